//! CSV summary statistics.
//!
//! Parses a CSV file into per-column statistics: numeric columns get
//! mean/std/min/max/count, everything else gets unique-value and
//! top-value counts. The first five rows are kept as samples. A column
//! is numeric when every non-empty value in it parses as a number.
//!
//! Record parsing handles quoted fields with embedded commas, quotes,
//! and newlines; it does not attempt other dialects.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context, Result};

use crate::schemas::{CategoricalStatistics, ColumnStatistics, CsvAnalysis, NumericStatistics};

const SAMPLE_ROWS: usize = 5;
const TOP_VALUES: usize = 10;

pub struct CsvParser;

impl CsvParser {
    /// Parse the file at `path` into summary statistics.
    ///
    /// Fails on unreadable files, empty files, or rows whose field count
    /// does not match the header.
    pub fn parse_file(&self, path: &Path) -> Result<CsvAnalysis> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read CSV file: {}", path.display()))?;
        parse_str(&content)
    }
}

/// Parse CSV text into summary statistics.
pub fn parse_str(content: &str) -> Result<CsvAnalysis> {
    let mut records = parse_records(content)?;
    if records.is_empty() {
        bail!("CSV file is empty");
    }

    let header = records.remove(0);
    if header.iter().all(|h| h.trim().is_empty()) {
        bail!("CSV header row is empty");
    }

    for (i, row) in records.iter().enumerate() {
        if row.len() != header.len() {
            bail!(
                "CSV row {} has {} fields, header has {}",
                i + 2,
                row.len(),
                header.len()
            );
        }
    }

    let mut column_statistics = BTreeMap::new();
    for (col_idx, name) in header.iter().enumerate() {
        let values: Vec<&str> = records
            .iter()
            .map(|row| row[col_idx].trim())
            .filter(|v| !v.is_empty())
            .collect();
        if values.is_empty() {
            continue;
        }
        column_statistics.insert(name.clone(), column_stats(&values));
    }

    let sample_rows = records
        .iter()
        .take(SAMPLE_ROWS)
        .map(|row| {
            header
                .iter()
                .cloned()
                .zip(row.iter().cloned())
                .collect::<BTreeMap<String, String>>()
        })
        .collect();

    Ok(CsvAnalysis {
        total_rows: records.len() as u64,
        columns: header,
        column_statistics,
        sample_rows,
    })
}

fn column_stats(values: &[&str]) -> ColumnStatistics {
    let numbers: Vec<f64> = values.iter().filter_map(|v| v.parse::<f64>().ok()).collect();

    if numbers.len() == values.len() {
        let count = numbers.len() as u64;
        let mean = numbers.iter().sum::<f64>() / numbers.len() as f64;
        // Sample standard deviation; zero for a single observation.
        let std = if numbers.len() > 1 {
            let var = numbers.iter().map(|n| (n - mean).powi(2)).sum::<f64>()
                / (numbers.len() - 1) as f64;
            var.sqrt()
        } else {
            0.0
        };
        let min = numbers.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = numbers.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        ColumnStatistics::Numeric(NumericStatistics {
            mean,
            std,
            min,
            max,
            count,
        })
    } else {
        let mut counts: BTreeMap<String, u64> = BTreeMap::new();
        for v in values {
            *counts.entry((*v).to_string()).or_insert(0) += 1;
        }
        let unique_values = counts.len() as u64;

        let mut ranked: Vec<(String, u64)> = counts.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        let top_values = ranked.into_iter().take(TOP_VALUES).collect();

        ColumnStatistics::Categorical(CategoricalStatistics {
            unique_values,
            top_values,
        })
    }
}

/// Split CSV text into records of fields, honoring RFC-4180 quoting.
fn parse_records(content: &str) -> Result<Vec<Vec<String>>> {
    let mut records = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = content.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' => {
                    if chars.peek() == Some(&'"') {
                        chars.next();
                        field.push('"');
                    } else {
                        in_quotes = false;
                    }
                }
                _ => field.push(c),
            }
            continue;
        }
        match c {
            '"' => in_quotes = true,
            ',' => {
                row.push(std::mem::take(&mut field));
            }
            '\r' => {
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
                row.push(std::mem::take(&mut field));
                records.push(std::mem::take(&mut row));
            }
            '\n' => {
                row.push(std::mem::take(&mut field));
                records.push(std::mem::take(&mut row));
            }
            _ => field.push(c),
        }
    }

    if in_quotes {
        bail!("unterminated quoted field in CSV");
    }
    if !field.is_empty() || !row.is_empty() {
        row.push(field);
        records.push(row);
    }

    // Drop trailing blank lines.
    records.retain(|r| !(r.len() == 1 && r[0].is_empty()));
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_and_categorical_columns() {
        let analysis = parse_str("price,region\n10,west\n20,east\n30,west\n").unwrap();
        assert_eq!(analysis.total_rows, 3);
        assert_eq!(analysis.columns, vec!["price", "region"]);

        match &analysis.column_statistics["price"] {
            ColumnStatistics::Numeric(s) => {
                assert!((s.mean - 20.0).abs() < 1e-9);
                assert_eq!(s.min, 10.0);
                assert_eq!(s.max, 30.0);
                assert_eq!(s.count, 3);
                assert!((s.std - 10.0).abs() < 1e-9);
            }
            other => panic!("expected numeric stats, got {:?}", other),
        }

        match &analysis.column_statistics["region"] {
            ColumnStatistics::Categorical(s) => {
                assert_eq!(s.unique_values, 2);
                assert_eq!(s.top_values["west"], 2);
                assert_eq!(s.top_values["east"], 1);
            }
            other => panic!("expected categorical stats, got {:?}", other),
        }
    }

    #[test]
    fn sample_rows_capped_at_five() {
        let mut content = String::from("n\n");
        for i in 0..10 {
            content.push_str(&format!("{}\n", i));
        }
        let analysis = parse_str(&content).unwrap();
        assert_eq!(analysis.total_rows, 10);
        assert_eq!(analysis.sample_rows.len(), 5);
        assert_eq!(analysis.sample_rows[0]["n"], "0");
    }

    #[test]
    fn quoted_fields_with_commas_and_quotes() {
        let analysis = parse_str("name,notes\nwidget,\"big, heavy\"\ngadget,\"said \"\"hi\"\"\"\n")
            .unwrap();
        assert_eq!(analysis.total_rows, 2);
        assert_eq!(analysis.sample_rows[0]["notes"], "big, heavy");
        assert_eq!(analysis.sample_rows[1]["notes"], "said \"hi\"");
    }

    #[test]
    fn mixed_column_is_categorical() {
        let analysis = parse_str("v\n1\ntwo\n3\n").unwrap();
        assert!(matches!(
            analysis.column_statistics["v"],
            ColumnStatistics::Categorical(_)
        ));
    }

    #[test]
    fn empty_file_is_an_error() {
        assert!(parse_str("").is_err());
        assert!(parse_str("\n\n").is_err());
    }

    #[test]
    fn ragged_row_is_an_error() {
        assert!(parse_str("a,b\n1\n").is_err());
    }

    #[test]
    fn empty_values_excluded_from_stats() {
        let analysis = parse_str("n\n1\n\n3\n").unwrap();
        // The blank line is dropped, not counted as an empty value row.
        match &analysis.column_statistics["n"] {
            ColumnStatistics::Numeric(s) => assert_eq!(s.count, 2),
            other => panic!("expected numeric stats, got {:?}", other),
        }
    }

    #[test]
    fn parse_file_missing_path_errors() {
        let parser = CsvParser;
        assert!(parser.parse_file(Path::new("/nonexistent/x.csv")).is_err());
    }
}
