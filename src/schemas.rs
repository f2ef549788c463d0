//! Request and response schemas for the HTTP surface.
//!
//! These types define the wire contract: upload and query responses,
//! the structured error body, and the CSV analysis shapes embedded in
//! upload responses. Serialization is the contract — field names here
//! are load-bearing for clients.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Per-column statistics for a numeric CSV column.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NumericStatistics {
    pub mean: f64,
    pub std: f64,
    pub min: f64,
    pub max: f64,
    pub count: u64,
}

/// Per-column statistics for a categorical CSV column.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CategoricalStatistics {
    pub unique_values: u64,
    /// Up to the ten most frequent values with their occurrence counts.
    pub top_values: BTreeMap<String, u64>,
}

/// Statistics for one column, tagged by inferred type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ColumnStatistics {
    Numeric(NumericStatistics),
    Categorical(CategoricalStatistics),
}

/// Summary analysis of a tabular (CSV) upload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CsvAnalysis {
    pub total_rows: u64,
    pub columns: Vec<String>,
    pub column_statistics: BTreeMap<String, ColumnStatistics>,
    /// First rows of the file, as column → raw value maps.
    pub sample_rows: Vec<BTreeMap<String, String>>,
}

/// Statistics field of an upload response.
///
/// Tabular uploads carry a full [`CsvAnalysis`]; when the parser fails the
/// request still succeeds and this degrades to a string sentinel rather
/// than disappearing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Statistics {
    Analysis(CsvAnalysis),
    Unavailable(String),
}

impl Statistics {
    pub const UNAVAILABLE: &'static str = "No analysis available";

    pub fn unavailable() -> Self {
        Statistics::Unavailable(Self::UNAVAILABLE.to_string())
    }
}

/// Saved-file summary embedded in upload responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileInfo {
    pub filename: String,
    pub path: String,
    pub status: String,
}

/// Body of a successful `POST /upload`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadResponse {
    pub request_id: String,
    pub file_info: FileInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub statistics: Option<Statistics>,
    pub message: String,
    /// ISO-8601 UTC timestamp.
    pub timestamp: String,
}

/// A chart suggestion attached to insights or returned directly.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChartData {
    pub chart_type: String,
    pub title: String,
    pub x_axis: String,
    pub y_axis: String,
    #[serde(default)]
    pub data: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<serde_json::Value>,
}

/// A narrative finding extracted from the LLM reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NarrativeInsight {
    /// Kind of insight, e.g. `"trend"`, `"correlation"`, `"anomaly"`.
    #[serde(rename = "type")]
    pub insight_type: String,
    pub description: String,
    /// Confidence in [0, 1].
    #[serde(default)]
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supporting_data: Option<ChartData>,
}

/// Body of `POST /query`.
#[derive(Debug, Clone, Deserialize)]
pub struct QueryRequest {
    pub query: String,
}

/// Body of a successful `POST /query`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    pub request_id: String,
    pub query: String,
    pub response: String,
    #[serde(default)]
    pub insights: Vec<NarrativeInsight>,
    #[serde(default)]
    pub visualizations: Vec<ChartData>,
    pub timestamp: String,
}

/// Structured error body returned for every failed request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub error_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// Body of `GET /health`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub status: String,
    pub services: BTreeMap<String, bool>,
    pub version: String,
    pub timestamp: String,
}

/// Current UTC time formatted for response bodies.
pub fn now_iso8601() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}
