//! Corpus statistics overview.
//!
//! Prints a quick summary of what's stored: document counts, chunk
//! counts, embedding coverage, and per-type breakdowns. Used by
//! `docgate stats` to confirm uploads and processing are landing.

use anyhow::Result;
use sqlx::Row;

use crate::config::Config;
use crate::db;

struct TypeStats {
    file_type: String,
    doc_count: i64,
    chunk_count: i64,
    embedded_count: i64,
}

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;

    let total_docs: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
        .fetch_one(&pool)
        .await?;

    let total_chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM document_chunks")
        .fetch_one(&pool)
        .await?;

    let total_embedded: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM document_chunks WHERE embedding IS NOT NULL")
            .fetch_one(&pool)
            .await?;

    let total_tags: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tags")
        .fetch_one(&pool)
        .await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Docgate — Corpus Stats");
    println!("======================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  Documents:   {}", total_docs);
    println!("  Chunks:      {}", total_chunks);
    println!(
        "  Embedded:    {} / {} ({}%)",
        total_embedded,
        total_chunks,
        if total_chunks > 0 {
            (total_embedded * 100) / total_chunks
        } else {
            0
        }
    );
    println!("  Tags:        {}", total_tags);

    let type_rows = sqlx::query(
        r#"
        SELECT
            d.file_type,
            COUNT(DISTINCT d.id) AS doc_count,
            COUNT(DISTINCT c.id) AS chunk_count,
            COUNT(DISTINCT CASE WHEN c.embedding IS NOT NULL THEN c.id END) AS embedded_count
        FROM documents d
        LEFT JOIN document_chunks c ON c.document_id = d.id
        GROUP BY d.file_type
        ORDER BY doc_count DESC
        "#,
    )
    .fetch_all(&pool)
    .await?;

    let type_stats: Vec<TypeStats> = type_rows
        .iter()
        .map(|row| TypeStats {
            file_type: row.get("file_type"),
            doc_count: row.get("doc_count"),
            chunk_count: row.get("chunk_count"),
            embedded_count: row.get("embedded_count"),
        })
        .collect();

    if !type_stats.is_empty() {
        println!();
        println!("  By file type:");
        println!(
            "  {:<40} {:>6} {:>8} {:>10}",
            "TYPE", "DOCS", "CHUNKS", "EMBEDDED"
        );
        println!("  {}", "-".repeat(68));
        for s in &type_stats {
            println!(
                "  {:<40} {:>6} {:>8} {:>10}",
                s.file_type, s.doc_count, s.chunk_count, s.embedded_count
            );
        }
    }

    println!();

    pool.close().await;
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
