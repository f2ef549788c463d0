//! Core data models shared by the storage layer and the orchestrator.

use serde::Serialize;

/// Metadata row for an uploaded document.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct DocumentRecord {
    pub id: String,
    pub filename: String,
    pub storage_path: String,
    pub file_type: String,
    pub file_size: i64,
    /// Unix timestamp (seconds).
    pub uploaded_at: i64,
}

impl DocumentRecord {
    pub fn is_tabular(&self) -> bool {
        self.file_type == "text/csv"
    }
}

/// A stored slice of extracted document text, optionally embedded.
#[derive(Debug, Clone)]
pub struct ChunkRecord {
    pub id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub content: String,
    pub embedding: Option<Vec<f32>>,
    pub metadata_json: String,
}

/// A tag row. Tags associate freely with documents via `document_tags`.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct TagRecord {
    pub id: String,
    pub name: String,
    pub color: Option<String>,
}

/// Result row from text or vector search over chunks.
#[derive(Debug, Clone, Serialize)]
pub struct ChunkMatch {
    pub chunk_id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub content: String,
    pub score: f64,
}

/// MIME type inferred from a filename extension.
///
/// Mirrors the upload path's type table; unknown extensions fall back to
/// `application/octet-stream` and are rejected later by extraction.
pub fn file_type_for(filename: &str) -> &'static str {
    let extension = filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "pdf" => "application/pdf",
        "txt" => "text/plain",
        "md" => "text/markdown",
        "json" => "application/json",
        "csv" => "text/csv",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        _ => "application/octet-stream",
    }
}
