//! Document processor collaborator.
//!
//! Turns a stored upload into searchable content: extract text, chunk it,
//! embed the chunks, and write them to storage. Tabular (CSV) files are
//! deliberately exempted from chunking and embedding — their content is
//! analyzed directly by the query workflow — so processing a CSV only
//! validates that text could be extracted.
//!
//! The contract is a bool: `true` means the document is ready, `false`
//! is a hard failure for the upload request. Failures are logged here
//! with their cause; callers only branch on the flag.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::chunk::{chunk_text, content_hash};
use crate::embedding::EmbeddingClient;
use crate::extract::{extract_text, MIME_CSV};
use crate::models::ChunkRecord;
use crate::storage::Storage;

#[async_trait]
pub trait Processor: Send + Sync {
    /// Process one stored document. Returns true when the document is
    /// fully ingested (or exempt), false on any failure.
    async fn process(&self, document_id: &str, path: &Path, file_type: &str) -> bool;
}

pub struct DocumentProcessor {
    storage: Arc<dyn Storage>,
    embedding: Arc<EmbeddingClient>,
    max_chunk_chars: usize,
}

impl DocumentProcessor {
    pub fn new(
        storage: Arc<dyn Storage>,
        embedding: Arc<EmbeddingClient>,
        max_chunk_chars: usize,
    ) -> Self {
        Self {
            storage,
            embedding,
            max_chunk_chars,
        }
    }

    async fn process_inner(
        &self,
        document_id: &str,
        path: &Path,
        file_type: &str,
    ) -> anyhow::Result<bool> {
        let bytes = tokio::fs::read(path).await?;
        let text = match extract_text(&bytes, file_type) {
            Ok(text) => text,
            Err(e) => {
                warn!(document_id = %document_id, error = %e, "text extraction failed");
                return Ok(false);
            }
        };
        if text.trim().is_empty() {
            warn!(document_id = %document_id, "no text extracted from document");
            return Ok(false);
        }

        // CSV content goes to the LLM whole; no chunks, no embeddings.
        if file_type == MIME_CSV {
            info!(document_id = %document_id, "tabular file, skipping chunk embedding");
            return Ok(true);
        }

        let contents = chunk_text(&text, self.max_chunk_chars);
        let total_chunks = contents.len();
        info!(document_id = %document_id, chunks = total_chunks, "created chunks");

        let embeddings = if self.embedding.is_enabled() {
            match self.embedding.embed_texts(&contents).await {
                Ok(vectors) => vectors.into_iter().map(Some).collect(),
                Err(e) => {
                    // Chunks without vectors still serve text search.
                    warn!(document_id = %document_id, error = %e, "embedding failed, storing chunks without vectors");
                    vec![None; total_chunks]
                }
            }
        } else {
            vec![None; total_chunks]
        };

        for (index, (content, embedding)) in
            contents.into_iter().zip(embeddings.into_iter()).enumerate()
        {
            let metadata = serde_json::json!({
                "type": file_type,
                "chunk_number": index,
                "total_chunks": total_chunks,
                "content_hash": content_hash(&content),
            });
            let chunk = ChunkRecord {
                id: Uuid::new_v4().to_string(),
                document_id: document_id.to_string(),
                chunk_index: index as i64,
                content,
                embedding,
                metadata_json: metadata.to_string(),
            };
            self.storage.store_chunk(&chunk).await?;
        }

        info!(document_id = %document_id, "processed document");
        Ok(true)
    }
}

#[async_trait]
impl Processor for DocumentProcessor {
    async fn process(&self, document_id: &str, path: &Path, file_type: &str) -> bool {
        match self.process_inner(document_id, path, file_type).await {
            Ok(result) => result,
            Err(e) => {
                error!(document_id = %document_id, error = %e, "error processing document");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmbeddingConfig;
    use crate::migrate::run_migrations;
    use crate::storage::SqliteStorage;

    async fn processor_with_storage() -> (DocumentProcessor, Arc<SqliteStorage>) {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        run_migrations(&pool).await.unwrap();
        let storage = Arc::new(SqliteStorage::new(pool));
        let embedding = Arc::new(EmbeddingClient::new(EmbeddingConfig::default()));
        (
            DocumentProcessor::new(storage.clone(), embedding, 100),
            storage,
        )
    }

    #[tokio::test]
    async fn text_file_is_chunked_and_stored() {
        let (processor, storage) = processor_with_storage().await;
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("doc.txt");
        std::fs::write(&path, "First paragraph here.\n\nSecond paragraph here.").unwrap();

        let id = storage
            .store_document("doc.txt", &path.display().to_string(), "text/plain", 1)
            .await
            .unwrap();

        assert!(processor.process(&id, &path, "text/plain").await);
        let chunks = storage.get_chunks(&id).await.unwrap();
        assert!(!chunks.is_empty());
        assert_eq!(chunks[0].chunk_index, 0);
        // Disabled embedding provider stores chunks without vectors.
        assert!(chunks[0].embedding.is_none());
    }

    #[tokio::test]
    async fn csv_file_skips_chunking() {
        let (processor, storage) = processor_with_storage().await;
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("data.csv");
        std::fs::write(&path, "a,b\n1,2\n").unwrap();

        let id = storage
            .store_document("data.csv", &path.display().to_string(), "text/csv", 1)
            .await
            .unwrap();

        assert!(processor.process(&id, &path, "text/csv").await);
        assert!(storage.get_chunks(&id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_file_fails_processing() {
        let (processor, _storage) = processor_with_storage().await;
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("empty.txt");
        std::fs::write(&path, "   \n  ").unwrap();

        assert!(!processor.process("d1", &path, "text/plain").await);
    }

    #[tokio::test]
    async fn missing_file_fails_processing() {
        let (processor, _storage) = processor_with_storage().await;
        assert!(
            !processor
                .process("d1", Path::new("/nonexistent/doc.txt"), "text/plain")
                .await
        );
    }

    #[tokio::test]
    async fn unsupported_type_fails_processing() {
        let (processor, _storage) = processor_with_storage().await;
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("blob.bin");
        std::fs::write(&path, [0u8, 1, 2]).unwrap();

        assert!(
            !processor
                .process("d1", &path, "application/octet-stream")
                .await
        );
    }
}
