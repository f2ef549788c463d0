//! Storage collaborator: documents, chunks, tags, and search.
//!
//! The orchestrator consumes the [`Storage`] trait; [`SqliteStorage`] is
//! the production implementation over the sqlx pool. Text search goes
//! through the FTS5 index kept in lockstep with `document_chunks`;
//! vector search computes cosine similarity over stored embedding BLOBs.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::models::{ChunkMatch, ChunkRecord, DocumentRecord, TagRecord};

#[async_trait]
pub trait Storage: Send + Sync {
    /// Connectivity probe. Every workflow checks this before starting;
    /// a false here short-circuits to a service-unavailable outcome.
    async fn is_connected(&self) -> bool;

    async fn list_documents(&self) -> Result<Vec<DocumentRecord>>;

    /// Resolve a document id by exact filename match, newest first.
    async fn find_document_id(&self, filename: &str) -> Result<Option<String>>;

    /// Insert a metadata row and return the generated document id.
    async fn store_document(
        &self,
        filename: &str,
        storage_path: &str,
        file_type: &str,
        file_size: i64,
    ) -> Result<String>;

    async fn get_document(&self, id: &str) -> Result<Option<DocumentRecord>>;

    /// Delete a document with its chunks and tag associations. Returns
    /// false when no such document exists.
    async fn delete_document(&self, id: &str) -> Result<bool>;

    async fn store_chunk(&self, chunk: &ChunkRecord) -> Result<()>;

    async fn get_chunks(&self, document_id: &str) -> Result<Vec<ChunkRecord>>;

    /// Full-text search over chunk content.
    async fn text_search(&self, query: &str, limit: i64) -> Result<Vec<ChunkMatch>>;

    /// Cosine-similarity search over embedded chunks.
    async fn vector_search(&self, query_vec: &[f32], top_k: i64) -> Result<Vec<ChunkMatch>>;

    async fn list_tags(&self) -> Result<Vec<TagRecord>>;

    async fn create_tag(&self, name: &str, color: Option<&str>) -> Result<TagRecord>;

    async fn delete_tag(&self, id: &str) -> Result<bool>;

    async fn tags_for_document(&self, document_id: &str) -> Result<Vec<TagRecord>>;

    async fn tag_document(&self, document_id: &str, tag_id: &str) -> Result<()>;

    async fn untag_document(&self, document_id: &str, tag_id: &str) -> Result<()>;

    /// Connectivity plus table row counts, for the diagnostics endpoint.
    async fn diagnostics(&self) -> Result<serde_json::Value>;
}

pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Quote a user query as an FTS5 phrase so operators and punctuation in
/// it are matched literally instead of parsed as syntax.
fn fts_phrase(query: &str) -> String {
    format!("\"{}\"", query.replace('"', "\"\""))
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn is_connected(&self) -> bool {
        if self.pool.is_closed() {
            return false;
        }
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .is_ok()
    }

    async fn list_documents(&self) -> Result<Vec<DocumentRecord>> {
        let docs = sqlx::query_as::<_, DocumentRecord>(
            "SELECT id, filename, storage_path, file_type, file_size, uploaded_at
             FROM documents ORDER BY uploaded_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(docs)
    }

    async fn find_document_id(&self, filename: &str) -> Result<Option<String>> {
        let id = sqlx::query_scalar(
            "SELECT id FROM documents WHERE filename = ? ORDER BY uploaded_at DESC LIMIT 1",
        )
        .bind(filename)
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }

    async fn store_document(
        &self,
        filename: &str,
        storage_path: &str,
        file_type: &str,
        file_size: i64,
    ) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO documents (id, filename, storage_path, file_type, file_size, uploaded_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(filename)
        .bind(storage_path)
        .bind(file_type)
        .bind(file_size)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    async fn get_document(&self, id: &str) -> Result<Option<DocumentRecord>> {
        let doc = sqlx::query_as::<_, DocumentRecord>(
            "SELECT id, filename, storage_path, file_type, file_size, uploaded_at
             FROM documents WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(doc)
    }

    async fn delete_document(&self, id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM chunks_fts WHERE document_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM document_chunks WHERE document_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM document_tags WHERE document_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn store_chunk(&self, chunk: &ChunkRecord) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO document_chunks (id, document_id, chunk_index, content, embedding, metadata_json, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&chunk.id)
        .bind(&chunk.document_id)
        .bind(chunk.chunk_index)
        .bind(&chunk.content)
        .bind(chunk.embedding.as_ref().map(|v| vec_to_blob(v)))
        .bind(&chunk.metadata_json)
        .bind(chrono::Utc::now().timestamp())
        .execute(&mut *tx)
        .await?;

        sqlx::query("INSERT INTO chunks_fts (chunk_id, document_id, content) VALUES (?, ?, ?)")
            .bind(&chunk.id)
            .bind(&chunk.document_id)
            .bind(&chunk.content)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_chunks(&self, document_id: &str) -> Result<Vec<ChunkRecord>> {
        let rows = sqlx::query(
            "SELECT id, document_id, chunk_index, content, embedding, metadata_json
             FROM document_chunks WHERE document_id = ? ORDER BY chunk_index",
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;

        let chunks = rows
            .iter()
            .map(|row| ChunkRecord {
                id: row.get("id"),
                document_id: row.get("document_id"),
                chunk_index: row.get("chunk_index"),
                content: row.get("content"),
                embedding: row
                    .get::<Option<Vec<u8>>, _>("embedding")
                    .map(|blob| blob_to_vec(&blob)),
                metadata_json: row.get("metadata_json"),
            })
            .collect();
        Ok(chunks)
    }

    async fn text_search(&self, query: &str, limit: i64) -> Result<Vec<ChunkMatch>> {
        let rows = sqlx::query(
            r#"
            SELECT chunks_fts.chunk_id, chunks_fts.document_id, chunks_fts.rank AS rank,
                   c.chunk_index, c.content
            FROM chunks_fts
            JOIN document_chunks c ON c.id = chunks_fts.chunk_id
            WHERE chunks_fts MATCH ?
            ORDER BY rank
            LIMIT ?
            "#,
        )
        .bind(fts_phrase(query))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let matches = rows
            .iter()
            .map(|row| {
                let rank: f64 = row.get("rank");
                ChunkMatch {
                    chunk_id: row.get("chunk_id"),
                    document_id: row.get("document_id"),
                    chunk_index: row.get("chunk_index"),
                    content: row.get("content"),
                    score: -rank, // negate so higher = better
                }
            })
            .collect();
        Ok(matches)
    }

    async fn vector_search(&self, query_vec: &[f32], top_k: i64) -> Result<Vec<ChunkMatch>> {
        // Fetch embedded chunks and score in Rust.
        let rows = sqlx::query(
            "SELECT id, document_id, chunk_index, content, embedding
             FROM document_chunks WHERE embedding IS NOT NULL",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut matches: Vec<ChunkMatch> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let similarity = cosine_similarity(query_vec, &blob_to_vec(&blob));
                ChunkMatch {
                    chunk_id: row.get("id"),
                    document_id: row.get("document_id"),
                    chunk_index: row.get("chunk_index"),
                    content: row.get("content"),
                    score: similarity,
                }
            })
            .collect();

        matches.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        matches.truncate(top_k.max(0) as usize);
        Ok(matches)
    }

    async fn list_tags(&self) -> Result<Vec<TagRecord>> {
        let tags =
            sqlx::query_as::<_, TagRecord>("SELECT id, name, color FROM tags ORDER BY name")
                .fetch_all(&self.pool)
                .await?;
        Ok(tags)
    }

    async fn create_tag(&self, name: &str, color: Option<&str>) -> Result<TagRecord> {
        let id = Uuid::new_v4().to_string();
        sqlx::query("INSERT INTO tags (id, name, color) VALUES (?, ?, ?)")
            .bind(&id)
            .bind(name)
            .bind(color)
            .execute(&self.pool)
            .await?;
        Ok(TagRecord {
            id,
            name: name.to_string(),
            color: color.map(|c| c.to_string()),
        })
    }

    async fn delete_tag(&self, id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM document_tags WHERE tag_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM tags WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn tags_for_document(&self, document_id: &str) -> Result<Vec<TagRecord>> {
        let tags = sqlx::query_as::<_, TagRecord>(
            "SELECT t.id, t.name, t.color FROM tags t
             JOIN document_tags dt ON dt.tag_id = t.id
             WHERE dt.document_id = ? ORDER BY t.name",
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(tags)
    }

    async fn tag_document(&self, document_id: &str, tag_id: &str) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO document_tags (document_id, tag_id) VALUES (?, ?)",
        )
        .bind(document_id)
        .bind(tag_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn untag_document(&self, document_id: &str, tag_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM document_tags WHERE document_id = ? AND tag_id = ?")
            .bind(document_id)
            .bind(tag_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn diagnostics(&self) -> Result<serde_json::Value> {
        let connected = self.is_connected().await;
        if !connected {
            return Ok(serde_json::json!({ "connected": false }));
        }

        let documents: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
            .fetch_one(&self.pool)
            .await?;
        let chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM document_chunks")
            .fetch_one(&self.pool)
            .await?;
        let embedded: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM document_chunks WHERE embedding IS NOT NULL",
        )
        .fetch_one(&self.pool)
        .await?;
        let tags: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tags")
            .fetch_one(&self.pool)
            .await?;

        Ok(serde_json::json!({
            "connected": true,
            "documents": documents,
            "chunks": chunks,
            "embedded_chunks": embedded,
            "tags": tags,
        }))
    }
}
