//! Request orchestration.
//!
//! The [`Orchestrator`] composes the admission-gated collaborators into
//! the two primary workflows — file ingestion and query answering — under
//! a per-request transaction with guaranteed cleanup and a per-request
//! context carrying step timings.
//!
//! Upload path:
//!
//! ```text
//! admitted → storage checked → file saved → metadata verified
//!          → content processed → (csv stats) → response built
//! ```
//!
//! Any step failure surfaces as one [`GatewayError`] kind and rolls the
//! transaction back; the saved file is removed with it. Cleanup failures
//! after a determined outcome are logged, never promoted over that
//! outcome.

use std::sync::Arc;
use std::time::Instant;

use tracing::{error, info, warn};

use crate::context::RequestContextRegistry;
use crate::csv_parser::CsvParser;
use crate::error::GatewayError;
use crate::extract::MIME_CSV;
use crate::llm::{LanguageModel, LlmError};
use crate::models::{file_type_for, DocumentRecord};
use crate::processor::Processor;
use crate::schemas::{
    now_iso8601, ChartData, FileInfo, NarrativeInsight, QueryResponse, Statistics, UploadResponse,
};
use crate::storage::Storage;
use crate::transaction::{FileResource, Transaction, TransactionManager};
use crate::upload::FileStore;

/// Most CSV documents included verbatim in a query prompt.
const MAX_CSV_CONTEXT_DOCS: usize = 3;
/// Per-document cap on CSV bytes included in a prompt.
const MAX_CSV_CONTEXT_CHARS: usize = 20_000;
/// Matching text chunks included in a query prompt.
const CHUNK_CONTEXT_LIMIT: i64 = 8;

pub struct Orchestrator {
    storage: Arc<dyn Storage>,
    file_store: Arc<dyn FileStore>,
    processor: Arc<dyn Processor>,
    csv_parser: CsvParser,
    llm: Arc<dyn LanguageModel>,
    contexts: RequestContextRegistry,
    transactions: TransactionManager,
}

impl Orchestrator {
    pub fn new(
        storage: Arc<dyn Storage>,
        file_store: Arc<dyn FileStore>,
        processor: Arc<dyn Processor>,
        llm: Arc<dyn LanguageModel>,
        contexts: RequestContextRegistry,
        transactions: TransactionManager,
    ) -> Self {
        Self {
            storage,
            file_store,
            processor,
            csv_parser: CsvParser,
            llm,
            contexts,
            transactions,
        }
    }

    /// Create a request context and return its id.
    pub fn create_request_context(&self) -> String {
        self.contexts.create()
    }

    /// Destroy the request context (emitting its final metrics) and
    /// opportunistically sweep stale transactions.
    pub fn finish_request(&self, request_id: &str) {
        self.contexts.finish(request_id);
        let swept = self.transactions.sweep_stale();
        if swept > 0 {
            warn!(swept, "swept stale transactions");
        }
    }

    /// Orchestrate the upload workflow for one file.
    ///
    /// The caller has already passed admission control; this checks the
    /// storage precondition, opens the transaction, runs the steps, and
    /// settles the transaction on every exit path.
    pub async fn handle_upload(
        &self,
        filename: &str,
        bytes: &[u8],
        request_id: &str,
    ) -> Result<UploadResponse, GatewayError> {
        if !self.storage.is_connected().await {
            return Err(GatewayError::ServiceUnavailable(
                "storage is unreachable".to_string(),
            ));
        }

        let txn = self.transactions.begin(request_id)?;
        info!(request_id = %request_id, filename = %filename, "starting file upload");

        let result = self.run_upload(&txn, filename, bytes, request_id).await;
        self.settle(txn, result)
    }

    async fn run_upload(
        &self,
        txn: &Transaction,
        filename: &str,
        bytes: &[u8],
        request_id: &str,
    ) -> Result<UploadResponse, GatewayError> {
        // Persist the raw bytes. The saved path is a durable resource:
        // commit keeps it, rollback and stale sweeps remove it.
        let step_start = Instant::now();
        let saved = self
            .file_store
            .save(filename, bytes)
            .await
            .map_err(|e| GatewayError::Collaborator {
                step: "upload_service",
                message: e.to_string(),
            })?;
        txn.register(Box::new(FileResource::durable(&saved.path)));
        self.contexts
            .record_timing(request_id, "upload_service", step_start.elapsed());

        // The metadata write is allowed to defer; verify it took effect.
        let document_id = self
            .storage
            .find_document_id(&saved.filename)
            .await
            .map_err(|e| GatewayError::Collaborator {
                step: "document_lookup",
                message: e.to_string(),
            })?
            .ok_or_else(|| {
                GatewayError::DataIntegrity(format!(
                    "document id not found after upload of '{}'",
                    saved.filename
                ))
            })?;

        let step_start = Instant::now();
        let file_type = file_type_for(&saved.filename);
        let processed = self
            .processor
            .process(&document_id, &saved.path, file_type)
            .await;
        if !processed {
            return Err(GatewayError::Collaborator {
                step: "document_processing",
                message: format!("processing failed for document {}", document_id),
            });
        }
        self.contexts
            .record_timing(request_id, "document_processing", step_start.elapsed());

        // Statistics degrade gracefully: a parser failure is reported as
        // the sentinel, never as a failed upload.
        let statistics = if file_type == MIME_CSV {
            match self.csv_parser.parse_file(&saved.path) {
                Ok(analysis) => Some(Statistics::Analysis(analysis)),
                Err(e) => {
                    warn!(request_id = %request_id, error = %e, "CSV analysis failed");
                    Some(Statistics::unavailable())
                }
            }
        } else {
            None
        };

        Ok(UploadResponse {
            request_id: request_id.to_string(),
            file_info: FileInfo {
                filename: saved.filename.clone(),
                path: saved.path.display().to_string(),
                status: saved.status.clone(),
            },
            statistics,
            message: "File uploaded and processed successfully".to_string(),
            timestamp: now_iso8601(),
        })
    }

    /// Orchestrate the query workflow.
    pub async fn handle_query(
        &self,
        query: &str,
        request_id: &str,
    ) -> Result<QueryResponse, GatewayError> {
        if !self.storage.is_connected().await {
            return Err(GatewayError::ServiceUnavailable(
                "storage is unreachable".to_string(),
            ));
        }

        // Symmetry with upload: the query path registers no file
        // resources, but runs under the same scoped lifetime.
        let txn = self.transactions.begin(request_id)?;
        info!(request_id = %request_id, query = %query, "processing query");

        let result = self.run_query(query, request_id).await;
        self.settle(txn, result)
    }

    async fn run_query(
        &self,
        query: &str,
        request_id: &str,
    ) -> Result<QueryResponse, GatewayError> {
        if query.trim().is_empty() {
            return Err(GatewayError::ClientInput(
                "query must not be empty".to_string(),
            ));
        }

        let documents = self
            .storage
            .list_documents()
            .await
            .map_err(|e| GatewayError::Collaborator {
                step: "document_lookup",
                message: e.to_string(),
            })?;
        if documents.is_empty() {
            return Err(GatewayError::ClientInput(
                "No documents uploaded yet. Please upload a document first.".to_string(),
            ));
        }

        let step_start = Instant::now();
        let prompt = self.build_query_prompt(&documents, query).await;
        let reply = self.llm.complete(&prompt).await.map_err(|e| match e {
            LlmError::Timeout(d) => {
                GatewayError::GatewayTimeout(format!("LLM call exceeded {:?}", d))
            }
            other => GatewayError::Collaborator {
                step: "query_processing",
                message: other.to_string(),
            },
        })?;
        self.contexts
            .record_timing(request_id, "query_processing", step_start.elapsed());

        let (response, insights, visualizations) = split_structured_reply(&reply);

        Ok(QueryResponse {
            request_id: request_id.to_string(),
            query: query.to_string(),
            response,
            insights,
            visualizations,
            timestamp: now_iso8601(),
        })
    }

    /// Assemble the prompt from explicit document context: CSV content is
    /// re-read from the stored documents, matching chunks come from text
    /// search. Context gathering is best-effort — an unreadable document
    /// is skipped, not fatal.
    async fn build_query_prompt(&self, documents: &[DocumentRecord], query: &str) -> String {
        let mut prompt = String::from(
            "You are analyzing documents a user has uploaded. Answer the question using the context below.\n",
        );

        for doc in documents
            .iter()
            .filter(|d| d.is_tabular())
            .take(MAX_CSV_CONTEXT_DOCS)
        {
            match tokio::fs::read_to_string(&doc.storage_path).await {
                Ok(mut content) => {
                    if content.len() > MAX_CSV_CONTEXT_CHARS {
                        let mut cut = MAX_CSV_CONTEXT_CHARS;
                        while !content.is_char_boundary(cut) {
                            cut -= 1;
                        }
                        content.truncate(cut);
                        content.push_str("\n[truncated]");
                    }
                    prompt.push_str(&format!(
                        "\nCSV file `{}`:\n{}\n",
                        doc.filename, content
                    ));
                }
                Err(e) => {
                    warn!(document_id = %doc.id, error = %e, "could not read CSV for query context");
                }
            }
        }

        match self.storage.text_search(query, CHUNK_CONTEXT_LIMIT).await {
            Ok(matches) if !matches.is_empty() => {
                prompt.push_str("\nRelevant document excerpts:\n");
                for m in matches {
                    prompt.push_str(&format!("- {}\n", m.content));
                }
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "text search for query context failed");
            }
        }

        prompt.push_str(&format!(
            "\nQuestion: {}\n\nAnalyze the data to answer this question. Include any relevant \
             statistics, patterns, or insights you find. If appropriate, suggest visualizations \
             that could help illustrate the answer. You may append, as the final line, a JSON \
             object with \"insights\" and \"visualizations\" arrays.",
            query
        ));
        prompt
    }

    /// Settle the transaction according to the workflow outcome. Exactly
    /// one of commit/rollback runs, exactly once; cleanup failures are
    /// logged without overwriting the primary result.
    fn settle<T>(
        &self,
        txn: Transaction,
        result: Result<T, GatewayError>,
    ) -> Result<T, GatewayError> {
        match result {
            Ok(response) => {
                if let Err(e) = txn.commit() {
                    error!(error = %e, "cleanup after successful request failed");
                }
                Ok(response)
            }
            Err(e) => {
                if let Err(cleanup_err) = txn.rollback() {
                    error!(error = %cleanup_err, "rollback cleanup failed");
                }
                Err(e)
            }
        }
    }
}

/// Split an LLM reply into prose plus optional structured trailer.
///
/// When the final line is a JSON object, its `insights` and
/// `visualizations` arrays are lifted into typed records and the line is
/// dropped from the prose. Absent or unmapped fields become empty
/// collections, never nulls.
fn split_structured_reply(reply: &str) -> (String, Vec<NarrativeInsight>, Vec<ChartData>) {
    #[derive(serde::Deserialize, Default)]
    struct Trailer {
        #[serde(default)]
        insights: Vec<NarrativeInsight>,
        #[serde(default)]
        visualizations: Vec<ChartData>,
    }

    let trimmed = reply.trim_end();
    if let Some(last_line) = trimmed.lines().last() {
        let candidate = last_line.trim();
        if candidate.starts_with('{') && candidate.ends_with('}') {
            if let Ok(trailer) = serde_json::from_str::<Trailer>(candidate) {
                let prose_len = trimmed.len() - last_line.len();
                let prose = trimmed[..prose_len].trim_end().to_string();
                return (prose, trailer.insights, trailer.visualizations);
            }
        }
    }

    (reply.to_string(), Vec::new(), Vec::new())
}
