//! End-to-end tests for the upload and query workflows.
//!
//! These run the real orchestrator over a real SQLite store and file
//! store, with the LLM scripted. Collaborator failure modes are driven
//! through the trait seams the production code uses.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tempfile::TempDir;

use docgate::config::EmbeddingConfig;
use docgate::context::RequestContextRegistry;
use docgate::embedding::EmbeddingClient;
use docgate::error::GatewayError;
use docgate::llm::{LanguageModel, LlmError};
use docgate::migrate::run_migrations;
use docgate::orchestrator::Orchestrator;
use docgate::processor::DocumentProcessor;
use docgate::schemas::{ColumnStatistics, Statistics};
use docgate::storage::{SqliteStorage, Storage};
use docgate::transaction::TransactionManager;
use docgate::upload::{FileStore, LocalFileStore, SavedFile};

// ─── Scripted collaborators ─────────────────────────────────────────

/// LLM double: returns a fixed reply and records every prompt.
struct ScriptedModel {
    reply: String,
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedModel {
    fn new(reply: &str) -> Arc<Self> {
        Arc::new(Self {
            reply: reply.to_string(),
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        })
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn last_prompt(&self) -> Option<String> {
        self.prompts.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    fn is_enabled(&self) -> bool {
        true
    }

    async fn complete(&self, prompt: &str) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(prompt.to_string());
        Ok(self.reply.clone())
    }
}

/// LLM double that always times out.
struct TimeoutModel;

#[async_trait]
impl LanguageModel for TimeoutModel {
    fn is_enabled(&self) -> bool {
        true
    }

    async fn complete(&self, _prompt: &str) -> Result<String, LlmError> {
        Err(LlmError::Timeout(Duration::from_secs(60)))
    }
}

/// File store double that saves the file but never writes the metadata
/// row — the partial-failure state the upload workflow must surface.
struct FileOnlyStore {
    dir: PathBuf,
}

#[async_trait]
impl FileStore for FileOnlyStore {
    async fn save(&self, filename: &str, bytes: &[u8]) -> Result<SavedFile> {
        let path = self.dir.join(filename);
        tokio::fs::write(&path, bytes).await?;
        Ok(SavedFile {
            filename: filename.to_string(),
            path,
            status: "success".to_string(),
        })
    }
}

// ─── Harness ────────────────────────────────────────────────────────

struct Harness {
    _tmp: TempDir,
    upload_dir: PathBuf,
    storage: Arc<SqliteStorage>,
    transactions: TransactionManager,
    llm: Arc<ScriptedModel>,
    orchestrator: Orchestrator,
}

async fn storage_in(tmp: &TempDir) -> Arc<SqliteStorage> {
    let db_path = tmp.path().join("docgate.sqlite");
    let options = sqlx::sqlite::SqliteConnectOptions::new()
        .filename(&db_path)
        .create_if_missing(true);
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .unwrap();
    run_migrations(&pool).await.unwrap();
    Arc::new(SqliteStorage::new(pool))
}

fn build_orchestrator(
    storage: Arc<SqliteStorage>,
    file_store: Arc<dyn FileStore>,
    llm: Arc<dyn LanguageModel>,
    transactions: TransactionManager,
) -> Orchestrator {
    let embedding = Arc::new(EmbeddingClient::new(EmbeddingConfig::default()));
    let processor = Arc::new(DocumentProcessor::new(storage.clone(), embedding, 1000));
    Orchestrator::new(
        storage,
        file_store,
        processor,
        llm,
        RequestContextRegistry::new(),
        transactions,
    )
}

async fn harness() -> Harness {
    harness_with_reply("The data shows steady growth.").await
}

async fn harness_with_reply(reply: &str) -> Harness {
    let tmp = TempDir::new().unwrap();
    let upload_dir = tmp.path().join("uploads");
    let storage = storage_in(&tmp).await;
    let llm = ScriptedModel::new(reply);
    let transactions = TransactionManager::new(Duration::from_secs(3600));
    let file_store = Arc::new(LocalFileStore::new(&upload_dir, storage.clone()).unwrap());
    let orchestrator = build_orchestrator(
        storage.clone(),
        file_store,
        llm.clone(),
        transactions.clone(),
    );
    Harness {
        _tmp: tmp,
        upload_dir,
        storage,
        transactions,
        llm,
        orchestrator,
    }
}

// ─── Upload workflow ────────────────────────────────────────────────

#[tokio::test]
async fn upload_text_file_succeeds_and_stores_chunks() {
    let h = harness().await;

    let response = h
        .orchestrator
        .handle_upload("notes.txt", b"First paragraph.\n\nSecond paragraph.", "req-1")
        .await
        .unwrap();

    assert_eq!(response.request_id, "req-1");
    assert_eq!(response.file_info.filename, "notes.txt");
    assert_eq!(response.file_info.status, "success");
    assert!(response.statistics.is_none(), "text upload has no statistics");
    assert!(!response.timestamp.is_empty());

    // The durable file survives the committed transaction.
    assert!(h.upload_dir.join("notes.txt").exists());
    assert_eq!(h.transactions.active_count(), 0);

    let doc_id = h
        .storage
        .find_document_id("notes.txt")
        .await
        .unwrap()
        .expect("metadata row missing");
    assert!(!h.storage.get_chunks(&doc_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn upload_csv_returns_statistics_and_skips_chunks() {
    let h = harness().await;

    let response = h
        .orchestrator
        .handle_upload("sales.csv", b"price,region\n10,west\n20,east\n30,west\n", "req-1")
        .await
        .unwrap();

    let stats = match response.statistics.expect("CSV upload must carry statistics") {
        Statistics::Analysis(a) => a,
        Statistics::Unavailable(s) => panic!("expected analysis, got sentinel {:?}", s),
    };
    assert_eq!(stats.total_rows, 3);
    assert!(matches!(
        stats.column_statistics["price"],
        ColumnStatistics::Numeric(_)
    ));

    // CSV is exempt from chunk embedding.
    let doc_id = h
        .storage
        .find_document_id("sales.csv")
        .await
        .unwrap()
        .unwrap();
    assert!(h.storage.get_chunks(&doc_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn csv_parse_failure_degrades_to_sentinel_not_error() {
    let h = harness().await;

    // Ragged rows: extraction and processing succeed, analysis fails.
    let response = h
        .orchestrator
        .handle_upload("bad.csv", b"a,b\n1\n", "req-1")
        .await
        .unwrap();

    assert_eq!(
        response.statistics,
        Some(Statistics::Unavailable("No analysis available".to_string()))
    );
}

#[tokio::test]
async fn unresolved_document_id_is_data_integrity_and_file_is_cleaned() {
    let tmp = TempDir::new().unwrap();
    let upload_dir = tmp.path().join("uploads");
    std::fs::create_dir_all(&upload_dir).unwrap();
    let storage = storage_in(&tmp).await;
    let llm = ScriptedModel::new("unused");
    let transactions = TransactionManager::new(Duration::from_secs(3600));
    // File lands on disk, metadata never does.
    let file_store = Arc::new(FileOnlyStore {
        dir: upload_dir.clone(),
    });
    let orchestrator =
        build_orchestrator(storage, file_store, llm, transactions.clone());

    let err = orchestrator
        .handle_upload("orphan.txt", b"some text", "req-1")
        .await
        .unwrap_err();

    assert!(matches!(err, GatewayError::DataIntegrity(_)), "got {:?}", err.kind());
    // Rollback removed the saved file with the failed request.
    assert!(!upload_dir.join("orphan.txt").exists());
    assert_eq!(transactions.active_count(), 0);
}

#[tokio::test]
async fn processing_failure_fails_upload_and_rolls_back() {
    let h = harness().await;

    // Unknown extension → octet-stream → extraction fails → processor false.
    let err = h
        .orchestrator
        .handle_upload("blob.bin", b"\x00\x01\x02", "req-1")
        .await
        .unwrap_err();

    assert!(matches!(err, GatewayError::Collaborator { .. }));
    assert_eq!(err.kind(), "CollaboratorFailure");
    assert!(!h.upload_dir.join("blob.bin").exists(), "failed upload left its file");
}

#[tokio::test]
async fn storage_down_is_service_unavailable_without_transaction() {
    let h = harness().await;
    h.storage.pool().close().await;

    let err = h
        .orchestrator
        .handle_upload("notes.txt", b"text", "req-1")
        .await
        .unwrap_err();

    assert!(matches!(err, GatewayError::ServiceUnavailable(_)));
    assert_eq!(h.transactions.active_count(), 0);
}

#[tokio::test]
async fn duplicate_request_id_collides() {
    let h = harness().await;
    let _held = h.transactions.begin("dup").unwrap();

    let err = h
        .orchestrator
        .handle_upload("notes.txt", b"text", "dup")
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::TransactionCollision(_)));
}

// ─── Query workflow ─────────────────────────────────────────────────

#[tokio::test]
async fn query_with_no_documents_is_client_error_and_no_llm_call() {
    let h = harness().await;

    let err = h
        .orchestrator
        .handle_query("what is the trend?", "req-1")
        .await
        .unwrap_err();

    assert!(matches!(err, GatewayError::ClientInput(_)));
    assert_eq!(err.kind(), "ClientInputError");
    assert_eq!(h.llm.call_count(), 0, "LLM must not be called for an empty corpus");
    assert_eq!(h.transactions.active_count(), 0);
}

#[tokio::test]
async fn empty_query_is_client_error() {
    let h = harness().await;
    let err = h
        .orchestrator
        .handle_query("   ", "req-1")
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::ClientInput(_)));
}

#[tokio::test]
async fn query_includes_csv_content_in_prompt() {
    let h = harness().await;
    h.orchestrator
        .handle_upload("sales.csv", b"price,region\n10,west\n", "up-1")
        .await
        .unwrap();

    let response = h
        .orchestrator
        .handle_query("what drives price?", "req-1")
        .await
        .unwrap();

    assert_eq!(response.response, "The data shows steady growth.");
    assert_eq!(response.query, "what drives price?");
    assert!(response.insights.is_empty());
    assert!(response.visualizations.is_empty());

    let prompt = h.llm.last_prompt().expect("LLM was not called");
    assert!(prompt.contains("sales.csv"), "prompt names the CSV document");
    assert!(prompt.contains("price,region"), "prompt embeds the CSV content");
    assert!(prompt.contains("what drives price?"));
}

#[tokio::test]
async fn query_lifts_structured_trailer_into_typed_records() {
    let reply = concat!(
        "Revenue is concentrated in the west.\n",
        r#"{"insights": [{"type": "concentration", "description": "west region dominates", "confidence": 0.8}], "visualizations": [{"chart_type": "bar", "title": "Revenue by region", "x_axis": "region", "y_axis": "revenue", "data": []}]}"#
    );
    let h = harness_with_reply(reply).await;
    h.orchestrator
        .handle_upload("sales.csv", b"price,region\n10,west\n", "up-1")
        .await
        .unwrap();

    let response = h
        .orchestrator
        .handle_query("where is revenue?", "req-1")
        .await
        .unwrap();

    assert_eq!(response.response, "Revenue is concentrated in the west.");
    assert_eq!(response.insights.len(), 1);
    assert_eq!(response.insights[0].insight_type, "concentration");
    assert_eq!(response.visualizations.len(), 1);
    assert_eq!(response.visualizations[0].chart_type, "bar");
}

#[tokio::test]
async fn llm_timeout_maps_to_gateway_timeout() {
    let tmp = TempDir::new().unwrap();
    let upload_dir = tmp.path().join("uploads");
    let storage = storage_in(&tmp).await;
    let transactions = TransactionManager::new(Duration::from_secs(3600));
    let file_store = Arc::new(LocalFileStore::new(&upload_dir, storage.clone()).unwrap());
    let orchestrator = build_orchestrator(
        storage,
        file_store,
        Arc::new(TimeoutModel),
        transactions.clone(),
    );

    orchestrator
        .handle_upload("notes.txt", b"some text body", "up-1")
        .await
        .unwrap();

    let err = orchestrator
        .handle_query("anything", "req-1")
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::GatewayTimeout(_)));
    assert_eq!(err.kind(), "GatewayTimeout");
    assert_eq!(transactions.active_count(), 0);
}

#[tokio::test]
async fn request_ids_are_reusable_across_sequential_requests() {
    let h = harness().await;
    h.orchestrator
        .handle_upload("sales.csv", b"price\n10\n", "shared-id")
        .await
        .unwrap();

    // The first transaction finished, so the id is free again.
    let response = h
        .orchestrator
        .handle_query("trend?", "shared-id")
        .await
        .unwrap();
    assert_eq!(response.request_id, "shared-id");
}
