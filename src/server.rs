//! HTTP server.
//!
//! Exposes the upload/query workflows plus thin pass-throughs to the
//! storage collaborator (documents, tags, search, diagnostics).
//!
//! # Endpoints
//!
//! | Method   | Path | Description |
//! |----------|------|-------------|
//! | `POST`   | `/upload` | Multipart file upload (queued admission) |
//! | `POST`   | `/query` | Query the uploaded corpus (queued admission) |
//! | `GET`    | `/documents` | List uploaded documents |
//! | `DELETE` | `/documents/{id}` | Delete a document and its chunks |
//! | `GET`    | `/documents/search` | Full-text search over chunks |
//! | `POST`   | `/documents/vector_search` | Vector search over chunks |
//! | `GET`    | `/documents/{id}/tags` | Tags on a document |
//! | `POST`   | `/documents/{id}/tags/{tag_id}` | Tag a document |
//! | `DELETE` | `/documents/{id}/tags/{tag_id}` | Untag a document |
//! | `GET`    | `/tags` | List tags |
//! | `POST`   | `/tags` | Create a tag |
//! | `DELETE` | `/tags/{id}` | Delete a tag |
//! | `GET`    | `/health` | Health check |
//! | `GET`    | `/diagnostics/database` | Storage diagnostics |
//!
//! # Error Contract
//!
//! Every failure is a structured body — message, kind, request id,
//! timestamp — mapped from the [`GatewayError`] taxonomy by the single
//! [`AppError`] adapter: 429 admission, 503 storage down, 400 client
//! input, 504 collaborator timeout, 500 otherwise. Full causes are
//! logged server-side; clients never see a bare trace.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Multipart, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use crate::admission::AdmissionController;
use crate::config::Config;
use crate::context::RequestContextRegistry;
use crate::embedding::EmbeddingClient;
use crate::error::GatewayError;
use crate::llm::LlmClient;
use crate::orchestrator::Orchestrator;
use crate::processor::DocumentProcessor;
use crate::schemas::{
    now_iso8601, ErrorBody, HealthStatus, QueryRequest, QueryResponse, UploadResponse,
};
use crate::storage::{SqliteStorage, Storage};
use crate::transaction::TransactionManager;
use crate::upload::LocalFileStore;
use crate::{db, migrate};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
struct AppState {
    orchestrator: Arc<Orchestrator>,
    storage: Arc<dyn Storage>,
    admission: Arc<AdmissionController>,
    embedding: Arc<EmbeddingClient>,
    queue_timeout: Duration,
    llm_enabled: bool,
}

/// Starts the HTTP server. Runs until the process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let pool = db::connect(config).await?;
    migrate::run_migrations(&pool).await?;

    let storage: Arc<dyn Storage> = Arc::new(SqliteStorage::new(pool));
    let embedding = Arc::new(EmbeddingClient::new(config.embedding.clone()));
    let file_store = Arc::new(LocalFileStore::new(&config.upload.dir, storage.clone())?);
    let processor = Arc::new(DocumentProcessor::new(
        storage.clone(),
        embedding.clone(),
        config.chunking.max_chars,
    ));
    let llm = Arc::new(LlmClient::new(config.llm.clone()));
    let llm_enabled = config.llm.is_enabled();

    let transactions = TransactionManager::new(Duration::from_secs(
        config.transactions.max_age_hours * 3600,
    ));
    let orchestrator = Arc::new(Orchestrator::new(
        storage.clone(),
        file_store,
        processor,
        llm,
        RequestContextRegistry::new(),
        transactions,
    ));

    let admission = Arc::new(AdmissionController::new(
        config.admission.capacity,
        config.admission.leak_rate_per_sec,
        config.admission.max_queue_size,
    ));
    tokio::spawn(admission.clone().drain_loop());

    let state = AppState {
        orchestrator,
        storage,
        admission,
        embedding,
        queue_timeout: Duration::from_secs_f64(config.admission.queue_timeout_secs),
        llm_enabled,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/upload", post(handle_upload))
        .route("/query", post(handle_query))
        .route("/documents", get(handle_list_documents))
        .route("/documents/search", get(handle_text_search))
        .route("/documents/vector_search", post(handle_vector_search))
        .route("/documents/{id}", delete(handle_delete_document))
        .route("/documents/{id}/tags", get(handle_document_tags))
        .route(
            "/documents/{id}/tags/{tag_id}",
            post(handle_tag_document).delete(handle_untag_document),
        )
        .route("/tags", get(handle_list_tags).post(handle_create_tag))
        .route("/tags/{id}", delete(handle_delete_tag))
        .route("/health", get(handle_health))
        .route("/diagnostics/database", get(handle_diagnostics))
        .layer(cors)
        .with_state(state);

    let bind_addr = config.server.bind.clone();
    info!(bind = %bind_addr, "docgate listening");

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Error response ============

/// Boundary adapter from [`GatewayError`] to an HTTP response.
struct AppError {
    status: StatusCode,
    body: ErrorBody,
}

impl AppError {
    fn from_gateway(err: &GatewayError, request_id: Option<String>) -> Self {
        Self {
            status: err.status(),
            body: ErrorBody {
                error: err.to_string(),
                error_type: err.kind().to_string(),
                request_id,
                timestamp: now_iso8601(),
                details: None,
            },
        }
    }

    /// 500 for pass-through failures that carry no workflow context.
    fn internal(err: anyhow::Error) -> Self {
        error!(error = %err, "internal error");
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            body: ErrorBody {
                error: err.to_string(),
                error_type: "InternalError".to_string(),
                request_id: None,
                timestamp: now_iso8601(),
                details: None,
            },
        }
    }

    fn admission_rejected() -> Self {
        let err = GatewayError::AdmissionRejected(
            "too many requests, retry later".to_string(),
        );
        Self::from_gateway(&err, None)
    }

    fn bad_request(message: impl Into<String>) -> Self {
        let err = GatewayError::ClientInput(message.into());
        Self::from_gateway(&err, None)
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            body: ErrorBody {
                error: message.into(),
                error_type: "NotFound".to_string(),
                request_id: None,
                timestamp: now_iso8601(),
                details: None,
            },
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

/// Gate a pass-through endpoint with the non-queuing admission check.
fn gate_simple(state: &AppState) -> Result<(), AppError> {
    if state.admission.try_admit() {
        Ok(())
    } else {
        Err(AppError::admission_rejected())
    }
}

// ============ POST /upload ============

async fn handle_upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, AppError> {
    if !state.admission.admit_with_queue(state.queue_timeout).await {
        return Err(AppError::admission_rejected());
    }

    // Pull the first file part out of the multipart body.
    let mut filename = None;
    let mut bytes = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::bad_request(format!("malformed multipart body: {}", e)))?
    {
        if let Some(name) = field.file_name().map(|s| s.to_string()) {
            let data = field
                .bytes()
                .await
                .map_err(|e| AppError::bad_request(format!("failed to read upload: {}", e)))?;
            filename = Some(name);
            bytes = Some(data);
            break;
        }
    }
    let (filename, bytes) = match (filename, bytes) {
        (Some(f), Some(b)) => (f, b),
        _ => return Err(AppError::bad_request("no file in multipart body")),
    };

    let request_id = state.orchestrator.create_request_context();
    let result = state
        .orchestrator
        .handle_upload(&filename, &bytes, &request_id)
        .await;
    state.orchestrator.finish_request(&request_id);

    match result {
        Ok(response) => Ok(Json(response)),
        Err(e) => Err(AppError::from_gateway(&e, Some(request_id))),
    }
}

// ============ POST /query ============

async fn handle_query(
    State(state): State<AppState>,
    Json(request): Json<QueryRequest>,
) -> Result<Json<QueryResponse>, AppError> {
    if !state.admission.admit_with_queue(state.queue_timeout).await {
        return Err(AppError::admission_rejected());
    }

    let request_id = state.orchestrator.create_request_context();
    let result = state
        .orchestrator
        .handle_query(&request.query, &request_id)
        .await;
    state.orchestrator.finish_request(&request_id);

    match result {
        Ok(response) => Ok(Json(response)),
        Err(e) => Err(AppError::from_gateway(&e, Some(request_id))),
    }
}

// ============ Document pass-throughs ============

async fn handle_list_documents(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    gate_simple(&state)?;
    let documents = state
        .storage
        .list_documents()
        .await
        .map_err(AppError::internal)?;
    Ok(Json(serde_json::json!({ "documents": documents })))
}

async fn handle_delete_document(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    gate_simple(&state)?;
    let deleted = state
        .storage
        .delete_document(&id)
        .await
        .map_err(AppError::internal)?;
    if !deleted {
        return Err(AppError::not_found(format!("no document with id {}", id)));
    }
    Ok(Json(serde_json::json!({ "deleted": id })))
}

#[derive(Deserialize)]
struct TextSearchParams {
    q: String,
    #[serde(default = "default_search_limit")]
    limit: i64,
}

fn default_search_limit() -> i64 {
    10
}

async fn handle_text_search(
    State(state): State<AppState>,
    Query(params): Query<TextSearchParams>,
) -> Result<Json<serde_json::Value>, AppError> {
    gate_simple(&state)?;
    if params.q.trim().is_empty() {
        return Err(AppError::bad_request("query must not be empty"));
    }
    let results = state
        .storage
        .text_search(&params.q, params.limit)
        .await
        .map_err(AppError::internal)?;
    Ok(Json(serde_json::json!({ "results": results })))
}

#[derive(Deserialize)]
struct VectorSearchRequest {
    query: String,
    #[serde(default = "default_top_k")]
    top_k: i64,
}

fn default_top_k() -> i64 {
    5
}

async fn handle_vector_search(
    State(state): State<AppState>,
    Json(request): Json<VectorSearchRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    gate_simple(&state)?;
    if request.query.trim().is_empty() {
        return Err(AppError::bad_request("query must not be empty"));
    }
    if !state.embedding.is_enabled() {
        return Err(AppError::bad_request("embeddings are disabled"));
    }
    let query_vec = state
        .embedding
        .embed_query(&request.query)
        .await
        .map_err(AppError::internal)?;
    let results = state
        .storage
        .vector_search(&query_vec, request.top_k)
        .await
        .map_err(AppError::internal)?;
    Ok(Json(serde_json::json!({ "results": results })))
}

// ============ Tag pass-throughs ============

async fn handle_list_tags(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    gate_simple(&state)?;
    let tags = state.storage.list_tags().await.map_err(AppError::internal)?;
    Ok(Json(serde_json::json!({ "tags": tags })))
}

#[derive(Deserialize)]
struct CreateTagRequest {
    name: String,
    #[serde(default)]
    color: Option<String>,
}

async fn handle_create_tag(
    State(state): State<AppState>,
    Json(request): Json<CreateTagRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    gate_simple(&state)?;
    if request.name.trim().is_empty() {
        return Err(AppError::bad_request("tag name must not be empty"));
    }
    let tag = state
        .storage
        .create_tag(&request.name, request.color.as_deref())
        .await
        .map_err(AppError::internal)?;
    Ok(Json(serde_json::json!({ "tag": tag })))
}

async fn handle_delete_tag(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    gate_simple(&state)?;
    let deleted = state
        .storage
        .delete_tag(&id)
        .await
        .map_err(AppError::internal)?;
    if !deleted {
        return Err(AppError::not_found(format!("no tag with id {}", id)));
    }
    Ok(Json(serde_json::json!({ "deleted": id })))
}

async fn handle_document_tags(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    gate_simple(&state)?;
    let tags = state
        .storage
        .tags_for_document(&id)
        .await
        .map_err(AppError::internal)?;
    Ok(Json(serde_json::json!({ "tags": tags })))
}

async fn handle_tag_document(
    State(state): State<AppState>,
    Path((id, tag_id)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, AppError> {
    gate_simple(&state)?;
    state
        .storage
        .tag_document(&id, &tag_id)
        .await
        .map_err(AppError::internal)?;
    Ok(Json(serde_json::json!({ "tagged": true })))
}

async fn handle_untag_document(
    State(state): State<AppState>,
    Path((id, tag_id)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, AppError> {
    gate_simple(&state)?;
    state
        .storage
        .untag_document(&id, &tag_id)
        .await
        .map_err(AppError::internal)?;
    Ok(Json(serde_json::json!({ "untagged": true })))
}

// ============ GET /health ============

async fn handle_health(State(state): State<AppState>) -> Json<HealthStatus> {
    let storage_ok = state.storage.is_connected().await;
    let services = BTreeMap::from([
        ("storage".to_string(), storage_ok),
        ("llm".to_string(), state.llm_enabled),
        ("embeddings".to_string(), state.embedding.is_enabled()),
    ]);
    Json(HealthStatus {
        status: if storage_ok { "healthy" } else { "degraded" }.to_string(),
        services,
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: now_iso8601(),
    })
}

// ============ GET /diagnostics/database ============

async fn handle_diagnostics(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    gate_simple(&state)?;
    let diagnostics = state
        .storage
        .diagnostics()
        .await
        .map_err(AppError::internal)?;
    Ok(Json(diagnostics))
}
