//! Typed error taxonomy for the orchestration core.
//!
//! Every failure a workflow can produce is one of the [`GatewayError`]
//! kinds below. Collaborators return `anyhow::Error` internally; the
//! orchestrator converts them into a kind at the step where they occur,
//! and a single boundary adapter in [`crate::server`] maps kinds to
//! HTTP status codes. Nothing in the core raises a bare string to the
//! transport layer.

use axum::http::StatusCode;

/// Aggregate error produced when one or more resource cleanups fail.
///
/// Cleanup attempts every registered resource even after a failure, so
/// this carries the full list of individual failure messages.
#[derive(Debug, thiserror::Error)]
#[error("cleanup errors occurred: {}", failures.join("; "))]
pub struct CleanupError {
    /// One message per resource whose cleanup failed, in cleanup order.
    pub failures: Vec<String>,
}

impl CleanupError {
    pub fn new(failures: Vec<String>) -> Self {
        Self { failures }
    }
}

/// Failure kinds surfaced by the upload and query workflows.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Admission queue full or queued wait timed out. Client should retry later.
    #[error("request rejected by admission control: {0}")]
    AdmissionRejected(String),

    /// The storage dependency is unreachable.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    /// The client sent something we cannot act on (no documents, empty query).
    #[error("{0}")]
    ClientInput(String),

    /// A partial-failure state: the file write took effect but the metadata
    /// row did not. Surfaced, never silently ignored.
    #[error("data integrity violation: {0}")]
    DataIntegrity(String),

    /// A collaborator step (processing, parsing, LLM call) failed.
    #[error("{step} failed: {message}")]
    Collaborator { step: &'static str, message: String },

    /// A collaborator call exceeded its bounded timeout.
    #[error("timed out waiting for {0}")]
    GatewayTimeout(String),

    /// Post-workflow resource teardown failed. Reported, but never
    /// overwrites an already-determined workflow outcome.
    #[error(transparent)]
    Cleanup(#[from] CleanupError),

    /// A transaction is already active for this request id.
    #[error("transaction already active for request {0}")]
    TransactionCollision(String),
}

impl GatewayError {
    /// Machine-readable kind string carried in error response bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::AdmissionRejected(_) => "AdmissionRejected",
            GatewayError::ServiceUnavailable(_) => "ServiceUnavailable",
            GatewayError::ClientInput(_) => "ClientInputError",
            GatewayError::DataIntegrity(_) => "DataIntegrityError",
            GatewayError::Collaborator { .. } => "CollaboratorFailure",
            GatewayError::GatewayTimeout(_) => "GatewayTimeout",
            GatewayError::Cleanup(_) => "CleanupError",
            GatewayError::TransactionCollision(_) => "TransactionCollisionError",
        }
    }

    /// Transport-level status code for this kind.
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::AdmissionRejected(_) => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::ClientInput(_) => StatusCode::BAD_REQUEST,
            GatewayError::GatewayTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::DataIntegrity(_)
            | GatewayError::Collaborator { .. }
            | GatewayError::Cleanup(_)
            | GatewayError::TransactionCollision(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
