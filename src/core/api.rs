use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use super::models::{BatchStatusResponse, JobKind, ListedJob, StatusResponse};

/// Failure to talk to the remote job service.
///
/// Every variant is a transport-level failure: the remote system never
/// reported anything about the job itself.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Transport(String),

    #[error("remote service returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("malformed response: {0}")]
    Decode(String),

    #[error("{kind} jobs cannot be started individually")]
    Unsupported { kind: JobKind },
}

/// Parameters for starting a batch.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchRequest {
    /// Fields shared by every item (e.g. the product name).
    #[serde(flatten)]
    pub shared: serde_json::Map<String, Value>,
    /// One entry per sub-job.
    pub items: Vec<Value>,
}

/// The remote operations the orchestration core depends on.
#[async_trait]
pub trait JobApi: Send + Sync {
    /// Start a single job. Returns the remote job id.
    async fn start_job(&self, kind: JobKind, params: &Value) -> Result<String, ApiError>;

    /// Fetch the current status of a single job.
    async fn poll_job(&self, kind: JobKind, job_id: &str) -> Result<StatusResponse, ApiError>;

    /// List jobs known to the remote system, in any state.
    async fn list_jobs(&self) -> Result<Vec<ListedJob>, ApiError>;

    /// Start a batch. Returns the batch id.
    async fn start_batch(&self, request: &BatchRequest) -> Result<String, ApiError>;

    /// Fetch the aggregate status of a batch.
    async fn poll_batch(&self, batch_id: &str) -> Result<BatchStatusResponse, ApiError>;
}
