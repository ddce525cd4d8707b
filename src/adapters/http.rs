use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::core::{
    ApiError, BatchRequest, BatchStatusResponse, JobApi, JobKind, ListedJob, StatusResponse,
};

/// Keys the remote services use for a freshly created job id.
const ID_KEYS: [&str; 6] = [
    "jobId",
    "job_id",
    "training_id",
    "batch_job_id",
    "batchId",
    "id",
];

/// REST+JSON backend for the remote job service.
pub struct HttpJobApi {
    base_url: String,
    client: Client,
}

impl HttpJobApi {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<T, ApiError> {
        let url = self.url(path);
        debug!(%method, %url, "Calling job service");

        let mut request = self.client.request(method, &url);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;

        if !status.is_success() {
            return Err(http_error(status, text));
        }

        serde_json::from_str(&text).map_err(|e| ApiError::Decode(e.to_string()))
    }
}

fn http_error(status: StatusCode, body: String) -> ApiError {
    ApiError::Http {
        status: status.as_u16(),
        body,
    }
}

fn start_route(kind: JobKind) -> Result<&'static str, ApiError> {
    match kind {
        JobKind::Training => Ok("/products/train"),
        JobKind::Generation => Ok("/generate/flux-lora"),
        JobKind::Upscale => Ok("/upscale"),
        JobKind::BatchItem => Err(ApiError::Unsupported { kind }),
    }
}

fn status_route(kind: JobKind, job_id: &str) -> String {
    match kind {
        JobKind::Training => format!("/products/train-status/{job_id}"),
        JobKind::Generation | JobKind::Upscale | JobKind::BatchItem => {
            format!("/status/{job_id}")
        }
    }
}

/// Pull the job id out of a start response.
fn extract_id(body: &Value) -> Result<String, ApiError> {
    ID_KEYS
        .iter()
        .find_map(|key| match body.get(key) {
            Some(Value::String(id)) if !id.is_empty() => Some(id.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        })
        .ok_or_else(|| ApiError::Decode(format!("start response carries no job id: {body}")))
}

/// The listing is either a bare array or wrapped under `products` / `jobs`.
/// Entries that do not describe a job are skipped.
fn decode_listing(body: Value) -> Result<Vec<ListedJob>, ApiError> {
    let entries = match body {
        Value::Array(entries) => entries,
        Value::Object(mut map) => match map.remove("products").or_else(|| map.remove("jobs")) {
            Some(Value::Array(entries)) => entries,
            _ => return Err(ApiError::Decode("listing has no job array".to_string())),
        },
        other => return Err(ApiError::Decode(format!("unexpected listing: {other}"))),
    };

    let listed = entries
        .into_iter()
        .filter_map(|entry| match serde_json::from_value::<ListedJob>(entry) {
            Ok(job) => Some(job),
            Err(e) => {
                debug!(error = %e, "Skipping listing entry");
                None
            }
        })
        .collect();
    Ok(listed)
}

#[async_trait]
impl JobApi for HttpJobApi {
    async fn start_job(&self, kind: JobKind, params: &Value) -> Result<String, ApiError> {
        let route = start_route(kind)?;
        let body: Value = self.send(Method::POST, route, Some(params)).await?;
        extract_id(&body)
    }

    async fn poll_job(&self, kind: JobKind, job_id: &str) -> Result<StatusResponse, ApiError> {
        self.send(Method::GET, &status_route(kind, job_id), None)
            .await
    }

    async fn list_jobs(&self) -> Result<Vec<ListedJob>, ApiError> {
        let body: Value = self.send(Method::GET, "/products", None).await?;
        decode_listing(body)
    }

    async fn start_batch(&self, request: &BatchRequest) -> Result<String, ApiError> {
        let payload =
            serde_json::to_value(request).map_err(|e| ApiError::Decode(e.to_string()))?;
        let body: Value = self
            .send(Method::POST, "/batch/start", Some(&payload))
            .await?;
        extract_id(&body)
    }

    async fn poll_batch(&self, batch_id: &str) -> Result<BatchStatusResponse, ApiError> {
        self.send(Method::GET, &format!("/batch/status/{batch_id}"), None)
            .await
    }
}
