use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;

/// The kind of remote operation a job represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "camelCase")]
pub enum JobKind {
    Training,
    Generation,
    Upscale,
    #[serde(alias = "batch_item")]
    BatchItem,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Training => "training",
            Self::Generation => "generation",
            Self::Upscale => "upscale",
            Self::BatchItem => "batchItem",
        }
    }

    /// Only training runs long enough to be worth re-attaching after a restart.
    pub fn is_resumable(&self) -> bool {
        matches!(self, Self::Training)
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Remote job status.
///
/// Deserialization is lenient: the remote services spell a few of these
/// differently (batch items report `pending`/`masking`/`inpainting`/`completed`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Starting,
    Queued,
    Training,
    Processing,
    Succeeded,
    Failed,
    Canceled,
}

impl JobStatus {
    pub fn parse(raw: &str) -> Option<Self> {
        let status = match raw.trim().to_ascii_lowercase().as_str() {
            "starting" => Self::Starting,
            "queued" | "pending" => Self::Queued,
            "training" => Self::Training,
            "processing" | "running" | "in_progress" | "masking" | "inpainting" => {
                Self::Processing
            }
            "succeeded" | "completed" => Self::Succeeded,
            "failed" => Self::Failed,
            "canceled" | "cancelled" => Self::Canceled,
            _ => return None,
        };
        Some(status)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Queued => "queued",
            Self::Training => "training",
            Self::Processing => "processing",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::Canceled)
    }

    /// Position along `starting -> {queued|training|processing} -> terminal`.
    fn stage(&self) -> u8 {
        match self {
            Self::Starting => 0,
            Self::Queued | Self::Training | Self::Processing => 1,
            Self::Succeeded | Self::Failed | Self::Canceled => 2,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for JobStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        JobStatus::parse(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown job status: {raw}")))
    }
}

/// How a tracker came to be attached to its job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachMode {
    /// The job was started by this process.
    Starting,
    /// The job was already in flight when this process started.
    Resuming,
}

impl AttachMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Resuming => "resuming",
        }
    }
}

impl fmt::Display for AttachMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One poll of a single job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "RawStatusResponse")]
pub struct StatusResponse {
    pub status: Option<JobStatus>,
    pub logs: Option<String>,
    pub result: Option<Value>,
    pub error: Option<String>,
}

/// Wire shape of a status poll. The services spell the result and the error
/// several ways, sometimes more than one in the same body.
#[derive(Deserialize)]
struct RawStatusResponse {
    #[serde(default)]
    status: Option<JobStatus>,
    #[serde(default)]
    logs: Option<String>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    version_id: Option<Value>,
    #[serde(default)]
    output: Option<Value>,
    #[serde(default)]
    output_path: Option<Value>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl From<RawStatusResponse> for StatusResponse {
    fn from(raw: RawStatusResponse) -> Self {
        Self {
            status: raw.status,
            logs: raw.logs,
            result: raw
                .result
                .or(raw.version_id)
                .or(raw.output)
                .or(raw.output_path),
            error: first_message(raw.error, raw.message),
        }
    }
}

fn first_message(preferred: Option<String>, fallback: Option<String>) -> Option<String> {
    preferred
        .filter(|e| !e.is_empty())
        .or(fallback.filter(|e| !e.is_empty()))
}

impl StatusResponse {
    pub fn with_status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn succeeded(result: Value) -> Self {
        Self {
            status: Some(JobStatus::Succeeded),
            result: Some(result),
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: Some(JobStatus::Failed),
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn logs(mut self, logs: impl Into<String>) -> Self {
        self.logs = Some(logs.into());
        self
    }
}

/// An entry of the remote job listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "RawListedJob")]
pub struct ListedJob {
    pub job_id: String,
    pub kind: JobKind,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct RawListedJob {
    #[serde(default)]
    job_id: Option<String>,
    #[serde(default, rename = "jobId")]
    job_id_camel: Option<String>,
    #[serde(default)]
    training_id: Option<String>,
    #[serde(default)]
    id: Option<String>,
    kind: JobKind,
    status: JobStatus,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
    #[serde(default, rename = "createdAt")]
    created_at_camel: Option<DateTime<Utc>>,
}

impl TryFrom<RawListedJob> for ListedJob {
    type Error = String;

    fn try_from(raw: RawListedJob) -> Result<Self, Self::Error> {
        let job_id = raw
            .job_id
            .or(raw.job_id_camel)
            .or(raw.training_id)
            .or(raw.id)
            .filter(|id| !id.is_empty())
            .ok_or("listed job has no id")?;
        let created_at = raw
            .created_at
            .or(raw.created_at_camel)
            .ok_or("listed job has no creation time")?;
        Ok(Self {
            job_id,
            kind: raw.kind,
            status: raw.status,
            created_at,
        })
    }
}

/// What changed when a poll response was applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Applied {
    pub status_changed: bool,
    pub logs_changed: bool,
    /// The response tried to move the status backwards and was ignored.
    pub regressed: bool,
}

/// Local view of one remote long-running operation.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: String,
    pub kind: JobKind,
    pub status: JobStatus,
    pub logs: Option<String>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
}

impl Job {
    pub fn new(id: impl Into<String>, kind: JobKind) -> Self {
        Self {
            id: id.into(),
            kind,
            status: JobStatus::Starting,
            logs: None,
            result: None,
            error: None,
            started_at: Utc::now(),
        }
    }

    /// Rebuild the local view of a job found in the remote listing.
    pub fn from_listing(listed: &ListedJob) -> Self {
        let mut job = Self::new(listed.job_id.clone(), listed.kind);
        job.started_at = listed.created_at;
        job.apply(StatusResponse::with_status(listed.status));
        job
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Apply one poll response.
    ///
    /// Logs are replaced wholesale. Status only moves forward and a terminal
    /// job is never modified again. `result` is set only on `succeeded`,
    /// `error` only on `failed`/`canceled`.
    pub fn apply(&mut self, response: StatusResponse) -> Applied {
        let mut applied = Applied::default();
        if self.is_terminal() {
            return applied;
        }

        if response.logs != self.logs {
            self.logs = response.logs;
            applied.logs_changed = true;
        }

        let Some(next) = response.status else {
            return applied;
        };

        if next.stage() < self.status.stage() {
            applied.regressed = true;
            return applied;
        }

        if next != self.status {
            self.status = next;
            applied.status_changed = true;
        }

        match next {
            JobStatus::Succeeded => {
                self.result = Some(response.result.unwrap_or(Value::Null));
            }
            JobStatus::Failed | JobStatus::Canceled => {
                self.error = Some(
                    response
                        .error
                        .filter(|e| !e.is_empty())
                        .unwrap_or_else(|| format!("remote job {next}")),
                );
            }
            _ => {}
        }

        applied
    }

    /// Mark the job failed for a reason that never reached the remote system.
    pub fn fail_locally(&mut self, error: impl Into<String>) {
        if self.is_terminal() {
            return;
        }
        self.status = JobStatus::Failed;
        self.result = None;
        self.error = Some(error.into());
    }
}

/// One sub-job of a batch as reported by the aggregate status endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawBatchItem")]
pub struct BatchItem {
    pub status: JobStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
}

#[derive(Deserialize)]
struct RawBatchItem {
    status: JobStatus,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    output_path: Option<Value>,
    #[serde(default)]
    output: Option<Value>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl From<RawBatchItem> for BatchItem {
    fn from(raw: RawBatchItem) -> Self {
        Self {
            status: raw.status,
            result: raw.result.or(raw.output_path).or(raw.output),
            error: first_message(raw.error, raw.message),
        }
    }
}

impl BatchItem {
    pub fn new(status: JobStatus) -> Self {
        Self {
            status,
            result: None,
            error: None,
        }
    }

    pub fn succeeded(result: Value) -> Self {
        Self {
            status: JobStatus::Succeeded,
            result: Some(result),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Failed,
            result: None,
            error: Some(error.into()),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Counts toward `completed_count`.
    pub fn is_finished(&self) -> bool {
        matches!(self.status, JobStatus::Succeeded | JobStatus::Failed)
    }

    /// Apply the same result/error rules as [`Job::apply`]: `result` only on
    /// success, `error` only on failure, with a default message.
    pub fn normalized(mut self) -> Self {
        match self.status {
            JobStatus::Succeeded => {
                self.error = None;
                if self.result.is_none() {
                    self.result = Some(Value::Null);
                }
            }
            JobStatus::Failed | JobStatus::Canceled => {
                self.result = None;
                let status = self.status;
                self.error = Some(
                    self.error
                        .take()
                        .filter(|e| !e.is_empty())
                        .unwrap_or_else(|| format!("remote job {status}")),
                );
            }
            _ => {
                self.result = None;
                self.error = None;
            }
        }
        self
    }
}

/// Raw aggregate status of a batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "RawBatchStatusResponse")]
pub struct BatchStatusResponse {
    pub completed_count: usize,
    pub total_count: usize,
    pub items: Vec<BatchItem>,
    /// Parent record, as nested by the batch service.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job: Option<BatchSummary>,
}

#[derive(Deserialize)]
struct RawBatchStatusResponse {
    #[serde(default)]
    completed_count: Option<usize>,
    #[serde(default, rename = "completedCount")]
    completed_count_camel: Option<usize>,
    #[serde(default)]
    total_count: Option<usize>,
    #[serde(default, rename = "totalCount")]
    total_count_camel: Option<usize>,
    #[serde(default)]
    items: Vec<BatchItem>,
    #[serde(default)]
    job: Option<BatchSummary>,
}

impl From<RawBatchStatusResponse> for BatchStatusResponse {
    fn from(raw: RawBatchStatusResponse) -> Self {
        Self {
            completed_count: raw
                .completed_count
                .or(raw.completed_count_camel)
                .unwrap_or_default(),
            total_count: raw.total_count.or(raw.total_count_camel).unwrap_or_default(),
            items: raw.items,
            job: raw.job,
        }
    }
}

impl BatchStatusResponse {
    pub fn total(&self) -> usize {
        let nested = self.job.as_ref().map_or(0, |j| j.total_items);
        self.total_count.max(nested)
    }

    pub fn reported_completed(&self) -> usize {
        let nested = self.job.as_ref().map_or(0, |j| j.completed_items);
        self.completed_count.max(nested)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchSummary {
    #[serde(default)]
    pub total_items: usize,
    #[serde(default)]
    pub completed_items: usize,
}

/// Local aggregate view of a batch.
#[derive(Debug, Clone, Serialize)]
pub struct BatchJob {
    pub id: String,
    pub items: Vec<BatchItem>,
    pub completed_count: usize,
    pub total_count: usize,
    pub completed: bool,
    /// Set when the batch view itself could not be kept up to date.
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
}

impl BatchJob {
    pub fn new(id: impl Into<String>, total_count: usize) -> Self {
        Self {
            id: id.into(),
            items: Vec::new(),
            completed_count: 0,
            total_count,
            completed: false,
            error: None,
            started_at: Utc::now(),
        }
    }

    /// Merge an aggregate poll. Returns the indices of items whose state changed.
    ///
    /// An item that already reached a terminal state keeps it, so
    /// `completed_count` never decreases.
    pub fn merge(&mut self, response: BatchStatusResponse) -> Vec<usize> {
        let mut changed = Vec::new();
        let total = response.total();

        for (index, incoming) in response.items.into_iter().enumerate() {
            let incoming = incoming.normalized();
            match self.items.get_mut(index) {
                Some(current) if current.is_terminal() => {}
                Some(current) => {
                    if *current != incoming {
                        *current = incoming;
                        changed.push(index);
                    }
                }
                None => {
                    self.items.push(incoming);
                    changed.push(index);
                }
            }
        }

        self.total_count = self.total_count.max(total).max(self.items.len());
        self.completed_count = self.items.iter().filter(|i| i.is_finished()).count();
        self.completed = self.items.len() == self.total_count
            && self.items.iter().all(BatchItem::is_terminal);

        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_aliases_from_source_services() {
        assert_eq!(JobStatus::parse("pending"), Some(JobStatus::Queued));
        assert_eq!(JobStatus::parse("Masking"), Some(JobStatus::Processing));
        assert_eq!(JobStatus::parse("completed"), Some(JobStatus::Succeeded));
        assert_eq!(JobStatus::parse("cancelled"), Some(JobStatus::Canceled));
        assert_eq!(JobStatus::parse("exploded"), None);
    }

    #[test]
    fn training_response_uses_version_id_as_result() {
        let resp: StatusResponse = serde_json::from_value(json!({
            "status": "succeeded",
            "logs": "epoch 10/10",
            "version_id": "abc123"
        }))
        .unwrap();
        assert_eq!(resp.status, Some(JobStatus::Succeeded));
        assert_eq!(resp.result, Some(json!("abc123")));
    }

    #[test]
    fn result_only_on_success_and_error_only_on_failure() {
        let mut job = Job::new("j1", JobKind::Generation);
        let mut resp = StatusResponse::with_status(JobStatus::Processing);
        resp.result = Some(json!("early"));
        resp.error = Some("noise".into());
        job.apply(resp);
        assert!(job.result.is_none());
        assert!(job.error.is_none());

        job.apply(StatusResponse::succeeded(json!({"url": "img/1.png"})));
        assert_eq!(job.status, JobStatus::Succeeded);
        assert!(job.result.is_some());
        assert!(job.error.is_none());
    }

    #[test]
    fn failure_without_message_gets_one() {
        let mut job = Job::new("j1", JobKind::Training);
        job.apply(StatusResponse::with_status(JobStatus::Canceled));
        assert_eq!(job.error.as_deref(), Some("remote job canceled"));
        assert!(job.result.is_none());
    }

    #[test]
    fn succeeded_without_result_still_has_one() {
        let mut job = Job::new("j1", JobKind::Upscale);
        job.apply(StatusResponse::with_status(JobStatus::Succeeded));
        assert_eq!(job.result, Some(Value::Null));
    }

    #[test]
    fn status_never_moves_backwards() {
        let mut job = Job::new("j1", JobKind::Training);
        job.apply(StatusResponse::with_status(JobStatus::Processing));

        let applied = job.apply(StatusResponse::with_status(JobStatus::Starting).logs("late"));
        assert!(applied.regressed);
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.logs.as_deref(), Some("late"));

        let applied = job.apply(StatusResponse::with_status(JobStatus::Training));
        assert!(applied.status_changed);
        assert_eq!(job.status, JobStatus::Training);
    }

    #[test]
    fn terminal_job_is_frozen() {
        let mut job = Job::new("j1", JobKind::Generation);
        job.apply(StatusResponse::failed("out of memory"));
        let applied = job.apply(StatusResponse::succeeded(json!("x")).logs("more"));
        assert_eq!(applied, Applied::default());
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.result.is_none());
        assert_eq!(job.error.as_deref(), Some("out of memory"));
        assert!(job.logs.is_none());
    }

    #[test]
    fn logs_are_replaced_not_appended() {
        let mut job = Job::new("j1", JobKind::Training);
        job.apply(StatusResponse::with_status(JobStatus::Training).logs("step 1"));
        job.apply(StatusResponse::with_status(JobStatus::Training).logs("step 2"));
        assert_eq!(job.logs.as_deref(), Some("step 2"));
    }

    #[test]
    fn batch_merge_keeps_terminal_items() {
        let mut batch = BatchJob::new("b1", 2);
        batch.merge(BatchStatusResponse {
            completed_count: 1,
            total_count: 2,
            items: vec![
                BatchItem::failed("mask not found"),
                BatchItem::new(JobStatus::Processing),
            ],
            job: None,
        });
        assert_eq!(batch.completed_count, 1);
        assert!(!batch.completed);

        let changed = batch.merge(BatchStatusResponse {
            completed_count: 1,
            total_count: 2,
            items: vec![
                BatchItem::new(JobStatus::Processing),
                BatchItem::succeeded(json!("out/2.png")),
            ],
            job: None,
        });
        assert_eq!(changed, vec![1]);
        assert_eq!(batch.items[0].error.as_deref(), Some("mask not found"));
        assert_eq!(batch.completed_count, 2);
        assert!(batch.completed);
    }

    #[test]
    fn batch_is_not_complete_until_every_item_reported() {
        let mut batch = BatchJob::new("b1", 3);
        batch.merge(BatchStatusResponse {
            completed_count: 1,
            total_count: 3,
            items: vec![BatchItem::succeeded(json!("a"))],
            job: None,
        });
        assert!(!batch.completed);
    }

    #[test]
    fn batch_status_accepts_nested_parent_record() {
        let resp: BatchStatusResponse = serde_json::from_value(json!({
            "success": true,
            "job": {"id": "b1", "total_items": 2, "completed_items": 1, "status": "processing"},
            "items": [
                {"status": "completed", "output_path": "generated/a.png", "error": null},
                {"status": "inpainting", "output_path": null, "error": null}
            ]
        }))
        .unwrap();
        assert_eq!(resp.total(), 2);
        assert_eq!(resp.reported_completed(), 1);
        assert_eq!(resp.items[0].status, JobStatus::Succeeded);
        assert_eq!(resp.items[0].result, Some(json!("generated/a.png")));
        assert_eq!(resp.items[1].status, JobStatus::Processing);
        assert!(resp.items[1].result.is_none());
    }

    #[test]
    fn listed_job_accepts_source_field_names() {
        let listed: ListedJob = serde_json::from_value(json!({
            "training_id": "t-9",
            "kind": "training",
            "status": "processing",
            "createdAt": "2026-01-02T03:04:05Z"
        }))
        .unwrap();
        assert_eq!(listed.job_id, "t-9");
        assert_eq!(listed.kind, JobKind::Training);
        assert!(listed.kind.is_resumable());
    }

    #[test]
    fn status_with_error_and_message_prefers_error() {
        let resp: StatusResponse = serde_json::from_value(json!({
            "status": "failed",
            "error": "CUDA OOM",
            "message": "Generation failed"
        }))
        .unwrap();
        assert_eq!(resp.error.as_deref(), Some("CUDA OOM"));

        let resp: StatusResponse = serde_json::from_value(json!({
            "status": "succeeded",
            "output": "generated/b.png",
            "output_path": "generated/b.png"
        }))
        .unwrap();
        assert_eq!(resp.result, Some(json!("generated/b.png")));
    }

    #[test]
    fn listed_job_with_several_id_fields_decodes() {
        let listed: ListedJob = serde_json::from_value(json!({
            "id": "row-3",
            "training_id": "t-3",
            "kind": "training",
            "status": "queued",
            "created_at": "2026-01-02T03:04:05Z",
            "createdAt": "2026-01-02T03:04:05Z"
        }))
        .unwrap();
        assert_eq!(listed.job_id, "t-3");

        let missing = serde_json::from_value::<ListedJob>(json!({
            "kind": "training",
            "status": "queued",
            "created_at": "2026-01-02T03:04:05Z"
        }));
        assert!(missing.is_err());
    }

    #[test]
    fn batch_item_fields_follow_status() {
        let failed = BatchItem::new(JobStatus::Failed).normalized();
        assert_eq!(failed.error.as_deref(), Some("remote job failed"));
        assert!(failed.result.is_none());

        let mut early = BatchItem::new(JobStatus::Processing);
        early.result = Some(json!("partial.png"));
        early.error = Some("retrying".into());
        let early = early.normalized();
        assert!(early.result.is_none());
        assert!(early.error.is_none());

        let mut done = BatchItem::new(JobStatus::Succeeded);
        done.error = Some("stale".into());
        let done = done.normalized();
        assert_eq!(done.result, Some(Value::Null));
        assert!(done.error.is_none());
    }

    #[test]
    fn batch_merge_fills_missing_item_error() {
        let mut batch = BatchJob::new("b1", 1);
        let changed = batch.merge(BatchStatusResponse {
            completed_count: 1,
            total_count: 1,
            items: vec![BatchItem::new(JobStatus::Failed)],
            job: None,
        });
        assert_eq!(changed, vec![0]);
        assert_eq!(batch.items[0].error.as_deref(), Some("remote job failed"));
        assert!(batch.completed);
    }
}
