use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::core::{
    ApiError, BatchItem, BatchRequest, BatchStatusResponse, JobApi, JobKind, JobStatus,
    ListedJob, StatusResponse,
};

/// A call received by the simulated backend, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum ApiCall {
    StartJob { kind: JobKind, params: Value },
    PollJob { kind: JobKind, job_id: String },
    ListJobs,
    StartBatch { request: Value },
    PollBatch { batch_id: String },
}

/// Queue of scripted responses. The last one repeats once the queue drains.
struct Script<T> {
    steps: VecDeque<Result<T, ApiError>>,
    last: Option<Result<T, ApiError>>,
}

impl<T: Clone> Script<T> {
    fn new() -> Self {
        Self {
            steps: VecDeque::new(),
            last: None,
        }
    }

    fn push(&mut self, step: Result<T, ApiError>) {
        self.steps.push_back(step);
    }

    fn next(&mut self) -> Option<Result<T, ApiError>> {
        match self.steps.pop_front() {
            Some(step) => {
                self.last = Some(step.clone());
                Some(step)
            }
            None => self.last.clone(),
        }
    }
}

#[derive(Default)]
struct State {
    next_id: u64,
    started: HashMap<JobKind, VecDeque<Result<String, ApiError>>>,
    jobs: HashMap<String, Script<StatusResponse>>,
    listing: Option<Result<Vec<ListedJob>, ApiError>>,
    batch_ids: VecDeque<Result<String, ApiError>>,
    batches: HashMap<String, Script<BatchStatusResponse>>,
    calls: Vec<ApiCall>,
}

/// In-memory scripted stand-in for the remote job service.
///
/// Tests script responses per job id; `with_defaults` additionally makes every
/// unscripted job run a short happy path, which is what `--simulation` uses.
#[derive(Clone, Default)]
pub struct SimulatedApi {
    state: Arc<Mutex<State>>,
    defaults: bool,
}

impl SimulatedApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Self {
        Self {
            defaults: true,
            ..Self::default()
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The next `start_job` of `kind` returns `job_id`.
    pub fn queue_start(&self, kind: JobKind, job_id: impl Into<String>) {
        self.lock()
            .started
            .entry(kind)
            .or_default()
            .push_back(Ok(job_id.into()));
    }

    /// The next `start_job` of `kind` fails.
    pub fn fail_start(&self, kind: JobKind, error: ApiError) {
        self.lock()
            .started
            .entry(kind)
            .or_default()
            .push_back(Err(error));
    }

    /// Append poll responses for `job_id`.
    pub fn script_job(&self, job_id: impl Into<String>, responses: Vec<StatusResponse>) {
        let mut state = self.lock();
        let script = state.jobs.entry(job_id.into()).or_insert_with(Script::new);
        for response in responses {
            script.push(Ok(response));
        }
    }

    /// Append a failing poll for `job_id`.
    pub fn fail_poll(&self, job_id: impl Into<String>, error: ApiError) {
        self.lock()
            .jobs
            .entry(job_id.into())
            .or_insert_with(Script::new)
            .push(Err(error));
    }

    pub fn set_listing(&self, listing: Vec<ListedJob>) {
        self.lock().listing = Some(Ok(listing));
    }

    pub fn fail_listing(&self, error: ApiError) {
        self.lock().listing = Some(Err(error));
    }

    /// The next `start_batch` returns `batch_id`.
    pub fn queue_batch(&self, batch_id: impl Into<String>) {
        self.lock().batch_ids.push_back(Ok(batch_id.into()));
    }

    pub fn fail_batch_start(&self, error: ApiError) {
        self.lock().batch_ids.push_back(Err(error));
    }

    /// Append aggregate poll responses for `batch_id`.
    pub fn script_batch(&self, batch_id: impl Into<String>, responses: Vec<BatchStatusResponse>) {
        let mut state = self.lock();
        let script = state
            .batches
            .entry(batch_id.into())
            .or_insert_with(Script::new);
        for response in responses {
            script.push(Ok(response));
        }
    }

    pub fn fail_batch_poll(&self, batch_id: impl Into<String>, error: ApiError) {
        self.lock()
            .batches
            .entry(batch_id.into())
            .or_insert_with(Script::new)
            .push(Err(error));
    }

    pub fn calls(&self) -> Vec<ApiCall> {
        self.lock().calls.clone()
    }

    pub fn poll_count(&self, job_id: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|call| match call {
                ApiCall::PollJob { job_id: id, .. } => id == job_id,
                ApiCall::PollBatch { batch_id } => batch_id == job_id,
                _ => false,
            })
            .count()
    }

    /// Parameters of every `start_job` of `kind`, in order.
    pub fn started(&self, kind: JobKind) -> Vec<Value> {
        self.lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                ApiCall::StartJob { kind: k, params } if *k == kind => Some(params.clone()),
                _ => None,
            })
            .collect()
    }

    fn generate_id(state: &mut State, prefix: &str) -> (u64, String) {
        state.next_id += 1;
        (state.next_id, format!("{prefix}-{}", state.next_id))
    }
}

/// Two `processing` polls, then success with an image path.
fn default_job_script(n: u64) -> Script<StatusResponse> {
    let mut script = Script::new();
    script.push(Ok(StatusResponse::with_status(JobStatus::Processing)));
    script.push(Ok(
        StatusResponse::with_status(JobStatus::Processing).logs("step 1/2"),
    ));
    script.push(Ok(StatusResponse::succeeded(json!({ "url": format!("img/{n}.png") }))));
    script
}

/// One more item finishes on every poll.
fn default_batch_script(id: &str, total: usize) -> Script<BatchStatusResponse> {
    let mut script = Script::new();
    for done in 0..=total {
        let items = (0..total)
            .map(|i| {
                if i < done {
                    BatchItem::succeeded(json!({ "url": format!("batch/{id}/{i}.png") }))
                } else {
                    BatchItem::new(JobStatus::Processing)
                }
            })
            .collect();
        script.push(Ok(BatchStatusResponse {
            completed_count: done,
            total_count: total,
            items,
            job: None,
        }));
    }
    script
}

#[async_trait]
impl JobApi for SimulatedApi {
    async fn start_job(&self, kind: JobKind, params: &Value) -> Result<String, ApiError> {
        let mut state = self.lock();
        state.calls.push(ApiCall::StartJob {
            kind,
            params: params.clone(),
        });

        if let Some(queued) = state.started.get_mut(&kind).and_then(VecDeque::pop_front) {
            return queued;
        }

        let (n, id) = Self::generate_id(&mut state, kind.as_str());
        if self.defaults && !state.jobs.contains_key(&id) {
            state.jobs.insert(id.clone(), default_job_script(n));
        }
        Ok(id)
    }

    async fn poll_job(&self, kind: JobKind, job_id: &str) -> Result<StatusResponse, ApiError> {
        let mut state = self.lock();
        state.calls.push(ApiCall::PollJob {
            kind,
            job_id: job_id.to_string(),
        });

        state
            .jobs
            .get_mut(job_id)
            .and_then(Script::next)
            .unwrap_or_else(|| {
                Err(ApiError::Http {
                    status: 404,
                    body: format!("unknown job {job_id}"),
                })
            })
    }

    async fn list_jobs(&self) -> Result<Vec<ListedJob>, ApiError> {
        let mut state = self.lock();
        state.calls.push(ApiCall::ListJobs);
        state.listing.clone().unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn start_batch(&self, request: &BatchRequest) -> Result<String, ApiError> {
        let mut state = self.lock();
        let payload =
            serde_json::to_value(request).map_err(|e| ApiError::Decode(e.to_string()))?;
        state.calls.push(ApiCall::StartBatch { request: payload });

        if let Some(queued) = state.batch_ids.pop_front() {
            return queued;
        }

        let (_, id) = Self::generate_id(&mut state, "batch");
        if self.defaults && !state.batches.contains_key(&id) {
            let script = default_batch_script(&id, request.items.len());
            state.batches.insert(id.clone(), script);
        }
        Ok(id)
    }

    async fn poll_batch(&self, batch_id: &str) -> Result<BatchStatusResponse, ApiError> {
        let mut state = self.lock();
        state.calls.push(ApiCall::PollBatch {
            batch_id: batch_id.to_string(),
        });

        state
            .batches
            .get_mut(batch_id)
            .and_then(Script::next)
            .unwrap_or_else(|| {
                Err(ApiError::Http {
                    status: 404,
                    body: format!("unknown batch {batch_id}"),
                })
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn last_scripted_response_repeats() {
        let api = SimulatedApi::new();
        api.queue_start(JobKind::Upscale, "u1");
        api.script_job(
            "u1",
            vec![
                StatusResponse::with_status(JobStatus::Queued),
                StatusResponse::with_status(JobStatus::Processing),
            ],
        );

        assert_eq!(api.start_job(JobKind::Upscale, &json!({})).await.unwrap(), "u1");
        for expected in [JobStatus::Queued, JobStatus::Processing, JobStatus::Processing] {
            let response = api.poll_job(JobKind::Upscale, "u1").await.unwrap();
            assert_eq!(response.status, Some(expected));
        }
        assert_eq!(api.poll_count("u1"), 3);
    }

    #[tokio::test]
    async fn unscripted_job_is_not_found() {
        let api = SimulatedApi::new();
        let err = api.poll_job(JobKind::Generation, "missing").await.unwrap_err();
        assert!(matches!(err, ApiError::Http { status: 404, .. }));
    }

    #[tokio::test]
    async fn defaults_run_a_happy_path() {
        let api = SimulatedApi::with_defaults();
        let id = api
            .start_job(JobKind::Generation, &json!({"prompt": "a lamp"}))
            .await
            .unwrap();

        let mut last = None;
        for _ in 0..3 {
            last = api.poll_job(JobKind::Generation, &id).await.unwrap().status;
        }
        assert_eq!(last, Some(JobStatus::Succeeded));
        assert_eq!(api.started(JobKind::Generation), vec![json!({"prompt": "a lamp"})]);
    }

    #[tokio::test]
    async fn default_batch_finishes_one_item_per_poll() {
        let api = SimulatedApi::with_defaults();
        let request = BatchRequest {
            items: vec![json!({}), json!({})],
            ..Default::default()
        };
        let id = api.start_batch(&request).await.unwrap();

        let first = api.poll_batch(&id).await.unwrap();
        assert_eq!(first.completed_count, 0);
        api.poll_batch(&id).await.unwrap();
        let last = api.poll_batch(&id).await.unwrap();
        assert!(last.items.iter().all(BatchItem::is_terminal));
    }
}
