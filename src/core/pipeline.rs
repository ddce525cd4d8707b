//! Sequencing of dependent jobs.
//!
//! A pipeline is a list of [`StageSpec`]s. Stage 0 starts with static
//! parameters; every later stage derives its parameters from the previous
//! stage's result and only starts after that stage's `completed` event has
//! been forwarded to the observer.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use super::api::ApiError;
use super::events::{PipelineEvent, TrackerEvent};
use super::models::JobKind;
use super::tracker::JobTracker;

/// Buffer between a stage tracker and the sequencer.
const STAGE_EVENT_BUFFER: usize = 32;

type ParamBuilder = Arc<dyn Fn(Option<&Value>) -> Result<Value, String> + Send + Sync>;

/// One stage: a job kind plus how to compute its start parameters.
#[derive(Clone)]
pub struct StageSpec {
    pub kind: JobKind,
    build: ParamBuilder,
}

impl fmt::Debug for StageSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageSpec").field("kind", &self.kind).finish()
    }
}

impl StageSpec {
    /// A stage with static parameters, independent of any previous result.
    pub fn fixed(kind: JobKind, params: Value) -> Self {
        Self {
            kind,
            build: Arc::new(move |_| Ok(params.clone())),
        }
    }

    /// A stage whose parameters are derived from the previous stage's result.
    pub fn derived<F>(kind: JobKind, derive: F) -> Self
    where
        F: Fn(&Value) -> Result<Value, String> + Send + Sync + 'static,
    {
        Self {
            kind,
            build: Arc::new(move |previous| match previous {
                Some(result) => derive(result),
                None => Err("no previous result to derive parameters from".to_string()),
            }),
        }
    }

    pub fn params(&self, previous: Option<&Value>) -> Result<Value, String> {
        (self.build)(previous)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("pipeline has no stages")]
    Empty,

    #[error("stage {stage} ({kind}) could not derive its parameters: {message}")]
    Params {
        stage: usize,
        kind: JobKind,
        message: String,
    },

    #[error("stage {stage} ({kind}) could not be started: {source}")]
    Start {
        stage: usize,
        kind: JobKind,
        #[source]
        source: ApiError,
    },
}

/// How a pipeline run ended.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum PipelineOutcome {
    Finished { result: Value },
    Halted {
        stage: usize,
        kind: JobKind,
        error: String,
    },
    /// Cancelled locally while `stage` was active.
    Cancelled { stage: usize },
}

impl PipelineOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Finished { .. })
    }
}

/// Handle on a running pipeline.
pub struct PipelineHandle {
    cancel: CancellationToken,
    task: JoinHandle<PipelineOutcome>,
}

impl PipelineHandle {
    /// Stop the active stage's tracker and start no further stages. Idempotent.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token that cancels this run, for callers that give up the handle to `wait`.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for the run to end. Errors only if the sequencer task panicked.
    pub async fn wait(self) -> Result<PipelineOutcome, JoinError> {
        self.task.await
    }
}

/// Runs ordered stages, each one a tracked remote job.
#[derive(Clone)]
pub struct PipelineCoordinator {
    tracker: JobTracker,
}

impl PipelineCoordinator {
    pub fn new(tracker: JobTracker) -> Self {
        Self { tracker }
    }

    /// Run `stages` from the first one, which uses its static parameters.
    pub fn run(
        &self,
        stages: Vec<StageSpec>,
        events: mpsc::Sender<PipelineEvent>,
    ) -> Result<PipelineHandle, PipelineError> {
        self.run_from(stages, None, events)
    }

    /// Run `stages` with `seed` standing in for the result of a stage that
    /// already succeeded earlier.
    pub fn run_from(
        &self,
        stages: Vec<StageSpec>,
        seed: Option<Value>,
        events: mpsc::Sender<PipelineEvent>,
    ) -> Result<PipelineHandle, PipelineError> {
        if stages.is_empty() {
            return Err(PipelineError::Empty);
        }

        let cancel = CancellationToken::new();
        let sequencer = Sequencer {
            tracker: self.tracker.child_of(&cancel),
            stages,
            cancel: cancel.clone(),
            events,
        };
        let span = info_span!("pipeline", pipeline_id = %uuid::Uuid::now_v7());
        let task = tokio::spawn(sequencer.run(seed).instrument(span));

        Ok(PipelineHandle { cancel, task })
    }

    /// Generate an image, then upscale it as soon as generation succeeds.
    pub fn generate_and_upscale(
        &self,
        generation_params: Value,
        events: mpsc::Sender<PipelineEvent>,
    ) -> Result<PipelineHandle, PipelineError> {
        self.run(generate_then_upscale(generation_params), events)
    }

    /// Run the upscale stage alone against an earlier generation result.
    ///
    /// Can be called any number of times, with the same or different results.
    pub fn replay_upscale(
        &self,
        generation_result: Value,
        events: mpsc::Sender<PipelineEvent>,
    ) -> Result<PipelineHandle, PipelineError> {
        self.run_from(vec![upscale_stage()], Some(generation_result), events)
    }
}

enum StageOutcome {
    Succeeded(Value),
    Failed(String),
    Cancelled,
}

struct Sequencer {
    tracker: JobTracker,
    stages: Vec<StageSpec>,
    cancel: CancellationToken,
    events: mpsc::Sender<PipelineEvent>,
}

impl Sequencer {
    async fn run(self, seed: Option<Value>) -> PipelineOutcome {
        let mut previous = seed;

        for (stage, spec) in self.stages.iter().enumerate() {
            let outcome = self.run_stage(stage, spec, previous.as_ref()).await;
            match outcome {
                StageOutcome::Succeeded(result) => previous = Some(result),
                StageOutcome::Failed(error) => {
                    warn!(stage, kind = %spec.kind, error = %error, "Pipeline halted");
                    self.emit(PipelineEvent::Halted {
                        stage,
                        kind: spec.kind,
                        error: error.clone(),
                    })
                    .await;
                    return PipelineOutcome::Halted {
                        stage,
                        kind: spec.kind,
                        error,
                    };
                }
                StageOutcome::Cancelled => {
                    info!(stage, "Pipeline cancelled");
                    return PipelineOutcome::Cancelled { stage };
                }
            }
        }

        let result = previous.unwrap_or(Value::Null);
        info!(stages = self.stages.len(), "Pipeline finished");
        self.emit(PipelineEvent::Finished {
            result: result.clone(),
        })
        .await;
        PipelineOutcome::Finished { result }
    }

    async fn run_stage(
        &self,
        stage: usize,
        spec: &StageSpec,
        previous: Option<&Value>,
    ) -> StageOutcome {
        if self.cancel.is_cancelled() {
            return StageOutcome::Cancelled;
        }
        if self.events.is_closed() {
            self.owner_gone();
            return StageOutcome::Cancelled;
        }

        let params = match spec.params(previous) {
            Ok(params) => params,
            Err(message) => {
                let err = PipelineError::Params {
                    stage,
                    kind: spec.kind,
                    message,
                };
                return StageOutcome::Failed(err.to_string());
            }
        };

        let started = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return StageOutcome::Cancelled,
            started = self.tracker.api().start_job(spec.kind, &params) => started,
        };
        let job_id = match started {
            Ok(job_id) => job_id,
            Err(source) => {
                let err = PipelineError::Start {
                    stage,
                    kind: spec.kind,
                    source,
                };
                return StageOutcome::Failed(err.to_string());
            }
        };

        info!(stage, kind = %spec.kind, job_id = %job_id, "Pipeline stage started");
        let announced = self
            .emit(PipelineEvent::StageStarted {
                stage,
                kind: spec.kind,
                job_id: job_id.clone(),
            })
            .await;
        if !announced {
            return StageOutcome::Cancelled;
        }

        let (tx, mut rx) = mpsc::channel(STAGE_EVENT_BUFFER);
        let _handle = self.tracker.start(job_id, spec.kind, tx);

        loop {
            let update = tokio::select! {
                update = rx.recv() => update,
                _ = self.events.closed() => {
                    self.owner_gone();
                    return StageOutcome::Cancelled;
                }
            };
            // The tracker stopped without a terminal event: it was cancelled.
            let Some(update) = update else {
                return StageOutcome::Cancelled;
            };

            let outcome = match &update {
                TrackerEvent::Completed { result, .. } => {
                    Some(StageOutcome::Succeeded(result.clone()))
                }
                TrackerEvent::Failed { error, .. } => Some(StageOutcome::Failed(error.clone())),
                _ => None,
            };
            if !self.emit(PipelineEvent::Stage { stage, update }).await {
                return StageOutcome::Cancelled;
            }
            if let Some(outcome) = outcome {
                return outcome;
            }
        }
    }

    /// Deliver an event to the observer. A closed channel means the owner is
    /// gone and the run stops.
    async fn emit(&self, event: PipelineEvent) -> bool {
        if self.events.send(event).await.is_err() {
            self.owner_gone();
            return false;
        }
        true
    }

    fn owner_gone(&self) {
        debug!("Owner dropped the pipeline event receiver, stopping");
        self.cancel.cancel();
    }
}

/// The generate -> upscale pipeline.
pub fn generate_then_upscale(generation_params: Value) -> Vec<StageSpec> {
    vec![
        StageSpec::fixed(JobKind::Generation, generation_params),
        upscale_stage(),
    ]
}

/// Upscale stage fed by a generation result.
pub fn upscale_stage() -> StageSpec {
    StageSpec::derived(JobKind::Upscale, upscale_params)
}

/// Upscaler input for a generation result: the generated file's name.
pub fn upscale_params(generation_result: &Value) -> Result<Value, String> {
    let filename = artifact_filename(generation_result)
        .ok_or_else(|| format!("no image in generation result: {generation_result}"))?;
    Ok(json!({ "image_filename": filename }))
}

/// File name of the artifact referenced by a job result.
///
/// Accepts a bare URL/path string, an object with one of the usual URL keys,
/// or a list whose first entry is one of those. `img/42.png` -> `42.png`.
pub fn artifact_filename(result: &Value) -> Option<String> {
    const URL_KEYS: [&str; 6] = ["url", "image_url", "output", "filename", "path", "image"];

    match result {
        Value::String(location) => {
            let path = location.split(['?', '#']).next().unwrap_or_default();
            let name = path.trim_end_matches('/').rsplit('/').next().unwrap_or_default();
            (!name.is_empty()).then(|| name.to_string())
        }
        Value::Object(map) => URL_KEYS
            .iter()
            .filter_map(|key| map.get(*key))
            .find_map(artifact_filename),
        Value::Array(entries) => entries.first().and_then(artifact_filename),
        _ => None,
    }
}
