//! Notifications pushed by the orchestration core to whoever owns a tracker,
//! pipeline or batch.

use serde::Serialize;
use serde_json::Value;

use super::models::{AttachMode, BatchItem, BatchJob, JobKind, JobStatus};

/// Events emitted by a single [`JobTracker`](super::tracker::JobTracker).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum TrackerEvent {
    /// The tracker attached to its job. Always the first event.
    Attached {
        job_id: String,
        kind: JobKind,
        mode: AttachMode,
        status: JobStatus,
    },
    /// A poll changed the status or replaced the logs.
    StatusChanged {
        job_id: String,
        status: JobStatus,
        logs: Option<String>,
    },
    /// The job succeeded. Emitted once.
    Completed { job_id: String, result: Value },
    /// The job failed, was canceled, or could not be polled. Emitted once.
    Failed {
        job_id: String,
        status: JobStatus,
        error: String,
    },
}

impl TrackerEvent {
    pub fn job_id(&self) -> &str {
        match self {
            Self::Attached { job_id, .. }
            | Self::StatusChanged { job_id, .. }
            | Self::Completed { job_id, .. }
            | Self::Failed { job_id, .. } => job_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Failed { .. })
    }
}

/// Events emitted by a [`PipelineCoordinator`](super::pipeline::PipelineCoordinator) run.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum PipelineEvent {
    /// A stage's remote job was started.
    StageStarted {
        stage: usize,
        kind: JobKind,
        job_id: String,
    },
    /// A tracker event from the active stage.
    Stage { stage: usize, update: TrackerEvent },
    /// The pipeline stopped at `stage`; later stages never start.
    Halted {
        stage: usize,
        kind: JobKind,
        error: String,
    },
    /// Every stage succeeded. Carries the last stage's result.
    Finished { result: Value },
}

/// Events emitted by a [`BatchOrchestrator`](super::batch::BatchOrchestrator) run.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum BatchEvent {
    /// One item changed state.
    ItemChanged {
        batch_id: String,
        index: usize,
        item: BatchItem,
    },
    /// Aggregate view after each poll.
    Progress { batch: BatchJob },
    /// Every item is terminal.
    Completed { batch: BatchJob },
    /// The aggregate endpoint could not be polled; tracking stopped.
    Failed { batch_id: String, error: String },
}
