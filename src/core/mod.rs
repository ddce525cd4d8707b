pub mod api;
pub mod batch;
pub mod events;
pub mod models;
pub mod pipeline;
pub mod resumption;
pub mod slots;
pub mod tracker;

pub use api::{ApiError, BatchRequest, JobApi};
pub use batch::{BatchError, BatchHandle, BatchOrchestrator};
pub use events::{BatchEvent, PipelineEvent, TrackerEvent};
pub use models::{
    AttachMode, BatchItem, BatchJob, BatchStatusResponse, Job, JobKind, JobStatus, ListedJob,
    StatusResponse,
};
pub use pipeline::{PipelineCoordinator, PipelineError, PipelineHandle, PipelineOutcome, StageSpec};
pub use resumption::{ResumeError, ResumptionManager};
pub use slots::TrackerSlots;
pub use tracker::{JobTracker, PollSettings, TrackerHandle};
