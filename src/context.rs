use std::sync::Arc;

use crate::adapters;
use crate::config::AppConfig;
use crate::core::{
    BatchOrchestrator, JobApi, JobTracker, PipelineCoordinator, ResumptionManager, TrackerSlots,
};

/// Process-wide wiring: config, backend, and the single-job slot table.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub api: Arc<dyn JobApi>,
    pub tracker: JobTracker,
    pub slots: TrackerSlots,
    resumption: ResumptionManager,
}

impl AppContext {
    pub fn new(config: AppConfig) -> anyhow::Result<Self> {
        let api = adapters::get_backend(&config)?;
        Ok(Self::with_api(config, api))
    }

    pub fn with_api(config: AppConfig, api: Arc<dyn JobApi>) -> Self {
        let tracker = JobTracker::new(Arc::clone(&api), config.poll_settings());
        let slots = TrackerSlots::new();
        let resumption = ResumptionManager::new(tracker.clone(), slots.clone());
        Self {
            config: Arc::new(config),
            api,
            tracker,
            slots,
            resumption,
        }
    }

    pub fn pipeline(&self) -> PipelineCoordinator {
        PipelineCoordinator::new(self.tracker.clone())
    }

    pub fn batches(&self) -> BatchOrchestrator {
        BatchOrchestrator::new(Arc::clone(&self.api))
            .with_interval(self.config.poll_settings().interval)
    }

    /// The process-wide resumption routine; it runs at most once however
    /// many clones of the context call it.
    pub fn resumption(&self) -> &ResumptionManager {
        &self.resumption
    }
}
