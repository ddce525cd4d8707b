//! The single active tracker per job kind.
//!
//! In a single-job context only one tracker of a kind is meaningful: starting
//! a new training abandons the previous training's tracker. Abandoning is a
//! local cancel, the remote job is left alone.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::info;

use super::api::ApiError;
use super::events::TrackerEvent;
use super::models::JobKind;
use super::tracker::{JobTracker, TrackerHandle};

#[derive(Clone, Default)]
pub struct TrackerSlots {
    inner: Arc<Mutex<HashMap<JobKind, TrackerHandle>>>,
}

impl TrackerSlots {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<JobKind, TrackerHandle>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make `handle` the active tracker for its kind, abandoning the previous one.
    ///
    /// Returns the abandoned handle, if there was one. Occupying with the
    /// tracker that already holds the slot is a no-op.
    pub fn occupy(&self, handle: TrackerHandle) -> Option<TrackerHandle> {
        let previous = self.lock().insert(handle.kind(), handle.clone())?;
        if previous.same_tracker(&handle) {
            return None;
        }
        info!(
            kind = %handle.kind(),
            abandoned = %previous.job_id(),
            job_id = %handle.job_id(),
            "Abandoning previous tracker of the same kind",
        );
        previous.cancel();
        Some(previous)
    }

    pub fn current(&self, kind: JobKind) -> Option<TrackerHandle> {
        self.lock().get(&kind).cloned()
    }

    /// Start a remote job and track it in its kind's slot.
    ///
    /// The previous tracker of the same kind is only abandoned once the new
    /// job has actually been accepted by the remote system.
    pub async fn launch(
        &self,
        tracker: &JobTracker,
        kind: JobKind,
        params: &Value,
        events: mpsc::Sender<TrackerEvent>,
    ) -> Result<TrackerHandle, ApiError> {
        let job_id = tracker.api().start_job(kind, params).await?;
        info!(job_id = %job_id, kind = %kind, "Remote job started");

        let handle = tracker.start(job_id, kind, events);
        self.occupy(handle.clone());
        Ok(handle)
    }

    /// Cancel every tracker. Used on shutdown.
    pub fn cancel_all(&self) {
        for (_, handle) in self.lock().drain() {
            handle.cancel();
        }
    }

    pub fn active_count(&self) -> usize {
        self.lock().values().filter(|h| h.is_active()).count()
    }
}
