//! Re-attaching trackers to jobs left in flight by a previous process.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::api::ApiError;
use super::events::TrackerEvent;
use super::models::ListedJob;
use super::slots::TrackerSlots;
use super::tracker::{JobTracker, TrackerHandle};

#[derive(Debug, thiserror::Error)]
pub enum ResumeError {
    #[error("could not list jobs: {0}")]
    Listing(#[from] ApiError),
}

/// Startup routine that resumes the most recent in-flight resumable job.
///
/// Clones share one run: only the first `run` queries the listing, later
/// calls return `Ok(None)` without touching the remote system.
#[derive(Clone)]
pub struct ResumptionManager {
    tracker: JobTracker,
    slots: TrackerSlots,
    ran: Arc<AtomicBool>,
}

impl ResumptionManager {
    pub fn new(tracker: JobTracker, slots: TrackerSlots) -> Self {
        Self {
            tracker,
            slots,
            ran: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn has_run(&self) -> bool {
        self.ran.load(Ordering::Acquire)
    }

    /// Query the job listing and attach a tracker to the newest non-terminal
    /// resumable job, if any. Older candidates are left without a poller.
    ///
    /// A failed listing still counts as the one run.
    pub async fn run(
        &self,
        events: mpsc::Sender<TrackerEvent>,
    ) -> Result<Option<TrackerHandle>, ResumeError> {
        if self.ran.swap(true, Ordering::AcqRel) {
            debug!("Resumption already ran, skipping");
            return Ok(None);
        }

        let listing = self.tracker.api().list_jobs().await?;

        let Some(job) = pick_resumable(&listing) else {
            info!(listed = listing.len(), "No in-flight jobs to resume");
            return Ok(None);
        };

        for skipped in listing
            .iter()
            .filter(|l| is_candidate(l) && l.job_id != job.job_id)
        {
            warn!(
                job_id = %skipped.job_id,
                kind = %skipped.kind,
                status = %skipped.status,
                "Leaving older in-flight job without a tracker",
            );
        }

        info!(
            job_id = %job.job_id,
            kind = %job.kind,
            status = %job.status,
            "Resuming in-flight job",
        );
        let handle = self.tracker.resume(job, events);
        self.slots.occupy(handle.clone());
        Ok(Some(handle))
    }
}

fn is_candidate(listed: &ListedJob) -> bool {
    listed.kind.is_resumable() && !listed.status.is_terminal()
}

/// The most recently created non-terminal job of a resumable kind.
pub fn pick_resumable(listing: &[ListedJob]) -> Option<&ListedJob> {
    listing
        .iter()
        .filter(|l| is_candidate(l))
        .max_by_key(|l| l.created_at)
}
