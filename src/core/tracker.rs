//! Poll loop for a single remote job.
//!
//! A [`JobTracker`] spawns one task per job. The task polls immediately,
//! then waits the kind's interval after each response before polling again,
//! so requests for one job never overlap and responses are applied in order.
//! It stops on a terminal status, on a transport failure, when its
//! cancellation token fires, or when the owner drops the event receiver.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::api::JobApi;
use super::events::TrackerEvent;
use super::models::{AttachMode, Job, JobKind, JobStatus, ListedJob};
use crate::logging::LogThrottle;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const TRAINING_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Minimum gap between "still running" log lines for one job.
const LIVENESS_LOG_INTERVAL: Duration = Duration::from_secs(60);

/// Poll cadence per job kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub interval: Duration,
    pub training_interval: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            training_interval: TRAINING_POLL_INTERVAL,
        }
    }
}

impl PollSettings {
    /// Same interval for every kind. Handy for tests.
    pub fn uniform(interval: Duration) -> Self {
        Self {
            interval,
            training_interval: interval,
        }
    }

    pub fn interval_for(&self, kind: JobKind) -> Duration {
        match kind {
            JobKind::Training => self.training_interval,
            _ => self.interval,
        }
    }
}

/// Starts poll loops against a [`JobApi`].
#[derive(Clone)]
pub struct JobTracker {
    api: Arc<dyn JobApi>,
    settings: PollSettings,
    parent: Option<CancellationToken>,
}

impl JobTracker {
    pub fn new(api: Arc<dyn JobApi>, settings: PollSettings) -> Self {
        Self {
            api,
            settings,
            parent: None,
        }
    }

    /// A tracker whose loops are also cancelled when `token` is.
    pub fn child_of(&self, token: &CancellationToken) -> Self {
        Self {
            api: Arc::clone(&self.api),
            settings: self.settings,
            parent: Some(token.clone()),
        }
    }

    pub fn api(&self) -> &Arc<dyn JobApi> {
        &self.api
    }

    pub fn settings(&self) -> PollSettings {
        self.settings
    }

    /// Track a job this process just started.
    pub fn start(
        &self,
        job_id: impl Into<String>,
        kind: JobKind,
        events: mpsc::Sender<TrackerEvent>,
    ) -> TrackerHandle {
        self.attach(Job::new(job_id, kind), AttachMode::Starting, events)
    }

    /// Re-attach to a job that was already in flight before this process started.
    pub fn resume(&self, listed: &ListedJob, events: mpsc::Sender<TrackerEvent>) -> TrackerHandle {
        self.attach(Job::from_listing(listed), AttachMode::Resuming, events)
    }

    fn attach(
        &self,
        job: Job,
        mode: AttachMode,
        events: mpsc::Sender<TrackerEvent>,
    ) -> TrackerHandle {
        let cancel = match &self.parent {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };
        let (snapshot_tx, snapshot_rx) = watch::channel(job.clone());

        let handle = TrackerHandle {
            job_id: job.id.clone(),
            kind: job.kind,
            mode,
            cancel: cancel.clone(),
            snapshot: snapshot_rx,
        };

        let span = info_span!("tracker", job_id = %job.id, kind = %job.kind);
        let poll = PollLoop {
            api: Arc::clone(&self.api),
            interval: self.settings.interval_for(job.kind),
            job,
            mode,
            cancel,
            snapshot: snapshot_tx,
            events,
        };
        tokio::spawn(poll.run().instrument(span));

        handle
    }
}

/// Owner-side handle of a running tracker.
///
/// Cloning is cheap; every clone controls the same loop.
#[derive(Debug, Clone)]
pub struct TrackerHandle {
    job_id: String,
    kind: JobKind,
    mode: AttachMode,
    cancel: CancellationToken,
    snapshot: watch::Receiver<Job>,
}

impl TrackerHandle {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    /// `starting` for jobs started by this process, `resuming` for re-attached ones.
    pub fn mode(&self) -> AttachMode {
        self.mode
    }

    /// Latest local view of the job.
    pub fn snapshot(&self) -> Job {
        self.snapshot.borrow().clone()
    }

    /// Stop polling. Local only: the remote job keeps running.
    ///
    /// Safe to call any number of times, including after the job finished.
    pub fn cancel(&self) {
        if !self.cancel.is_cancelled() {
            debug!(job_id = %self.job_id, "Abandoning tracker");
        }
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Both handles observe the same poll loop.
    pub fn same_tracker(&self, other: &TrackerHandle) -> bool {
        self.snapshot.same_channel(&other.snapshot)
    }

    /// Still polling: not cancelled, not terminal, loop alive.
    pub fn is_active(&self) -> bool {
        !self.cancel.is_cancelled()
            && !self.snapshot.borrow().is_terminal()
            && self.snapshot.has_changed().is_ok()
    }

    /// Wait until the job is terminal or the tracker stopped, and return the
    /// final snapshot.
    pub async fn wait(&self) -> Job {
        let mut rx = self.snapshot.clone();
        loop {
            if rx.borrow_and_update().is_terminal() {
                break;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                changed = rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        rx.borrow().clone()
    }
}

struct PollLoop {
    api: Arc<dyn JobApi>,
    interval: Duration,
    job: Job,
    mode: AttachMode,
    cancel: CancellationToken,
    snapshot: watch::Sender<Job>,
    events: mpsc::Sender<TrackerEvent>,
}

impl PollLoop {
    async fn run(mut self) {
        let attached = TrackerEvent::Attached {
            job_id: self.job.id.clone(),
            kind: self.job.kind,
            mode: self.mode,
            status: self.job.status,
        };
        if !self.emit(attached).await {
            return;
        }

        info!(
            mode = %self.mode,
            status = %self.job.status,
            interval_ms = self.interval.as_millis() as u64,
            "Tracking job",
        );

        let throttle = LogThrottle::new(LIVENESS_LOG_INTERVAL);

        loop {
            if self.events.is_closed() {
                debug!("Owner dropped the event receiver, stopping tracker");
                self.cancel.cancel();
                return;
            }

            let response = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!("Tracker cancelled while polling");
                    return;
                }
                response = self.api.poll_job(self.job.kind, &self.job.id) => response,
            };

            if self.cancel.is_cancelled() {
                return;
            }

            match response {
                Ok(response) => {
                    let applied = self.job.apply(response);
                    if applied.regressed {
                        warn!(status = %self.job.status, "Ignoring status that would move backwards");
                    }
                    self.publish();

                    if applied.status_changed || applied.logs_changed {
                        debug!(status = %self.job.status, "Job status updated");
                        let changed = TrackerEvent::StatusChanged {
                            job_id: self.job.id.clone(),
                            status: self.job.status,
                            logs: self.job.logs.clone(),
                        };
                        if !self.emit(changed).await {
                            return;
                        }
                    } else if throttle.should_log() {
                        info!(status = %self.job.status, "Job still running");
                    }
                }
                Err(e) => {
                    error!(error = %e, "Polling failed, giving up on job");
                    self.job.fail_locally(format!("transport error: {e}"));
                    self.publish();
                    let changed = TrackerEvent::StatusChanged {
                        job_id: self.job.id.clone(),
                        status: self.job.status,
                        logs: self.job.logs.clone(),
                    };
                    if !self.emit(changed).await {
                        return;
                    }
                }
            }

            if self.job.is_terminal() {
                self.finish().await;
                return;
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!("Tracker cancelled between polls");
                    return;
                }
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }

    async fn finish(&self) {
        let event = if self.job.status == JobStatus::Succeeded {
            info!("Job completed");
            TrackerEvent::Completed {
                job_id: self.job.id.clone(),
                result: self.job.result.clone().unwrap_or(Value::Null),
            }
        } else {
            let error = self.job.error.clone().unwrap_or_default();
            warn!(status = %self.job.status, error = %error, "Job failed");
            TrackerEvent::Failed {
                job_id: self.job.id.clone(),
                status: self.job.status,
                error,
            }
        };
        self.emit(event).await;
    }

    fn publish(&self) {
        self.snapshot.send_replace(self.job.clone());
    }

    /// Deliver an event to the owner. A closed channel means the owner is gone.
    async fn emit(&self, event: TrackerEvent) -> bool {
        if self.events.send(event).await.is_err() {
            debug!("Owner dropped the event receiver, stopping tracker");
            self.cancel.cancel();
            return false;
        }
        true
    }
}
