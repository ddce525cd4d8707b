//! Fan-out of independent sub-jobs under one batch id.
//!
//! The remote system starts and runs the items. Locally there is one poll
//! loop per batch against the aggregate status endpoint; it keeps going until
//! every item is terminal, whatever the individual outcomes.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::api::{ApiError, BatchRequest, JobApi};
use super::events::BatchEvent;
use super::models::BatchJob;
use super::tracker::DEFAULT_POLL_INTERVAL;

#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error("a batch needs at least one item")]
    Empty,

    #[error("batch could not be started: {0}")]
    Start(#[from] ApiError),
}

/// Starts batches and follows their aggregate progress.
#[derive(Clone)]
pub struct BatchOrchestrator {
    api: Arc<dyn JobApi>,
    interval: Duration,
}

impl BatchOrchestrator {
    pub fn new(api: Arc<dyn JobApi>) -> Self {
        Self {
            api,
            interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Start a batch of `items` sharing `shared` parameters and begin polling.
    pub async fn start(
        &self,
        shared: serde_json::Map<String, Value>,
        items: Vec<Value>,
        events: mpsc::Sender<BatchEvent>,
    ) -> Result<BatchHandle, BatchError> {
        if items.is_empty() {
            return Err(BatchError::Empty);
        }

        let total = items.len();
        let request = BatchRequest { shared, items };
        let batch_id = self.api.start_batch(&request).await?;
        info!(batch_id = %batch_id, items = total, "Batch started");

        Ok(self.attach(BatchJob::new(batch_id, total), events))
    }

    /// Follow a batch that was started elsewhere.
    pub fn follow(
        &self,
        batch_id: impl Into<String>,
        events: mpsc::Sender<BatchEvent>,
    ) -> BatchHandle {
        self.attach(BatchJob::new(batch_id, 0), events)
    }

    fn attach(&self, batch: BatchJob, events: mpsc::Sender<BatchEvent>) -> BatchHandle {
        let cancel = CancellationToken::new();
        let (snapshot_tx, snapshot_rx) = watch::channel(batch.clone());

        let handle = BatchHandle {
            batch_id: batch.id.clone(),
            cancel: cancel.clone(),
            snapshot: snapshot_rx,
        };

        let span = info_span!("batch", batch_id = %batch.id);
        let poll = BatchPoll {
            api: Arc::clone(&self.api),
            interval: self.interval,
            batch,
            cancel,
            snapshot: snapshot_tx,
            events,
        };
        tokio::spawn(poll.run().instrument(span));

        handle
    }
}

/// Owner-side handle of a followed batch.
#[derive(Debug, Clone)]
pub struct BatchHandle {
    batch_id: String,
    cancel: CancellationToken,
    snapshot: watch::Receiver<BatchJob>,
}

impl BatchHandle {
    pub fn batch_id(&self) -> &str {
        &self.batch_id
    }

    pub fn snapshot(&self) -> BatchJob {
        self.snapshot.borrow().clone()
    }

    /// Stop polling. Local only and idempotent.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait until the batch completes, fails to poll, or is cancelled.
    pub async fn wait(&self) -> BatchJob {
        let mut rx = self.snapshot.clone();
        loop {
            {
                let batch = rx.borrow_and_update();
                if batch.completed || batch.error.is_some() {
                    break;
                }
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

struct BatchPoll {
    api: Arc<dyn JobApi>,
    interval: Duration,
    batch: BatchJob,
    cancel: CancellationToken,
    snapshot: watch::Sender<BatchJob>,
    events: mpsc::Sender<BatchEvent>,
}

impl BatchPoll {
    async fn run(mut self) {
        loop {
            if self.events.is_closed() {
                debug!("Owner dropped the batch event receiver, stopping");
                self.cancel.cancel();
                return;
            }

            let response = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!("Batch tracking cancelled while polling");
                    return;
                }
                response = self.api.poll_batch(&self.batch.id) => response,
            };

            if self.cancel.is_cancelled() {
                return;
            }

            let response = match response {
                Ok(response) => response,
                Err(e) => {
                    error!(error = %e, "Batch polling failed, giving up");
                    let message = format!("transport error: {e}");
                    self.batch.error = Some(message.clone());
                    self.snapshot.send_replace(self.batch.clone());
                    self.emit(BatchEvent::Failed {
                        batch_id: self.batch.id.clone(),
                        error: message,
                    })
                    .await;
                    return;
                }
            };

            let reported = response.reported_completed();
            let before = self.batch.completed_count;
            let changed = self.batch.merge(response);
            if reported != self.batch.completed_count {
                debug!(
                    reported,
                    counted = self.batch.completed_count,
                    "Remote completed count differs from item states",
                );
            }
            self.snapshot.send_replace(self.batch.clone());

            for index in changed {
                let item = self.batch.items[index].clone();
                if item.status.is_failure() {
                    warn!(
                        index,
                        status = %item.status,
                        error = item.error.as_deref().unwrap_or_default(),
                        "Batch item failed",
                    );
                }
                if !self
                    .emit(BatchEvent::ItemChanged {
                        batch_id: self.batch.id.clone(),
                        index,
                        item,
                    })
                    .await
                {
                    return;
                }
            }

            if self.batch.completed_count != before {
                info!(
                    completed = self.batch.completed_count,
                    total = self.batch.total_count,
                    "Batch progress",
                );
            }

            if !self
                .emit(BatchEvent::Progress {
                    batch: self.batch.clone(),
                })
                .await
            {
                return;
            }

            if self.batch.completed {
                info!(
                    completed = self.batch.completed_count,
                    total = self.batch.total_count,
                    "Batch completed",
                );
                self.emit(BatchEvent::Completed {
                    batch: self.batch.clone(),
                })
                .await;
                return;
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!("Batch tracking cancelled between polls");
                    return;
                }
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }

    async fn emit(&self, event: BatchEvent) -> bool {
        if self.events.send(event).await.is_err() {
            debug!("Owner dropped the batch event receiver, stopping");
            self.cancel.cancel();
            return false;
        }
        true
    }
}
