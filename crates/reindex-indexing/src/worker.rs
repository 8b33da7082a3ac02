//! Workers pull batches off a uuid queue and index them.

use std::time::Duration;

use reindex_queue::UuidQueueWorker;
use reindex_types::WorkItem;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::IndexingError;
use crate::item::{IndexItem, RetryPolicy};
use crate::source::Collaborators;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Ids requested per dequeue
    pub get_size: usize,
    pub retry: RetryPolicy,
    /// Poll interval while waiting for the source to reach the run's xmin
    pub xmin_poll: Duration,
    /// Give up on a batch whose snapshot never becomes visible
    pub xmin_timeout: Duration,
    /// Sleep when the queue is empty but the run is still going
    pub idle_poll: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            get_size: 1024,
            retry: RetryPolicy::default(),
            xmin_poll: Duration::from_millis(100),
            xmin_timeout: Duration::from_secs(60),
            idle_poll: Duration::from_millis(500),
        }
    }
}

impl From<&reindex_types::Settings> for WorkerConfig {
    fn from(settings: &reindex_types::Settings) -> Self {
        Self {
            get_size: settings.queue.get_size,
            retry: RetryPolicy::from(&settings.indexer),
            xmin_poll: Duration::from_millis(settings.indexer.xmin_wait_ms),
            xmin_timeout: Duration::from_secs(settings.indexer.xmin_wait_timeout_secs),
            idle_poll: settings.queue.finish_poll(),
        }
    }
}

/// Totals for one worker run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerSummary {
    pub batches: usize,
    pub successes: usize,
    pub errors: usize,
    /// Batches the ledger refused, usually because they expired
    pub rejected: usize,
    /// Batches left unreported because the source was unavailable
    pub abandoned: usize,
}

pub struct Worker {
    queue: UuidQueueWorker,
    collaborators: Collaborators,
    config: WorkerConfig,
    name: String,
}

impl Worker {
    pub fn new(
        name: impl Into<String>,
        queue: UuidQueueWorker,
        collaborators: Collaborators,
        config: WorkerConfig,
    ) -> Self {
        Self {
            queue,
            collaborators,
            config,
            name: name.into(),
        }
    }

    /// Sleep unless cancelled first. Returns false on cancellation.
    async fn pause(&self, cancel: &CancellationToken, delay: Duration) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// Wait until the server has published run args.
    pub async fn wait_for_server(&mut self, cancel: &CancellationToken) -> Result<bool, IndexingError> {
        loop {
            if self.queue.server_ready().await? {
                return Ok(true);
            }
            if !self.pause(cancel, self.config.idle_poll).await {
                return Ok(false);
            }
        }
    }

    /// Wait until the source's snapshot has caught up with `xmin`.
    ///
    /// Returns false when it did not within the timeout.
    async fn wait_for_xmin(&self, xmin: i64, cancel: &CancellationToken) -> Result<bool, IndexingError> {
        let deadline = tokio::time::Instant::now() + self.config.xmin_timeout;
        loop {
            let current = self.collaborators.source.current_xmin().await?;
            if current >= xmin {
                return Ok(true);
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(worker = %self.name, current, xmin, "Snapshot never reached the run's xmin");
                return Ok(false);
            }
            if !self.pause(cancel, self.config.xmin_poll).await {
                return Ok(false);
            }
        }
    }

    /// Index every id of one batch. Returns successes and error strings.
    pub async fn index_batch(&self, uuids: &[String]) -> Result<(usize, Vec<String>), IndexingError> {
        let args = self.queue.run_args().ok_or_else(|| {
            IndexingError::Config(format!("worker {} has no run args", self.name))
        })?;
        let mut successes = 0;
        let mut errors = Vec::new();
        for uuid in uuids {
            let item = WorkItem::new(uuid.clone(), args.xmin, args.snapshot_id.clone());
            let result = IndexItem::run(
                &item,
                self.collaborators.renderer.as_ref(),
                self.collaborators.writer.as_ref(),
                &self.config.retry,
            )
            .await?;
            match result.error_string() {
                None => successes += 1,
                Some(err) => errors.push(err),
            }
        }
        Ok((successes, errors))
    }

    /// Pull and index batches until the queue is drained and the server
    /// has stopped the run, or until cancelled.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<WorkerSummary, IndexingError> {
        let mut summary = WorkerSummary::default();
        if !self.wait_for_server(&cancel).await? {
            return Ok(summary);
        }
        let xmin = self.queue.run_args().map(|args| args.xmin).unwrap_or_default();
        info!(worker = %self.name, queue = %self.queue.queue_name(), xmin, "Worker started");

        while !cancel.is_cancelled() {
            let checkout = self.queue.get_uuids(self.config.get_size).await?;
            let Some(batch_id) = checkout.batch_id else {
                if !self.queue.queue_running().await? {
                    break;
                }
                if !self.pause(&cancel, self.config.idle_poll).await {
                    break;
                }
                continue;
            };

            if !self.wait_for_xmin(xmin, &cancel).await? {
                // Left outstanding; the ledger expires it and the ids are re-queued.
                summary.abandoned += 1;
                continue;
            }
            let (successes, errors) = match self.index_batch(&checkout.uuids).await {
                Ok(outcome) => outcome,
                Err(e) if e.is_transient() => {
                    warn!(worker = %self.name, batch_id = %batch_id, error = %e, "Abandoning batch");
                    summary.abandoned += 1;
                    if !self.pause(&cancel, self.config.idle_poll).await {
                        break;
                    }
                    continue;
                }
                Err(e) => return Err(e),
            };
            if successes > 0 || !errors.is_empty() {
                self.collaborators.writer.commit().await?;
            }

            let (did_finish, message) = self
                .queue
                .add_finished(&batch_id, successes, &errors)
                .await?;
            summary.batches += 1;
            summary.successes += successes;
            summary.errors += errors.len();
            if did_finish {
                debug!(worker = %self.name, batch_id = %batch_id, successes, errors = errors.len(), "Batch finished");
            } else {
                summary.rejected += 1;
                warn!(
                    worker = %self.name,
                    batch_id = %batch_id,
                    reason = message.as_deref().unwrap_or("unknown"),
                    "Batch result rejected"
                );
            }
        }
        info!(
            worker = %self.name,
            batches = summary.batches,
            successes = summary.successes,
            errors = summary.errors,
            "Worker done"
        );
        Ok(summary)
    }

    /// Serve run after run until cancelled, for workers in their own process.
    pub async fn run_forever(&mut self, cancel: CancellationToken) -> Result<WorkerSummary, IndexingError> {
        let mut total = WorkerSummary::default();
        while !cancel.is_cancelled() {
            let running = self.queue.server_ready().await? && self.queue.queue_running().await?;
            if !running {
                if !self.pause(&cancel, self.config.idle_poll).await {
                    break;
                }
                continue;
            }
            let summary = self.run(cancel.clone()).await?;
            total.batches += summary.batches;
            total.successes += summary.successes;
            total.errors += summary.errors;
            total.rejected += summary.rejected;
            total.abandoned += summary.abandoned;
        }
        Ok(total)
    }
}
