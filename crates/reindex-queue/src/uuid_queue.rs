//! Uuid-level view over a queue backend.
//!
//! [`UuidQueue`] is the server role: it publishes run args, loads ids and
//! decides when the run is over. [`UuidQueueWorker`] is the worker role:
//! it waits for the server's run args, checks batches out and reports them
//! back. With `batch_by > 1` several fixed-length ids are concatenated into
//! one stored value to cut store round trips.

use std::sync::Arc;
use std::time::Duration;

use reindex_store::KvStore;
use reindex_types::RunArgs;
use tracing::{debug, info};

use crate::backend::{QueueBackend, QueueKind};
use crate::error::QueueError;
use crate::kv_queue::KvQueue;
use crate::meta::{FinishOutcome, FinishedCheck, LedgerStats};

/// Concatenate fixed-length ids, at most `batch_by` per value and each
/// value strictly below `max_value_size` bytes.
pub fn combine_uuids(
    batch_by: usize,
    uuid_len: usize,
    max_value_size: usize,
    uuids: &[String],
) -> Result<Vec<String>, QueueError> {
    let mut combined = Vec::new();
    let mut current = String::new();
    let mut count = 0;
    for uuid in uuids {
        if uuid.len() != uuid_len {
            return Err(QueueError::Combine(format!(
                "uuid '{}' has length {}, expected {}",
                uuid,
                uuid.len(),
                uuid_len
            )));
        }
        if count < batch_by && current.len() + uuid.len() < max_value_size {
            current.push_str(uuid);
            count += 1;
        } else {
            combined.push(std::mem::replace(&mut current, uuid.clone()));
            count = 1;
        }
    }
    if !current.is_empty() {
        combined.push(current);
    }
    Ok(combined)
}

/// Split a combined value back into ids; a trailing partial id is dropped.
pub fn split_combined(uuid_len: usize, combined: &str) -> Vec<String> {
    if uuid_len == 0 {
        return Vec::new();
    }
    combined
        .as_bytes()
        .chunks_exact(uuid_len)
        .filter_map(|chunk| std::str::from_utf8(chunk).ok())
        .map(str::to_string)
        .collect()
}

/// How many stored values to pop for `get_count` ids.
fn values_for(get_count: usize, batch_by: usize) -> usize {
    if batch_by <= 1 {
        get_count
    } else if get_count < batch_by {
        1
    } else {
        (get_count + 1) / batch_by + 1
    }
}

/// One checked-out batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Checkout {
    /// `None` when nothing was dequeued
    pub batch_id: Option<String>,
    pub uuids: Vec<String>,
    pub call_count: usize,
}

/// Result of [`UuidQueue::load_uuids`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadOutcome {
    /// Stored values that failed (combined when `batch_by > 1`)
    pub failed: Vec<String>,
    /// Ids that landed in the queue
    pub success_count: usize,
    pub call_count: usize,
}

/// Worker-side handle.
#[derive(Clone)]
pub struct UuidQueueWorker {
    queue: Arc<dyn QueueBackend>,
    run_args: Option<RunArgs>,
}

impl UuidQueueWorker {
    /// Attach to a queue served by another process.
    ///
    /// An in-memory queue only exists inside its server's process, so it
    /// cannot be attached to; use [`UuidQueue::worker`] there.
    pub fn attach(name: &str, kind: QueueKind, store: Arc<dyn KvStore>) -> Result<Self, QueueError> {
        if kind == QueueKind::BaseInMemory {
            return Err(QueueError::Config(format!(
                "Not allowed to create a worker of type {}; server and worker must share the queue",
                kind
            )));
        }
        Ok(Self {
            queue: Arc::new(KvQueue::new(name, kind, store)?),
            run_args: None,
        })
    }

    pub fn queue_name(&self) -> &str {
        self.queue.queue_name()
    }

    pub fn queue_kind(&self) -> QueueKind {
        self.queue.kind()
    }

    pub fn backend(&self) -> &Arc<dyn QueueBackend> {
        &self.queue
    }

    /// Run args read by the last successful [`Self::server_ready`].
    pub fn run_args(&self) -> Option<&RunArgs> {
        self.run_args.as_ref()
    }

    fn require_run_args(&self) -> Result<&RunArgs, QueueError> {
        self.run_args.as_ref().ok_or_else(|| {
            QueueError::Config(format!(
                "queue '{}' has no run args; call server_ready first",
                self.queue_name()
            ))
        })
    }

    /// Read and validate the server's run args. Ok(false) until the server
    /// has published them; malformed args are an error.
    pub async fn server_ready(&mut self) -> Result<bool, QueueError> {
        match self.queue.meta().get_run_args().await? {
            Some(args) => {
                debug!(queue = %self.queue_name(), batch_by = args.batch_by, "Server ready");
                self.run_args = Some(args);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Whether the server still wants workers pulling.
    pub async fn queue_running(&self) -> Result<bool, QueueError> {
        self.queue.meta().is_server_running().await
    }

    /// Dequeue about `get_count` ids and record them as a batch.
    pub async fn get_uuids(&self, get_count: usize) -> Result<Checkout, QueueError> {
        let args = self.require_run_args()?;
        let got = self
            .queue
            .get_values(values_for(get_count, args.batch_by))
            .await?;
        let uuids = if args.batch_by == 1 {
            got.values
        } else {
            got.values
                .iter()
                .flat_map(|combined| split_combined(args.uuid_len, combined))
                .collect()
        };
        let batch_id = if uuids.is_empty() {
            None
        } else {
            Some(self.queue.meta().add_batch(&uuids).await?)
        };
        Ok(Checkout {
            batch_id,
            uuids,
            call_count: got.call_count,
        })
    }

    pub async fn add_finished(
        &self,
        batch_id: &str,
        successes: usize,
        errors: &[String],
    ) -> Result<FinishOutcome, QueueError> {
        self.queue
            .meta()
            .add_finished(batch_id, successes, errors)
            .await
    }

    pub async fn get_errors(&self) -> Result<Vec<String>, QueueError> {
        self.queue.meta().get_errors().await
    }

    pub async fn is_finished(&self, max_age: Duration) -> Result<FinishedCheck, QueueError> {
        self.queue.meta().is_finished(max_age).await
    }
}

/// Server-side handle.
pub struct UuidQueue {
    worker: UuidQueueWorker,
}

impl UuidQueue {
    pub fn new(queue: Arc<dyn QueueBackend>) -> Self {
        Self {
            worker: UuidQueueWorker {
                queue,
                run_args: None,
            },
        }
    }

    /// A worker sharing this queue, already holding the run args.
    pub fn worker(&self) -> UuidQueueWorker {
        self.worker.clone()
    }

    pub fn queue_name(&self) -> &str {
        self.worker.queue_name()
    }

    pub fn queue_kind(&self) -> QueueKind {
        self.worker.queue_kind()
    }

    pub fn backend(&self) -> &Arc<dyn QueueBackend> {
        self.worker.backend()
    }

    pub fn run_args(&self) -> Option<&RunArgs> {
        self.worker.run_args()
    }

    /// Reset the ledger, publish run args and check they read back.
    ///
    /// Called only once the previous run is known to be finished, so an
    /// interrupted run's data survives until then.
    pub async fn initialize(&mut self, run_args: &RunArgs) -> Result<bool, QueueError> {
        if run_args.batch_by > 1 && run_args.uuid_len == 0 {
            return Err(QueueError::InvalidArgument(
                "uuid_len is required when batch_by > 1".to_string(),
            ));
        }
        let meta = self.worker.queue.meta();
        meta.set_args().await?;
        meta.set_run_args(run_args).await?;
        let ready = self.worker.server_ready().await?;
        info!(
            queue = %self.queue_name(),
            kind = %self.queue_kind(),
            batch_by = run_args.batch_by,
            restart = run_args.restart,
            "Queue initialized"
        );
        Ok(ready)
    }

    /// Adopt the run args of an interrupted run without resetting it.
    pub async fn resume(&mut self) -> Result<bool, QueueError> {
        self.worker.server_ready().await
    }

    /// Load ids. With `readded`, the ids were checked out before and
    /// expired; their earlier checkout is cancelled in the ledger.
    pub async fn load_uuids(&self, uuids: &[String], readded: bool) -> Result<LoadOutcome, QueueError> {
        let args = self.worker.require_run_args()?;
        let queue = &self.worker.queue;

        let (added, success_count) = if args.batch_by == 1 {
            let added = queue.add_values(uuids).await?;
            let stored = uuids.len() - added.failed.len();
            (added, stored)
        } else {
            let combined = combine_uuids(
                args.batch_by,
                args.uuid_len,
                queue.max_value_size(),
                uuids,
            )?;
            let added = queue.add_values(&combined).await?;
            let stored = added.bytes_added / args.uuid_len;
            (added, stored)
        };

        if readded {
            if !uuids.is_empty() {
                queue.meta().values_added(-(uuids.len() as i64)).await?;
            }
        } else if success_count > 0 {
            queue.meta().values_loaded(success_count as i64).await?;
        }
        debug!(
            queue = %self.queue_name(),
            loaded = success_count,
            failed = added.failed.len(),
            readded,
            "Loaded uuids"
        );
        Ok(LoadOutcome {
            failed: added.failed,
            success_count,
            call_count: added.call_count,
        })
    }

    pub async fn get_uuids(&self, get_count: usize) -> Result<Checkout, QueueError> {
        self.worker.get_uuids(get_count).await
    }

    pub async fn add_finished(
        &self,
        batch_id: &str,
        successes: usize,
        errors: &[String],
    ) -> Result<FinishOutcome, QueueError> {
        self.worker.add_finished(batch_id, successes, errors).await
    }

    pub async fn get_errors(&self) -> Result<Vec<String>, QueueError> {
        self.worker.get_errors().await
    }

    pub async fn is_finished(&self, max_age: Duration) -> Result<FinishedCheck, QueueError> {
        self.worker.is_finished(max_age).await
    }

    /// Whether the run is over: no batch is out, the queue is drained and
    /// workers reported every loaded id. A worker holding dequeued ids it
    /// has not yet recorded as a batch keeps the run open.
    pub async fn is_run_finished(&self, max_age: Duration) -> Result<FinishedCheck, QueueError> {
        let (readd, settled) = self.is_finished(max_age).await?;
        if !readd.is_empty() || !settled || !self.is_queue_empty().await? {
            return Ok((readd, false));
        }
        let stats = self.stats().await?;
        Ok((readd, stats.accounts_for_loaded()))
    }

    pub async fn stats(&self) -> Result<LedgerStats, QueueError> {
        self.worker.queue.meta().stats().await
    }

    pub async fn is_queue_empty(&self) -> Result<bool, QueueError> {
        self.worker.queue.is_queue_empty().await
    }

    /// Whether an interrupted run left a ledger that can be resumed.
    pub async fn can_resume(&self) -> Result<bool, QueueError> {
        let meta = self.worker.queue.meta();
        Ok(meta.is_server_running().await? && meta.is_useable().await?)
    }

    /// Clear the queue and its ledger.
    pub async fn purge(&self) -> Result<(), QueueError> {
        self.worker.queue.purge().await?;
        self.worker.queue.meta().purge_meta().await
    }

    /// Tell workers the run is over.
    pub async fn stop(&self) -> Result<(), QueueError> {
        self.worker.queue.meta().set_to_not_running().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryQueue;
    use reindex_store::MemoryKvStore;

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    fn run_args(batch_by: usize, uuid_len: usize) -> RunArgs {
        RunArgs {
            batch_by,
            restart: false,
            snapshot_id: "snap".to_string(),
            uuid_len,
            xmin: 1,
        }
    }

    #[test]
    fn test_combine_and_split() {
        let uuids = ids(&["aa", "bb", "cc", "dd", "ee"]);
        let combined = combine_uuids(2, 2, 1024, &uuids).unwrap();
        assert_eq!(combined, ids(&["aabb", "ccdd", "ee"]));
        assert_eq!(split_combined(2, "ccdd"), ids(&["cc", "dd"]));

        // value size caps the combination before batch_by does
        let combined = combine_uuids(10, 2, 5, &uuids).unwrap();
        assert_eq!(combined, ids(&["aabb", "ccdd", "ee"]));

        let err = combine_uuids(2, 3, 1024, &uuids).unwrap_err();
        assert!(matches!(err, QueueError::Combine(_)));
    }

    #[test]
    fn test_values_for() {
        assert_eq!(values_for(7, 1), 7);
        assert_eq!(values_for(3, 4), 1);
        assert_eq!(values_for(8, 4), 3);
        assert_eq!(values_for(100, 10), 11);
    }

    #[tokio::test]
    async fn test_get_uuids_requires_run_args() {
        let queue = UuidQueue::new(Arc::new(MemoryQueue::new("q")));
        assert!(matches!(queue.get_uuids(1).await, Err(QueueError::Config(_))));
    }

    #[tokio::test]
    async fn test_batched_load_and_checkout() {
        let mut queue = UuidQueue::new(Arc::new(MemoryQueue::new("q")));
        assert!(queue.initialize(&run_args(2, 2)).await.unwrap());

        let loaded = queue.load_uuids(&ids(&["aa", "bb", "cc"]), false).await.unwrap();
        assert_eq!(loaded.success_count, 3);
        assert_eq!(loaded.call_count, 2);

        let checkout = queue.get_uuids(10).await.unwrap();
        let mut got = checkout.uuids.clone();
        got.sort();
        assert_eq!(got, ids(&["aa", "bb", "cc"]));
        let batch_id = checkout.batch_id.unwrap();

        let (ok, _) = queue.add_finished(&batch_id, 3, &[]).await.unwrap();
        assert!(ok);
        let (readd, done) = queue.is_finished(Duration::from_secs(60)).await.unwrap();
        assert!(readd.is_empty());
        assert!(done);
        assert!(queue.is_queue_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_readd_cancels_expired_checkout() {
        let mut queue = UuidQueue::new(Arc::new(MemoryQueue::new("q")));
        queue.initialize(&run_args(1, 0)).await.unwrap();
        queue.load_uuids(&ids(&["x", "y"]), false).await.unwrap();

        let first = queue.get_uuids(2).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let (readd, _) = queue.is_finished(Duration::from_millis(1)).await.unwrap();
        assert_eq!(readd.len(), 2);

        queue.load_uuids(&readd, true).await.unwrap();
        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.uuids_added, 0);
        assert_eq!(stats.uuids_loaded, 2);

        let second = queue.get_uuids(2).await.unwrap();
        let (ok, _) = queue
            .add_finished(second.batch_id.as_deref().unwrap(), 2, &[])
            .await
            .unwrap();
        assert!(ok);
        let (ok, msg) = queue
            .add_finished(first.batch_id.as_deref().unwrap(), 2, &[])
            .await
            .unwrap();
        assert!(!ok);
        assert!(msg.unwrap().ends_with("expired"));

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.uuids_added, 2);
        assert_eq!(stats.successes, 2);
        let (_, done) = queue.is_finished(Duration::from_secs(60)).await.unwrap();
        assert!(done);
    }

    #[tokio::test]
    async fn test_run_stays_open_while_ids_are_in_flight() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let backend = Arc::new(KvQueue::new("q", QueueKind::RemoteList, Arc::clone(&store)).unwrap());
        let mut server = UuidQueue::new(backend);
        server.initialize(&run_args(1, 0)).await.unwrap();
        server.load_uuids(&ids(&["a", "b"]), false).await.unwrap();

        // dequeued but not yet recorded as a batch
        let worker = UuidQueueWorker::attach("q", QueueKind::RemoteList, store).unwrap();
        let got = worker.backend().get_values(10).await.unwrap();
        assert_eq!(got.values.len(), 2);
        assert!(server.is_queue_empty().await.unwrap());
        let (_, ledger_done) = server.is_finished(Duration::from_secs(60)).await.unwrap();
        assert!(ledger_done);
        let (_, done) = server.is_run_finished(Duration::from_secs(60)).await.unwrap();
        assert!(!done);

        let batch_id = worker.backend().meta().add_batch(&got.values).await.unwrap();
        worker.add_finished(&batch_id, 2, &[]).await.unwrap();
        let (_, done) = server.is_run_finished(Duration::from_secs(60)).await.unwrap();
        assert!(done);
    }

    #[tokio::test]
    async fn test_remote_worker_sees_server_run() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let backend = Arc::new(KvQueue::new("q", QueueKind::RemoteSet, Arc::clone(&store)).unwrap());
        let mut server = UuidQueue::new(backend);

        let mut worker = UuidQueueWorker::attach("q", QueueKind::RemoteSet, store).unwrap();
        assert!(!worker.server_ready().await.unwrap());

        server.initialize(&run_args(1, 0)).await.unwrap();
        server.load_uuids(&ids(&["a", "b"]), false).await.unwrap();
        assert!(worker.server_ready().await.unwrap());
        assert!(worker.queue_running().await.unwrap());

        let checkout = worker.get_uuids(5).await.unwrap();
        assert_eq!(checkout.uuids.len(), 2);
        worker
            .add_finished(checkout.batch_id.as_deref().unwrap(), 1, &ids(&["err"]))
            .await
            .unwrap();
        assert_eq!(server.get_errors().await.unwrap(), ids(&["err"]));

        server.stop().await.unwrap();
        assert!(!worker.queue_running().await.unwrap());
    }

    #[test]
    fn test_attach_in_memory_rejected() {
        let result = UuidQueueWorker::attach(
            "q",
            QueueKind::BaseInMemory,
            Arc::new(MemoryKvStore::new()),
        );
        assert!(matches!(result, Err(QueueError::Config(_))));
    }
}
