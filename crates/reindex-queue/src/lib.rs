//! # reindex-queue
//!
//! Work queues for the reindexing pipeline.
//!
//! - [`QueueBackend`]: bulk add/get over an in-memory list or a shared
//!   key/value store, selected by [`QueueKind`] through [`create_queue`]
//! - [`QueueMeta`]: the batch tracking ledger each backend owns
//! - [`UuidQueue`] / [`UuidQueueWorker`]: server and worker roles on top

pub mod backend;
pub mod error;
pub mod kv_meta;
pub mod kv_queue;
pub mod memory;
pub mod meta;
pub mod uuid_queue;

use std::sync::Arc;

use reindex_store::KvStore;
use tracing::debug;

pub use backend::{AddOutcome, GetOutcome, QueueBackend, QueueKind, DEFAULT_MAX_VALUE_SIZE};
pub use error::QueueError;
pub use kv_meta::KvQueueMeta;
pub use kv_queue::KvQueue;
pub use memory::MemoryQueue;
pub use meta::{FinishOutcome, FinishedCheck, LedgerStats, MemoryQueueMeta, QueueMeta};
pub use uuid_queue::{combine_uuids, split_combined, Checkout, LoadOutcome, UuidQueue, UuidQueueWorker};

/// Build the queue for a type tag such as `"REMOTE_SET_PIPE"`.
///
/// Remote kinds keep their values and ledger in `store`; the in-memory
/// kind ignores it.
pub fn create_queue(
    name: &str,
    queue_type: &str,
    store: Arc<dyn KvStore>,
) -> Result<Arc<dyn QueueBackend>, QueueError> {
    let kind: QueueKind = queue_type.parse()?;
    build_queue(name, kind, store)
}

/// Build the queue for an already parsed kind.
pub fn build_queue(
    name: &str,
    kind: QueueKind,
    store: Arc<dyn KvStore>,
) -> Result<Arc<dyn QueueBackend>, QueueError> {
    debug!(queue = name, kind = %kind, store = store.name(), "Creating queue");
    let queue: Arc<dyn QueueBackend> = match kind {
        QueueKind::BaseInMemory => Arc::new(MemoryQueue::new(name)),
        _ => Arc::new(KvQueue::new(name, kind, store)?),
    };
    Ok(queue)
}

#[cfg(test)]
mod tests {
    use super::*;
    use reindex_store::MemoryKvStore;

    #[test]
    fn test_factory_builds_every_kind() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        for kind in QueueKind::ALL {
            let queue = create_queue("q", kind.as_str(), Arc::clone(&store)).unwrap();
            assert_eq!(queue.kind(), kind);
            assert_eq!(queue.queue_name(), "q");
        }
    }

    #[test]
    fn test_factory_rejects_unknown_tag() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let result = create_queue("q", "AWS_SQS", store);
        assert!(matches!(result, Err(QueueError::InvalidArgument(_))));
    }
}
