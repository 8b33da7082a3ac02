//! Process-local queue.

use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use crate::backend::{partition_storable, AddOutcome, GetOutcome, QueueBackend, QueueKind};
use crate::error::QueueError;
use crate::meta::{MemoryQueueMeta, QueueMeta};

/// In-memory LIFO queue with a process-local ledger.
#[derive(Debug)]
pub struct MemoryQueue {
    name: String,
    values: Mutex<Vec<String>>,
    meta: MemoryQueueMeta,
}

impl MemoryQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            values: Mutex::new(Vec::new()),
            meta: MemoryQueueMeta::new(),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Vec<String>>, QueueError> {
        self.values
            .lock()
            .map_err(|e| QueueError::Config(format!("queue lock poisoned: {}", e)))
    }
}

#[async_trait]
impl QueueBackend for MemoryQueue {
    fn queue_name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> QueueKind {
        QueueKind::BaseInMemory
    }

    fn meta(&self) -> &dyn QueueMeta {
        &self.meta
    }

    async fn add_values(&self, values: &[String]) -> Result<AddOutcome, QueueError> {
        let (storable, failed) = partition_storable(values, self.max_value_size());
        let mut queue = self.lock()?;
        let mut outcome = AddOutcome {
            failed,
            ..Default::default()
        };
        for value in storable {
            queue.push(value.clone());
            outcome.bytes_added += value.len();
            outcome.call_count += 1;
        }
        Ok(outcome)
    }

    async fn get_values(&self, count: usize) -> Result<GetOutcome, QueueError> {
        let mut queue = self.lock()?;
        let take = count.min(queue.len());
        let mut values = Vec::with_capacity(take);
        while values.len() < take {
            match queue.pop() {
                Some(value) => values.push(value),
                None => break,
            }
        }
        let call_count = values.len();
        Ok(GetOutcome { values, call_count })
    }

    async fn does_exist(&self) -> Result<bool, QueueError> {
        Ok(!self.lock()?.is_empty())
    }

    async fn queue_length(&self) -> Result<Option<usize>, QueueError> {
        Ok(Some(self.lock()?.len()))
    }

    async fn purge(&self) -> Result<(), QueueError> {
        self.lock()?.clear();
        Ok(())
    }
}
