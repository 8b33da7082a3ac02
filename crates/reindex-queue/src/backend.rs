//! The queue backend contract and its type tags.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::QueueError;
use crate::meta::QueueMeta;

/// Largest single value a queue accepts, in bytes.
pub const DEFAULT_MAX_VALUE_SIZE: usize = 262_144;

/// Closed set of queue implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueKind {
    /// Process-local list; server and workers must share the process
    BaseInMemory,
    /// Store list, one call per value
    RemoteList,
    /// Store list, values batched in one pipeline
    RemoteListPipe,
    /// Store set, one call per value
    RemoteSet,
    /// Store set, values batched in one pipeline
    RemoteSetPipe,
    /// Store set, pipelined adds and a single counted pop
    RemoteSetPipeExec,
}

impl QueueKind {
    pub const ALL: [QueueKind; 6] = [
        QueueKind::BaseInMemory,
        QueueKind::RemoteList,
        QueueKind::RemoteListPipe,
        QueueKind::RemoteSet,
        QueueKind::RemoteSetPipe,
        QueueKind::RemoteSetPipeExec,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueKind::BaseInMemory => "BASE_IN_MEMORY",
            QueueKind::RemoteList => "REMOTE_LIST",
            QueueKind::RemoteListPipe => "REMOTE_LIST_PIPE",
            QueueKind::RemoteSet => "REMOTE_SET",
            QueueKind::RemoteSetPipe => "REMOTE_SET_PIPE",
            QueueKind::RemoteSetPipeExec => "REMOTE_SET_PIPE_EXEC",
        }
    }

    /// Whether the queue lives in a shared key/value store.
    pub fn is_remote(&self) -> bool {
        !matches!(self, QueueKind::BaseInMemory)
    }
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueKind {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        QueueKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| QueueError::InvalidArgument(format!("Queue type '{}' is not handled", s)))
    }
}

/// Result of [`QueueBackend::add_values`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddOutcome {
    /// Values that were not stored
    pub failed: Vec<String>,
    /// Total length of the values that were stored
    pub bytes_added: usize,
    /// Store calls (or pipelined commands) issued
    pub call_count: usize,
}

/// Result of [`QueueBackend::get_values`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GetOutcome {
    pub values: Vec<String>,
    pub call_count: usize,
}

/// Uniform interface over the queue substrates.
///
/// Delivery order is not guaranteed: list queues pop the most recently
/// added value first, set queues pop in arbitrary order.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    fn queue_name(&self) -> &str;

    fn kind(&self) -> QueueKind;

    fn max_value_size(&self) -> usize {
        DEFAULT_MAX_VALUE_SIZE
    }

    /// The batch tracking ledger owned by this queue.
    fn meta(&self) -> &dyn QueueMeta;

    /// Store values. Empty or oversized values fail individually.
    async fn add_values(&self, values: &[String]) -> Result<AddOutcome, QueueError>;

    /// Pop up to `count` values.
    async fn get_values(&self, count: usize) -> Result<GetOutcome, QueueError>;

    async fn does_exist(&self) -> Result<bool, QueueError>;

    /// `None` when the backend cannot tell.
    async fn queue_length(&self) -> Result<Option<usize>, QueueError>;

    async fn has_values(&self) -> Result<bool, QueueError> {
        Ok(matches!(self.queue_length().await?, Some(len) if len > 0))
    }

    async fn is_queue_empty(&self) -> Result<bool, QueueError> {
        Ok(!self.has_values().await?)
    }

    /// Remove every value. Succeeds on an empty or missing queue.
    async fn purge(&self) -> Result<(), QueueError>;
}

/// Split values into those a queue may store and those that fail up front.
pub(crate) fn partition_storable(values: &[String], max_value_size: usize) -> (Vec<&String>, Vec<String>) {
    let mut storable = Vec::with_capacity(values.len());
    let mut failed = Vec::new();
    for value in values {
        if value.is_empty() || value.len() > max_value_size {
            failed.push(value.clone());
        } else {
            storable.push(value);
        }
    }
    (storable, failed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_parse_roundtrip() {
        for kind in QueueKind::ALL {
            assert_eq!(kind.as_str().parse::<QueueKind>().unwrap(), kind);
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
        }
    }

    #[test]
    fn test_unknown_kind() {
        let err = "REDIS_SORTED_SET".parse::<QueueKind>().unwrap_err();
        assert!(matches!(err, QueueError::InvalidArgument(_)));
        assert!(err.to_string().contains("REDIS_SORTED_SET"));
    }

    #[test]
    fn test_partition_storable() {
        let big = "x".repeat(11);
        let values = vec!["a".to_string(), String::new(), big.clone()];
        let (ok, failed) = partition_storable(&values, 10);
        assert_eq!(ok, vec![&values[0]]);
        assert_eq!(failed, vec![String::new(), big]);
    }
}
