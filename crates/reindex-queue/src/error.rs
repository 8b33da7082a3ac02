//! Queue layer error types.

use reindex_store::StoreError;
use reindex_types::ReindexError;
use thiserror::Error;

/// Errors that can occur in the queue layer
#[derive(Error, Debug)]
pub enum QueueError {
    /// Underlying key/value store failed
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Queue wired to a store or role it cannot work with
    #[error("Configuration error: {0}")]
    Config(String),

    /// Unknown queue type or other bad argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Id of the wrong length handed to a combining queue
    #[error("Combine error: {0}")]
    Combine(String),

    /// Run args or ledger records could not be parsed
    #[error("Run args error: {0}")]
    RunArgs(#[from] ReindexError),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl QueueError {
    /// True when the store was unreachable; worth retrying later.
    pub fn is_transient(&self) -> bool {
        matches!(self, QueueError::Store(e) if e.is_transient())
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::Serialization(err.to_string())
    }
}
