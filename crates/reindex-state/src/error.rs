//! State store error types.

use reindex_store::StoreError;
use thiserror::Error;

/// Errors that can occur in the indexer state layer
#[derive(Error, Debug)]
pub enum StateError {
    /// Underlying key/value store failed
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// No state record has been written yet
    #[error("Indexer state not initialized under '{0}'")]
    NotInitialized(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Reindex request named something that is not a resource id
    #[error("Invalid reindex request: {0}")]
    InvalidRequest(String),
}

impl StateError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StateError::Store(e) if e.is_transient())
    }
}

impl From<serde_json::Error> for StateError {
    fn from(err: serde_json::Error) -> Self {
        StateError::Serialization(err.to_string())
    }
}
