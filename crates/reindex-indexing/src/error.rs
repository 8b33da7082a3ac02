//! Indexing error types.

use reindex_queue::QueueError;
use reindex_state::StateError;
use reindex_store::StoreError;
use thiserror::Error;

/// Failures reading or rendering resources.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// The resource exists but could not be turned into a document
    #[error("Render error: {0}")]
    Render(String),

    /// Source database unreachable or snapshot not available
    #[error("Source unavailable: {0}")]
    Unavailable(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl SourceError {
    pub fn is_transient(&self) -> bool {
        match self {
            SourceError::Unavailable(_) => true,
            SourceError::Store(e) => e.is_transient(),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for SourceError {
    fn from(err: serde_json::Error) -> Self {
        SourceError::Serialization(err.to_string())
    }
}

/// Failures writing to the search index.
#[derive(Debug, Error)]
pub enum WriteError {
    /// The index already holds a newer version of the document
    #[error("Version conflict for {id}: have {current}, got {version}")]
    Conflict { id: String, version: i64, current: i64 },

    /// Index unreachable or overloaded; worth retrying
    #[error("Search index unavailable: {0}")]
    Unavailable(String),

    /// The index refused the document
    #[error("Document rejected: {0}")]
    Rejected(String),

    #[error("Tantivy error: {0}")]
    Tantivy(#[from] tantivy::TantivyError),

    #[error("Index is locked: {0}")]
    IndexLocked(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WriteError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, WriteError::Unavailable(_))
    }
}

/// Errors surfacing from a worker or a coordinator pass.
#[derive(Debug, Error)]
pub enum IndexingError {
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("Write error: {0}")]
    Write(#[from] WriteError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    /// A worker task panicked or exited before the run finished
    #[error("Worker error: {0}")]
    Worker(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Shutdown was requested mid-run
    #[error("Cancelled")]
    Cancelled,
}

impl IndexingError {
    /// Infrastructure was unreachable; the poll loop backs off and retries.
    pub fn is_transient(&self) -> bool {
        match self {
            IndexingError::Queue(e) => e.is_transient(),
            IndexingError::State(e) => e.is_transient(),
            IndexingError::Store(e) => e.is_transient(),
            IndexingError::Source(e) => e.is_transient(),
            IndexingError::Write(e) => e.is_retryable(),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for IndexingError {
    fn from(err: serde_json::Error) -> Self {
        IndexingError::Serialization(err.to_string())
    }
}
