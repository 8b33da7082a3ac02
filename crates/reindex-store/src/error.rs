//! Key/value store error types.

use thiserror::Error;

/// Errors that can occur in the key/value layer
#[derive(Error, Debug)]
pub enum StoreError {
    /// RocksDB operation failed
    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    /// Column family not found
    #[error("Column family not found: {0}")]
    ColumnFamilyNotFound(String),

    /// Operation against a key holding another kind of value
    #[error("WRONGTYPE Operation against key '{0}' holding the wrong kind of value")]
    WrongType(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Could not reach the remote store, or the connection broke
    #[error("Connection error: {0}")]
    Connection(String),

    /// Malformed message or unexpected reply shape
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Backend does not provide the named capability
    #[error("Unsupported operation: {0} is not available on this store")]
    Unsupported(String),

    /// Internal lock was poisoned
    #[error("Lock error: {0}")]
    Lock(String),

    /// Bad argument (non-integer value for incr, NUL in key, ...)
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Error reported by the remote server that has no local variant
    #[error("Remote error: {0}")]
    Remote(String),
}

impl StoreError {
    /// Errors worth retrying after a pause: the store was unreachable.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Connection(_))
    }

    /// Variant payload, so a remote peer can rebuild the same variant.
    pub(crate) fn detail(&self) -> String {
        match self {
            StoreError::WrongType(d)
            | StoreError::Unsupported(d)
            | StoreError::InvalidArgument(d)
            | StoreError::Connection(d) => d.clone(),
            other => other.to_string(),
        }
    }

    pub(crate) fn kind(&self) -> ErrorKind {
        match self {
            StoreError::WrongType(_) => ErrorKind::WrongType,
            StoreError::Unsupported(_) => ErrorKind::Unsupported,
            StoreError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            StoreError::Connection(_) => ErrorKind::Connection,
            _ => ErrorKind::Other,
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

impl From<tonic::transport::Error> for StoreError {
    fn from(err: tonic::transport::Error) -> Self {
        StoreError::Connection(err.to_string())
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Connection(err.to_string())
    }
}

/// Error class carried in error replies so the client can rebuild it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    WrongType,
    Unsupported,
    InvalidArgument,
    Connection,
    Other,
}

impl ErrorKind {
    /// Rebuild a local error from a remote error reply.
    pub(crate) fn into_error(self, message: String) -> StoreError {
        match self {
            ErrorKind::WrongType => StoreError::WrongType(message),
            ErrorKind::Unsupported => StoreError::Unsupported(message),
            ErrorKind::InvalidArgument => StoreError::InvalidArgument(message),
            ErrorKind::Connection => StoreError::Connection(message),
            ErrorKind::Other => StoreError::Remote(message),
        }
    }
}
