//! # reindex-store
//!
//! Key/value substrate for the reindexing queues and indexer state.
//!
//! - [`KvStore`]: Redis-like strings, lists, sets and hashes, plus an
//!   optional pipeline transport
//! - [`MemoryKvStore`]: in-process, supports pipelines
//! - [`RocksKvStore`]: durable RocksDB store, no pipelines
//! - [`RemoteKvStore`] / [`KvServer`]: any store shared as a gRPC service
//! - [`open_store`]: pick one from [`StoreSettings`]

pub mod column_families;
pub mod error;
pub mod kv;
pub mod memory;
pub mod pb;
pub mod remote;
pub mod rocks;
pub mod server;
pub mod wire;

use std::sync::Arc;

use reindex_types::{StoreBackend, StoreSettings};
use tracing::info;

pub use error::StoreError;
pub use kv::{Command, KvStore, Reply};
pub use memory::MemoryKvStore;
pub use remote::RemoteKvStore;
pub use rocks::RocksKvStore;
pub use server::{KvServer, KvServiceImpl};

/// Open the store selected by `settings.backend`.
///
/// The remote backend dials lazily, so this succeeds even when the server
/// is not up yet.
pub fn open_store(settings: &StoreSettings) -> Result<Arc<dyn KvStore>, StoreError> {
    let store: Arc<dyn KvStore> = match settings.backend {
        StoreBackend::Memory => Arc::new(MemoryKvStore::new()),
        StoreBackend::Rocksdb => {
            let path = settings.expanded_db_path();
            std::fs::create_dir_all(&path)
                .map_err(|e| StoreError::InvalidArgument(format!("{}: {}", path.display(), e)))?;
            Arc::new(RocksKvStore::open(&path)?)
        }
        StoreBackend::Remote => Arc::new(RemoteKvStore::new(
            settings.remote_addr.clone(),
            settings.socket_timeout(),
        )?),
    };
    info!(backend = store.name(), "Opened key/value store");
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_open_store_backends() {
        let settings = StoreSettings::default();
        assert_eq!(open_store(&settings).unwrap().name(), "memory");

        let temp = TempDir::new().unwrap();
        let settings = StoreSettings {
            backend: StoreBackend::Rocksdb,
            db_path: temp.path().join("kv").to_string_lossy().to_string(),
            ..Default::default()
        };
        let store = open_store(&settings).unwrap();
        assert_eq!(store.name(), "rocksdb");
        store.set("a", "1").await.unwrap();

        let settings = StoreSettings {
            backend: StoreBackend::Remote,
            ..Default::default()
        };
        assert_eq!(open_store(&settings).unwrap().name(), "remote");
    }
}
