//! End-to-end test infrastructure for the reindexing pipeline.
//!
//! Provides a shared TestHarness and helpers for tests that run the
//! coordinator, workers, queues and the search index together.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use reindex_indexing::{
    Collaborators, Coordinator, CoordinatorConfig, KvResourceSource, RetryPolicy,
    TantivyIndexWriter, WorkerConfig,
};
use reindex_queue::QueueKind;
use reindex_state::{IndexerStateStore, StateSettings};
use reindex_store::{KvServer, KvStore, MemoryKvStore, RemoteKvStore, RocksKvStore, StoreError};

/// Shared test harness for E2E tests.
///
/// Holds a key/value store, the bundled resource source over it and a
/// Tantivy index under a temp directory.
pub struct TestHarness {
    /// Keeps temp dir alive for the lifetime of the harness
    pub _temp_dir: tempfile::TempDir,
    pub store: Arc<dyn KvStore>,
    pub source: Arc<KvResourceSource>,
    pub writer: Arc<TantivyIndexWriter>,
    pub index_path: PathBuf,
}

impl TestHarness {
    /// Harness over an in-memory store; supports every queue kind.
    pub fn new() -> Self {
        Self::with_store(|_| Arc::new(MemoryKvStore::new()))
    }

    /// Harness over RocksDB; pipelined queue kinds are unavailable.
    pub fn durable() -> Self {
        Self::with_store(|dir| {
            Arc::new(RocksKvStore::open(&dir.join("store")).expect("Failed to open test store"))
        })
    }

    fn with_store(open: impl FnOnce(&Path) -> Arc<dyn KvStore>) -> Self {
        let temp_dir = tempfile::TempDir::new().expect("Failed to create temp dir");
        let store = open(temp_dir.path());
        let index_path = temp_dir.path().join("search-index");
        let writer = Arc::new(
            TantivyIndexWriter::open_or_create(&index_path, 50).expect("Failed to open search index"),
        );
        Self {
            source: Arc::new(KvResourceSource::new(Arc::clone(&store))),
            _temp_dir: temp_dir,
            store,
            writer,
            index_path,
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        collaborators_over(Arc::clone(&self.store), Arc::clone(&self.writer))
    }

    pub fn state(&self) -> IndexerStateStore {
        IndexerStateStore::new(Arc::clone(&self.store), StateSettings::default())
    }

    /// A coordinator over the harness store.
    pub fn coordinator(&self, config: CoordinatorConfig) -> Coordinator {
        Coordinator::new(config, Arc::clone(&self.store), self.state(), self.collaborators())
            .expect("Failed to create coordinator")
    }

    /// Store `count` unrelated resources with equal-length ids.
    pub async fn seed_resources(&self, item_type: &str, count: usize) -> Vec<String> {
        let mut ids = Vec::with_capacity(count);
        for n in 0..count {
            let id = ulid::Ulid::new().to_string();
            self.source
                .put_resource(&id, item_type, json!({ "title": format!("{} {}", item_type, n) }), vec![])
                .await
                .expect("Failed to store resource");
            ids.push(id);
        }
        ids
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// The bundled source and renderer over `store`, writing to `writer`.
pub fn collaborators_over(store: Arc<dyn KvStore>, writer: Arc<TantivyIndexWriter>) -> Collaborators {
    let source = Arc::new(KvResourceSource::new(store));
    Collaborators {
        source: source.clone(),
        renderer: source,
        writer,
    }
}

/// Coordinator settings with short polls and a fast retry schedule.
pub fn fast_config(kind: QueueKind) -> CoordinatorConfig {
    CoordinatorConfig {
        queue_kind: kind,
        max_age: Duration::from_secs(30),
        finish_poll: Duration::from_millis(10),
        local_workers: 3,
        loop_time: Duration::from_millis(20),
        transient_backoff: Duration::from_millis(20),
        worker: fast_worker_config(),
        ..Default::default()
    }
}

pub fn fast_worker_config() -> WorkerConfig {
    WorkerConfig {
        get_size: 4,
        retry: RetryPolicy {
            initial_backoff: Duration::from_millis(1),
            max_attempts: 3,
        },
        xmin_poll: Duration::from_millis(5),
        xmin_timeout: Duration::from_secs(2),
        idle_poll: Duration::from_millis(5),
    }
}

/// A key/value server on an ephemeral local port.
pub struct StoreServer {
    pub addr: String,
    shutdown: CancellationToken,
    handle: JoinHandle<Result<(), StoreError>>,
}

impl StoreServer {
    pub async fn start(store: Arc<dyn KvStore>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind store server");
        let addr = listener.local_addr().expect("No local addr").to_string();
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let handle = tokio::spawn(async move {
            KvServer::new(store)
                .serve(listener, async move { token.cancelled().await })
                .await
        });
        Self {
            addr,
            shutdown,
            handle,
        }
    }

    /// A fresh client connection to this server.
    pub fn client(&self) -> Arc<dyn KvStore> {
        Arc::new(
            RemoteKvStore::new(self.addr.clone(), Duration::from_secs(5))
                .expect("Invalid store server address"),
        )
    }

    pub async fn stop(self) {
        self.shutdown.cancel();
        self.handle
            .await
            .expect("Store server task panicked")
            .expect("Store server failed");
    }
}
