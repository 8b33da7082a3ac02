//! Integration tests for the daemon commands over a shared store.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use reindex_daemon::{put_resource, run_indexer, run_worker};
use reindex_indexing::TantivyIndexWriter;
use reindex_store::{KvServer, MemoryKvStore};
use reindex_types::{Settings, StoreBackend};

/// Serve an in-memory store on an ephemeral port.
async fn start_store_server(shutdown: CancellationToken) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        KvServer::new(Arc::new(MemoryKvStore::new()))
            .serve(listener, async move { shutdown.cancelled().await })
            .await
    });
    addr
}

fn remote_settings(addr: &str, temp: &TempDir) -> Settings {
    let mut settings = Settings::default();
    settings.store.backend = StoreBackend::Remote;
    settings.store.remote_addr = addr.to_string();
    settings.queue.queue_type = "REMOTE_SET".to_string();
    settings.queue.remote_indexing = true;
    settings.queue.finish_poll_ms = 10;
    settings.indexer.xmin_wait_ms = 5;
    settings.search.index_path = temp.path().join("index").to_string_lossy().to_string();
    settings
}

#[tokio::test]
async fn test_coordinator_and_worker_processes_share_a_run() {
    let temp = TempDir::new().unwrap();
    let shutdown = CancellationToken::new();
    let addr = start_store_server(shutdown.clone()).await;
    let settings = remote_settings(&addr, &temp);

    put_resource(&settings, "lab-1", "lab", r#"{"title":"Lab"}"#, vec![])
        .await
        .unwrap();
    put_resource(&settings, "user-1", "user", "{}", vec!["lab-1".to_string()])
        .await
        .unwrap();

    let worker_cancel = CancellationToken::new();
    let worker_settings = settings.clone();
    let token = worker_cancel.clone();
    let worker = tokio::spawn(async move { run_worker(&worker_settings, "w0", token).await });

    tokio::time::timeout(
        Duration::from_secs(30),
        run_indexer(&settings, true, CancellationToken::new()),
    )
    .await
    .unwrap()
    .unwrap();

    worker_cancel.cancel();
    worker.await.unwrap().unwrap();

    let index = TantivyIndexWriter::open_or_create(&settings.search.expanded_index_path(), 50).unwrap();
    assert_eq!(index.doc_count(), 2);
    shutdown.cancel();
}
