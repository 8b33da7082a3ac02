//! Command implementations for the reindex daemon.
//!
//! Handles:
//! - start: run the coordinator poll loop (or one pass)
//! - stop: signal a running coordinator via its PID file
//! - serve-store / worker: the two halves of remote indexing
//! - status / reindex: ask the running indexer, or read a shared store
//! - purge, put-resource, config show

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use reindex_indexing::{
    Collaborators, Coordinator, CoordinatorConfig, KvResourceSource, MemoryIndexWriter,
    SearchIndexWriter, TantivyIndexWriter, Worker, WorkerConfig,
};
use reindex_queue::{create_queue, QueueKind, UuidQueue, UuidQueueWorker};
use reindex_state::{views, IndexerStateStore, ReindexRequest, StateSettings, View};
use reindex_store::{open_store, KvServer, KvStore};
use reindex_types::{Settings, StoreBackend};

use crate::status_service::{serve_status, StatusClient, StatusError};

const APP_DIR: &str = "snovault-reindex";

/// Get the PID file path
fn pid_file_path() -> PathBuf {
    directories::BaseDirs::new()
        .map(|dirs| {
            #[cfg(unix)]
            {
                dirs.runtime_dir()
                    .map(|p| p.to_path_buf())
                    .unwrap_or_else(|| dirs.cache_dir().to_path_buf())
            }
            #[cfg(not(unix))]
            {
                dirs.cache_dir().to_path_buf()
            }
        })
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(APP_DIR)
        .join("indexer.pid")
}

fn write_pid_file() -> Result<()> {
    let pid_path = pid_file_path();
    if let Some(parent) = pid_path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&pid_path, std::process::id().to_string())?;
    info!(path = ?pid_path, "Wrote PID file");
    Ok(())
}

fn remove_pid_file() {
    let pid_path = pid_file_path();
    if pid_path.exists() {
        if let Err(e) = fs::remove_file(&pid_path) {
            warn!(error = %e, "Failed to remove PID file");
        }
    }
}

fn read_pid_file() -> Option<u32> {
    fs::read_to_string(pid_file_path())
        .ok()
        .and_then(|s| s.trim().parse().ok())
}

#[cfg(unix)]
fn is_process_running(pid: u32) -> bool {
    // Signal 0 only checks that the process exists
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(not(unix))]
fn is_process_running(_pid: u32) -> bool {
    true
}

/// Load settings and apply the CLI log level override.
pub fn load_settings(config_path: Option<&str>, log_level: Option<&str>) -> Result<Settings> {
    let mut settings = Settings::load(config_path).context("Failed to load configuration")?;
    if let Some(level) = log_level {
        settings.log_level = level.to_string();
    }
    Ok(settings)
}

/// Install the global tracing subscriber. Logs go to stderr so command
/// output on stdout stays parseable.
pub fn init_logging(log_level: &str) -> Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;
    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Could not listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Could not listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
        _ = terminate => info!("Received SIGTERM, shutting down..."),
    }
}

/// A token cancelled on SIGINT or SIGTERM.
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        cancel.cancel();
    });
    token
}

/// The bundled change source and renderer over `store`, writing to
/// `writer`.
fn collaborators(store: Arc<dyn KvStore>, writer: Arc<dyn SearchIndexWriter>) -> Collaborators {
    let source = Arc::new(KvResourceSource::new(store));
    Collaborators {
        source: source.clone(),
        renderer: source,
        writer,
    }
}

fn open_index_writer(settings: &Settings) -> Result<Arc<dyn SearchIndexWriter>> {
    let path = settings.search.expanded_index_path();
    let writer = TantivyIndexWriter::open_or_create(&path, settings.search.writer_memory_mb)
        .with_context(|| format!("Failed to open search index at {:?}", path))?;
    Ok(Arc::new(writer))
}

/// Run the coordinator until `cancel` fires, or for a single pass.
pub async fn run_indexer(settings: &Settings, once: bool, cancel: CancellationToken) -> Result<()> {
    let store = open_store(&settings.store).context("Failed to open store")?;
    // Remote workers own the search index; the coordinator never writes.
    let writer: Arc<dyn SearchIndexWriter> = if settings.queue.remote_indexing {
        Arc::new(MemoryIndexWriter::new())
    } else {
        open_index_writer(settings)?
    };
    let state = IndexerStateStore::new(Arc::clone(&store), StateSettings::from(settings));
    let config = CoordinatorConfig::try_from(settings)?;
    let mut coordinator = Coordinator::new(
        config,
        Arc::clone(&store),
        state,
        collaborators(Arc::clone(&store), writer),
    )
    .context("Failed to create coordinator")?;

    if once {
        let result = coordinator.run_once(&cancel).await?;
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }

    let addr = &settings.indexer.status_addr;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind status endpoint on {}", addr))?;
    let status_state = IndexerStateStore::new(Arc::clone(&store), StateSettings::from(settings));
    let status_cancel = cancel.clone();
    let status_server = tokio::spawn(async move {
        serve_status(listener, status_state, async move {
            status_cancel.cancelled().await
        })
        .await
    });

    let result = coordinator
        .run(cancel.clone())
        .await
        .context("Indexer poll loop failed");
    cancel.cancel();
    match status_server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "Status endpoint failed"),
        Err(e) => warn!(error = %e, "Status endpoint task panicked"),
    }
    result
}

/// Start the coordinator with signal handling and a PID file.
pub async fn start_indexer(settings: &Settings, once: bool) -> Result<()> {
    info!(
        store = ?settings.store.backend,
        queue = %settings.queue.queue_type,
        remote_indexing = settings.queue.remote_indexing,
        index_path = %settings.search.index_path,
        "Reindex daemon starting"
    );
    if once {
        return run_indexer(settings, true, shutdown_token()).await;
    }
    write_pid_file()?;
    let result = run_indexer(settings, false, shutdown_token()).await;
    remove_pid_file();
    result
}

/// Stop the running coordinator by sending SIGTERM.
pub fn stop_daemon() -> Result<()> {
    let pid = read_pid_file().context("No PID file found - indexer may not be running")?;

    if !is_process_running(pid) {
        remove_pid_file();
        bail!("Indexer not running (stale PID file removed)");
    }

    #[cfg(unix)]
    {
        unsafe {
            if libc::kill(pid as i32, libc::SIGTERM) != 0 {
                bail!("Failed to send SIGTERM to indexer");
            }
        }
        println!("Sent SIGTERM to indexer (PID {})", pid);
    }

    #[cfg(not(unix))]
    {
        bail!("Stop command not yet implemented on this platform");
    }

    Ok(())
}

/// Serve the configured local store to remote processes.
///
/// A `remote` backend setting is served from RocksDB at `db_path`.
pub async fn serve_store(settings: &Settings, listen: Option<&str>) -> Result<()> {
    let mut local = settings.store.clone();
    if local.backend == StoreBackend::Remote {
        local.backend = StoreBackend::Rocksdb;
    }
    let store = open_store(&local).context("Failed to open store")?;
    let addr = listen.unwrap_or(&settings.store.listen_addr).to_string();
    let cancel = shutdown_token();
    KvServer::new(store)
        .run_with_shutdown(&addr, async move { cancel.cancelled().await })
        .await
        .with_context(|| format!("Key/value server on {} failed", addr))
}

/// Attach a worker to the shared queue and index runs until cancelled.
pub async fn run_worker(settings: &Settings, name: &str, cancel: CancellationToken) -> Result<()> {
    if settings.store.backend != StoreBackend::Remote {
        bail!("Workers join through a shared store; set store.backend = \"remote\"");
    }
    let store = open_store(&settings.store).context("Failed to open store")?;
    let kind: QueueKind = settings.queue.queue_type.parse()?;
    let queue = UuidQueueWorker::attach(&settings.queue.queue_name, kind, Arc::clone(&store))?;
    let writer = open_index_writer(settings)?;
    let mut worker = Worker::new(
        name,
        queue,
        collaborators(store, writer),
        WorkerConfig::from(settings),
    );
    info!(worker = name, queue = %settings.queue.queue_name, "Worker attached");
    let summary = worker.run_forever(cancel).await?;
    info!(
        worker = name,
        batches = summary.batches,
        successes = summary.successes,
        errors = summary.errors,
        "Worker stopped"
    );
    Ok(())
}

/// Run a worker until SIGINT or SIGTERM.
pub async fn start_worker(settings: &Settings, name: &str) -> Result<()> {
    run_worker(settings, name, shutdown_token()).await
}

/// Print one status view as JSON.
pub async fn show_status(settings: &Settings, view: &str, events: Option<&str>) -> Result<()> {
    let value = status_json(settings, view, events).await?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

/// The running indexer's status client, or `None` when nothing answers.
async fn dial_indexer(settings: &Settings) -> Result<Option<StatusClient>> {
    let addr = &settings.indexer.status_addr;
    match StatusClient::connect(addr, settings.store.socket_timeout()).await {
        Ok(client) => Ok(Some(client)),
        Err(e) if e.is_unreachable() => {
            debug!(addr = %addr, error = %e, "No indexer answering");
            Ok(None)
        }
        Err(e) => Err(e).context("Failed to reach indexer status endpoint"),
    }
}

/// State store for commands run without a live indexer.
///
/// The memory backend lives inside the indexer process, so another process
/// would only see an empty store.
fn offline_state(settings: &Settings) -> Result<IndexerStateStore> {
    if settings.store.backend == StoreBackend::Memory {
        bail!(
            "No indexer answering on {} and the memory store is private to the indexer process; \
             start the indexer or use the rocksdb or remote store backend",
            settings.indexer.status_addr
        );
    }
    let store = open_store(&settings.store).context("Failed to open store")?;
    Ok(IndexerStateStore::new(store, StateSettings::from(settings)))
}

fn rpc_error(err: StatusError) -> anyhow::Error {
    match err {
        StatusError::Rpc(status) => anyhow!("{}", status.message()),
        other => anyhow!(other),
    }
}

async fn status_json(settings: &Settings, view: &str, events: Option<&str>) -> Result<Value> {
    let view: View = view.parse().map_err(|e: String| anyhow!(e))?;
    if let Some(mut client) = dial_indexer(settings).await? {
        return client.status(view, events).await.map_err(rpc_error);
    }
    let state = offline_state(settings)?;
    Ok(views::render(&state, view, events).await)
}

/// Queue a reindex of every resource or of the given ids for the next pass.
///
/// Goes through the running indexer when one answers; otherwise the request
/// is written to the shared store for the indexer to find when it starts.
pub async fn request_reindex(settings: &Settings, requested: &str) -> Result<Value> {
    ReindexRequest::parse(requested)?;
    let pending = match dial_indexer(settings).await? {
        Some(mut client) => client.request_reindex(requested).await.map_err(rpc_error)?,
        None => offline_state(settings)?
            .request_reindex(requested)
            .await?
            .describe(),
    };
    println!("Reindex requested; pending: {}", pending);
    Ok(pending)
}

/// Clear the configured queue and its ledger.
pub async fn purge_queue(settings: &Settings) -> Result<()> {
    let store = open_store(&settings.store).context("Failed to open store")?;
    let backend = create_queue(&settings.queue.queue_name, &settings.queue.queue_type, store)?;
    UuidQueue::new(backend).purge().await?;
    println!("Purged queue {}", settings.queue.queue_name);
    Ok(())
}

/// Store one resource in the bundled change source.
pub async fn put_resource(
    settings: &Settings,
    id: &str,
    item_type: &str,
    properties: &str,
    links: Vec<String>,
) -> Result<i64> {
    let properties: serde_json::Value =
        serde_json::from_str(properties).context("Properties must be a JSON object")?;
    if !properties.is_object() {
        bail!("Properties must be a JSON object");
    }
    let store = open_store(&settings.store).context("Failed to open store")?;
    let txn = KvResourceSource::new(store)
        .put_resource(id, item_type, properties, links)
        .await?;
    println!("Stored {} ({}) at transaction {}", id, item_type, txn);
    Ok(txn)
}

/// Print the effective settings.
pub fn show_config(settings: &Settings) -> Result<()> {
    let rendered = toml::to_string_pretty(settings).context("Failed to render settings")?;
    println!("{}", rendered);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// An address nothing listens on.
    fn closed_addr() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().to_string()
    }

    fn rocks_settings(temp: &TempDir) -> Settings {
        let mut settings = Settings::default();
        settings.indexer.status_addr = closed_addr();
        settings.store.backend = StoreBackend::Rocksdb;
        settings.store.db_path = temp.path().join("store").to_string_lossy().to_string();
        settings.search.index_path = temp.path().join("index").to_string_lossy().to_string();
        settings.queue.finish_poll_ms = 10;
        settings.queue.local_workers = 2;
        settings
    }

    #[test]
    fn test_pid_file_path() {
        let path = pid_file_path();
        assert!(path.ends_with("indexer.pid"));
        assert!(path.parent().unwrap().to_string_lossy().contains(APP_DIR));
    }

    #[test]
    fn test_show_config() {
        assert!(show_config(&Settings::default()).is_ok());
    }

    #[tokio::test]
    async fn test_put_resource_rejects_non_objects() {
        let temp = TempDir::new().unwrap();
        let settings = rocks_settings(&temp);
        assert!(put_resource(&settings, "a", "item", "[1, 2]", vec![]).await.is_err());
        assert!(put_resource(&settings, "a", "item", "not json", vec![]).await.is_err());
    }

    #[tokio::test]
    async fn test_single_pass_against_rocksdb() {
        let temp = TempDir::new().unwrap();
        let settings = rocks_settings(&temp);
        put_resource(&settings, "lab-1", "lab", r#"{"title":"Lab"}"#, vec![])
            .await
            .unwrap();
        let txn = put_resource(&settings, "user-1", "user", "{}", vec!["lab-1".to_string()])
            .await
            .unwrap();
        assert_eq!(txn, 2);

        run_indexer(&settings, true, CancellationToken::new()).await.unwrap();

        let minimal = status_json(&settings, "minimal", None).await.unwrap();
        assert_eq!(minimal["state"], "state_waiting");
        let events = status_json(&settings, "events", None).await.unwrap();
        assert_eq!(events["events"].as_array().unwrap().len(), 1);
        let listener = status_json(&settings, "listener", None).await.unwrap();
        assert_eq!(listener["listener"]["status"], "stopped");

        let writer = TantivyIndexWriter::open_or_create(&settings.search.expanded_index_path(), 50).unwrap();
        assert_eq!(writer.doc_count(), 2);
    }

    #[tokio::test]
    async fn test_status_rejects_unknown_view() {
        let temp = TempDir::new().unwrap();
        let settings = rocks_settings(&temp);
        let err = status_json(&settings, "verbose", None).await.unwrap_err();
        assert!(err.to_string().contains("unknown view"));
    }

    #[tokio::test]
    async fn test_status_refuses_private_memory_store() {
        let mut settings = Settings::default();
        settings.indexer.status_addr = closed_addr();
        let err = status_json(&settings, "minimal", None).await.unwrap_err();
        assert!(err.to_string().contains("private"), "{}", err);
        let err = request_reindex(&settings, "all").await.unwrap_err();
        assert!(err.to_string().contains("private"), "{}", err);
    }

    #[tokio::test]
    async fn test_running_indexer_answers_status_and_reindex() {
        let temp = TempDir::new().unwrap();
        let mut settings = Settings::default();
        settings.indexer.status_addr = closed_addr();
        settings.search.index_path = temp.path().join("index").to_string_lossy().to_string();

        let cancel = CancellationToken::new();
        let indexer_settings = settings.clone();
        let token = cancel.clone();
        let indexer =
            tokio::spawn(async move { run_indexer(&indexer_settings, false, token).await });

        let mut minimal = None;
        for _ in 0..200 {
            if let Ok(value) = status_json(&settings, "minimal", None).await {
                minimal = Some(value);
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(25)).await;
        }
        let minimal = minimal.expect("indexer never answered");
        assert!(minimal["state"].as_str().unwrap().starts_with("state_"));

        let pending = request_reindex(&settings, "lab-1").await.unwrap();
        assert!(pending == serde_json::json!(["lab-1"]), "{}", pending);
        let err = request_reindex(&settings, "lab 1").await.unwrap_err();
        assert!(err.to_string().contains("uninterpretable"), "{}", err);

        cancel.cancel();
        indexer.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_offline_reindex_request_is_picked_up_at_start() {
        let temp = TempDir::new().unwrap();
        let settings = rocks_settings(&temp);
        put_resource(&settings, "lab-1", "lab", "{}", vec![]).await.unwrap();
        run_indexer(&settings, true, CancellationToken::new()).await.unwrap();

        let pending = request_reindex(&settings, "all").await.unwrap();
        assert_eq!(pending, "all");
        let minimal = status_json(&settings, "minimal", None).await.unwrap();
        assert_eq!(minimal["reindex_requested"], "all");

        run_indexer(&settings, true, CancellationToken::new()).await.unwrap();
        let minimal = status_json(&settings, "minimal", None).await.unwrap();
        assert!(minimal.get("reindex_requested").is_none());
        let events = status_json(&settings, "events", None).await.unwrap();
        assert_eq!(events["events"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_purge_clears_queue() {
        let temp = TempDir::new().unwrap();
        let mut settings = rocks_settings(&temp);
        settings.queue.queue_type = "REMOTE_LIST".to_string();
        {
            let store = open_store(&settings.store).unwrap();
            let backend = create_queue("indexer_queue", "REMOTE_LIST", store).unwrap();
            assert!(backend.add_values(&["a".to_string()]).await.is_ok());
        }
        purge_queue(&settings).await.unwrap();

        let store = open_store(&settings.store).unwrap();
        let backend = create_queue("indexer_queue", "REMOTE_LIST", store).unwrap();
        assert!(backend.is_queue_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_worker_needs_remote_store() {
        let temp = TempDir::new().unwrap();
        let settings = rocks_settings(&temp);
        let err = run_worker(&settings, "w0", CancellationToken::new()).await.unwrap_err();
        assert!(err.to_string().contains("shared store"));
    }
}
