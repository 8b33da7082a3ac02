//! Configuration loading for the reindexing daemon.
//!
//! Layered config: defaults -> config file -> env vars -> CLI flags.
//! Default config file lives at `~/.config/snovault-reindex/config.toml`.
//! Environment variables use the `REINDEX` prefix and `__` between
//! sections, e.g. `REINDEX__QUEUE__BATCH_BY=4`.

use std::path::PathBuf;
use std::time::Duration;

use config::{Config, Environment, File};
use directories::{BaseDirs, ProjectDirs};
use serde::{Deserialize, Serialize};

use crate::error::ReindexError;

const APP_NAME: &str = "snovault-reindex";

/// Which key/value substrate backs queues, ledgers and the indexer state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// Process-local, lost on exit
    #[default]
    Memory,
    /// Durable RocksDB directory at `db_path`
    Rocksdb,
    /// Networked store served by `reindex-daemon serve-store`
    Remote,
}

/// Key/value store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSettings {
    #[serde(default)]
    pub backend: StoreBackend,

    /// RocksDB directory (rocksdb backend, and the server side of remote)
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Address the remote client dials
    #[serde(default = "default_remote_addr")]
    pub remote_addr: String,

    /// Address `serve-store` listens on
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Per-request timeout for the remote client
    #[serde(default = "default_socket_timeout_secs")]
    pub socket_timeout_secs: u64,
}

fn default_db_path() -> String {
    ProjectDirs::from("", "", APP_NAME)
        .map(|p| p.data_local_dir().join("store"))
        .unwrap_or_else(|| PathBuf::from("./store"))
        .to_string_lossy()
        .to_string()
}

fn default_remote_addr() -> String {
    "127.0.0.1:6390".to_string()
}

fn default_listen_addr() -> String {
    "0.0.0.0:6390".to_string()
}

fn default_socket_timeout_secs() -> u64 {
    5
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            db_path: default_db_path(),
            remote_addr: default_remote_addr(),
            listen_addr: default_listen_addr(),
            socket_timeout_secs: default_socket_timeout_secs(),
        }
    }
}

impl StoreSettings {
    pub fn socket_timeout(&self) -> Duration {
        Duration::from_secs(self.socket_timeout_secs)
    }

    /// `db_path` with a leading `~/` expanded.
    pub fn expanded_db_path(&self) -> PathBuf {
        expand_home(&self.db_path)
    }
}

/// Queue settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSettings {
    /// Name of the queue key in the store
    #[serde(default = "default_queue_name")]
    pub queue_name: String,

    /// Backend type tag, e.g. `BASE_IN_MEMORY` or `REMOTE_SET_PIPE`
    #[serde(default = "default_queue_type")]
    pub queue_type: String,

    /// Ids concatenated per queue value
    #[serde(default = "default_batch_by")]
    pub batch_by: usize,

    /// Ids a worker requests per dequeue
    #[serde(default = "default_get_size")]
    pub get_size: usize,

    /// Age after which a checked-out batch is considered abandoned
    #[serde(default = "default_max_age_secs")]
    pub max_age_secs: u64,

    /// Whether workers run in other processes
    #[serde(default)]
    pub remote_indexing: bool,

    /// In-process workers used when `remote_indexing` is off
    #[serde(default = "default_local_workers")]
    pub local_workers: usize,

    /// How often the coordinator checks the ledger while draining
    #[serde(default = "default_finish_poll_ms")]
    pub finish_poll_ms: u64,
}

fn default_queue_name() -> String {
    "indexer_queue".to_string()
}

fn default_queue_type() -> String {
    "BASE_IN_MEMORY".to_string()
}

fn default_batch_by() -> usize {
    1
}

fn default_get_size() -> usize {
    1024
}

fn default_max_age_secs() -> u64 {
    60
}

fn default_local_workers() -> usize {
    4
}

fn default_finish_poll_ms() -> u64 {
    500
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            queue_name: default_queue_name(),
            queue_type: default_queue_type(),
            batch_by: default_batch_by(),
            get_size: default_get_size(),
            max_age_secs: default_max_age_secs(),
            remote_indexing: false,
            local_workers: default_local_workers(),
            finish_poll_ms: default_finish_poll_ms(),
        }
    }
}

impl QueueSettings {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }

    pub fn finish_poll(&self) -> Duration {
        Duration::from_millis(self.finish_poll_ms)
    }
}

/// Indexer process settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexerSettings {
    /// Process role; only `indexer` initializes the state record
    #[serde(default = "default_config_name")]
    pub config_name: String,

    /// Seconds between poll cycles
    #[serde(default = "default_loop_time_secs")]
    pub loop_time_secs: u64,

    /// Seconds to back off after a transient infrastructure error
    #[serde(default = "default_transient_backoff_secs")]
    pub transient_backoff_secs: u64,

    /// Upstream database host, reported in the state record
    #[serde(default = "default_db_host")]
    pub db_host: String,

    /// Time zone name used for local timestamps in status views
    #[serde(default = "default_local_tz")]
    pub local_tz: String,

    /// Closed events kept in the recency list
    #[serde(default = "default_max_events")]
    pub max_events: usize,

    /// First retry delay for a failed index write
    #[serde(default = "default_index_initial_backoff_ms")]
    pub index_initial_backoff_ms: u64,

    /// Write attempts per document, including the first
    #[serde(default = "default_index_max_attempts")]
    pub index_max_attempts: u32,

    /// Poll interval while waiting for a snapshot to become visible
    #[serde(default = "default_xmin_wait_ms")]
    pub xmin_wait_ms: u64,

    /// Give up waiting for a snapshot after this long
    #[serde(default = "default_xmin_wait_timeout_secs")]
    pub xmin_wait_timeout_secs: u64,

    /// Where a running indexer answers status and reindex requests
    #[serde(default = "default_status_addr")]
    pub status_addr: String,
}

fn default_config_name() -> String {
    "indexer".to_string()
}

fn default_loop_time_secs() -> u64 {
    3
}

fn default_transient_backoff_secs() -> u64 {
    60
}

fn default_db_host() -> String {
    "localhost".to_string()
}

fn default_local_tz() -> String {
    "GMT".to_string()
}

fn default_max_events() -> usize {
    1000
}

fn default_index_initial_backoff_ms() -> u64 {
    10_000
}

fn default_index_max_attempts() -> u32 {
    5
}

fn default_xmin_wait_ms() -> u64 {
    100
}

fn default_xmin_wait_timeout_secs() -> u64 {
    60
}

fn default_status_addr() -> String {
    "127.0.0.1:6391".to_string()
}

impl Default for IndexerSettings {
    fn default() -> Self {
        Self {
            config_name: default_config_name(),
            loop_time_secs: default_loop_time_secs(),
            transient_backoff_secs: default_transient_backoff_secs(),
            db_host: default_db_host(),
            local_tz: default_local_tz(),
            max_events: default_max_events(),
            index_initial_backoff_ms: default_index_initial_backoff_ms(),
            index_max_attempts: default_index_max_attempts(),
            xmin_wait_ms: default_xmin_wait_ms(),
            xmin_wait_timeout_secs: default_xmin_wait_timeout_secs(),
            status_addr: default_status_addr(),
        }
    }
}

impl IndexerSettings {
    pub fn loop_time(&self) -> Duration {
        Duration::from_secs(self.loop_time_secs)
    }

    pub fn transient_backoff(&self) -> Duration {
        Duration::from_secs(self.transient_backoff_secs)
    }
}

/// Search index settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchSettings {
    /// Path to the tantivy index directory
    #[serde(default = "default_index_path")]
    pub index_path: String,

    /// Memory budget for the index writer in MB
    #[serde(default = "default_writer_memory_mb")]
    pub writer_memory_mb: usize,
}

fn default_index_path() -> String {
    ProjectDirs::from("", "", APP_NAME)
        .map(|p| p.data_local_dir().join("search-index"))
        .unwrap_or_else(|| PathBuf::from("./search-index"))
        .to_string_lossy()
        .to_string()
}

fn default_writer_memory_mb() -> usize {
    50
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            index_path: default_index_path(),
            writer_memory_mb: default_writer_memory_mb(),
        }
    }
}

impl SearchSettings {
    pub fn expanded_index_path(&self) -> PathBuf {
        expand_home(&self.index_path)
    }
}

/// Main application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub store: StoreSettings,

    #[serde(default)]
    pub queue: QueueSettings,

    #[serde(default)]
    pub indexer: IndexerSettings,

    #[serde(default)]
    pub search: SearchSettings,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            store: StoreSettings::default(),
            queue: QueueSettings::default(),
            indexer: IndexerSettings::default(),
            search: SearchSettings::default(),
            log_level: default_log_level(),
        }
    }
}

impl Settings {
    /// Load settings with layered precedence:
    /// 1. Built-in defaults
    /// 2. Config file (~/.config/snovault-reindex/config.toml)
    /// 3. CLI-specified config file (optional)
    /// 4. Environment variables (REINDEX__*)
    ///
    /// CLI flags should be applied by the caller after this returns.
    pub fn load(cli_config_path: Option<&str>) -> Result<Self, ReindexError> {
        let config_dir = ProjectDirs::from("", "", APP_NAME)
            .map(|p| p.config_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));

        let default_config_path = config_dir.join("config");

        let mut builder = Config::builder()
            .set_default("log_level", default_log_level())
            .map_err(|e| ReindexError::Config(e.to_string()))?
            .set_default("store.db_path", default_db_path())
            .map_err(|e| ReindexError::Config(e.to_string()))?
            .set_default("queue.queue_name", default_queue_name())
            .map_err(|e| ReindexError::Config(e.to_string()))?
            .set_default("queue.queue_type", default_queue_type())
            .map_err(|e| ReindexError::Config(e.to_string()))?
            .set_default("queue.batch_by", default_batch_by() as i64)
            .map_err(|e| ReindexError::Config(e.to_string()))?
            .set_default("indexer.config_name", default_config_name())
            .map_err(|e| ReindexError::Config(e.to_string()))?
            .set_default("indexer.loop_time_secs", default_loop_time_secs() as i64)
            .map_err(|e| ReindexError::Config(e.to_string()))?
            .set_default("search.index_path", default_index_path())
            .map_err(|e| ReindexError::Config(e.to_string()))?
            .add_source(File::with_name(&default_config_path.to_string_lossy()).required(false));

        if let Some(path) = cli_config_path {
            builder = builder.add_source(File::with_name(path).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix("REINDEX")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder
            .build()
            .map_err(|e| ReindexError::Config(e.to_string()))?;

        let settings: Settings = config
            .try_deserialize()
            .map_err(|e| ReindexError::Config(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ReindexError> {
        if self.queue.batch_by == 0 {
            return Err(ReindexError::Config("queue.batch_by must be > 0".into()));
        }
        if self.queue.get_size == 0 {
            return Err(ReindexError::Config("queue.get_size must be > 0".into()));
        }
        if self.indexer.index_max_attempts == 0 {
            return Err(ReindexError::Config(
                "indexer.index_max_attempts must be > 0".into(),
            ));
        }
        if !self.queue.remote_indexing && self.queue.local_workers == 0 {
            return Err(ReindexError::Config(
                "queue.local_workers must be > 0 without remote indexing".into(),
            ));
        }
        Ok(())
    }
}

/// Expand a leading `~/` to the user's home directory.
fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(dirs) = BaseDirs::new() {
            return dirs.home_dir().join(rest);
        }
    }
    PathBuf::from(path)
}
