//! Status holder for the coordinator's poll loop.
//!
//! The coordinator rewrites this after every pass so status readers in
//! other processes can see what the loop is doing without touching the
//! state record.

use reindex_store::KvStore;
use reindex_types::utc_now_string;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StateError;

/// Key holding the JSON-encoded [`ListenerStatus`].
pub const LISTENER_STATUS_KEY: &str = "indexer_listener_status";

const MAX_ERRORS: usize = 3;
const MAX_RESULTS: usize = 10;

/// One error seen by the poll loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenerError {
    pub timestamp: String,
    pub error: String,
    /// Transient errors back off and retry; others stop the loop
    pub transient: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenerStatus {
    pub status: String,
    pub started: String,
    /// Most recent first
    pub errors: Vec<ListenerError>,
    /// Finished pass results, most recent first
    pub results: Vec<Value>,
    pub last_result: Option<Value>,
    pub timestamp: String,
}

impl ListenerStatus {
    pub fn new(status: impl Into<String>) -> Self {
        let now = utc_now_string();
        Self {
            status: status.into(),
            started: now.clone(),
            errors: Vec::new(),
            results: Vec::new(),
            last_result: None,
            timestamp: now,
        }
    }

    pub fn set_status(&mut self, status: impl Into<String>) {
        self.status = status.into();
        self.timestamp = utc_now_string();
    }

    pub fn record_error(&mut self, error: impl Into<String>, transient: bool) {
        let timestamp = utc_now_string();
        self.errors.insert(
            0,
            ListenerError {
                timestamp: timestamp.clone(),
                error: error.into(),
                transient,
            },
        );
        self.errors.truncate(MAX_ERRORS);
        self.timestamp = timestamp;
    }

    pub fn record_result(&mut self, result: Value) {
        self.results.insert(0, result.clone());
        self.results.truncate(MAX_RESULTS);
        self.last_result = Some(result);
        self.timestamp = utc_now_string();
    }

    /// Read the persisted status, if the loop has ever written one.
    pub async fn load(store: &dyn KvStore) -> Result<Option<Self>, StateError> {
        match store.get(LISTENER_STATUS_KEY).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn save(&self, store: &dyn KvStore) -> Result<(), StateError> {
        let raw = serde_json::to_string(self)?;
        store.set(LISTENER_STATUS_KEY, &raw).await?;
        Ok(())
    }
}
