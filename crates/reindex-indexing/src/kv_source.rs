//! Resource source kept in the key/value store.
//!
//! Lets the daemon run without an external database. Layout:
//! - `resource:{id}`: JSON [`StoredResource`]
//! - `resource_txn`: transaction counter
//! - `resource_txn_log:{txn}`: id written by that transaction (zero padded
//!   so key order is commit order)
//!
//! The counter doubles as the snapshot marker: once a transaction id is
//! assigned it is committed, so the oldest transaction still in flight is
//! always `counter + 1`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use reindex_store::KvStore;
use reindex_types::{ChangeSet, WorkItem};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::error::SourceError;
use crate::source::{ChangeSource, RenderedDocument, Renderer};

const RESOURCE_PREFIX: &str = "resource:";
const TXN_COUNTER_KEY: &str = "resource_txn";
const TXN_LOG_PREFIX: &str = "resource_txn_log:";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredResource {
    pub item_type: String,
    pub properties: Value,
    /// Ids of resources embedded one level deep when rendering
    #[serde(default)]
    pub links: Vec<String>,
    /// Transaction that last wrote the resource
    pub txn: i64,
}

pub struct KvResourceSource {
    store: Arc<dyn KvStore>,
}

impl KvResourceSource {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    fn resource_key(id: &str) -> String {
        format!("{}{}", RESOURCE_PREFIX, id)
    }

    /// Create or replace a resource. Returns the transaction id.
    pub async fn put_resource(
        &self,
        id: &str,
        item_type: &str,
        properties: Value,
        links: Vec<String>,
    ) -> Result<i64, SourceError> {
        if id.is_empty() || item_type.is_empty() {
            return Err(SourceError::Render(
                "resource id and item type must not be empty".to_string(),
            ));
        }
        let txn = self.store.incr_by(TXN_COUNTER_KEY, 1).await?;
        let resource = StoredResource {
            item_type: item_type.to_string(),
            properties,
            links,
            txn,
        };
        self.store
            .set(&Self::resource_key(id), &serde_json::to_string(&resource)?)
            .await?;
        self.store
            .set(&format!("{}{:020}", TXN_LOG_PREFIX, txn), id)
            .await?;
        debug!(id, item_type, txn, "Stored resource");
        Ok(txn)
    }

    pub async fn get_resource(&self, id: &str) -> Result<Option<StoredResource>, SourceError> {
        match self.store.get(&Self::resource_key(id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn all_resources(&self) -> Result<BTreeMap<String, StoredResource>, SourceError> {
        let mut resources = BTreeMap::new();
        for key in self.store.keys(RESOURCE_PREFIX).await? {
            let id = key.trim_start_matches(RESOURCE_PREFIX).to_string();
            if let Some(resource) = self.get_resource(&id).await? {
                resources.insert(id, resource);
            }
        }
        Ok(resources)
    }

    async fn last_txn(&self) -> Result<i64, SourceError> {
        let raw = self.store.get(TXN_COUNTER_KEY).await?;
        raw.map(|v| v.parse::<i64>())
            .transpose()
            .map_err(|e| SourceError::Render(format!("bad transaction counter: {}", e)))
            .map(Option::unwrap_or_default)
    }
}

#[async_trait]
impl ChangeSource for KvResourceSource {
    async fn changes_since(&self, since_xmin: Option<i64>) -> Result<ChangeSet, SourceError> {
        // Read the counter first; later writes belong to the next poll.
        let last_txn = self.last_txn().await?;
        let xmin = last_txn + 1;
        let snapshot_id = format!("snapshot-{}", last_txn);

        let resources = self.all_resources().await?;
        let Some(since) = since_xmin else {
            return Ok(ChangeSet {
                resource_ids: resources.into_keys().collect(),
                xmin,
                snapshot_id,
            });
        };

        let mut updated = BTreeSet::new();
        for key in self.store.keys(TXN_LOG_PREFIX).await? {
            let Ok(txn) = key.trim_start_matches(TXN_LOG_PREFIX).parse::<i64>() else {
                continue;
            };
            if txn < since || txn > last_txn {
                continue;
            }
            if let Some(id) = self.store.get(&key).await? {
                updated.insert(id);
            }
        }

        // Resources embedding an updated one render differently too.
        let mut invalidated = updated.clone();
        for (id, resource) in &resources {
            if resource.links.iter().any(|link| updated.contains(link)) {
                invalidated.insert(id.clone());
            }
        }
        debug!(
            since,
            updated = updated.len(),
            invalidated = invalidated.len(),
            "Collected changes"
        );
        Ok(ChangeSet {
            resource_ids: invalidated,
            xmin,
            snapshot_id,
        })
    }

    async fn current_xmin(&self) -> Result<i64, SourceError> {
        Ok(self.last_txn().await? + 1)
    }
}

#[async_trait]
impl Renderer for KvResourceSource {
    async fn render(&self, item: &WorkItem) -> Result<RenderedDocument, SourceError> {
        let resource = self
            .get_resource(&item.resource_id)
            .await?
            .ok_or_else(|| SourceError::NotFound(item.resource_id.clone()))?;

        let mut embedded = serde_json::Map::new();
        for link in &resource.links {
            match self.get_resource(link).await? {
                Some(linked) => {
                    embedded.insert(
                        link.clone(),
                        json!({
                            "item_type": linked.item_type,
                            "properties": linked.properties,
                        }),
                    );
                }
                None => {
                    return Err(SourceError::Render(format!(
                        "{} links to missing resource {}",
                        item.resource_id, link
                    )))
                }
            }
        }

        let body = json!({
            "uuid": item.resource_id,
            "item_type": resource.item_type,
            "properties": resource.properties,
            "embedded": embedded,
            "linked_uuids": resource.links,
            "snapshot_id": item.snapshot_id,
        });
        Ok(RenderedDocument {
            resource_id: item.resource_id.clone(),
            item_type: resource.item_type,
            version: item.xmin,
            body,
        })
    }
}
