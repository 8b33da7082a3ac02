//! Units of reindexing work.
//!
//! Run args are published by the queue server as flat string fields so any
//! worker, in any process, can read them back from the shared store.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::ReindexError;

/// One resource to render and index at a given database snapshot.
///
/// `xmin` is the oldest transaction still in flight when the item was
/// enqueued; the renderer must not read a snapshot older than that.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkItem {
    /// Resource identifier (a uuid in practice)
    pub resource_id: String,
    /// Oldest in-flight transaction at enqueue time
    pub xmin: i64,
    /// Exported snapshot the resource must be rendered from
    pub snapshot_id: String,
}

impl WorkItem {
    pub fn new(resource_id: impl Into<String>, xmin: i64, snapshot_id: impl Into<String>) -> Self {
        Self {
            resource_id: resource_id.into(),
            xmin,
            snapshot_id: snapshot_id.into(),
        }
    }
}

/// Resources changed since a prior snapshot marker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    /// Resources mutated at or after the requested marker
    pub resource_ids: BTreeSet<String>,
    /// New low-water mark: oldest transaction still in flight
    pub xmin: i64,
    /// Snapshot the resources should be rendered at
    pub snapshot_id: String,
}

impl ChangeSet {
    pub fn len(&self) -> usize {
        self.resource_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resource_ids.is_empty()
    }

    /// Build the work items for every changed resource.
    pub fn work_items(&self) -> Vec<WorkItem> {
        self.resource_ids
            .iter()
            .map(|id| WorkItem::new(id.clone(), self.xmin, self.snapshot_id.clone()))
            .collect()
    }
}

/// Arguments a queue server publishes so remote workers can join a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunArgs {
    /// How many ids are concatenated into one queue value
    pub batch_by: usize,
    /// Whether this run resumes an interrupted one
    pub restart: bool,
    /// Snapshot the run renders from
    pub snapshot_id: String,
    /// Fixed id length, required when `batch_by > 1`
    pub uuid_len: usize,
    /// Oldest in-flight transaction when the run started
    pub xmin: i64,
}

impl RunArgs {
    /// Field names as stored on the wire.
    pub const FIELDS: [&'static str; 5] = ["batch_by", "restart", "snapshot_id", "uuid_len", "xmin"];

    /// Flatten to string fields.
    pub fn to_fields(&self) -> BTreeMap<String, String> {
        let mut fields = BTreeMap::new();
        fields.insert("batch_by".to_string(), self.batch_by.to_string());
        fields.insert(
            "restart".to_string(),
            if self.restart { "true" } else { "false" }.to_string(),
        );
        fields.insert("snapshot_id".to_string(), self.snapshot_id.clone());
        fields.insert("uuid_len".to_string(), self.uuid_len.to_string());
        fields.insert("xmin".to_string(), self.xmin.to_string());
        fields
    }

    /// Parse string fields; every field is required.
    pub fn from_fields(fields: &BTreeMap<String, String>) -> Result<Self, ReindexError> {
        let get = |name: &str| {
            fields
                .get(name)
                .ok_or_else(|| ReindexError::InvalidInput(format!("run arg '{}' missing", name)))
        };
        let parse_err = |name: &str, value: &str| {
            ReindexError::InvalidInput(format!("run arg '{}' has bad value '{}'", name, value))
        };

        let batch_by_raw = get("batch_by")?;
        let batch_by: usize = batch_by_raw
            .parse()
            .map_err(|_| parse_err("batch_by", batch_by_raw))?;
        if batch_by == 0 {
            return Err(parse_err("batch_by", batch_by_raw));
        }

        let restart_raw = get("restart")?;
        let restart = match restart_raw.as_str() {
            "true" | "True" | "1" => true,
            "false" | "False" | "0" => false,
            other => return Err(parse_err("restart", other)),
        };

        let uuid_len_raw = get("uuid_len")?;
        let uuid_len = uuid_len_raw
            .parse()
            .map_err(|_| parse_err("uuid_len", uuid_len_raw))?;

        let xmin_raw = get("xmin")?;
        let xmin = xmin_raw.parse().map_err(|_| parse_err("xmin", xmin_raw))?;

        Ok(Self {
            batch_by,
            restart,
            snapshot_id: get("snapshot_id")?.clone(),
            uuid_len,
            xmin,
        })
    }
}
