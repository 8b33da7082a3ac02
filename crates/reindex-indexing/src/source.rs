//! Interfaces to the systems the pipeline reads from and writes to.
//!
//! The coordinator and workers only see these traits; the daemon wires in
//! concrete implementations through [`Collaborators`].

use std::sync::Arc;

use async_trait::async_trait;
use reindex_types::{ChangeSet, WorkItem};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{SourceError, WriteError};

/// A resource rendered into the document the search index stores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderedDocument {
    pub resource_id: String,
    /// Also the name of the index the document is written to
    pub item_type: String,
    /// External version; the xmin the resource was rendered at
    pub version: i64,
    pub body: Value,
}

/// Reports which resources changed since a snapshot marker.
#[async_trait]
pub trait ChangeSource: Send + Sync {
    /// Resources changed at or after `since_xmin`, or every resource when
    /// `since_xmin` is `None` (first run).
    async fn changes_since(&self, since_xmin: Option<i64>) -> Result<ChangeSet, SourceError>;

    /// Oldest transaction still in flight right now.
    async fn current_xmin(&self) -> Result<i64, SourceError>;
}

/// Renders one resource at the snapshot carried by its work item.
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn render(&self, item: &WorkItem) -> Result<RenderedDocument, SourceError>;
}

/// Upserts documents into named indexes.
#[async_trait]
pub trait SearchIndexWriter: Send + Sync {
    /// Write `doc` under `id`; a stored version newer than `version` is a
    /// conflict for writers that track versions.
    async fn upsert(&self, index: &str, id: &str, version: i64, doc: &Value) -> Result<(), WriteError>;

    /// Make written documents visible to readers.
    async fn commit(&self) -> Result<(), WriteError>;
}

/// Everything a coordinator or worker needs from outside the queue.
#[derive(Clone)]
pub struct Collaborators {
    pub source: Arc<dyn ChangeSource>,
    pub renderer: Arc<dyn Renderer>,
    pub writer: Arc<dyn SearchIndexWriter>,
}
