//! Render-then-write for a single resource, with retries.

use std::time::{Duration, Instant};

use backoff::{backoff::Backoff, ExponentialBackoff};
use reindex_types::{utc_now_string, WorkItem};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::error::{IndexingError, WriteError};
use crate::source::{Renderer, SearchIndexWriter};

/// Retry schedule for index writes.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the second attempt; doubles after each retry
    pub initial_backoff: Duration,
    /// Attempts including the first
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(10),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: self.initial_backoff,
            initial_interval: self.initial_backoff,
            randomization_factor: 0.0,
            multiplier: 2.0,
            max_interval: Duration::from_secs(3600),
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}

impl From<&reindex_types::IndexerSettings> for RetryPolicy {
    fn from(settings: &reindex_types::IndexerSettings) -> Self {
        Self {
            initial_backoff: Duration::from_millis(settings.index_initial_backoff_ms),
            max_attempts: settings.index_max_attempts.max(1),
        }
    }
}

/// One failed render or write attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemError {
    pub error_message: String,
    pub uuid: String,
    pub timestamp: String,
}

impl ItemError {
    fn new(uuid: &str, message: impl Into<String>) -> Self {
        Self {
            error_message: message.into(),
            uuid: uuid.to_string(),
            timestamp: utc_now_string(),
        }
    }
}

/// Outcome of indexing one resource.
#[derive(Debug, Clone, Default)]
pub struct IndexItem {
    pub uuid: String,
    /// Every failed attempt, in order
    pub attempts: Vec<ItemError>,
    /// Set when the resource ended up not indexed
    pub error: Option<ItemError>,
    pub render_time: Duration,
    pub write_time: Duration,
}

impl IndexItem {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }

    /// The final error as the JSON string recorded against the batch.
    pub fn error_string(&self) -> Option<String> {
        self.error.as_ref().map(|e| {
            serde_json::to_string(e).unwrap_or_else(|_| format!("{}: {}", e.uuid, e.error_message))
        })
    }

    fn fail(&mut self, message: impl Into<String>) {
        let err = ItemError::new(&self.uuid, message);
        self.attempts.push(err.clone());
        self.error = Some(err);
    }

    /// Render `item` and write it to the index.
    ///
    /// Per-resource failures end up in [`IndexItem::error`]. Only a
    /// transient source failure is returned as `Err`: the source cannot
    /// serve the rest of the batch either.
    pub async fn run(
        item: &WorkItem,
        renderer: &dyn Renderer,
        writer: &dyn SearchIndexWriter,
        retry: &RetryPolicy,
    ) -> Result<IndexItem, IndexingError> {
        let mut result = IndexItem {
            uuid: item.resource_id.clone(),
            ..Default::default()
        };

        let started = Instant::now();
        let rendered = renderer.render(item).await;
        result.render_time = started.elapsed();
        let doc = match rendered {
            Ok(doc) => doc,
            Err(e) if e.is_transient() => {
                error!(uuid = %item.resource_id, error = %e, "Source unavailable while rendering");
                return Err(e.into());
            }
            Err(e) => {
                error!(uuid = %item.resource_id, error = %e, "Error rendering");
                result.fail(e.to_string());
                return Ok(result);
            }
        };

        let started = Instant::now();
        let mut backoff = retry.backoff();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match writer
                .upsert(&doc.item_type, &doc.resource_id, doc.version, &doc.body)
                .await
            {
                Ok(()) => {
                    result.error = None;
                    break;
                }
                Err(e @ WriteError::Conflict { .. }) => {
                    warn!(uuid = %item.resource_id, version = doc.version, "Conflict indexing");
                    result.fail(e.to_string());
                    break;
                }
                Err(e) if e.is_retryable() => {
                    result.fail(e.to_string());
                    if attempt >= retry.max_attempts {
                        error!(uuid = %item.resource_id, attempts = attempt, error = %e, "Giving up indexing");
                        break;
                    }
                    match backoff.next_backoff() {
                        Some(delay) => {
                            warn!(
                                uuid = %item.resource_id,
                                error = %e,
                                retry_in_ms = delay.as_millis(),
                                "Retryable error indexing"
                            );
                            tokio::time::sleep(delay).await;
                        }
                        None => break,
                    }
                }
                Err(e) => {
                    error!(uuid = %item.resource_id, error = %e, "Error indexing");
                    result.fail(e.to_string());
                    break;
                }
            }
        }
        result.write_time = started.elapsed();
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SourceError;
    use crate::memory_writer::MemoryIndexWriter;
    use crate::source::RenderedDocument;
    use async_trait::async_trait;
    use serde_json::json;

    struct FixedRenderer;

    #[async_trait]
    impl Renderer for FixedRenderer {
        async fn render(&self, item: &WorkItem) -> Result<RenderedDocument, SourceError> {
            match item.resource_id.as_str() {
                "missing" => Err(SourceError::NotFound("missing".into())),
                "down" => Err(SourceError::Unavailable("db down".into())),
                id => Ok(RenderedDocument {
                    resource_id: id.to_string(),
                    item_type: "item".to_string(),
                    version: item.xmin,
                    body: json!({ "uuid": id }),
                }),
            }
        }
    }

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            initial_backoff: Duration::from_millis(1),
            max_attempts,
        }
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy::default();
        let mut backoff = policy.backoff();
        let delays: Vec<u64> = (0..4)
            .filter_map(|_| backoff.next_backoff())
            .map(|d| d.as_secs())
            .collect();
        assert_eq!(delays, vec![10, 20, 40, 80]);
    }

    #[tokio::test]
    async fn test_success() {
        let writer = MemoryIndexWriter::new();
        let item = WorkItem::new("a", 3, "s");
        let result = IndexItem::run(&item, &FixedRenderer, &writer, &fast_retry(5)).await.unwrap();
        assert!(result.succeeded());
        assert!(result.error_string().is_none());
        assert_eq!(writer.get("item", "a").unwrap().version, 3);
    }

    #[tokio::test]
    async fn test_retry_then_success_clears_error() {
        let writer = MemoryIndexWriter::new();
        writer.fail_next(2);
        let item = WorkItem::new("a", 3, "s");
        let result = IndexItem::run(&item, &FixedRenderer, &writer, &fast_retry(5)).await.unwrap();
        assert!(result.succeeded());
        assert_eq!(result.attempts.len(), 2);
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let writer = MemoryIndexWriter::new();
        writer.fail_next(10);
        let item = WorkItem::new("a", 3, "s");
        let result = IndexItem::run(&item, &FixedRenderer, &writer, &fast_retry(3)).await.unwrap();
        assert!(!result.succeeded());
        assert_eq!(result.attempts.len(), 3);
        let recorded: ItemError = serde_json::from_str(&result.error_string().unwrap()).unwrap();
        assert_eq!(recorded.uuid, "a");
        assert!(recorded.error_message.contains("injected failure"));
    }

    #[tokio::test]
    async fn test_conflict_stops_retrying() {
        let writer = MemoryIndexWriter::new();
        let newer = WorkItem::new("a", 9, "s");
        IndexItem::run(&newer, &FixedRenderer, &writer, &fast_retry(5)).await.unwrap();

        let older = WorkItem::new("a", 4, "s");
        let result = IndexItem::run(&older, &FixedRenderer, &writer, &fast_retry(5)).await.unwrap();
        assert!(!result.succeeded());
        assert_eq!(result.attempts.len(), 1);
        assert_eq!(writer.get("item", "a").unwrap().version, 9);
    }

    #[tokio::test]
    async fn test_render_failures() {
        let writer = MemoryIndexWriter::new();
        let result = IndexItem::run(&WorkItem::new("missing", 1, "s"), &FixedRenderer, &writer, &fast_retry(5))
            .await
            .unwrap();
        assert!(result.error.unwrap().error_message.contains("not found"));

        let err = IndexItem::run(&WorkItem::new("down", 1, "s"), &FixedRenderer, &writer, &fast_retry(5))
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert!(writer.is_empty());
    }
}
