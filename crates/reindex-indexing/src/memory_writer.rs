//! In-process search index writer with external version checks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::WriteError;
use crate::source::SearchIndexWriter;

/// A stored document and its external version.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    pub version: i64,
    pub doc: Value,
}

/// Keeps documents in a map keyed by `(index, id)`.
///
/// A write whose version is older than the stored one is a conflict; equal
/// versions overwrite. [`Self::fail_next`] makes the next writes fail with
/// a retryable error.
#[derive(Default)]
pub struct MemoryIndexWriter {
    docs: Mutex<HashMap<(String, String), StoredDocument>>,
    failures: AtomicUsize,
    commits: AtomicUsize,
}

impl MemoryIndexWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    pub fn get(&self, index: &str, id: &str) -> Option<StoredDocument> {
        let docs = self.docs.lock().ok()?;
        docs.get(&(index.to_string(), id.to_string())).cloned()
    }

    pub fn len(&self) -> usize {
        self.docs.lock().map(|docs| docs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SearchIndexWriter for MemoryIndexWriter {
    async fn upsert(&self, index: &str, id: &str, version: i64, doc: &Value) -> Result<(), WriteError> {
        let pending = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if pending.is_ok() {
            return Err(WriteError::Unavailable(format!("injected failure writing {}", id)));
        }

        let mut docs = self
            .docs
            .lock()
            .map_err(|e| WriteError::IndexLocked(e.to_string()))?;
        let key = (index.to_string(), id.to_string());
        if let Some(current) = docs.get(&key) {
            if current.version > version {
                return Err(WriteError::Conflict {
                    id: id.to_string(),
                    version,
                    current: current.version,
                });
            }
        }
        docs.insert(
            key,
            StoredDocument {
                version,
                doc: doc.clone(),
            },
        );
        Ok(())
    }

    async fn commit(&self) -> Result<(), WriteError> {
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_external_version_check() {
        let writer = MemoryIndexWriter::new();
        writer.upsert("item", "a", 5, &json!({"v": 1})).await.unwrap();
        writer.upsert("item", "a", 5, &json!({"v": 2})).await.unwrap();
        assert_eq!(writer.get("item", "a").unwrap().doc, json!({"v": 2}));

        let err = writer.upsert("item", "a", 4, &json!({})).await.unwrap_err();
        assert!(matches!(err, WriteError::Conflict { current: 5, .. }));
        assert!(!err.is_retryable());
        assert_eq!(writer.len(), 1);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let writer = MemoryIndexWriter::new();
        writer.fail_next(2);
        for _ in 0..2 {
            let err = writer.upsert("item", "a", 1, &json!({})).await.unwrap_err();
            assert!(err.is_retryable());
        }
        writer.upsert("item", "a", 1, &json!({})).await.unwrap();
        assert!(!writer.is_empty());
    }
}
