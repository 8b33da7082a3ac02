//! Operator requests to reindex resources outside the change feed.
//!
//! A request is stored until the coordinator's next pass picks it up.
//! Requests made before then merge: ids accumulate, and `all` absorbs
//! everything else.

use std::collections::BTreeSet;

use reindex_store::KvStore;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::StateError;

/// Key holding the JSON-encoded pending [`ReindexRequest`].
pub const REINDEX_REQUEST_KEY: &str = "indexer_reindex_request";

const MAX_ID_LEN: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", content = "ids", rename_all = "snake_case")]
pub enum ReindexRequest {
    /// Every resource the source knows about
    All,
    /// Just these resources
    Ids(BTreeSet<String>),
}

/// Resource ids are 1 to 128 characters of ASCII letters, digits and
/// `-_.:`, starting with a letter or digit.
pub fn is_valid_resource_id(id: &str) -> bool {
    let mut bytes = id.bytes();
    match bytes.next() {
        Some(first) if first.is_ascii_alphanumeric() => {}
        _ => return false,
    }
    id.len() <= MAX_ID_LEN
        && bytes.all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b':'))
}

impl ReindexRequest {
    /// Parse `all` or a comma separated id list.
    ///
    /// One malformed id rejects the whole request.
    pub fn parse(requested: &str) -> Result<Self, StateError> {
        let requested = requested.trim();
        if requested == "all" {
            return Ok(ReindexRequest::All);
        }
        let mut ids = BTreeSet::new();
        for id in requested.split(',').map(str::trim) {
            if !is_valid_resource_id(id) {
                return Err(StateError::InvalidRequest(format!(
                    "Requesting reindex of at least one uninterpretable id: '{}'",
                    id
                )));
            }
            ids.insert(id.to_string());
        }
        Ok(ReindexRequest::Ids(ids))
    }

    pub fn merge(self, other: ReindexRequest) -> ReindexRequest {
        match (self, other) {
            (ReindexRequest::Ids(mut ids), ReindexRequest::Ids(more)) => {
                ids.extend(more);
                ReindexRequest::Ids(ids)
            }
            _ => ReindexRequest::All,
        }
    }

    /// `"all"` or the id list, as shown in status views.
    pub fn describe(&self) -> Value {
        match self {
            ReindexRequest::All => json!("all"),
            ReindexRequest::Ids(ids) => json!(ids),
        }
    }

    pub async fn load(store: &dyn KvStore) -> Result<Option<Self>, StateError> {
        match store.get(REINDEX_REQUEST_KEY).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Merge into the pending request and save. Returns what is now pending.
    pub async fn submit(self, store: &dyn KvStore) -> Result<Self, StateError> {
        let pending = match Self::load(store).await? {
            Some(existing) => existing.merge(self),
            None => self,
        };
        let raw = serde_json::to_string(&pending)?;
        store.set(REINDEX_REQUEST_KEY, &raw).await?;
        Ok(pending)
    }

    pub async fn clear(store: &dyn KvStore) -> Result<(), StateError> {
        store.delete(&[REINDEX_REQUEST_KEY.to_string()]).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reindex_store::MemoryKvStore;

    fn ids(values: &[&str]) -> ReindexRequest {
        ReindexRequest::Ids(values.iter().map(|v| v.to_string()).collect())
    }

    #[test]
    fn test_parse_all_and_lists() {
        assert_eq!(ReindexRequest::parse("all").unwrap(), ReindexRequest::All);
        assert_eq!(
            ReindexRequest::parse(" user-1, lab-1 ,user-1").unwrap(),
            ids(&["lab-1", "user-1"])
        );
        assert_eq!(
            ReindexRequest::parse("01HQZX3V8K2M4N6P7Q9R0S1T2U").unwrap(),
            ids(&["01HQZX3V8K2M4N6P7Q9R0S1T2U"])
        );
    }

    #[test]
    fn test_parse_rejects_malformed_ids() {
        for bad in ["", "user-1,", "user 1", "-lead", "a/b", "user-1,,lab-1"] {
            let err = ReindexRequest::parse(bad).unwrap_err();
            assert!(
                matches!(err, StateError::InvalidRequest(ref m) if m.contains("uninterpretable")),
                "{:?} -> {:?}",
                bad,
                err
            );
        }
        assert!(!is_valid_resource_id(&"x".repeat(MAX_ID_LEN + 1)));
        assert!(is_valid_resource_id(&"x".repeat(MAX_ID_LEN)));
    }

    #[test]
    fn test_merge_and_describe() {
        let merged = ids(&["a"]).merge(ids(&["b"]));
        assert_eq!(merged, ids(&["a", "b"]));
        assert_eq!(merged.describe(), json!(["a", "b"]));
        assert_eq!(merged.merge(ReindexRequest::All), ReindexRequest::All);
        assert_eq!(ReindexRequest::All.merge(ids(&["c"])).describe(), json!("all"));
    }

    #[tokio::test]
    async fn test_submit_accumulates_until_cleared() {
        let store = MemoryKvStore::new();
        assert_eq!(ReindexRequest::load(&store).await.unwrap(), None);

        ids(&["a"]).submit(&store).await.unwrap();
        let pending = ids(&["b"]).submit(&store).await.unwrap();
        assert_eq!(pending, ids(&["a", "b"]));
        assert_eq!(ReindexRequest::load(&store).await.unwrap(), Some(pending));

        ReindexRequest::clear(&store).await.unwrap();
        assert_eq!(ReindexRequest::load(&store).await.unwrap(), None);
    }
}
