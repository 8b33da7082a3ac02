//! Ledger externalized in the shared key/value store.
//!
//! Every process attached to the same queue sees the same counters and
//! batches. Key layout under `{queue}:bm:`:
//!
//! - `cl`: uuids the server loaded for the run
//! - `ca`, `cs`, `ce`: uuids added, successes, errors (integer strings)
//! - `bid`: batch id counter, kept across purges
//! - `running`: `true` while the server wants workers to keep pulling
//! - `ra`: hash of run args
//! - `be:{id}`: list of error strings for a finished batch
//! - `b:{id}:ts`, `b:{id}:ex`, `b:{id}:vs`: checkout time (µs), expired
//!   flag, list of ids for an outstanding batch
//!
//! Updates are sequences of single-key commands; there is no
//! compare-and-swap, so two servers on one queue would race.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reindex_store::KvStore;
use reindex_types::RunArgs;
use tracing::{debug, warn};

use crate::error::QueueError;
use crate::meta::{
    expired_batch, length_mismatch, missing_batch, FinishOutcome, FinishedCheck, LedgerStats,
    QueueMeta,
};

/// Store-backed ledger.
pub struct KvQueueMeta {
    store: Arc<dyn KvStore>,
    base: String,
}

impl KvQueueMeta {
    pub fn new(queue_name: &str, store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            base: format!("{}:bm:", queue_name),
        }
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}{}", self.base, suffix)
    }

    fn batch_key(&self, batch_id: &str, field: &str) -> String {
        format!("{}b:{}:{}", self.base, batch_id, field)
    }

    fn errors_key(&self, batch_id: &str) -> String {
        format!("{}be:{}", self.base, batch_id)
    }

    async fn counter(&self, suffix: &str) -> Result<i64, QueueError> {
        let key = self.key(suffix);
        match self.store.get(&key).await? {
            None => Ok(0),
            Some(raw) => raw.parse().map_err(|_| {
                QueueError::InvalidArgument(format!("ledger counter {} holds '{}'", key, raw))
            }),
        }
    }

    /// Ids of batches with a checkout record.
    async fn batch_ids(&self) -> Result<Vec<String>, QueueError> {
        let prefix = self.key("b:");
        Ok(self
            .store
            .keys(&prefix)
            .await?
            .into_iter()
            .filter_map(|key| {
                key.strip_prefix(&prefix)
                    .and_then(|rest| rest.strip_suffix(":ts"))
                    .map(str::to_string)
            })
            .collect())
    }

    async fn is_expired(&self, batch_id: &str) -> Result<bool, QueueError> {
        Ok(self
            .store
            .get(&self.batch_key(batch_id, "ex"))
            .await?
            .as_deref()
            == Some("1"))
    }

    async fn drop_batch(&self, batch_id: &str) -> Result<(), QueueError> {
        self.store
            .delete(&[
                self.batch_key(batch_id, "ts"),
                self.batch_key(batch_id, "ex"),
                self.batch_key(batch_id, "vs"),
            ])
            .await?;
        Ok(())
    }

    /// Delete every ledger key except the batch id counter.
    async fn clear(&self) -> Result<(), QueueError> {
        let bid_key = self.key("bid");
        let keys: Vec<String> = self
            .store
            .keys(&self.base)
            .await?
            .into_iter()
            .filter(|key| *key != bid_key)
            .collect();
        if !keys.is_empty() {
            self.store.delete(&keys).await?;
        }
        Ok(())
    }

    async fn recorded_errors(&self) -> Result<Vec<String>, QueueError> {
        let mut errors = Vec::new();
        for key in self.store.keys(&self.key("be:")).await? {
            errors.extend(self.store.lrange(&key, 0, -1).await?);
        }
        Ok(errors)
    }
}

fn now_micros() -> i64 {
    chrono::Utc::now().timestamp_micros()
}

#[async_trait]
impl QueueMeta for KvQueueMeta {
    async fn add_batch(&self, values: &[String]) -> Result<String, QueueError> {
        let batch_id = self.store.incr_by(&self.key("bid"), 1).await?.to_string();

        let mut uuids: Vec<String> = values.to_vec();
        uuids.sort();
        uuids.dedup();
        if uuids.is_empty() {
            return Ok(batch_id);
        }

        // reversed so the stored list reads in sorted order
        let stored: Vec<String> = uuids.iter().rev().cloned().collect();
        self.store
            .lpush(&self.batch_key(&batch_id, "vs"), &stored)
            .await?;
        self.store
            .set(&self.batch_key(&batch_id, "ex"), "0")
            .await?;
        self.store
            .incr_by(&self.key("ca"), uuids.len() as i64)
            .await?;
        // ts last: a batch is only visible once fully written
        self.store
            .set(&self.batch_key(&batch_id, "ts"), &now_micros().to_string())
            .await?;
        Ok(batch_id)
    }

    async fn add_finished(
        &self,
        batch_id: &str,
        successes: usize,
        errors: &[String],
    ) -> Result<FinishOutcome, QueueError> {
        if !self.store.exists(&self.batch_key(batch_id, "ts")).await? {
            return Ok((false, Some(missing_batch(batch_id))));
        }
        if self.is_expired(batch_id).await? {
            self.drop_batch(batch_id).await?;
            warn!(batch_id, "Batch finished after it expired");
            return Ok((false, Some(expired_batch(batch_id))));
        }
        let expected = self.store.llen(&self.batch_key(batch_id, "vs")).await?;
        if successes + errors.len() != expected {
            let msg = length_mismatch(batch_id, successes, errors.len(), expected);
            warn!(batch_id, "{}", msg);
            return Ok((false, Some(msg)));
        }

        self.store
            .incr_by(&self.key("cs"), successes as i64)
            .await?;
        if !errors.is_empty() {
            let stored: Vec<String> = errors.iter().rev().cloned().collect();
            self.store.lpush(&self.errors_key(batch_id), &stored).await?;
            self.store
                .incr_by(&self.key("ce"), errors.len() as i64)
                .await?;
        }
        self.drop_batch(batch_id).await?;
        Ok((true, None))
    }

    async fn is_finished(&self, max_age: Duration) -> Result<FinishedCheck, QueueError> {
        let now = now_micros();
        let max_age_micros = i64::try_from(max_age.as_micros()).unwrap_or(i64::MAX);
        let mut readd = Vec::new();
        let mut outstanding = 0;

        for batch_id in self.batch_ids().await? {
            if self.is_expired(&batch_id).await? {
                continue;
            }
            let checked_out = self
                .store
                .get(&self.batch_key(&batch_id, "ts"))
                .await?
                .and_then(|raw| raw.parse::<i64>().ok());
            let overdue = match checked_out {
                Some(ts) => now.saturating_sub(ts) >= max_age_micros,
                // unreadable timestamp: let the sweep reclaim it
                None => true,
            };
            if !max_age.is_zero() && overdue {
                self.store
                    .set(&self.batch_key(&batch_id, "ex"), "1")
                    .await?;
                let uuids = self
                    .store
                    .lrange(&self.batch_key(&batch_id, "vs"), 0, -1)
                    .await?;
                debug!(batch_id = %batch_id, count = uuids.len(), "Batch expired");
                readd.extend(uuids);
            } else {
                outstanding += 1;
            }
        }

        let did_finish = if readd.is_empty() && outstanding == 0 {
            let handled = self.counter("cs").await? + self.counter("ce").await?;
            handled == self.counter("ca").await?
        } else {
            false
        };
        Ok((readd, did_finish))
    }

    async fn get_errors(&self) -> Result<Vec<String>, QueueError> {
        let errors = self.recorded_errors().await?;
        let total = self.counter("ce").await?;
        if total != errors.len() as i64 {
            warn!(total, recorded = errors.len(), "Ledger error count is off");
        }
        Ok(errors)
    }

    async fn purge_meta(&self) -> Result<(), QueueError> {
        self.clear().await
    }

    async fn values_added(&self, count: i64) -> Result<(), QueueError> {
        self.store.incr_by(&self.key("ca"), count).await?;
        Ok(())
    }

    async fn values_loaded(&self, count: i64) -> Result<(), QueueError> {
        self.store.incr_by(&self.key("cl"), count).await?;
        Ok(())
    }

    async fn set_args(&self) -> Result<(), QueueError> {
        self.clear().await?;
        for counter in ["cl", "ca", "cs", "ce"] {
            self.store.set(&self.key(counter), "0").await?;
        }
        self.store.set(&self.key("running"), "true").await?;
        Ok(())
    }

    async fn set_run_args(&self, run_args: &RunArgs) -> Result<(), QueueError> {
        self.store
            .hset(&self.key("ra"), &run_args.to_fields())
            .await?;
        Ok(())
    }

    async fn get_run_args(&self) -> Result<Option<RunArgs>, QueueError> {
        let fields = self.store.hgetall(&self.key("ra")).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(Some(RunArgs::from_fields(&fields)?))
    }

    async fn is_server_running(&self) -> Result<bool, QueueError> {
        Ok(self.store.get(&self.key("running")).await?.as_deref() == Some("true"))
    }

    async fn set_to_not_running(&self) -> Result<(), QueueError> {
        self.store.set(&self.key("running"), "false").await?;
        Ok(())
    }

    async fn stats(&self) -> Result<LedgerStats, QueueError> {
        let mut stats = LedgerStats {
            uuids_loaded: self.counter("cl").await?,
            uuids_added: self.counter("ca").await?,
            successes: self.counter("cs").await?,
            errors_total: self.counter("ce").await?,
            ..Default::default()
        };
        for batch_id in self.batch_ids().await? {
            if self.is_expired(&batch_id).await? {
                stats.expired_batches += 1;
            } else {
                stats.outstanding_batches += 1;
            }
        }
        Ok(stats)
    }

    async fn is_useable(&self) -> Result<bool, QueueError> {
        let counters = (
            self.counter("ca").await,
            self.counter("cs").await,
            self.counter("ce").await,
        );
        let (added, successes, errors_total) = match counters {
            (Ok(a), Ok(s), Ok(e)) => (a, s, e),
            _ => return Ok(false),
        };
        match self.get_run_args().await {
            Ok(Some(_)) => {}
            Ok(None) | Err(QueueError::RunArgs(_)) => return Ok(false),
            Err(e) => return Err(e),
        }
        if successes + errors_total > added {
            return Ok(false);
        }
        let recorded = self.recorded_errors().await?.len() as i64;
        Ok(recorded == errors_total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reindex_store::MemoryKvStore;

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    fn create_meta() -> (KvQueueMeta, Arc<dyn KvStore>) {
        let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        (KvQueueMeta::new("indexq", Arc::clone(&store)), store)
    }

    #[tokio::test]
    async fn test_batches_visible_to_second_handle() {
        let (meta, store) = create_meta();
        let other = KvQueueMeta::new("indexq", store);

        meta.values_loaded(2).await.unwrap();
        assert_eq!(other.stats().await.unwrap().uuids_loaded, 2);
        let batch_id = meta.add_batch(&ids(&["a", "b"])).await.unwrap();
        assert_eq!(other.stats().await.unwrap().outstanding_batches, 1);

        let (ok, msg) = other
            .add_finished(&batch_id, 1, &ids(&["b failed"]))
            .await
            .unwrap();
        assert!(ok, "{:?}", msg);
        assert_eq!(meta.get_errors().await.unwrap(), ids(&["b failed"]));
        let (readd, done) = meta.is_finished(Duration::from_secs(60)).await.unwrap();
        assert!(readd.is_empty());
        assert!(done);
        assert!(other.stats().await.unwrap().accounts_for_loaded());
    }

    #[tokio::test]
    async fn test_expiry() {
        let (meta, _store) = create_meta();
        let batch_id = meta.add_batch(&ids(&["c", "a", "b"])).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let (readd, done) = meta.is_finished(Duration::from_millis(1)).await.unwrap();
        assert_eq!(readd, ids(&["a", "b", "c"]));
        assert!(!done);
        let (readd, _) = meta.is_finished(Duration::from_millis(1)).await.unwrap();
        assert!(readd.is_empty());

        let (ok, msg) = meta.add_finished(&batch_id, 3, &[]).await.unwrap();
        assert!(!ok);
        assert_eq!(msg.unwrap(), format!("Batch Id {} expired", batch_id));
    }

    #[tokio::test]
    async fn test_unknown_and_mismatched_batches() {
        let (meta, _store) = create_meta();
        let (ok, msg) = meta.add_finished("99", 0, &[]).await.unwrap();
        assert!(!ok);
        assert_eq!(msg.unwrap(), "Batch Id 99 does not exist");

        let batch_id = meta.add_batch(&ids(&["a"])).await.unwrap();
        let (ok, _) = meta
            .add_finished(&batch_id, 1, &ids(&["extra"]))
            .await
            .unwrap();
        assert!(!ok);
        assert_eq!(meta.stats().await.unwrap().successes, 0);
    }

    #[tokio::test]
    async fn test_purge_keeps_batch_ids_monotonic() {
        let (meta, _store) = create_meta();
        let first: u64 = meta.add_batch(&ids(&["a"])).await.unwrap().parse().unwrap();
        meta.purge_meta().await.unwrap();
        meta.purge_meta().await.unwrap();
        assert_eq!(meta.stats().await.unwrap(), LedgerStats::default());
        let second: u64 = meta.add_batch(&ids(&["a"])).await.unwrap().parse().unwrap();
        assert!(second > first);
    }

    #[tokio::test]
    async fn test_run_args_and_useable() {
        let (meta, store) = create_meta();
        assert!(!meta.is_useable().await.unwrap());
        meta.set_args().await.unwrap();
        let args = RunArgs {
            batch_by: 2,
            restart: false,
            snapshot_id: "snap".to_string(),
            uuid_len: 1,
            xmin: 5,
        };
        meta.set_run_args(&args).await.unwrap();
        assert!(meta.is_server_running().await.unwrap());
        assert_eq!(meta.get_run_args().await.unwrap(), Some(args));
        assert!(meta.is_useable().await.unwrap());

        // errors counter no longer matches recorded errors
        store.set("indexq:bm:ce", "3").await.unwrap();
        store.set("indexq:bm:ca", "3").await.unwrap();
        assert!(!meta.is_useable().await.unwrap());

        store.set("indexq:bm:ca", "junk").await.unwrap();
        assert!(!meta.is_useable().await.unwrap());
    }
}
