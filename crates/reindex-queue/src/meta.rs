//! Batch tracking ledger ("queue meta").
//!
//! Workers check batches out with [`QueueMeta::add_batch`] and resolve them
//! with [`QueueMeta::add_finished`]. A batch that stays out longer than the
//! caller's max age is expired by [`QueueMeta::is_finished`]: its ids are
//! handed back for requeueing exactly once, and the late finish from the
//! original worker is rejected so nothing is counted twice.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reindex_types::RunArgs;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::QueueError;

/// Outcome of [`QueueMeta::add_finished`]: whether the batch was applied,
/// and why not when it was not.
pub type FinishOutcome = (bool, Option<String>);

/// Outcome of [`QueueMeta::is_finished`]: ids to requeue, and whether the
/// run is fully accounted for.
pub type FinishedCheck = (Vec<String>, bool);

/// Point-in-time copy of the ledger counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerStats {
    /// Ids the server loaded for the run; requeued ids count once
    pub uuids_loaded: i64,
    pub uuids_added: i64,
    pub successes: i64,
    pub errors_total: i64,
    /// Checked out and not yet expired
    pub outstanding_batches: usize,
    /// Expired but not yet finished or purged
    pub expired_batches: usize,
}

impl LedgerStats {
    pub fn uuids_handled(&self) -> i64 {
        self.successes + self.errors_total
    }

    /// Every loaded id has been reported back by a worker.
    pub fn accounts_for_loaded(&self) -> bool {
        self.uuids_handled() >= self.uuids_loaded
    }
}

pub(crate) fn missing_batch(batch_id: &str) -> String {
    format!("Batch Id {} does not exist", batch_id)
}

pub(crate) fn expired_batch(batch_id: &str) -> String {
    format!("Batch Id {} expired", batch_id)
}

pub(crate) fn length_mismatch(batch_id: &str, successes: usize, errors: usize, expected: usize) -> String {
    format!(
        "Batch Id {} length mismatch: {} successes + {} errors != {} uuids",
        batch_id, successes, errors, expected
    )
}

/// Ledger contract shared by the process-local and store-backed ledgers.
#[async_trait]
pub trait QueueMeta: Send + Sync {
    /// Record a checked-out batch; returns its id.
    ///
    /// Duplicate values are collapsed. An empty batch still gets an id but
    /// is finished on the spot and leaves the counters alone.
    async fn add_batch(&self, values: &[String]) -> Result<String, QueueError>;

    /// Resolve a batch. Rejects unknown, expired and miscounted batches
    /// without touching the counters.
    async fn add_finished(
        &self,
        batch_id: &str,
        successes: usize,
        errors: &[String],
    ) -> Result<FinishOutcome, QueueError>;

    /// Expire overdue batches, then report whether everything added has
    /// been handled. A zero `max_age` skips the expiry sweep.
    async fn is_finished(&self, max_age: Duration) -> Result<FinishedCheck, QueueError>;

    /// All error strings reported through `add_finished`.
    async fn get_errors(&self) -> Result<Vec<String>, QueueError>;

    /// Reset counters, batches and run state.
    async fn purge_meta(&self) -> Result<(), QueueError>;

    /// Adjust the added counter directly; negative when ids are requeued.
    async fn values_added(&self, count: i64) -> Result<(), QueueError>;

    /// Count ids the server put into the queue for this run. Unlike the
    /// added counter this moves before any worker checks the ids out.
    async fn values_loaded(&self, count: i64) -> Result<(), QueueError>;

    /// Start of a run: zero everything and flag the server as running.
    async fn set_args(&self) -> Result<(), QueueError>;

    async fn set_run_args(&self, run_args: &RunArgs) -> Result<(), QueueError>;

    /// `None` when no run args were published.
    async fn get_run_args(&self) -> Result<Option<RunArgs>, QueueError>;

    async fn is_server_running(&self) -> Result<bool, QueueError>;

    /// Tell workers the run is over.
    async fn set_to_not_running(&self) -> Result<(), QueueError>;

    async fn stats(&self) -> Result<LedgerStats, QueueError>;

    /// Whether the persisted data is consistent enough to resume a run.
    async fn is_useable(&self) -> Result<bool, QueueError>;
}

#[derive(Debug)]
struct Batch {
    uuids: BTreeSet<String>,
    checked_out: Instant,
    expired: bool,
}

#[derive(Debug)]
struct Ledger {
    next_id: u64,
    batches: HashMap<String, Batch>,
    errors: BTreeMap<String, Vec<String>>,
    errors_total: i64,
    uuids_loaded: i64,
    uuids_added: i64,
    successes: i64,
    running: bool,
    run_args: Option<RunArgs>,
}

impl Ledger {
    fn new(first_id: u64) -> Self {
        Self {
            next_id: first_id,
            batches: HashMap::new(),
            errors: BTreeMap::new(),
            errors_total: 0,
            uuids_loaded: 0,
            uuids_added: 0,
            successes: 0,
            running: false,
            run_args: None,
        }
    }

    fn reset(&mut self) {
        self.batches.clear();
        self.errors.clear();
        self.errors_total = 0;
        self.uuids_loaded = 0;
        self.uuids_added = 0;
        self.successes = 0;
        self.running = false;
        self.run_args = None;
    }
}

/// Ledger held in process memory; counts are visible only to this process.
///
/// Batch ids start from the construction time in microseconds so ids from
/// successive ledgers in one process do not collide.
#[derive(Debug)]
pub struct MemoryQueueMeta {
    ledger: Mutex<Ledger>,
}

impl Default for MemoryQueueMeta {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryQueueMeta {
    pub fn new() -> Self {
        let base_id = chrono::Utc::now().timestamp_micros().max(0) as u64;
        Self {
            ledger: Mutex::new(Ledger::new(base_id)),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Ledger>, QueueError> {
        self.ledger
            .lock()
            .map_err(|e| QueueError::Config(format!("ledger lock poisoned: {}", e)))
    }
}

#[async_trait]
impl QueueMeta for MemoryQueueMeta {
    async fn add_batch(&self, values: &[String]) -> Result<String, QueueError> {
        let mut ledger = self.lock()?;
        let batch_id = ledger.next_id.to_string();
        ledger.next_id += 1;

        let uuids: BTreeSet<String> = values.iter().cloned().collect();
        if uuids.is_empty() {
            return Ok(batch_id);
        }
        ledger.uuids_added += uuids.len() as i64;
        ledger.batches.insert(
            batch_id.clone(),
            Batch {
                uuids,
                checked_out: Instant::now(),
                expired: false,
            },
        );
        Ok(batch_id)
    }

    async fn add_finished(
        &self,
        batch_id: &str,
        successes: usize,
        errors: &[String],
    ) -> Result<FinishOutcome, QueueError> {
        let mut ledger = self.lock()?;
        let (expired, expected) = match ledger.batches.get(batch_id) {
            None => return Ok((false, Some(missing_batch(batch_id)))),
            Some(batch) => (batch.expired, batch.uuids.len()),
        };
        if expired {
            ledger.batches.remove(batch_id);
            warn!(batch_id, "Batch finished after it expired");
            return Ok((false, Some(expired_batch(batch_id))));
        }
        if successes + errors.len() != expected {
            let msg = length_mismatch(batch_id, successes, errors.len(), expected);
            warn!(batch_id, "{}", msg);
            return Ok((false, Some(msg)));
        }

        ledger.successes += successes as i64;
        if !errors.is_empty() {
            ledger.errors_total += errors.len() as i64;
            ledger.errors.insert(batch_id.to_string(), errors.to_vec());
        }
        ledger.batches.remove(batch_id);
        Ok((true, None))
    }

    async fn is_finished(&self, max_age: Duration) -> Result<FinishedCheck, QueueError> {
        let mut ledger = self.lock()?;
        let mut readd = Vec::new();
        if !max_age.is_zero() {
            for (batch_id, batch) in ledger.batches.iter_mut() {
                if !batch.expired && batch.checked_out.elapsed() >= max_age {
                    batch.expired = true;
                    debug!(batch_id = %batch_id, count = batch.uuids.len(), "Batch expired");
                    readd.extend(batch.uuids.iter().cloned());
                }
            }
        }
        let outstanding = ledger.batches.values().filter(|b| !b.expired).count();
        let handled = ledger.successes + ledger.errors_total;
        let did_finish = readd.is_empty() && outstanding == 0 && handled == ledger.uuids_added;
        Ok((readd, did_finish))
    }

    async fn get_errors(&self) -> Result<Vec<String>, QueueError> {
        let ledger = self.lock()?;
        Ok(ledger.errors.values().flatten().cloned().collect())
    }

    async fn purge_meta(&self) -> Result<(), QueueError> {
        self.lock()?.reset();
        Ok(())
    }

    async fn values_added(&self, count: i64) -> Result<(), QueueError> {
        self.lock()?.uuids_added += count;
        Ok(())
    }

    async fn values_loaded(&self, count: i64) -> Result<(), QueueError> {
        self.lock()?.uuids_loaded += count;
        Ok(())
    }

    async fn set_args(&self) -> Result<(), QueueError> {
        let mut ledger = self.lock()?;
        ledger.reset();
        ledger.running = true;
        Ok(())
    }

    async fn set_run_args(&self, run_args: &RunArgs) -> Result<(), QueueError> {
        self.lock()?.run_args = Some(run_args.clone());
        Ok(())
    }

    async fn get_run_args(&self) -> Result<Option<RunArgs>, QueueError> {
        Ok(self.lock()?.run_args.clone())
    }

    async fn is_server_running(&self) -> Result<bool, QueueError> {
        Ok(self.lock()?.running)
    }

    async fn set_to_not_running(&self) -> Result<(), QueueError> {
        self.lock()?.running = false;
        Ok(())
    }

    async fn stats(&self) -> Result<LedgerStats, QueueError> {
        let ledger = self.lock()?;
        let expired = ledger.batches.values().filter(|b| b.expired).count();
        Ok(LedgerStats {
            uuids_loaded: ledger.uuids_loaded,
            uuids_added: ledger.uuids_added,
            successes: ledger.successes,
            errors_total: ledger.errors_total,
            outstanding_batches: ledger.batches.len() - expired,
            expired_batches: expired,
        })
    }

    async fn is_useable(&self) -> Result<bool, QueueError> {
        let ledger = self.lock()?;
        let recorded: usize = ledger.errors.values().map(Vec::len).sum();
        Ok(ledger.run_args.is_some()
            && ledger.successes + ledger.errors_total <= ledger.uuids_added
            && recorded as i64 == ledger.errors_total)
    }
}
