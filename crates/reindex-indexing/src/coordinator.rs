//! The indexing coordinator: one poll loop driving the state machine.
//!
//! Each pass walks `endpoint_start -> load_indexing -> run_indexing ->
//! waiting`, loading changed ids into the queue and draining it with local
//! workers or by waiting on remote ones. The last fully indexed xmin is
//! persisted so the next pass only asks for newer changes.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use reindex_queue::{build_queue, QueueKind, UuidQueue};
use reindex_state::{IndexerState, IndexerStateStore, ListenerStatus, ReindexRequest, TransitionArgs};
use reindex_store::KvStore;
use reindex_types::{utc_now_string, ChangeSet, RunArgs};
use serde::Serialize;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::IndexingError;
use crate::source::Collaborators;
use crate::worker::{Worker, WorkerConfig, WorkerSummary};

/// Key holding the xmin of the last completed run.
pub const LAST_XMIN_KEY: &str = "indexer_last_xmin";

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub queue_name: String,
    pub queue_kind: QueueKind,
    pub batch_by: usize,
    /// Batches older than this are expired and their ids re-queued
    pub max_age: Duration,
    /// How often the ledger is checked while draining
    pub finish_poll: Duration,
    pub remote_indexing: bool,
    pub local_workers: usize,
    pub loop_time: Duration,
    pub transient_backoff: Duration,
    pub worker: WorkerConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            queue_name: "indexer_queue".to_string(),
            queue_kind: QueueKind::BaseInMemory,
            batch_by: 1,
            max_age: Duration::from_secs(60),
            finish_poll: Duration::from_millis(500),
            remote_indexing: false,
            local_workers: 4,
            loop_time: Duration::from_secs(3),
            transient_backoff: Duration::from_secs(60),
            worker: WorkerConfig::default(),
        }
    }
}

impl TryFrom<&reindex_types::Settings> for CoordinatorConfig {
    type Error = IndexingError;

    fn try_from(settings: &reindex_types::Settings) -> Result<Self, Self::Error> {
        let queue_kind: QueueKind = settings.queue.queue_type.parse()?;
        Ok(Self {
            queue_name: settings.queue.queue_name.clone(),
            queue_kind,
            batch_by: settings.queue.batch_by,
            max_age: settings.queue.max_age(),
            finish_poll: settings.queue.finish_poll(),
            remote_indexing: settings.queue.remote_indexing,
            local_workers: settings.queue.local_workers,
            loop_time: settings.indexer.loop_time(),
            transient_backoff: settings.indexer.transient_backoff(),
            worker: WorkerConfig::from(settings),
        })
    }
}

/// Summary of one coordinator pass, kept in the listener status.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PassResult {
    pub event_tag: Option<String>,
    pub invalidated: usize,
    /// Ids the queue refused to store
    pub load_failed: usize,
    pub errors: usize,
    pub xmin: Option<i64>,
    pub snapshot_id: Option<String>,
    pub restart: bool,
    pub duration_secs: f64,
    pub finished_at: String,
}

pub struct Coordinator {
    config: CoordinatorConfig,
    store: Arc<dyn KvStore>,
    state: IndexerStateStore,
    queue: UuidQueue,
    collaborators: Collaborators,
    listener: ListenerStatus,
}

impl Coordinator {
    pub fn new(
        config: CoordinatorConfig,
        store: Arc<dyn KvStore>,
        state: IndexerStateStore,
        collaborators: Collaborators,
    ) -> Result<Self, IndexingError> {
        if config.remote_indexing && config.queue_kind == QueueKind::BaseInMemory {
            return Err(IndexingError::Config(format!(
                "remote indexing needs a shared queue, not {}",
                config.queue_kind
            )));
        }
        if !config.remote_indexing && config.local_workers == 0 {
            return Err(IndexingError::Config(
                "local indexing needs at least one worker".to_string(),
            ));
        }
        let backend = build_queue(&config.queue_name, config.queue_kind, Arc::clone(&store))?;
        Ok(Self {
            config,
            store,
            state,
            queue: UuidQueue::new(backend),
            collaborators,
            listener: ListenerStatus::new("created"),
        })
    }

    pub fn queue(&self) -> &UuidQueue {
        &self.queue
    }

    pub fn state(&self) -> &IndexerStateStore {
        &self.state
    }

    pub fn listener(&self) -> &ListenerStatus {
        &self.listener
    }

    pub async fn last_xmin(&self) -> Result<Option<i64>, IndexingError> {
        let raw = self.store.get(LAST_XMIN_KEY).await?;
        Ok(raw.and_then(|v| v.parse().ok()))
    }

    async fn save_last_xmin(&self, xmin: i64) -> Result<(), IndexingError> {
        self.store.set(LAST_XMIN_KEY, &xmin.to_string()).await?;
        Ok(())
    }

    async fn transition(&self, state: IndexerState, args: TransitionArgs) -> Result<Option<String>, IndexingError> {
        Ok(self.state.transition(state, args).await?.event_tag)
    }

    /// Run args for a change set. Combining needs one id length, so mixed
    /// lengths fall back to one id per value.
    fn run_args_for(&self, changes: &ChangeSet) -> RunArgs {
        let mut lengths = changes.resource_ids.iter().map(String::len);
        let first = lengths.next().unwrap_or_default();
        let uniform = first > 0 && lengths.all(|len| len == first);
        let batch_by = if uniform { self.config.batch_by } else { 1 };
        RunArgs {
            batch_by,
            restart: false,
            snapshot_id: changes.snapshot_id.clone(),
            uuid_len: if uniform { first } else { 0 },
            xmin: changes.xmin,
        }
    }

    fn spawn_workers(&self, cancel: &CancellationToken) -> Vec<JoinHandle<Result<WorkerSummary, IndexingError>>> {
        if self.config.remote_indexing {
            return Vec::new();
        }
        (0..self.config.local_workers)
            .map(|n| {
                let mut worker = Worker::new(
                    format!("local-{}", n),
                    self.queue.worker(),
                    self.collaborators.clone(),
                    self.config.worker.clone(),
                );
                let token = cancel.child_token();
                tokio::spawn(async move { worker.run(token).await })
            })
            .collect()
    }

    async fn join_workers(
        handles: Vec<JoinHandle<Result<WorkerSummary, IndexingError>>>,
    ) -> Result<WorkerSummary, IndexingError> {
        let mut total = WorkerSummary::default();
        for joined in join_all(handles).await {
            let summary = joined.map_err(|e| IndexingError::Worker(e.to_string()))??;
            total.batches += summary.batches;
            total.successes += summary.successes;
            total.errors += summary.errors;
            total.rejected += summary.rejected;
            total.abandoned += summary.abandoned;
        }
        Ok(total)
    }

    /// Wait until the ledger accounts for every loaded id and the queue is
    /// empty, re-queueing expired batches along the way.
    async fn drain(&self, cancel: &CancellationToken) -> Result<(), IndexingError> {
        let workers_cancel = cancel.child_token();
        let handles = self.spawn_workers(&workers_cancel);
        let outcome = self.wait_until_finished(cancel, &handles).await;

        if outcome.is_ok() {
            self.queue.stop().await?;
        } else {
            workers_cancel.cancel();
        }
        let joined = Self::join_workers(handles).await;
        outcome?;
        let summary = joined?;
        debug!(
            batches = summary.batches,
            successes = summary.successes,
            errors = summary.errors,
            rejected = summary.rejected,
            "Workers joined"
        );
        Ok(())
    }

    async fn wait_until_finished(
        &self,
        cancel: &CancellationToken,
        handles: &[JoinHandle<Result<WorkerSummary, IndexingError>>],
    ) -> Result<(), IndexingError> {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(IndexingError::Cancelled),
                _ = tokio::time::sleep(self.config.finish_poll) => {}
            }
            let (readd, done) = self.queue.is_run_finished(self.config.max_age).await?;
            if !readd.is_empty() {
                warn!(count = readd.len(), "Re-queueing ids from expired batches");
                self.queue.load_uuids(&readd, true).await?;
                continue;
            }
            if done {
                return Ok(());
            }
            if !handles.is_empty() && handles.iter().all(JoinHandle::is_finished) {
                return Err(IndexingError::Worker(
                    "all local workers exited before the run finished".to_string(),
                ));
            }
        }
    }

    /// Close the run's event, persist its xmin and tell workers to stop.
    async fn finish_run(
        &self,
        event_tag: Option<String>,
        args: &RunArgs,
        mut result: PassResult,
        started: Instant,
    ) -> Result<PassResult, IndexingError> {
        let errors = self.queue.get_errors().await?;
        result.errors = errors.len() + result.load_failed;
        if let Some(tag) = &event_tag {
            self.transition(
                IndexerState::RunIndexing,
                TransitionArgs::end_event(tag.clone(), result.errors as u64),
            )
            .await?;
        }
        self.save_last_xmin(args.xmin).await?;
        self.queue.stop().await?;
        self.transition(IndexerState::Waiting, TransitionArgs::default())
            .await?;
        result.event_tag = event_tag;
        result.duration_secs = started.elapsed().as_secs_f64();
        result.finished_at = utc_now_string();
        info!(
            event_tag = result.event_tag.as_deref().unwrap_or("none"),
            invalidated = result.invalidated,
            errors = result.errors,
            xmin = args.xmin,
            "Indexing run finished"
        );
        Ok(result)
    }

    /// Changes since `last_xmin`, widened by a pending reindex request.
    async fn collect_changes(
        &self,
        last_xmin: Option<i64>,
        requested: Option<&ReindexRequest>,
    ) -> Result<ChangeSet, IndexingError> {
        let source = &self.collaborators.source;
        match requested {
            None => Ok(source.changes_since(last_xmin).await?),
            Some(ReindexRequest::All) => {
                warn!("Reindex of all resources requested");
                Ok(source.changes_since(None).await?)
            }
            Some(ReindexRequest::Ids(ids)) => {
                warn!(requested = ids.len(), "Reindex of {} ids requested", ids.len());
                let mut changes = source.changes_since(last_xmin).await?;
                changes.resource_ids.extend(ids.iter().cloned());
                Ok(changes)
            }
        }
    }

    /// One poll: look for changes and index them.
    pub async fn run_pass(&mut self, cancel: &CancellationToken) -> Result<PassResult, IndexingError> {
        let started = Instant::now();
        self.transition(IndexerState::EndpointStart, TransitionArgs::default())
            .await?;
        self.transition(IndexerState::LoadIndexing, TransitionArgs::default())
            .await?;

        let last_xmin = self.last_xmin().await?;
        let requested = self.state.reindex_request().await?;
        let changes = self.collect_changes(last_xmin, requested.as_ref()).await?;
        if changes.is_empty() {
            debug!(last_xmin, xmin = changes.xmin, "No changes");
            if requested.is_some() {
                self.state.clear_reindex_request().await?;
            }
            self.save_last_xmin(changes.xmin).await?;
            self.transition(IndexerState::Waiting, TransitionArgs::default())
                .await?;
            return Ok(PassResult {
                xmin: Some(changes.xmin),
                duration_secs: started.elapsed().as_secs_f64(),
                finished_at: utc_now_string(),
                ..Default::default()
            });
        }

        let invalidated = changes.len();
        let event_tag = self
            .transition(
                IndexerState::RunIndexing,
                TransitionArgs::start_event(invalidated as u64),
            )
            .await?;
        let args = self.run_args_for(&changes);
        info!(
            invalidated,
            xmin = args.xmin,
            batch_by = args.batch_by,
            event_tag = event_tag.as_deref().unwrap_or("none"),
            "Indexing run started"
        );
        self.queue.initialize(&args).await?;
        let ids: Vec<String> = changes.resource_ids.into_iter().collect();
        let loaded = self.queue.load_uuids(&ids, false).await?;
        if !loaded.failed.is_empty() {
            warn!(failed = loaded.failed.len(), "Queue refused some ids");
        }
        // Cleared only once queued so a failed load keeps the request.
        if requested.is_some() {
            self.state.clear_reindex_request().await?;
        }

        self.drain(cancel).await?;
        let result = PassResult {
            invalidated,
            load_failed: loaded.failed.len(),
            xmin: Some(args.xmin),
            snapshot_id: Some(args.snapshot_id.clone()),
            ..Default::default()
        };
        self.finish_run(event_tag, &args, result, started).await
    }

    /// Finish a run a previous process left behind. `Ok(None)` when there
    /// is nothing to resume.
    pub async fn resume_interrupted(&mut self, cancel: &CancellationToken) -> Result<Option<PassResult>, IndexingError> {
        if !self.queue.can_resume().await? {
            return Ok(None);
        }
        let started = Instant::now();
        let meta = self.queue.backend().meta();
        let Some(mut args) = meta.get_run_args().await? else {
            return Ok(None);
        };
        args.restart = true;
        meta.set_run_args(&args).await?;
        self.queue.resume().await?;

        let stats = self.queue.stats().await?;
        let record = self.state.get_record().await?;
        let open_tag = record
            .as_ref()
            .filter(|r| r.has_open_event())
            .and_then(|r| r.event_tag.value().cloned());
        let invalidated = stats.uuids_loaded.max(0) as usize;
        let event_tag = match open_tag {
            Some(tag) => Some(tag),
            None => {
                self.transition(
                    IndexerState::RunIndexing,
                    TransitionArgs::start_event(invalidated.max(1) as u64),
                )
                .await?
            }
        };
        info!(
            event_tag = event_tag.as_deref().unwrap_or("none"),
            loaded = stats.uuids_loaded,
            handled = stats.uuids_handled(),
            "Resuming interrupted run"
        );

        self.drain(cancel).await?;
        let result = PassResult {
            invalidated,
            xmin: Some(args.xmin),
            snapshot_id: Some(args.snapshot_id.clone()),
            restart: true,
            ..Default::default()
        };
        self.finish_run(event_tag, &args, result, started).await.map(Some)
    }

    async fn publish_status(&self) {
        if let Err(e) = self.listener.save(self.store.as_ref()).await {
            warn!(error = %e, "Could not save listener status");
        }
    }

    fn record_result(&mut self, result: &PassResult) {
        let value = serde_json::to_value(result).unwrap_or_else(|e| json!({ "error": e.to_string() }));
        self.listener.record_result(value);
    }

    /// Initialize the state record and finish any interrupted run.
    pub async fn start(&mut self, cancel: &CancellationToken) -> Result<(), IndexingError> {
        self.state.initialize().await?;
        self.listener.set_status("starting");
        self.publish_status().await;
        if let Some(result) = self.resume_interrupted(cancel).await? {
            self.record_result(&result);
            self.publish_status().await;
        }
        Ok(())
    }

    /// Start, then run a single pass.
    pub async fn run_once(&mut self, cancel: &CancellationToken) -> Result<PassResult, IndexingError> {
        self.start(cancel).await?;
        self.listener.set_status("indexing");
        self.publish_status().await;
        let result = self.run_pass(cancel).await?;
        self.record_result(&result);
        self.listener.set_status("stopped");
        self.publish_status().await;
        Ok(result)
    }

    /// Poll until cancelled.
    ///
    /// Transient failures are recorded and retried after
    /// `transient_backoff`; any other failure ends the loop with an error.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<(), IndexingError> {
        loop {
            match self.start(&cancel).await {
                Ok(()) => break,
                Err(IndexingError::Cancelled) => return Ok(()),
                Err(e) if e.is_transient() => {
                    if !self.back_off(&cancel, &e).await {
                        return Ok(());
                    }
                }
                Err(e) => return Err(self.fatal(e).await),
            }
        }
        info!(loop_time_secs = self.config.loop_time.as_secs(), "Poll loop started");

        while !cancel.is_cancelled() {
            self.listener.set_status("indexing");
            self.publish_status().await;
            let delay = match self.run_pass(&cancel).await {
                Ok(result) => {
                    self.record_result(&result);
                    self.listener.set_status("waiting");
                    self.publish_status().await;
                    self.config.loop_time
                }
                Err(IndexingError::Cancelled) => break,
                Err(e) if e.is_transient() => {
                    if !self.back_off(&cancel, &e).await {
                        break;
                    }
                    continue;
                }
                Err(e) => return Err(self.fatal(e).await),
            };
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        self.listener.set_status("stopped");
        self.publish_status().await;
        info!("Poll loop stopped");
        Ok(())
    }

    /// Record a transient error and sleep. Returns false if cancelled.
    async fn back_off(&mut self, cancel: &CancellationToken, err: &IndexingError) -> bool {
        warn!(
            error = %err,
            backoff_secs = self.config.transient_backoff.as_secs(),
            "Transient error, backing off"
        );
        self.listener.record_error(err.to_string(), true);
        self.listener.set_status("backing off");
        self.publish_status().await;
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(self.config.transient_backoff) => true,
        }
    }

    async fn fatal(&mut self, err: IndexingError) -> IndexingError {
        error!(error = %err, "Fatal error in poll loop");
        self.listener.record_error(err.to_string(), false);
        self.listener.set_status("failed");
        self.publish_status().await;
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SourceError;
    use crate::item::RetryPolicy;
    use crate::kv_source::KvResourceSource;
    use crate::memory_writer::MemoryIndexWriter;
    use crate::source::ChangeSource;
    use async_trait::async_trait;
    use reindex_queue::UuidQueueWorker;
    use reindex_state::{StateSettings, EVENTS_LIST_KEY};
    use reindex_store::MemoryKvStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_config(kind: QueueKind) -> CoordinatorConfig {
        CoordinatorConfig {
            queue_kind: kind,
            max_age: Duration::from_secs(30),
            finish_poll: Duration::from_millis(5),
            local_workers: 2,
            loop_time: Duration::from_millis(10),
            transient_backoff: Duration::from_millis(10),
            worker: WorkerConfig {
                get_size: 2,
                retry: RetryPolicy {
                    initial_backoff: Duration::from_millis(1),
                    max_attempts: 2,
                },
                xmin_poll: Duration::from_millis(5),
                xmin_timeout: Duration::from_secs(1),
                idle_poll: Duration::from_millis(5),
            },
            ..Default::default()
        }
    }

    struct Fixture {
        store: Arc<dyn KvStore>,
        source: Arc<KvResourceSource>,
        writer: Arc<MemoryIndexWriter>,
    }

    impl Fixture {
        fn new() -> Self {
            let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
            Self {
                source: Arc::new(KvResourceSource::new(Arc::clone(&store))),
                writer: Arc::new(MemoryIndexWriter::new()),
                store,
            }
        }

        fn collaborators(&self) -> Collaborators {
            Collaborators {
                source: self.source.clone(),
                renderer: self.source.clone(),
                writer: self.writer.clone(),
            }
        }

        fn coordinator(&self, config: CoordinatorConfig) -> Coordinator {
            let state = IndexerStateStore::new(Arc::clone(&self.store), StateSettings::default());
            Coordinator::new(config, Arc::clone(&self.store), state, self.collaborators()).unwrap()
        }
    }

    #[tokio::test]
    async fn test_pass_without_changes_waits() {
        let fixture = Fixture::new();
        let mut coordinator = fixture.coordinator(fast_config(QueueKind::BaseInMemory));
        let result = coordinator.run_once(&CancellationToken::new()).await.unwrap();
        assert_eq!(result.event_tag, None);
        assert_eq!(result.invalidated, 0);
        assert_eq!(coordinator.last_xmin().await.unwrap(), Some(1));

        let record = coordinator.state().get_record().await.unwrap().unwrap();
        assert_eq!(record.state, Some(IndexerState::Waiting));
        assert!(!record.has_open_event());
    }

    #[tokio::test]
    async fn test_pass_indexes_changes_then_only_new_ones() {
        let fixture = Fixture::new();
        fixture.source.put_resource("lab", "lab", json!({"title": "Lab"}), vec![]).await.unwrap();
        fixture
            .source
            .put_resource("user", "user", json!({}), vec!["lab".to_string()])
            .await
            .unwrap();
        fixture.source.put_resource("award", "award", json!({}), vec![]).await.unwrap();

        let mut coordinator = fixture.coordinator(fast_config(QueueKind::BaseInMemory));
        let cancel = CancellationToken::new();
        let result = coordinator.run_once(&cancel).await.unwrap();
        assert_eq!(result.invalidated, 3);
        assert_eq!(result.errors, 0);
        assert_eq!(fixture.writer.len(), 3);
        let tag = result.event_tag.clone().unwrap();
        let message = coordinator.state().get_event(&tag).await.unwrap().unwrap();
        assert!(message.contains("Indexed '3' uuids"), "{}", message);

        let record = coordinator.state().get_record().await.unwrap().unwrap();
        assert_eq!(record.state, Some(IndexerState::Waiting));
        assert!(!record.has_open_event());
        assert_eq!(coordinator.last_xmin().await.unwrap(), Some(4));

        let quiet = coordinator.run_pass(&cancel).await.unwrap();
        assert_eq!(quiet.invalidated, 0);

        fixture.source.put_resource("lab", "lab", json!({"title": "New"}), vec![]).await.unwrap();
        let again = coordinator.run_pass(&cancel).await.unwrap();
        assert_eq!(again.invalidated, 2);
        let user = fixture.writer.get("user", "user").unwrap();
        assert_eq!(user.version, 5);
        assert_eq!(user.doc["embedded"]["lab"]["properties"]["title"], "New");
        assert_eq!(fixture.store.llen(EVENTS_LIST_KEY).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_requested_reindex_is_picked_up_once() {
        let fixture = Fixture::new();
        fixture.source.put_resource("lab", "lab", json!({}), vec![]).await.unwrap();
        fixture.source.put_resource("user", "user", json!({}), vec![]).await.unwrap();
        fixture.source.put_resource("award", "award", json!({}), vec![]).await.unwrap();

        let mut coordinator = fixture.coordinator(fast_config(QueueKind::BaseInMemory));
        let cancel = CancellationToken::new();
        assert_eq!(coordinator.run_once(&cancel).await.unwrap().invalidated, 3);

        coordinator.state().request_reindex("award,ghost").await.unwrap();
        let result = coordinator.run_pass(&cancel).await.unwrap();
        assert_eq!(result.invalidated, 2);
        assert_eq!(result.errors, 1);
        assert_eq!(coordinator.state().reindex_request().await.unwrap(), None);
        assert_eq!(coordinator.run_pass(&cancel).await.unwrap().invalidated, 0);

        coordinator.state().request_reindex("all").await.unwrap();
        let result = coordinator.run_pass(&cancel).await.unwrap();
        assert_eq!(result.invalidated, 3);
        assert_eq!(result.errors, 0);
        assert_eq!(coordinator.state().reindex_request().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_request_survives_a_failed_pass() {
        let fixture = Fixture::new();
        fixture.source.put_resource("lab", "lab", json!({}), vec![]).await.unwrap();
        let mut coordinator = flaky_coordinator(&fixture, true);
        coordinator.state().initialize().await.unwrap();
        coordinator.state().request_reindex("lab").await.unwrap();

        let cancel = CancellationToken::new();
        assert!(coordinator.run_pass(&cancel).await.is_err());
        assert!(coordinator.state().reindex_request().await.unwrap().is_some());

        let result = coordinator.run_pass(&cancel).await.unwrap();
        assert_eq!(result.invalidated, 1);
        assert_eq!(coordinator.state().reindex_request().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_item_errors_close_event_with_count() {
        let fixture = Fixture::new();
        fixture.source.put_resource("ok", "item", json!({}), vec![]).await.unwrap();
        fixture
            .source
            .put_resource("bad", "item", json!({}), vec!["nowhere".to_string()])
            .await
            .unwrap();

        let mut coordinator = fixture.coordinator(fast_config(QueueKind::RemoteListPipe));
        let result = coordinator.run_once(&CancellationToken::new()).await.unwrap();
        assert_eq!(result.errors, 1);
        let state = coordinator.state().get_state().await.unwrap();
        assert_eq!(state["errors_cnt"], "1");
        let errors = coordinator.queue().get_errors().await.unwrap();
        assert!(errors[0].contains("bad"));
    }

    #[tokio::test]
    async fn test_batched_run_over_shared_set() {
        let fixture = Fixture::new();
        for n in 0..10 {
            let id = format!("{:08}-aaaa", n);
            fixture.source.put_resource(&id, "item", json!({ "n": n }), vec![]).await.unwrap();
        }
        let config = CoordinatorConfig {
            batch_by: 4,
            ..fast_config(QueueKind::RemoteSetPipeExec)
        };
        let mut coordinator = fixture.coordinator(config);
        let result = coordinator.run_once(&CancellationToken::new()).await.unwrap();
        assert_eq!(result.invalidated, 10);
        assert_eq!(result.errors, 0);
        assert_eq!(fixture.writer.len(), 10);
        let args = coordinator.queue().run_args().unwrap();
        assert_eq!(args.batch_by, 4);
        assert_eq!(args.uuid_len, 13);
    }

    #[tokio::test]
    async fn test_resume_interrupted_run() {
        let fixture = Fixture::new();
        let ids: Vec<String> = (0..5).map(|n| format!("r{}", n)).collect();
        for id in &ids {
            fixture.source.put_resource(id, "item", json!({}), vec![]).await.unwrap();
        }

        // A previous process started a run and died holding one batch.
        {
            let mut dead = fixture.coordinator(fast_config(QueueKind::RemoteList));
            dead.state().initialize().await.unwrap();
            let changes = fixture.source.changes_since(None).await.unwrap();
            let args = dead.run_args_for(&changes);
            dead.queue.initialize(&args).await.unwrap();
            dead.queue.load_uuids(&ids, false).await.unwrap();
            let mut worker = UuidQueueWorker::attach("indexer_queue", QueueKind::RemoteList, Arc::clone(&fixture.store)).unwrap();
            assert!(worker.server_ready().await.unwrap());
            let checkout = worker.get_uuids(2).await.unwrap();
            assert_eq!(checkout.uuids.len(), 2);
        }

        let config = CoordinatorConfig {
            max_age: Duration::from_millis(50),
            ..fast_config(QueueKind::RemoteList)
        };
        let mut coordinator = fixture.coordinator(config);
        let cancel = CancellationToken::new();
        coordinator.start(&cancel).await.unwrap();

        let last = coordinator.listener().last_result.clone().unwrap();
        assert_eq!(last["restart"], true);
        assert_eq!(fixture.writer.len(), 5);
        assert_eq!(coordinator.last_xmin().await.unwrap(), Some(6));
        assert!(!coordinator.queue().can_resume().await.unwrap());

        let next = coordinator.run_pass(&cancel).await.unwrap();
        assert_eq!(next.invalidated, 0);
    }

    #[test]
    fn test_remote_indexing_needs_shared_queue() {
        let fixture = Fixture::new();
        let config = CoordinatorConfig {
            remote_indexing: true,
            ..fast_config(QueueKind::BaseInMemory)
        };
        let state = IndexerStateStore::new(Arc::clone(&fixture.store), StateSettings::default());
        let err = Coordinator::new(config, Arc::clone(&fixture.store), state, fixture.collaborators())
            .err()
            .unwrap();
        assert!(matches!(err, IndexingError::Config(_)));
    }

    #[tokio::test]
    async fn test_remote_indexing_waits_for_external_worker() {
        let fixture = Fixture::new();
        fixture.source.put_resource("a", "item", json!({}), vec![]).await.unwrap();
        let config = CoordinatorConfig {
            remote_indexing: true,
            ..fast_config(QueueKind::RemoteSet)
        };
        let mut coordinator = fixture.coordinator(config.clone());

        let queue = UuidQueueWorker::attach("indexer_queue", QueueKind::RemoteSet, Arc::clone(&fixture.store)).unwrap();
        let mut worker = Worker::new("remote-0", queue, fixture.collaborators(), config.worker.clone());
        let cancel = CancellationToken::new();
        let worker_cancel = cancel.clone();
        let remote = tokio::spawn(async move { worker.run_forever(worker_cancel).await });

        let result = coordinator.run_once(&cancel).await.unwrap();
        assert_eq!(result.invalidated, 1);
        assert_eq!(fixture.writer.len(), 1);

        cancel.cancel();
        let summary = remote.await.unwrap().unwrap();
        assert_eq!(summary.successes, 1);
    }

    #[tokio::test]
    async fn test_run_waits_for_ids_a_remote_worker_has_dequeued() {
        let fixture = Fixture::new();
        for id in ["a", "b", "c"] {
            fixture.source.put_resource(id, "item", json!({}), vec![]).await.unwrap();
        }
        let config = CoordinatorConfig {
            remote_indexing: true,
            ..fast_config(QueueKind::RemoteList)
        };
        let mut coordinator = fixture.coordinator(config);

        // Pops the whole queue, then stalls before recording the batch.
        let store = Arc::clone(&fixture.store);
        let reported = Arc::new(AtomicUsize::new(0));
        let reported_by_worker = Arc::clone(&reported);
        let slow = tokio::spawn(async move {
            let mut queue = UuidQueueWorker::attach("indexer_queue", QueueKind::RemoteList, store).unwrap();
            while !queue.server_ready().await.unwrap() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
            let mut values = Vec::new();
            while values.len() < 3 {
                values.extend(queue.backend().get_values(10).await.unwrap().values);
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
            tokio::time::sleep(Duration::from_millis(300)).await;
            let batch_id = queue.backend().meta().add_batch(&values).await.unwrap();
            reported_by_worker.store(values.len(), Ordering::SeqCst);
            let (ok, msg) = queue.add_finished(&batch_id, values.len(), &[]).await.unwrap();
            assert!(ok, "{:?}", msg);
        });

        let result = coordinator.run_once(&CancellationToken::new()).await.unwrap();
        assert_eq!(reported.load(Ordering::SeqCst), 3);
        assert_eq!(result.invalidated, 3);
        let stats = coordinator.queue().stats().await.unwrap();
        assert_eq!(stats.uuids_loaded, 3);
        assert_eq!(stats.successes, 3);
        slow.await.unwrap();
    }

    /// Change source that fails a fixed number of times before delegating.
    struct FlakySource {
        inner: Arc<KvResourceSource>,
        failures: AtomicUsize,
        transient: bool,
    }

    #[async_trait]
    impl ChangeSource for FlakySource {
        async fn changes_since(&self, since_xmin: Option<i64>) -> Result<ChangeSet, SourceError> {
            let pending = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
            if pending.is_ok() {
                return Err(if self.transient {
                    SourceError::Unavailable("database restarting".into())
                } else {
                    SourceError::Render("corrupt transaction log".into())
                });
            }
            self.inner.changes_since(since_xmin).await
        }

        async fn current_xmin(&self) -> Result<i64, SourceError> {
            self.inner.current_xmin().await
        }
    }

    fn flaky_coordinator(fixture: &Fixture, transient: bool) -> Coordinator {
        let collaborators = Collaborators {
            source: Arc::new(FlakySource {
                inner: fixture.source.clone(),
                failures: AtomicUsize::new(1),
                transient,
            }),
            ..fixture.collaborators()
        };
        let state = IndexerStateStore::new(Arc::clone(&fixture.store), StateSettings::default());
        Coordinator::new(
            fast_config(QueueKind::BaseInMemory),
            Arc::clone(&fixture.store),
            state,
            collaborators,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_poll_loop_backs_off_on_transient_errors() {
        let fixture = Fixture::new();
        fixture.source.put_resource("a", "item", json!({}), vec![]).await.unwrap();
        let mut coordinator = flaky_coordinator(&fixture, true);

        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        let handle = tokio::spawn(async move {
            let outcome = coordinator.run(cancel).await;
            (outcome, coordinator)
        });
        for _ in 0..200 {
            if fixture.writer.len() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        stopper.cancel();
        let (outcome, coordinator) = handle.await.unwrap();
        assert!(outcome.is_ok());
        assert_eq!(fixture.writer.len(), 1);

        let status = coordinator.listener();
        assert_eq!(status.status, "stopped");
        assert!(status.errors[0].transient);
        assert!(status.errors[0].error.contains("database restarting"));
        let saved = ListenerStatus::load(fixture.store.as_ref()).await.unwrap().unwrap();
        assert_eq!(saved.status, "stopped");
    }

    #[tokio::test]
    async fn test_poll_loop_fails_on_unexpected_errors() {
        let fixture = Fixture::new();
        let mut coordinator = flaky_coordinator(&fixture, false);
        let err = coordinator.run(CancellationToken::new()).await.unwrap_err();
        assert!(!err.is_transient());
        let saved = ListenerStatus::load(fixture.store.as_ref()).await.unwrap().unwrap();
        assert_eq!(saved.status, "failed");
        assert!(!saved.errors[0].transient);
    }

    #[tokio::test]
    async fn test_cancel_mid_run_keeps_ledger_resumable() {
        let fixture = Fixture::new();
        fixture.source.put_resource("a", "item", json!({}), vec![]).await.unwrap();
        // No remote worker ever shows up, so the run cannot finish.
        let config = CoordinatorConfig {
            remote_indexing: true,
            ..fast_config(QueueKind::RemoteList)
        };
        let mut coordinator = fixture.coordinator(config);
        coordinator.state().initialize().await.unwrap();

        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stopper.cancel();
        });
        let err = coordinator.run_pass(&cancel).await.unwrap_err();
        assert!(matches!(err, IndexingError::Cancelled));
        assert!(coordinator.queue().can_resume().await.unwrap());
        let record = coordinator.state().get_record().await.unwrap().unwrap();
        assert!(record.has_open_event());
        assert!(fixture.writer.is_empty());
    }
}
