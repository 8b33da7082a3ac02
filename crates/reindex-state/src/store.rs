//! Persistent indexer state machine.
//!
//! One record (a hash under [`STATE_KEY`]) describes the indexer: static
//! facts written once at initialization, the current lifecycle state, and
//! the current or most recent run event. Every update is a read, modify and
//! full write of the hash; there is no compare-and-swap, so only one process
//! should hold the indexer role.

use std::collections::BTreeMap;
use std::sync::Arc;

use reindex_store::KvStore;
use reindex_types::utc_now_string;
use tracing::{debug, info, warn};

use crate::error::StateError;
use crate::record::{
    duration_between, IndexerRecord, IndexerState, DYNAMIC_KEYS, EVENTS_LIST_KEY,
    EVENT_KEYS, EVENT_TAG_PREFIX, STATE_KEY, TBD, UNKNOWN,
};
use crate::request::ReindexRequest;

/// Static facts recorded when the indexer initializes the record.
#[derive(Debug, Clone)]
pub struct StateSettings {
    pub config_name: String,
    /// Poll interval in seconds
    pub loop_time: u64,
    /// Upstream database host
    pub pg_ip: String,
    pub remote_indexing: bool,
    /// Time zone name for the status views
    pub local_tz: String,
    /// Closed events kept in the recency list
    pub max_events: usize,
}

impl Default for StateSettings {
    fn default() -> Self {
        Self {
            config_name: "indexer".to_string(),
            loop_time: 3,
            pg_ip: "localhost".to_string(),
            remote_indexing: false,
            local_tz: "GMT".to_string(),
            max_events: 1000,
        }
    }
}

impl From<&reindex_types::Settings> for StateSettings {
    fn from(settings: &reindex_types::Settings) -> Self {
        Self {
            config_name: settings.indexer.config_name.clone(),
            loop_time: settings.indexer.loop_time_secs,
            pg_ip: settings.indexer.db_host.clone(),
            remote_indexing: settings.queue.remote_indexing,
            local_tz: settings.indexer.local_tz.clone(),
            max_events: settings.indexer.max_events,
        }
    }
}

/// Optional inputs to a transition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransitionArgs {
    pub errors_cnt: u64,
    /// Non-zero starts a run event
    pub invalidated_cnt: u64,
    /// Closes the named run event
    pub event_tag: Option<String>,
}

impl TransitionArgs {
    pub fn start_event(invalidated_cnt: u64) -> Self {
        Self {
            invalidated_cnt,
            ..Default::default()
        }
    }

    pub fn end_event(event_tag: impl Into<String>, errors_cnt: u64) -> Self {
        Self {
            errors_cnt,
            event_tag: Some(event_tag.into()),
            ..Default::default()
        }
    }
}

/// Result of [`IndexerStateStore::set_state`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    /// The record as written
    pub state: BTreeMap<String, String>,
    /// Tag of the event started or closed, if any
    pub event_tag: Option<String>,
}

/// New random event tag: `indexer_event:` plus 8 lowercase hex chars.
pub fn new_event_tag() -> String {
    format!("{}:{:08x}", EVENT_TAG_PREFIX, rand::random::<u32>())
}

/// Whether `tag` looks like an event tag (`indexer_event:` plus 8 lowercase alphanumerics).
pub fn is_event_tag(tag: &str) -> bool {
    tag.strip_prefix(EVENT_TAG_PREFIX)
        .and_then(|rest| rest.strip_prefix(':'))
        .is_some_and(|tail| {
            tail.len() == 8
                && tail
                    .bytes()
                    .all(|b| b.is_ascii_digit() || b.is_ascii_lowercase())
        })
}

/// Client for the indexer state record.
pub struct IndexerStateStore {
    store: Arc<dyn KvStore>,
    settings: StateSettings,
}

impl IndexerStateStore {
    /// Read-only until [`Self::initialize`] is called.
    pub fn new(store: Arc<dyn KvStore>, settings: StateSettings) -> Self {
        Self { store, settings }
    }

    pub fn settings(&self) -> &StateSettings {
        &self.settings
    }

    pub fn kv(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    /// Write a fresh record unless one already exists.
    ///
    /// Only the indexer process calls this; status readers never do.
    /// Returns whether a record was created.
    pub async fn initialize(&self) -> Result<bool, StateError> {
        if !self.get_state().await?.is_empty() {
            debug!("Indexer state already present, keeping it");
            return Ok(false);
        }
        let mut state = BTreeMap::new();
        let static_values = [
            ("addr", format!("{}:{}", self.settings.config_name, ulid::Ulid::new())),
            ("config_name", self.settings.config_name.clone()),
            ("init_dt", utc_now_string()),
            ("loop_time", self.settings.loop_time.to_string()),
            ("pg_ip", self.settings.pg_ip.clone()),
            ("remote_indexing", self.settings.remote_indexing.to_string()),
            ("state_key", STATE_KEY.to_string()),
        ];
        for (key, value) in static_values {
            state.insert(key.to_string(), value);
        }
        for key in DYNAMIC_KEYS.iter().chain(EVENT_KEYS.iter()) {
            state.insert(key.to_string(), UNKNOWN.to_string());
        }
        Self::apply_state(&mut state, IndexerState::Init);
        self.store.hset(STATE_KEY, &state).await?;
        info!(addr = %state["addr"], "Initialized indexer state");
        Ok(true)
    }

    /// The raw record; empty when uninitialized.
    pub async fn get_state(&self) -> Result<BTreeMap<String, String>, StateError> {
        Ok(self.store.hgetall(STATE_KEY).await?)
    }

    /// The parsed record; `None` when uninitialized.
    pub async fn get_record(&self) -> Result<Option<IndexerRecord>, StateError> {
        let state = self.get_state().await?;
        if state.is_empty() {
            return Ok(None);
        }
        Ok(Some(IndexerRecord::from_fields(&state)))
    }

    fn apply_state(state: &mut BTreeMap<String, String>, new_state: IndexerState) {
        state.insert("state".to_string(), new_state.tag().to_string());
        state.insert("state_desc".to_string(), new_state.description().to_string());
    }

    async fn write(&self, state: BTreeMap<String, String>, event_tag: Option<String>) -> Result<Transition, StateError> {
        self.store.hset(STATE_KEY, &state).await?;
        Ok(Transition { state, event_tag })
    }

    /// Typed entry point for [`Self::set_state`].
    pub async fn transition(&self, new_state: IndexerState, args: TransitionArgs) -> Result<Transition, StateError> {
        self.set_state(new_state.tag(), args).await
    }

    /// Apply one lifecycle transition named by its tag.
    ///
    /// - `state_endpoint_start`: endpoint start time now, end `tbd`
    /// - `state_load_indexing`: state only
    /// - `state_run_indexing` with `invalidated_cnt`: opens a new event
    /// - `state_run_indexing` with `event_tag`: closes that event
    /// - `state_waiting`: endpoint end time now, start `tbd`
    ///
    /// `state_run_indexing` with neither argument is recorded with a
    /// `state_error`; any other tag leaves the state unchanged and only
    /// sets `state_error`. Rejected transitions return no event tag.
    pub async fn set_state(&self, tag: &str, args: TransitionArgs) -> Result<Transition, StateError> {
        let mut state = self.get_state().await?;
        if state.is_empty() {
            return Err(StateError::NotInitialized(STATE_KEY.to_string()));
        }
        state.insert("state_error".to_string(), String::new());
        let now = utc_now_string();

        let new_state = match IndexerState::from_tag(tag) {
            Some(s) if s != IndexerState::Init => s,
            _ => {
                warn!(tag, "Rejected indexer state change");
                state.insert(
                    "state_error".to_string(),
                    format!("'{}' is not a valid state change", tag),
                );
                return self.write(state, None).await;
            }
        };

        match new_state {
            IndexerState::Waiting => {
                state.insert("endpoint_start_dt".to_string(), TBD.to_string());
                state.insert("endpoint_end_dt".to_string(), now);
            }
            IndexerState::EndpointStart => {
                state.insert("endpoint_end_dt".to_string(), TBD.to_string());
                state.insert("endpoint_start_dt".to_string(), now);
            }
            IndexerState::LoadIndexing | IndexerState::Init => {}
            IndexerState::RunIndexing if args.invalidated_cnt > 0 => {
                let record = IndexerRecord::from_fields(&state);
                if let (true, Some(open)) = (record.has_open_event(), record.event_tag.value()) {
                    warn!(event_tag = %open, "Starting a run while another is open; closing it");
                    self.close_event(open, &record_start(&state), &now, UNKNOWN).await?;
                }
                let event_tag = new_event_tag();
                for key in EVENT_KEYS {
                    state.insert(key.to_string(), TBD.to_string());
                }
                state.insert("event_tag".to_string(), event_tag.clone());
                state.insert("invalidated_cnt".to_string(), args.invalidated_cnt.to_string());
                state.insert("start_dt".to_string(), now);
                for key in EVENT_KEYS {
                    self.store
                        .set(&format!("{}:{}", event_tag, key), &state[key])
                        .await?;
                }
                Self::apply_state(&mut state, new_state);
                info!(event_tag = %event_tag, invalidated = args.invalidated_cnt, "Run event started");
                return self.write(state, Some(event_tag)).await;
            }
            IndexerState::RunIndexing if args.event_tag.is_some() => {
                let event_tag = args.event_tag.unwrap_or_default();
                let errors_cnt = args.errors_cnt.to_string();
                let start_dt = self
                    .store
                    .get(&format!("{}:start_dt", event_tag))
                    .await?
                    .unwrap_or_else(|| record_start(&state));
                let duration = self
                    .close_event(&event_tag, &start_dt, &now, &errors_cnt)
                    .await?;
                if state.get("event_tag") == Some(&event_tag) {
                    state.insert("end_dt".to_string(), now);
                    state.insert("errors_cnt".to_string(), errors_cnt);
                    state.insert("duration".to_string(), duration);
                }
                Self::apply_state(&mut state, new_state);
                info!(event_tag = %event_tag, errors = args.errors_cnt, "Run event closed");
                return self.write(state, Some(event_tag)).await;
            }
            IndexerState::RunIndexing => {
                state.insert(
                    "state_error".to_string(),
                    format!("'{}' requires additional arguments", tag),
                );
            }
        }
        Self::apply_state(&mut state, new_state);
        debug!(state = %new_state, "Indexer state changed");
        self.write(state, None).await
    }

    /// Write an event's end fields and push it onto the recency list.
    async fn close_event(&self, event_tag: &str, start_dt: &str, end_dt: &str, errors_cnt: &str) -> Result<String, StateError> {
        let duration = duration_between(start_dt, Some(end_dt));
        let fields = [
            ("end_dt", end_dt),
            ("errors_cnt", errors_cnt),
            ("duration", duration.as_str()),
        ];
        for (key, value) in fields {
            self.store
                .set(&format!("{}:{}", event_tag, key), value)
                .await?;
        }
        self.store
            .lpush(EVENTS_LIST_KEY, &[event_tag.to_string()])
            .await?;
        let max_events = self.settings.max_events.max(1) as i64;
        let dropped = self.store.lrange(EVENTS_LIST_KEY, max_events, -1).await?;
        if !dropped.is_empty() {
            let keys: Vec<String> = dropped
                .iter()
                .flat_map(|tag| EVENT_KEYS.iter().map(move |key| format!("{}:{}", tag, key)))
                .collect();
            self.store.delete(&keys).await?;
            debug!(count = dropped.len(), "Dropped events past the recency limit");
        }
        self.store.ltrim(EVENTS_LIST_KEY, 0, max_events - 1).await?;
        Ok(duration)
    }

    /// Event fields by name (without the tag prefix).
    pub async fn get_event_fields(&self, event_tag: &str) -> Result<BTreeMap<String, String>, StateError> {
        let prefix = format!("{}:", event_tag);
        let mut fields = BTreeMap::new();
        for key in self.store.keys(&prefix).await? {
            if let Some(value) = self.store.get(&key).await? {
                let name = key.strip_prefix(&prefix).unwrap_or(&key).to_string();
                fields.insert(name, value);
            }
        }
        Ok(fields)
    }

    /// One-line summary of an event; `None` when the tag is unknown.
    pub async fn get_event(&self, event_tag: &str) -> Result<Option<String>, StateError> {
        let fields = self.get_event_fields(event_tag).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        let field = |key: &str| fields.get(key).map(String::as_str).unwrap_or(UNKNOWN);
        let duration = duration_between(field("start_dt"), Some(field("end_dt")));
        Ok(Some(format!(
            "{}: Indexed '{}' uuids in '{}' with '{}' errors. Ended at '{}'.",
            event_tag,
            field("invalidated_cnt"),
            duration,
            field("errors_cnt"),
            field("end_dt"),
        )))
    }

    /// Closed event tags in `start..=stop` of the recency list.
    pub async fn list_events(&self, start: i64, stop: i64) -> Result<Vec<String>, StateError> {
        Ok(self.store.lrange(EVENTS_LIST_KEY, start, stop).await?)
    }

    /// Queue `all` or a comma separated id list for the next pass.
    pub async fn request_reindex(&self, requested: &str) -> Result<ReindexRequest, StateError> {
        let pending = ReindexRequest::parse(requested)?
            .submit(self.store.as_ref())
            .await?;
        info!(requested = %pending.describe(), "Reindex requested");
        Ok(pending)
    }

    pub async fn reindex_request(&self) -> Result<Option<ReindexRequest>, StateError> {
        ReindexRequest::load(self.store.as_ref()).await
    }

    pub async fn clear_reindex_request(&self) -> Result<(), StateError> {
        ReindexRequest::clear(self.store.as_ref()).await
    }
}

fn record_start(state: &BTreeMap<String, String>) -> String {
    state
        .get("start_dt")
        .cloned()
        .unwrap_or_else(|| UNKNOWN.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Field;
    use reindex_store::MemoryKvStore;

    fn create_store() -> IndexerStateStore {
        IndexerStateStore::new(Arc::new(MemoryKvStore::new()), StateSettings::default())
    }

    #[test]
    fn test_event_tag_shape() {
        for _ in 0..20 {
            let tag = new_event_tag();
            assert!(is_event_tag(&tag), "{}", tag);
        }
        assert!(!is_event_tag("indexer_event:XYZ"));
        assert!(!is_event_tag("other:0011aabb"));
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let store = create_store();
        assert!(store.get_state().await.unwrap().is_empty());
        assert!(store.initialize().await.unwrap());
        let first = store.get_state().await.unwrap();
        assert_eq!(first["state"], "state_init");
        assert_eq!(first["state_desc"], "initialized");
        assert_eq!(first["start_dt"], "unknown");
        assert!(first["addr"].starts_with("indexer:"));

        let again = IndexerStateStore::new(Arc::clone(store.kv()), StateSettings::default());
        assert!(!again.initialize().await.unwrap());
        assert_eq!(again.get_state().await.unwrap(), first);
    }

    #[tokio::test]
    async fn test_set_state_requires_record() {
        let store = create_store();
        let err = store
            .transition(IndexerState::Waiting, TransitionArgs::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::NotInitialized(_)));
    }

    #[tokio::test]
    async fn test_full_cycle_produces_one_event() {
        let store = create_store();
        store.initialize().await.unwrap();

        let t = store
            .transition(IndexerState::EndpointStart, TransitionArgs::default())
            .await
            .unwrap();
        assert_eq!(t.state["endpoint_end_dt"], "tbd");
        assert_eq!(t.event_tag, None);

        store
            .transition(IndexerState::LoadIndexing, TransitionArgs::default())
            .await
            .unwrap();
        let started = store
            .transition(IndexerState::RunIndexing, TransitionArgs::start_event(5))
            .await
            .unwrap();
        let tag = started.event_tag.clone().unwrap();
        assert_eq!(started.state["end_dt"], "tbd");
        assert_eq!(started.state["invalidated_cnt"], "5");
        let record = store.get_record().await.unwrap().unwrap();
        assert!(record.has_open_event());

        let ended = store
            .transition(IndexerState::RunIndexing, TransitionArgs::end_event(&tag, 2))
            .await
            .unwrap();
        assert_eq!(ended.event_tag.as_deref(), Some(tag.as_str()));
        assert_eq!(ended.state["errors_cnt"], "2");
        let record = store.get_record().await.unwrap().unwrap();
        assert!(!record.has_open_event());
        assert_eq!(record.invalidated_cnt, Field::Value(5));

        assert_eq!(store.list_events(0, -1).await.unwrap(), vec![tag.clone()]);
        let msg = store.get_event(&tag).await.unwrap().unwrap();
        assert!(msg.starts_with(&format!("{}: Indexed '5' uuids in '", tag)), "{}", msg);
        assert!(msg.contains("with '2' errors"), "{}", msg);

        let waiting = store
            .transition(IndexerState::Waiting, TransitionArgs::default())
            .await
            .unwrap();
        assert_eq!(waiting.state["endpoint_start_dt"], "tbd");
        assert_eq!(waiting.state["state_error"], "");
    }

    #[tokio::test]
    async fn test_rejected_transitions_set_error() {
        let store = create_store();
        store.initialize().await.unwrap();

        let t = store
            .set_state("state_bogus", TransitionArgs::default())
            .await
            .unwrap();
        assert_eq!(t.event_tag, None);
        assert_eq!(t.state["state"], "state_init");
        assert_eq!(t.state["state_error"], "'state_bogus' is not a valid state change");

        let t = store
            .set_state("state_init", TransitionArgs::default())
            .await
            .unwrap();
        assert!(t.state["state_error"].contains("not a valid state change"));

        let t = store
            .transition(IndexerState::RunIndexing, TransitionArgs::default())
            .await
            .unwrap();
        assert_eq!(t.event_tag, None);
        assert_eq!(t.state["state"], "state_run_indexing");
        assert!(t.state["state_error"].contains("requires additional arguments"));
    }

    #[tokio::test]
    async fn test_events_list_is_bounded_and_recent_first() {
        let settings = StateSettings {
            max_events: 2,
            ..Default::default()
        };
        let store = IndexerStateStore::new(Arc::new(MemoryKvStore::new()), settings);
        store.initialize().await.unwrap();
        let mut tags = Vec::new();
        for n in 1..=3 {
            let started = store
                .transition(IndexerState::RunIndexing, TransitionArgs::start_event(n))
                .await
                .unwrap();
            let tag = started.event_tag.unwrap();
            store
                .transition(IndexerState::RunIndexing, TransitionArgs::end_event(&tag, 0))
                .await
                .unwrap();
            tags.push(tag);
        }
        let listed = store.list_events(0, -1).await.unwrap();
        assert_eq!(listed, vec![tags[2].clone(), tags[1].clone()]);
        assert_eq!(store.get_event(&tags[0]).await.unwrap(), None);
        assert!(store.get_event(&tags[1]).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_dropped_events_leave_no_keys_behind() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let settings = StateSettings {
            max_events: 3,
            ..Default::default()
        };
        let store = IndexerStateStore::new(Arc::clone(&kv), settings);
        store.initialize().await.unwrap();
        for n in 1..=20 {
            let started = store
                .transition(IndexerState::RunIndexing, TransitionArgs::start_event(n))
                .await
                .unwrap();
            let tag = started.event_tag.unwrap();
            store
                .transition(IndexerState::RunIndexing, TransitionArgs::end_event(&tag, 0))
                .await
                .unwrap();
        }
        let event_keys = kv.keys(&format!("{}:", EVENT_TAG_PREFIX)).await.unwrap();
        assert_eq!(event_keys.len(), 3 * EVENT_KEYS.len());
        assert_eq!(kv.llen(EVENTS_LIST_KEY).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_random_transitions_keep_one_open_event() {
        use rand::Rng;

        let settings = StateSettings {
            max_events: 5,
            ..Default::default()
        };
        let store = IndexerStateStore::new(Arc::new(MemoryKvStore::new()), settings);
        store.initialize().await.unwrap();
        let mut rng = rand::rng();
        let mut open: Option<String> = None;
        for _ in 0..200 {
            let args = match rng.random_range(0..6) {
                0 => TransitionArgs::start_event(rng.random_range(1..50)),
                1 => match &open {
                    Some(tag) => TransitionArgs::end_event(tag, 0),
                    None => TransitionArgs::default(),
                },
                _ => TransitionArgs::default(),
            };
            let state = IndexerState::ALL[rng.random_range(1..IndexerState::ALL.len())];
            let starting = state == IndexerState::RunIndexing && args.invalidated_cnt > 0;
            let closing = state == IndexerState::RunIndexing && args.event_tag.is_some();
            let t = store.transition(state, args).await.unwrap();
            if starting {
                open = t.event_tag.clone();
            } else if closing {
                open = None;
            }

            let record = store.get_record().await.unwrap().unwrap();
            assert_eq!(record.state, Some(state));
            assert_eq!(record.has_open_event(), open.is_some());
            if let Some(tag) = &open {
                assert_eq!(record.event_tag.value(), Some(tag));
            }
            assert!(store.list_events(0, -1).await.unwrap().len() <= 5);
        }
    }

    #[tokio::test]
    async fn test_unknown_event() {
        let store = create_store();
        assert_eq!(store.get_event("indexer_event:00000000").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_malformed_reindex_request_leaves_pending_one_alone() {
        let store = create_store();
        store.request_reindex("user-1,lab-1").await.unwrap();

        let err = store.request_reindex("award-1,not an id").await.unwrap_err();
        assert!(matches!(err, StateError::InvalidRequest(_)));
        let pending = store.reindex_request().await.unwrap().unwrap();
        assert_eq!(pending.describe(), serde_json::json!(["lab-1", "user-1"]));

        store.clear_reindex_request().await.unwrap();
        assert_eq!(store.reindex_request().await.unwrap(), None);
    }
}
