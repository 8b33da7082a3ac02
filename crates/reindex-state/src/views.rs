//! Read-only JSON views over the indexer state.
//!
//! Views never fail: a missing record or a store error is reported inside
//! the returned object (`early_return`, `error`) so a status page always
//! has something to show.

use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use chrono_tz::Tz;
use serde_json::{json, Map, Value};
use tracing::warn;

use crate::listener::ListenerStatus;
use crate::record::{
    duration_between, IndexerState, DYNAMIC_KEYS, EVENT_KEYS, STATIC_KEYS, TBD, UNKNOWN,
};
use crate::store::{is_event_tag, IndexerStateStore};

/// Range used by the events view when no argument is given.
pub const EVENTS_DEFAULT_RANGE: &str = "0:100";

/// The views a status reader can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum View {
    Raw,
    Split,
    Minimal,
    Events,
    Listener,
}

impl FromStr for View {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "raw" => Ok(View::Raw),
            "split" => Ok(View::Split),
            "minimal" => Ok(View::Minimal),
            "events" => Ok(View::Events),
            "listener" => Ok(View::Listener),
            other => Err(format!(
                "unknown view '{}', expected raw|split|minimal|events|listener",
                other
            )),
        }
    }
}

impl fmt::Display for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            View::Raw => "raw",
            View::Split => "split",
            View::Minimal => "minimal",
            View::Events => "events",
            View::Listener => "listener",
        };
        f.write_str(name)
    }
}

/// Render one view. `events_arg` only applies to [`View::Events`].
pub async fn render(store: &IndexerStateStore, view: View, events_arg: Option<&str>) -> Value {
    match view {
        View::Raw => raw(store).await,
        View::Split => split(store).await,
        View::Minimal => minimal(store).await,
        View::Events => events(store, events_arg).await,
        View::Listener => listener(store).await,
    }
}

/// Common header: `@type`, UTC now, and local now in `local_tz`.
///
/// An unrecognised zone name falls back to UTC.
pub fn base_result(local_tz: &str) -> Map<String, Value> {
    let now = Utc::now();
    let lcl_now = match local_tz.parse::<Tz>() {
        Ok(tz) => format!("{}: {}", local_tz, now.with_timezone(&tz)),
        Err(_) => format!("{} (unrecognised, using UTC): {}", local_tz, now),
    };
    let mut result = Map::new();
    result.insert("@type".to_string(), json!(["result"]));
    result.insert(
        "utc_now".to_string(),
        json!(now.naive_utc().format(reindex_types::DATETIME_FORMAT).to_string()),
    );
    result.insert("lcl_now".to_string(), json!(lcl_now));
    result
}

fn error_result(store: &IndexerStateStore, err: impl fmt::Display) -> Value {
    warn!(error = %err, "Status view could not read the store");
    let mut result = base_result(&store.settings().local_tz);
    result.insert("error".to_string(), json!(err.to_string()));
    Value::Object(result)
}

/// The flat record as stored.
pub async fn raw(store: &IndexerStateStore) -> Value {
    match store.get_state().await {
        Ok(state) => json!(state),
        Err(err) => error_result(store, err),
    }
}

/// Record split into static, dynamic and event sections.
pub async fn split(store: &IndexerStateStore) -> Value {
    let state = match store.get_state().await {
        Ok(state) => state,
        Err(err) => return error_result(store, err),
    };
    let current = state.get("state").map(String::as_str).unwrap_or_default();
    if current.is_empty() {
        return json!({
            "early_return": "state_obj state keys is Falsey",
            "state_obj": state,
        });
    }
    if current == IndexerState::Init.tag() {
        return json!({
            "early_return": "state_obj state key is in initial state",
            "state_obj": state,
        });
    }

    let field = |key: &str| json!(state.get(key).map(String::as_str).unwrap_or(UNKNOWN));
    let section = |keys: &[&str]| -> Map<String, Value> {
        keys.iter().map(|key| (key.to_string(), field(key))).collect()
    };

    let mut result = base_result(&store.settings().local_tz);
    result.insert("static".to_string(), Value::Object(section(&STATIC_KEYS[..])));
    result.insert("dynamic".to_string(), Value::Object(section(&DYNAMIC_KEYS[..])));

    let start_dt = state.get("start_dt").map(String::as_str).unwrap_or(UNKNOWN);
    let end_dt = state.get("end_dt").map(String::as_str).unwrap_or(UNKNOWN);
    let event = match IndexerState::from_tag(current) {
        Some(IndexerState::RunIndexing) if end_dt == TBD => {
            Some(("current_event", duration_between(start_dt, None)))
        }
        Some(
            IndexerState::RunIndexing
            | IndexerState::EndpointStart
            | IndexerState::LoadIndexing
            | IndexerState::Waiting,
        ) => Some(("previous_event", duration_between(start_dt, Some(end_dt)))),
        _ => None,
    };
    if let Some((event_key, duration)) = event {
        let mut fields = section(&EVENT_KEYS[..]);
        fields.insert("duration".to_string(), json!(duration));
        result.insert(event_key.to_string(), Value::Object(fields));
    }
    Value::Object(result)
}

/// Current state, how long it has lasted, and the running event if any.
pub async fn minimal(store: &IndexerStateStore) -> Value {
    let state = match store.get_state().await {
        Ok(state) => state,
        Err(err) => return error_result(store, err),
    };
    let get = |key: &str| state.get(key).map(String::as_str).unwrap_or(UNKNOWN);
    let current = state.get("state").map(String::as_str).unwrap_or("not initialized");

    let mut result = Map::new();
    result.insert("state".to_string(), json!(current));
    result.insert("time_in_state".to_string(), json!("could not calculate"));

    let mut put = |key: &str, value: String| {
        result.insert(key.to_string(), json!(value));
    };
    match IndexerState::from_tag(current) {
        Some(IndexerState::Waiting) => {
            put("time_in_state", duration_between(get("endpoint_end_dt"), None));
            put(
                "description",
                format!("Remains in state for {} seconds.", get("loop_time")),
            );
        }
        Some(IndexerState::Init) => {
            put("time_in_state", duration_between(get("init_dt"), None));
            put(
                "description",
                "Very short duration. Happens once during deployment".to_string(),
            );
        }
        Some(IndexerState::EndpointStart) => {
            put("time_in_state", duration_between(get("endpoint_start_dt"), None));
            put(
                "description",
                "Very short duration. Happens once per poll.".to_string(),
            );
        }
        Some(IndexerState::LoadIndexing) => {
            put("time_in_state", duration_between(get("endpoint_start_dt"), None));
            put(
                "description",
                "Time depends on number of uuids to index. Could take minutes.".to_string(),
            );
        }
        Some(IndexerState::RunIndexing) if get("end_dt") == TBD => {
            put("time_in_state", duration_between(get("start_dt"), None));
            put(
                "description",
                "Time depends on number of uuids to index. Could take hours.".to_string(),
            );
            put("current_event_tag", get("event_tag").to_string());
            put("current_invalidated_cnt", get("invalidated_cnt").to_string());
        }
        Some(IndexerState::RunIndexing) => {
            put("time_in_state", duration_between(get("end_dt"), None));
            put(
                "description",
                "Short duration. Should go to waiting soon.".to_string(),
            );
            put("just_finished_event_tag", get("event_tag").to_string());
            put(
                "just_finished_invalidated_cnt",
                get("invalidated_cnt").to_string(),
            );
        }
        None => {}
    }
    match store.reindex_request().await {
        Ok(Some(request)) => {
            result.insert("reindex_requested".to_string(), request.describe());
        }
        Ok(None) => {}
        Err(err) => warn!(error = %err, "Could not read pending reindex request"),
    }
    Value::Object(result)
}

/// Parse `start:stop` where both sides are optionally negative integers.
pub fn parse_event_range(arg: &str) -> Option<(i64, i64)> {
    fn side(raw: &str) -> Option<i64> {
        let digits = raw.strip_prefix('-').unwrap_or(raw);
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        raw.parse().ok()
    }
    let (start, stop) = arg.split_once(':')?;
    Some((side(start)?, side(stop)?))
}

/// One event by tag, or event summaries for a `start:stop` range of the
/// recency list (most recent first).
pub async fn events(store: &IndexerStateStore, arg: Option<&str>) -> Value {
    let arg = match arg {
        Some(a) if !a.is_empty() => a,
        _ => EVENTS_DEFAULT_RANGE,
    };
    let mut result = base_result(&store.settings().local_tz);

    if is_event_tag(arg) {
        match store.get_event_fields(arg).await {
            Ok(fields) => {
                result.insert("event".to_string(), json!(fields));
            }
            Err(err) => return error_result(store, err),
        }
    } else if let Some((start, stop)) = parse_event_range(arg) {
        let tags = match store.list_events(start, stop).await {
            Ok(tags) => tags,
            Err(err) => return error_result(store, err),
        };
        let mut messages = Vec::with_capacity(tags.len());
        for tag in tags {
            match store.get_event(&tag).await {
                Ok(Some(msg)) => messages.push(json!(msg)),
                Ok(None) => messages.push(json!(format!("{}: no event data", tag))),
                Err(err) => return error_result(store, err),
            }
        }
        result.insert("events".to_string(), Value::Array(messages));
    } else {
        result.insert("error".to_string(), json!(format!("Bad events value '{}'", arg)));
        result.insert(
            "error_desc".to_string(),
            json!("Must be key(indexer_event:4fc592b0) or range(4:94) like"),
        );
    }
    Value::Object(result)
}

/// The poll loop's status holder.
pub async fn listener(store: &IndexerStateStore) -> Value {
    let mut result = base_result(&store.settings().local_tz);
    match ListenerStatus::load(store.kv().as_ref()).await {
        Ok(Some(status)) => match serde_json::to_value(status) {
            Ok(value) => {
                result.insert("listener".to_string(), value);
            }
            Err(err) => return error_result(store, err),
        },
        Ok(None) => {
            result.insert(
                "early_return".to_string(),
                json!("listener has not reported a status"),
            );
        }
        Err(err) => return error_result(store, err),
    }
    Value::Object(result)
}
