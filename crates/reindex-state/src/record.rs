//! The indexer state record and its wire format.
//!
//! On the wire every value is a string: timestamps use
//! [`reindex_types::DATETIME_FORMAT`], counts are decimal, and the
//! placeholders `unknown` (never set) and `tbd` (set when a phase starts,
//! filled when it ends) stand in for missing values. [`IndexerRecord`] is
//! the parsed form.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::NaiveDateTime;
use reindex_types::{parse_datetime, DATETIME_FORMAT};
use serde::{Deserialize, Serialize};

/// Hash key holding the record.
pub const STATE_KEY: &str = "indexer_state";
/// List of closed event tags, most recent first.
pub const EVENTS_LIST_KEY: &str = "indexer_events";
/// Prefix of every event tag.
pub const EVENT_TAG_PREFIX: &str = "indexer_event";

pub const UNKNOWN: &str = "unknown";
pub const TBD: &str = "tbd";

pub const STATIC_KEYS: [&str; 7] = [
    "addr",
    "config_name",
    "init_dt",
    "loop_time",
    "pg_ip",
    "remote_indexing",
    "state_key",
];

pub const DYNAMIC_KEYS: [&str; 5] = [
    "endpoint_end_dt",
    "endpoint_start_dt",
    "state",
    "state_desc",
    "state_error",
];

pub const EVENT_KEYS: [&str; 6] = [
    "duration",
    "end_dt",
    "errors_cnt",
    "event_tag",
    "invalidated_cnt",
    "start_dt",
];

/// Lifecycle states of the indexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexerState {
    #[serde(rename = "state_init")]
    Init,
    #[serde(rename = "state_endpoint_start")]
    EndpointStart,
    #[serde(rename = "state_load_indexing")]
    LoadIndexing,
    #[serde(rename = "state_run_indexing")]
    RunIndexing,
    #[serde(rename = "state_waiting")]
    Waiting,
}

impl IndexerState {
    pub const ALL: [IndexerState; 5] = [
        IndexerState::Init,
        IndexerState::EndpointStart,
        IndexerState::LoadIndexing,
        IndexerState::RunIndexing,
        IndexerState::Waiting,
    ];

    pub fn tag(&self) -> &'static str {
        match self {
            IndexerState::Init => "state_init",
            IndexerState::EndpointStart => "state_endpoint_start",
            IndexerState::LoadIndexing => "state_load_indexing",
            IndexerState::RunIndexing => "state_run_indexing",
            IndexerState::Waiting => "state_waiting",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            IndexerState::Init => "initialized",
            IndexerState::EndpointStart => "Endpoint started running",
            IndexerState::LoadIndexing => "Endpoint checking for uuids to index",
            IndexerState::RunIndexing => "Endpoint found uuids and started indexing",
            IndexerState::Waiting => "Waiting to call endpoint",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        IndexerState::ALL.into_iter().find(|state| state.tag() == tag)
    }
}

impl fmt::Display for IndexerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// A record value that may not have been filled in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Field<T> {
    /// Never set, or unreadable
    Unknown,
    /// Phase in progress; set when it ends
    Tbd,
    Value(T),
}

impl<T> Field<T> {
    pub fn value(&self) -> Option<&T> {
        match self {
            Field::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_tbd(&self) -> bool {
        matches!(self, Field::Tbd)
    }
}

impl<T: FromStr> Field<T> {
    pub fn parse(raw: Option<&str>) -> Self {
        match raw {
            None | Some(UNKNOWN) | Some("") => Field::Unknown,
            Some(TBD) => Field::Tbd,
            Some(value) => value.parse().map(Field::Value).unwrap_or(Field::Unknown),
        }
    }
}

fn parse_dt(raw: Option<&str>) -> Field<NaiveDateTime> {
    match raw {
        Some(TBD) => Field::Tbd,
        Some(value) => parse_datetime(value).map(Field::Value).unwrap_or(Field::Unknown),
        None => Field::Unknown,
    }
}

/// Parsed indexer state record.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexerRecord {
    pub addr: String,
    pub config_name: String,
    pub init_dt: Field<NaiveDateTime>,
    pub loop_time: Field<u64>,
    pub pg_ip: String,
    pub remote_indexing: Field<bool>,
    /// `None` when the tag is not one of the known states
    pub state: Option<IndexerState>,
    pub state_desc: String,
    /// Empty when the last transition was accepted
    pub state_error: String,
    pub endpoint_start_dt: Field<NaiveDateTime>,
    pub endpoint_end_dt: Field<NaiveDateTime>,
    pub event_tag: Field<String>,
    pub start_dt: Field<NaiveDateTime>,
    pub end_dt: Field<NaiveDateTime>,
    pub invalidated_cnt: Field<u64>,
    pub errors_cnt: Field<u64>,
    pub duration: Field<String>,
}

impl IndexerRecord {
    pub fn from_fields(fields: &BTreeMap<String, String>) -> Self {
        let get = |key: &str| fields.get(key).map(String::as_str);
        let text = |key: &str| get(key).unwrap_or(UNKNOWN).to_string();
        Self {
            addr: text("addr"),
            config_name: text("config_name"),
            init_dt: parse_dt(get("init_dt")),
            loop_time: Field::parse(get("loop_time")),
            pg_ip: text("pg_ip"),
            remote_indexing: Field::parse(get("remote_indexing")),
            state: get("state").and_then(IndexerState::from_tag),
            state_desc: text("state_desc"),
            state_error: get("state_error").unwrap_or_default().to_string(),
            endpoint_start_dt: parse_dt(get("endpoint_start_dt")),
            endpoint_end_dt: parse_dt(get("endpoint_end_dt")),
            event_tag: Field::parse(get("event_tag")),
            start_dt: parse_dt(get("start_dt")),
            end_dt: parse_dt(get("end_dt")),
            invalidated_cnt: Field::parse(get("invalidated_cnt")),
            errors_cnt: Field::parse(get("errors_cnt")),
            duration: Field::parse(get("duration")),
        }
    }

    /// A run event was started and not yet closed.
    pub fn has_open_event(&self) -> bool {
        self.event_tag.value().is_some() && self.start_dt.value().is_some() && self.end_dt.is_tbd()
    }
}

/// Render a timestamp the way the record stores it.
pub fn format_dt(dt: &NaiveDateTime) -> String {
    dt.format(DATETIME_FORMAT).to_string()
}

/// Seconds rendered in the largest sensible unit: `"12.50 seconds"`,
/// `"2.00 minutes"`, `"1.25 hours"`.
pub fn format_duration(seconds: f64) -> String {
    let (div, unit) = if seconds > 3600.0 {
        (3600.0, "hours")
    } else if seconds > 60.0 {
        (60.0, "minutes")
    } else {
        (1.0, "seconds")
    };
    format!("{:.2} {}", seconds / div, unit)
}

/// Duration between two stored timestamps; `end` defaults to now.
///
/// Unparseable input yields a message instead of a duration.
pub fn duration_between(start: &str, end: Option<&str>) -> String {
    let Some(start_dt) = parse_datetime(start) else {
        return format!("Could not determine duration with start_dt={}", start);
    };
    let end_dt = match end {
        None => chrono::Utc::now().naive_utc(),
        Some(raw) => match parse_datetime(raw) {
            Some(dt) => dt,
            None => return format!("Could not determine duration with end_dt={}", raw),
        },
    };
    let micros = (end_dt - start_dt).num_microseconds().unwrap_or(i64::MAX);
    format_duration(micros as f64 / 1_000_000.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_tags_roundtrip() {
        for state in IndexerState::ALL {
            assert_eq!(IndexerState::from_tag(state.tag()), Some(state));
            assert_eq!(
                serde_json::to_string(&state).unwrap(),
                format!("\"{}\"", state.tag())
            );
        }
        assert_eq!(IndexerState::from_tag("state_bogus"), None);
    }

    #[test]
    fn test_field_parse() {
        assert_eq!(Field::<u64>::parse(None), Field::Unknown);
        assert_eq!(Field::<u64>::parse(Some("unknown")), Field::Unknown);
        assert_eq!(Field::<u64>::parse(Some("tbd")), Field::Tbd);
        assert_eq!(Field::<u64>::parse(Some("12")), Field::Value(12));
        assert_eq!(Field::<u64>::parse(Some("twelve")), Field::Unknown);
    }

    #[test]
    fn test_format_duration_units() {
        assert_eq!(format_duration(12.5), "12.50 seconds");
        assert_eq!(format_duration(60.0), "60.00 seconds");
        assert_eq!(format_duration(120.0), "2.00 minutes");
        assert_eq!(format_duration(4500.0), "1.25 hours");
    }

    #[test]
    fn test_duration_between() {
        assert_eq!(
            duration_between("2020-10-23 17:09:36.000000", Some("2020-10-23 17:09:46.500000")),
            "10.50 seconds"
        );
        assert!(duration_between("tbd", None).starts_with("Could not determine"));
        assert!(duration_between("2020-10-23 17:09:36.000000", Some("unknown"))
            .contains("end_dt=unknown"));
    }

    #[test]
    fn test_record_open_event() {
        let mut fields = BTreeMap::new();
        fields.insert("state".to_string(), "state_run_indexing".to_string());
        fields.insert("event_tag".to_string(), "indexer_event:0011aabb".to_string());
        fields.insert("start_dt".to_string(), "2020-10-23 17:09:36.442405".to_string());
        fields.insert("end_dt".to_string(), "tbd".to_string());
        let record = IndexerRecord::from_fields(&fields);
        assert_eq!(record.state, Some(IndexerState::RunIndexing));
        assert!(record.has_open_event());
        assert_eq!(record.loop_time, Field::Unknown);
    }
}
