//! # reindex-types
//!
//! Shared domain types for the reindexing pipeline.
//!
//! - [`WorkItem`]: one resource id plus the snapshot it must be rendered at
//! - [`ChangeSet`]: what the change source reports for one poll
//! - [`RunArgs`]: per-run arguments the queue server publishes for workers
//! - [`Settings`]: layered configuration (defaults -> file -> env -> CLI)
//! - [`ReindexError`]: errors shared by the above

pub mod config;
pub mod error;
pub mod work;

pub use config::{
    IndexerSettings, QueueSettings, SearchSettings, Settings, StoreBackend, StoreSettings,
};
pub use error::ReindexError;
pub use work::{ChangeSet, RunArgs, WorkItem};

/// Format used for every timestamp persisted as a string.
///
/// Example: `2020-10-23 17:09:36.442405`
pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// Current UTC time rendered with [`DATETIME_FORMAT`].
pub fn utc_now_string() -> String {
    chrono::Utc::now()
        .naive_utc()
        .format(DATETIME_FORMAT)
        .to_string()
}

/// Parse a timestamp written with [`DATETIME_FORMAT`].
///
/// Fractional seconds are optional so hand-edited values still parse.
pub fn parse_datetime(value: &str) -> Option<chrono::NaiveDateTime> {
    chrono::NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f").ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_datetime_roundtrip() {
        let now = utc_now_string();
        let parsed = parse_datetime(&now).unwrap();
        assert_eq!(parsed.format(DATETIME_FORMAT).to_string(), now);
    }

    #[test]
    fn test_parse_datetime_without_fraction() {
        assert!(parse_datetime("2020-10-23 17:09:36").is_some());
        assert!(parse_datetime("2020-10-23 17:09:36.442405").is_some());
        assert!(parse_datetime("tbd").is_none());
    }
}
