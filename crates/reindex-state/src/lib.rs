//! # reindex-state
//!
//! The indexer's persistent state record and the read-only status views
//! built on it.
//!
//! Only the indexer process writes the record ([`IndexerStateStore::initialize`]
//! and [`IndexerStateStore::set_state`]); status readers in any process use
//! the [`views`] functions against the same store. Operators queue
//! out-of-band work with [`ReindexRequest`], which the coordinator picks up
//! on its next pass.

pub mod error;
pub mod listener;
pub mod record;
pub mod request;
pub mod store;
pub mod views;

pub use error::StateError;
pub use listener::{ListenerError, ListenerStatus, LISTENER_STATUS_KEY};
pub use record::{
    duration_between, format_duration, Field, IndexerRecord, IndexerState, EVENTS_LIST_KEY,
    STATE_KEY,
};
pub use request::{is_valid_resource_id, ReindexRequest, REINDEX_REQUEST_KEY};
pub use store::{
    is_event_tag, new_event_tag, IndexerStateStore, StateSettings, Transition, TransitionArgs,
};
pub use views::View;
