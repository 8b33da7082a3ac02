//! # reindex-indexing
//!
//! Turns changed resources into search documents.
//!
//! The [`Coordinator`] polls a [`ChangeSource`] for resources changed since
//! the last run, loads their ids into a queue and drives the indexer state
//! machine. [`Worker`]s check batches out of the queue, render each id with
//! a [`Renderer`] and write it through a [`SearchIndexWriter`] with an
//! external version check.
//!
//! Implementations shipped here:
//! - [`KvResourceSource`]: resources kept in the shared key/value store
//! - [`TantivyIndexWriter`]: an embedded Tantivy index on disk or in RAM
//! - [`MemoryIndexWriter`]: a map, for tests and dry runs

pub mod coordinator;
pub mod error;
pub mod item;
pub mod kv_source;
pub mod memory_writer;
pub mod source;
pub mod tantivy_writer;
pub mod worker;

pub use coordinator::{Coordinator, CoordinatorConfig, PassResult, LAST_XMIN_KEY};
pub use error::{IndexingError, SourceError, WriteError};
pub use item::{IndexItem, ItemError, RetryPolicy};
pub use kv_source::{KvResourceSource, StoredResource};
pub use memory_writer::{MemoryIndexWriter, StoredDocument};
pub use source::{ChangeSource, Collaborators, RenderedDocument, Renderer, SearchIndexWriter};
pub use tantivy_writer::TantivyIndexWriter;
pub use worker::{Worker, WorkerConfig, WorkerSummary};
