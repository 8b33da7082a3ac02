//! Reindex daemon library exports.
//!
//! # Modules
//!
//! - `cli`: Command-line argument parsing with clap
//! - `commands`: Command implementations
//! - `status_service`: gRPC status endpoint served by a running indexer

pub mod cli;
pub mod commands;
pub mod pb;
pub mod status_service;

pub use cli::{Cli, Commands, ConfigCommands};
pub use commands::{
    init_logging, load_settings, purge_queue, put_resource, request_reindex, run_indexer,
    run_worker, serve_store, show_config, show_status, start_indexer, start_worker, stop_daemon,
};
pub use status_service::{serve_status, StatusClient, StatusError};
