//! CLI argument parsing for the reindex daemon.
//!
//! CLI flags override every other config source.

use clap::{Parser, Subcommand};

/// Snovault reindex daemon
///
/// Polls for changed resources and keeps the search index current.
#[derive(Parser, Debug)]
#[command(name = "reindex-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to config file (overrides default ~/.config/snovault-reindex/config.toml)
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Set log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Daemon commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the indexing coordinator
    Start {
        /// Run a single pass and exit
        #[arg(long)]
        once: bool,

        /// Override the queue type, e.g. REMOTE_SET_PIPE
        #[arg(long)]
        queue_type: Option<String>,

        /// Leave indexing to `worker` processes
        #[arg(long)]
        remote_indexing: bool,

        /// Override the search index path
        #[arg(long)]
        index_path: Option<String>,
    },

    /// Stop a running coordinator
    Stop,

    /// Share the configured store as a gRPC service
    ServeStore {
        /// Override the listen address
        #[arg(long)]
        listen: Option<String>,
    },

    /// Attach an indexing worker to a shared queue
    Worker {
        /// Name used in logs
        #[arg(short, long, default_value = "worker-0")]
        name: String,

        /// Override the search index path
        #[arg(long)]
        index_path: Option<String>,
    },

    /// Show the indexer state
    Status {
        /// raw, split, minimal, events or listener
        #[arg(short, long, default_value = "minimal")]
        view: String,

        /// Event tag or `start:stop` range for the events view
        #[arg(short, long)]
        events: Option<String>,
    },

    /// Ask the indexer to reindex resources on its next pass
    #[command(group(clap::ArgGroup::new("scope").required(true).args(["all", "uuids"])))]
    Reindex {
        /// Reindex every resource
        #[arg(long)]
        all: bool,

        /// Comma separated resource ids
        #[arg(long)]
        uuids: Option<String>,
    },

    /// Clear the queue and its ledger
    Purge,

    /// Store a resource in the bundled change source
    PutResource {
        /// Resource id
        id: String,

        /// Item type, also the search index name
        item_type: String,

        /// Properties as a JSON object
        #[arg(short, long, default_value = "{}")]
        properties: String,

        /// Id of a linked resource (repeatable)
        #[arg(long = "link")]
        links: Vec<String>,
    },

    /// Configuration commands
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

/// Config subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommands {
    /// Print the effective settings as TOML
    Show,
}
