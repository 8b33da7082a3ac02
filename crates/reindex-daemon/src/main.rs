//! Snovault reindex daemon
//!
//! Keeps a search index in step with a resource store.
//!
//! # Usage
//!
//! ```bash
//! reindex-daemon start [--once] [--queue-type TYPE] [--remote-indexing]
//! reindex-daemon serve-store [--listen ADDR]
//! reindex-daemon worker [--name NAME]
//! reindex-daemon status [--view minimal|raw|split|events|listener] [--events ARG]
//! reindex-daemon reindex --all | --uuids ID,ID
//! reindex-daemon stop | purge | config show
//! reindex-daemon put-resource ID TYPE [--properties JSON] [--link ID]...
//! ```
//!
//! # Configuration
//!
//! Configuration is loaded in order (later sources override earlier):
//! 1. Built-in defaults
//! 2. Config file (~/.config/snovault-reindex/config.toml)
//! 3. Environment variables (REINDEX__*)
//! 4. CLI flags

use anyhow::Result;
use clap::Parser;

use reindex_daemon::{
    init_logging, load_settings, purge_queue, put_resource, request_reindex, serve_store,
    show_config, show_status, start_indexer, start_worker, stop_daemon, Cli, Commands,
    ConfigCommands,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Stop = cli.command {
        return stop_daemon();
    }

    let mut settings = load_settings(cli.config.as_deref(), cli.log_level.as_deref())?;
    init_logging(&settings.log_level)?;

    match cli.command {
        Commands::Start {
            once,
            queue_type,
            remote_indexing,
            index_path,
        } => {
            if let Some(queue_type) = queue_type {
                settings.queue.queue_type = queue_type;
            }
            if remote_indexing {
                settings.queue.remote_indexing = true;
            }
            if let Some(path) = index_path {
                settings.search.index_path = path;
            }
            settings.validate()?;
            start_indexer(&settings, once).await?;
        }
        Commands::Stop => {}
        Commands::ServeStore { listen } => {
            serve_store(&settings, listen.as_deref()).await?;
        }
        Commands::Worker { name, index_path } => {
            if let Some(path) = index_path {
                settings.search.index_path = path;
            }
            start_worker(&settings, &name).await?;
        }
        Commands::Status { view, events } => {
            show_status(&settings, &view, events.as_deref()).await?;
        }
        Commands::Reindex { all, uuids } => {
            let requested = if all {
                "all".to_string()
            } else {
                uuids.unwrap_or_default()
            };
            request_reindex(&settings, &requested).await?;
        }
        Commands::Purge => {
            purge_queue(&settings).await?;
        }
        Commands::PutResource {
            id,
            item_type,
            properties,
            links,
        } => {
            put_resource(&settings, &id, &item_type, &properties, links).await?;
        }
        Commands::Config {
            command: ConfigCommands::Show,
        } => {
            show_config(&settings)?;
        }
    }

    Ok(())
}
