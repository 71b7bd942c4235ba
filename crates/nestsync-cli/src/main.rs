//! nestsync CLI
//!
//! Command-line interface for nestsync: inspect and edit collections,
//! sync them with another replica, or serve them to peers.

use std::fs::File;
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use nestsync_core::{Collections, Config};

mod commands;
mod output;

use output::{Output, OutputFormat};

#[derive(Parser)]
#[command(name = "nestsync")]
#[command(about = "nestsync - local-first replicated document store")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Quiet mode - minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Use this config file instead of the default
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or update a document
    Put {
        /// Collection name
        collection: String,
        /// Document ID
        id: String,
        /// JSON object body, or - to read it from stdin
        body: String,
        /// Revision being replaced (required when the document exists)
        #[arg(long)]
        rev: Option<String>,
    },
    /// Show a document
    Get {
        collection: String,
        id: String,
        /// Show this revision instead of the current one
        #[arg(long)]
        rev: Option<String>,
    },
    /// Delete a document
    #[command(alias = "rm")]
    Delete {
        collection: String,
        id: String,
        /// Current revision of the document
        #[arg(long)]
        rev: String,
    },
    /// List documents in a collection
    #[command(alias = "ls")]
    List {
        collection: String,
        /// Include deleted documents
        #[arg(long)]
        deleted: bool,
    },
    /// List conflicting revisions of a document
    Conflicts { collection: String, id: String },
    /// Show the revision history of a document
    History {
        collection: String,
        id: String,
        /// Start from this revision instead of the current one
        #[arg(long)]
        rev: Option<String>,
    },
    /// Show the change feed of a collection
    Changes {
        collection: String,
        /// Only changes after this sequence number
        #[arg(long, default_value_t = 0)]
        since: u64,
        /// Maximum number of changes to show
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Sync with the configured server or another data directory
    Sync {
        /// Only sync this collection
        #[arg(short, long)]
        collection: Option<String>,
        /// Sync with the replica in this data directory
        #[arg(long)]
        peer_dir: Option<PathBuf>,
        /// Forget checkpoints and replicate from the beginning
        #[arg(long)]
        resync: bool,
    },
    /// Serve collections to peers over WebSocket
    Serve {
        /// Address to listen on
        #[arg(long, default_value = commands::serve::DEFAULT_BIND)]
        bind: String,
    },
    /// Show replica and replication status
    Status,
    /// Show or set configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Set a configuration value
    Set {
        /// Configuration key (data_dir, sync_url, sync_enabled, collections, ...)
        key: String,
        /// Configuration value
        value: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let output = Output::new(OutputFormat::from_flags(cli.json, cli.quiet));
    let config_path = cli.config.as_deref();

    // Config commands work without opening any collection
    if let Commands::Config { command } = &cli.command {
        return match command.clone() {
            Some(ConfigCommands::Show) | None => commands::config::show(config_path, &output),
            Some(ConfigCommands::Set { key, value }) => {
                commands::config::set(key, value, config_path, &output)
            }
        };
    }

    let config = Config::load_with_cli_override(config_path)?;
    init_logging(&config);
    let collections = Collections::open(&config)?;

    match cli.command {
        Commands::Put {
            collection,
            id,
            body,
            rev,
        } => {
            let store = collections.get(&collection)?;
            commands::doc::put(&store, id, body, rev, &output)?;
            auto_sync(&config, &collections, &collection, &output).await;
            Ok(())
        }
        Commands::Get { collection, id, rev } => {
            commands::doc::get(&*collections.get(&collection)?, id, rev, &output)
        }
        Commands::Delete {
            collection,
            id,
            rev,
        } => {
            let store = collections.get(&collection)?;
            commands::doc::delete(&store, id, rev, &output)?;
            auto_sync(&config, &collections, &collection, &output).await;
            Ok(())
        }
        Commands::List {
            collection,
            deleted,
        } => commands::doc::list(&*collections.get(&collection)?, deleted, &output),
        Commands::Conflicts { collection, id } => {
            commands::doc::conflicts(&*collections.get(&collection)?, id, &output)
        }
        Commands::History {
            collection,
            id,
            rev,
        } => commands::doc::history(&*collections.get(&collection)?, id, rev, &output),
        Commands::Changes {
            collection,
            since,
            limit,
        } => commands::doc::changes(&*collections.get(&collection)?, since, limit, &output),
        Commands::Sync {
            collection,
            peer_dir,
            resync,
        } => {
            commands::sync::sync(&config, &collections, collection, peer_dir, resync, &output)
                .await
        }
        Commands::Serve { bind } => {
            commands::serve::serve(&config, collections, &bind, &output).await
        }
        Commands::Status => commands::status::show(&config, &collections, &output),
        Commands::Config { .. } => Ok(()),
    }
}

/// Push a write to the configured server; failures only warn
async fn auto_sync(config: &Config, collections: &Collections, collection: &str, output: &Output) {
    let Ok(store) = collections.get(collection) else {
        return;
    };

    if let Err(e) = commands::sync::sync_quiet(config, store).await {
        if !output.is_quiet() {
            eprintln!("⚠ Auto-sync failed: {:#}", e);
        }
    }
}

/// Install the tracing subscriber when NESTSYNC_LOG is set
///
/// Logs go to `config.log_file` if set, stderr otherwise.
fn init_logging(config: &Config) {
    let Ok(log_level) = std::env::var("NESTSYNC_LOG") else {
        return;
    };

    let env_filter = EnvFilter::new(format!(
        "nestsync_core={},nestsync={}",
        log_level, log_level
    ));

    // Ignore the error if a subscriber is already installed
    match &config.log_file {
        Some(path) => {
            let log_file = match File::create(path) {
                Ok(f) => f,
                Err(e) => {
                    eprintln!("Warning: Could not create log file {:?}: {}", path, e);
                    return;
                }
            };
            let _ = tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_ansi(false)
                .with_writer(log_file)
                .try_init();
            info!("Logging to {:?}", path);
        }
        None => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .try_init();
        }
    }
}
