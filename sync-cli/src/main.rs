//! # courier-sync
//!
//! CLI tool for inspecting the courier-sync event log.
//!
//! ## Commands
//!
//! - `status`: Show pending events and remembered push ids
//! - `peek`: Show the next batch without acknowledging it
//! - `append`: Append events from a JSON file (for replay testing)
//!
//! ## Example
//!
//! ```bash
//! # Queue captured events
//! courier-sync --database events.db append captured.json
//!
//! # See what the decoder would replay next
//! courier-sync --database events.db peek --limit 10
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use sync_client::Config;
use tracing_subscriber::EnvFilter;

mod commands;

use commands::{append, peek, status};

const DEFAULT_CONFIG_FILE: &str = "courier.toml";

/// Inspect and replay the courier-sync event log.
#[derive(Parser, Debug)]
#[command(name = "courier-sync")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Configuration file (default: courier.toml, if present)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Event log database, overriding the configuration
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    /// Enable verbose output
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show pending events and remembered push ids
    Status,

    /// Show the next batch without acknowledging it
    Peek {
        /// Maximum number of events to show (default: configured batch size)
        #[arg(long, short)]
        limit: Option<usize>,

        /// Print one JSON object per event
        #[arg(long)]
        json: bool,
    },

    /// Append events from a JSON file
    Append {
        /// File containing a JSON array of events
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging (stderr, so command output stays parseable)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("warn")
        }
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let mut config = load_config(cli.config.as_deref())?;
    if let Some(database) = cli.database {
        config.event_log.database = database;
    }

    match cli.command {
        Commands::Status => status::run(&config).await?,
        Commands::Peek { limit, json } => {
            let limit = limit.unwrap_or(config.event_log.batch_size);
            peek::run(&config, limit, json).await?;
        }
        Commands::Append { file } => append::run(&config, &file).await?,
    }

    Ok(())
}

/// Load the configuration, falling back to defaults when no file exists.
fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::from_file(path).context("Failed to load configuration"),
        None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
            Config::from_file(Path::new(DEFAULT_CONFIG_FILE))
                .context("Failed to load configuration")
        }
        None => Ok(Config::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn explicit_config_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_config(Some(&dir.path().join("missing.toml"))).is_err());
    }

    #[test]
    fn explicit_config_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("courier.toml");
        std::fs::write(&path, "[event_log]\nbatch_size = 25\n").unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.event_log.batch_size, 25);
    }
}
