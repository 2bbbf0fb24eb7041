//! CLI command implementations.

pub mod append;
pub mod peek;
pub mod status;

use anyhow::{Context, Result};
use sync_client::{Config, SqliteEventLog};

/// Open the event log named by the configuration.
pub async fn open_log(config: &Config) -> Result<SqliteEventLog> {
    let path = &config.event_log.database;
    SqliteEventLog::new(path)
        .await
        .with_context(|| format!("Failed to open event log {}", path.display()))
}
