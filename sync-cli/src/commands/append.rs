//! Append events from a JSON file.
//!
//! The file holds an array of events in the same shape `peek --json`
//! prints, minus the `index`:
//!
//! ```json
//! [{"id": "…", "envelope_type": "user.update", "payload": "e30=",
//!   "is_encrypted": false, "origin": "stream"}]
//! ```

use anyhow::{Context, Result};
use std::path::Path;
use sync_client::{Config, EventLog};
use sync_types::RawEvent;
use tracing::info;

use super::open_log;

/// Parse the events in `contents`.
pub fn parse_events(contents: &str) -> Result<Vec<RawEvent>> {
    serde_json::from_str(contents).context("Invalid event file")
}

/// Run the append command.
pub async fn run(config: &Config, file: &Path) -> Result<()> {
    let contents = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let events = parse_events(&contents)?;

    let log = open_log(config).await?;
    let indices = log.append(&events).await?;
    info!(count = indices.len(), file = %file.display(), "Events appended");

    match (indices.first(), indices.last()) {
        (Some(first), Some(last)) => {
            println!("Appended {} events (#{first}..#{last})", indices.len())
        }
        _ => println!("No events to append."),
    }

    Ok(())
}
