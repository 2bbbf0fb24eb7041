//! Show the next batch of the event log without acknowledging it.

use anyhow::Result;
use base64::{engine::general_purpose::STANDARD, Engine};
use serde_json::{json, Value};
use sync_client::{Config, EventLog};
use sync_types::StoredEvent;

use super::open_log;

/// Run the peek command.
pub async fn run(config: &Config, limit: usize, as_json: bool) -> Result<()> {
    let log = open_log(config).await?;
    let batch = log.next_batch(limit).await?;

    if batch.is_empty() {
        if !as_json {
            println!("Event log is empty.");
        }
        return Ok(());
    }

    for stored in &batch {
        if as_json {
            println!("{}", to_json(stored));
        } else {
            println!("{}", describe(stored));
        }
    }

    Ok(())
}

/// One-line summary of a stored event.
fn describe(stored: &StoredEvent) -> String {
    let event = &stored.event;
    let sender = event
        .sender
        .as_ref()
        .map(|s| format!(" from {s}"))
        .unwrap_or_default();
    let kind = if event.is_encrypted { "encrypted" } else { "plain" };
    format!(
        "#{} {} {} {}{} ({kind}, {} bytes)",
        stored.index,
        event.id,
        event.origin,
        event.envelope_type,
        sender,
        event.payload.len()
    )
}

fn to_json(stored: &StoredEvent) -> Value {
    let event = &stored.event;
    json!({
        "index": stored.index.value(),
        "id": event.id.to_string(),
        "origin": event.origin.as_str(),
        "envelope_type": event.envelope_type,
        "is_encrypted": event.is_encrypted,
        "sender": event.sender.as_ref().map(|s| s.as_str()),
        "payload": STANDARD.encode(&event.payload),
    })
}
