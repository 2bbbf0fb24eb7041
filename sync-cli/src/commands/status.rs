//! Show event log status.

use anyhow::Result;
use sync_client::{Config, EventLog};

use super::open_log;

/// Counts shown by `status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusReport {
    /// Events appended but not acknowledged.
    pub pending_events: u64,
    /// Push ids still suppressing stream duplicates.
    pub seen_push_events: usize,
}

/// Collect the status of an event log.
pub async fn report(log: &impl EventLog) -> Result<StatusReport> {
    Ok(StatusReport {
        pending_events: log.pending_count().await?,
        seen_push_events: log.seen_push_events().await?.len(),
    })
}

/// Run the status command.
pub async fn run(config: &Config) -> Result<()> {
    let log = open_log(config).await?;
    let report = report(&log).await?;

    println!("=== courier-sync status ===");
    println!();
    println!("Event log: {}", config.event_log.database.display());
    println!("  Pending events:   {}", report.pending_events);
    println!("  Seen push events: {}", report.seen_push_events);
    if report.pending_events == 0 {
        println!();
        println!("Nothing to replay.");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync_client::SqliteEventLog;
    use sync_types::{EventId, EventOrigin, RawEvent, SequenceIndex};

    #[tokio::test]
    async fn empty_log() {
        let log = SqliteEventLog::in_memory().await.unwrap();
        let report = report(&log).await.unwrap();
        assert_eq!(
            report,
            StatusReport {
                pending_events: 0,
                seen_push_events: 0
            }
        );
    }

    #[tokio::test]
    async fn counts_pending_and_seen() {
        let log = SqliteEventLog::in_memory().await.unwrap();
        let pushed = EventId::new();
        log.append(&[
            RawEvent::plain(pushed, "user.update", vec![], EventOrigin::PushChannel),
            RawEvent::plain(EventId::new(), "user.update", vec![], EventOrigin::Stream),
        ])
        .await
        .unwrap();
        log.commit_batch(SequenceIndex::new(1), &[pushed])
            .await
            .unwrap();

        let report = report(&log).await.unwrap();
        assert_eq!(report.pending_events, 1);
        assert_eq!(report.seen_push_events, 1);
    }

    #[tokio::test]
    async fn run_creates_missing_database() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.event_log.database = dir.path().join("events.db");

        run(&config).await.unwrap();
        assert!(config.event_log.database.exists());
    }
}
