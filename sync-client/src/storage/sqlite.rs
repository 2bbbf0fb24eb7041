//! SQLite event log backend.

use super::{EventLog, StorageError};
use async_trait::async_trait;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use sync_types::{EventId, EventOrigin, RawEvent, SequenceIndex, SessionId, StoredEvent};
use tracing::{debug, error};

/// SQLite-backed event log.
///
/// Uses WAL mode so appends from other tasks do not block batch reads.
/// Cloning shares the underlying pool.
#[derive(Clone)]
pub struct SqliteEventLog {
    pool: SqlitePool,
}

impl SqliteEventLog {
    /// Open the event log at `path`, creating the database if needed.
    pub async fn new(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                return Err(StorageError::InvalidPath {
                    path: path.to_path_buf(),
                });
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let log = Self { pool };
        log.run_migrations().await?;
        debug!(path = %path.display(), "Event log opened");
        Ok(log)
    }

    /// Create an in-memory event log (for testing).
    pub async fn in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(":memory:")?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        // A second connection would open a separate, empty database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let log = Self { pool };
        log.run_migrations().await?;
        Ok(log)
    }

    async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS events (
                sequence_index INTEGER PRIMARY KEY AUTOINCREMENT,
                event_id BLOB NOT NULL,
                origin TEXT NOT NULL,
                is_encrypted INTEGER NOT NULL,
                envelope_type TEXT NOT NULL,
                sender TEXT,
                payload BLOB NOT NULL,
                created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS seen_push_events (
                event_id BLOB PRIMARY KEY
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl EventLog for SqliteEventLog {
    async fn append(&self, events: &[RawEvent]) -> Result<Vec<SequenceIndex>, StorageError> {
        if events.is_empty() {
            return Ok(Vec::new());
        }

        let mut tx = self.pool.begin().await?;
        let mut indices = Vec::with_capacity(events.len());

        for event in events {
            let result = sqlx::query(
                r#"
                INSERT INTO events (event_id, origin, is_encrypted, envelope_type, sender, payload)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
            )
            .bind(event.id.as_bytes())
            .bind(event.origin.as_str())
            .bind(event.is_encrypted)
            .bind(&event.envelope_type)
            .bind(event.sender.as_ref().map(SessionId::as_str))
            .bind(&event.payload)
            .execute(&mut *tx)
            .await?;
            indices.push(SequenceIndex::new(result.last_insert_rowid() as u64));
        }

        tx.commit().await.map_err(|e| {
            error!(error = %e, count = events.len(), "Failed to append events");
            StorageError::Database(e)
        })?;

        debug!(count = indices.len(), "Appended events");
        Ok(indices)
    }

    async fn next_batch(&self, max: usize) -> Result<Vec<StoredEvent>, StorageError> {
        let rows = sqlx::query_as::<_, EventRow>(
            r#"
            SELECT sequence_index, event_id, origin, is_encrypted, envelope_type, sender, payload
            FROM events
            ORDER BY sequence_index ASC
            LIMIT ?1
            "#,
        )
        .bind(max as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(StoredEvent::try_from).collect()
    }

    async fn acknowledge(&self, up_to: SequenceIndex) -> Result<u64, StorageError> {
        let result = sqlx::query("DELETE FROM events WHERE sequence_index <= ?1")
            .bind(up_to.value() as i64)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn commit_batch(
        &self,
        up_to: SequenceIndex,
        push_ids: &[EventId],
    ) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;

        let deleted = sqlx::query("DELETE FROM events WHERE sequence_index <= ?1")
            .bind(up_to.value() as i64)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        for id in push_ids {
            sqlx::query("INSERT OR IGNORE INTO seen_push_events (event_id) VALUES (?1)")
                .bind(id.as_bytes())
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await.map_err(|e| {
            error!(error = %e, %up_to, "Failed to acknowledge batch");
            StorageError::Database(e)
        })?;

        debug!(%up_to, deleted, push_ids = push_ids.len(), "Batch acknowledged");
        Ok(())
    }

    async fn seen_push_events(&self) -> Result<Vec<EventId>, StorageError> {
        let rows: Vec<Vec<u8>> = sqlx::query_scalar("SELECT event_id FROM seen_push_events")
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|bytes| {
                EventId::from_bytes(&bytes).ok_or_else(|| StorageError::Corrupt {
                    index: -1,
                    reason: format!("invalid push event id {}", hex::encode(&bytes)),
                })
            })
            .collect()
    }

    async fn clear_seen_push_events(&self) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM seen_push_events")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn pending_count(&self) -> Result<u64, StorageError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM events")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }
}

/// Internal row type for SQLite queries.
#[derive(sqlx::FromRow)]
struct EventRow {
    sequence_index: i64,
    event_id: Vec<u8>,
    origin: String,
    is_encrypted: bool,
    envelope_type: String,
    sender: Option<String>,
    payload: Vec<u8>,
}

impl TryFrom<EventRow> for StoredEvent {
    type Error = StorageError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        let index = row.sequence_index;
        let id = EventId::from_bytes(&row.event_id).ok_or_else(|| StorageError::Corrupt {
            index,
            reason: format!("invalid event id {}", hex::encode(&row.event_id)),
        })?;
        let origin = EventOrigin::from_str(&row.origin).map_err(|e| StorageError::Corrupt {
            index,
            reason: e.to_string(),
        })?;

        Ok(StoredEvent {
            index: SequenceIndex::new(index as u64),
            event: RawEvent {
                id,
                envelope_type: row.envelope_type,
                payload: row.payload,
                is_encrypted: row.is_encrypted,
                origin,
                sender: row.sender.map(SessionId::new),
            },
        })
    }
}
