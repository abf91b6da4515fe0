//! Persisted queue of events awaiting replication.
//!
//! Lives in `state.db` so it survives restarts. Entries carry the full event
//! payload, an attempt counter and a `next_retry_at` (epoch millis) used for
//! exponential backoff. Alongside the queue, a per-stream watermark records the
//! last event known to be enqueued so startup recovery can find the gap left by
//! a crash between the log write and the enqueue.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::{Arc, Mutex};

use crate::db::lock;
use crate::error::Result;
use crate::events::types::{Event, StreamKey};

/// One queued event.
#[derive(Debug, Clone)]
pub struct QueuedEvent {
    pub event: Event,
    pub attempts: u32,
    pub next_retry_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

#[derive(Clone)]
pub struct SyncQueue {
    db: Arc<Mutex<Connection>>,
}

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

impl SyncQueue {
    pub fn new(db: Arc<Mutex<Connection>>) -> Self {
        Self { db }
    }

    /// Insert `event` and advance its stream's watermark in one transaction.
    ///
    /// The watermark only moves when `event` directly follows it, so a failed
    /// enqueue leaves a gap that [`crate::events::EventStore::recover_pending`]
    /// will fill. Returns `false` if the event was already queued.
    pub fn enqueue(&self, event: &Event) -> Result<bool> {
        let mut conn = lock(&self.db);
        let tx = conn.transaction()?;
        let inserted = insert(&tx, event)?;

        let key = event.stream_key().storage_key();
        let now = Utc::now().to_rfc3339();
        match event.previous_id.as_deref() {
            Some(prev) => {
                tx.execute(
                    "UPDATE stream_watermarks SET last_enqueued_id = ?1, updated_at = ?2
                     WHERE stream_key = ?3 AND last_enqueued_id = ?4",
                    params![event.id, now, key, prev],
                )?;
            }
            None => {
                tx.execute(
                    "INSERT OR IGNORE INTO stream_watermarks (stream_key, last_enqueued_id, updated_at)
                     VALUES (?1, ?2, ?3)",
                    params![key, event.id, now],
                )?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    /// Insert without touching the watermark. Used by startup recovery.
    pub fn requeue(&self, event: &Event) -> Result<bool> {
        let conn = lock(&self.db);
        Ok(insert(&conn, event)?)
    }

    pub fn watermark(&self, key: &StreamKey) -> Result<Option<String>> {
        let conn = lock(&self.db);
        let mark = conn
            .query_row(
                "SELECT last_enqueued_id FROM stream_watermarks WHERE stream_key = ?1",
                [key.storage_key()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(mark)
    }

    pub fn set_watermark(&self, key: &StreamKey, event_id: &str) -> Result<()> {
        let conn = lock(&self.db);
        conn.execute(
            "INSERT INTO stream_watermarks (stream_key, last_enqueued_id, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(stream_key) DO UPDATE SET
                last_enqueued_id = excluded.last_enqueued_id,
                updated_at = excluded.updated_at",
            params![key.storage_key(), event_id, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Entries whose backoff has elapsed, oldest first.
    pub fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<QueuedEvent>> {
        let conn = lock(&self.db);
        let mut stmt = conn.prepare(
            "SELECT event_id, payload, attempts, next_retry_at, last_error FROM sync_queue
             WHERE next_retry_at <= ?1
             ORDER BY enqueued_at, event_id
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![millis(now), limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, u32>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, Option<String>>(4)?,
            ))
        })?;

        let mut items = Vec::new();
        for row in rows {
            let (event_id, payload, attempts, next_retry_at, last_error) = row?;
            let event: Event = match serde_json::from_str(&payload) {
                Ok(event) => event,
                Err(err) => {
                    tracing::error!(event_id, error = %err, "undecodable sync queue payload; skipping");
                    continue;
                }
            };
            items.push(QueuedEvent {
                event,
                attempts,
                next_retry_at: DateTime::from_timestamp_millis(next_retry_at).unwrap_or(now),
                last_error,
            });
        }
        Ok(items)
    }

    /// Remove acknowledged entries.
    pub fn ack(&self, event_ids: &[String]) -> Result<usize> {
        if event_ids.is_empty() {
            return Ok(0);
        }
        let mut conn = lock(&self.db);
        let tx = conn.transaction()?;
        let mut removed = 0;
        {
            let mut stmt = tx.prepare("DELETE FROM sync_queue WHERE event_id = ?1")?;
            for id in event_ids {
                removed += stmt.execute([id])?;
            }
        }
        tx.commit()?;
        Ok(removed)
    }

    /// Record a failed attempt and push the entry's retry time out.
    pub fn record_failure(
        &self,
        event_id: &str,
        attempts: u32,
        next_retry_at: DateTime<Utc>,
        error: &str,
    ) -> Result<()> {
        let conn = lock(&self.db);
        conn.execute(
            "UPDATE sync_queue SET attempts = ?1, next_retry_at = ?2, last_error = ?3
             WHERE event_id = ?4",
            params![attempts, millis(next_retry_at), error, event_id],
        )?;
        Ok(())
    }

    pub fn depth(&self) -> Result<usize> {
        let conn = lock(&self.db);
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM sync_queue", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    /// Queued entries for one stream, oldest first.
    pub fn pending_for(&self, key: &StreamKey) -> Result<Vec<String>> {
        let conn = lock(&self.db);
        let mut stmt = conn.prepare(
            "SELECT event_id FROM sync_queue WHERE stream_key = ?1 ORDER BY enqueued_at, event_id",
        )?;
        let ids = stmt
            .query_map([key.storage_key()], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(ids)
    }
}

fn insert(conn: &Connection, event: &Event) -> rusqlite::Result<bool> {
    let payload = serde_json::to_string(event)
        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
    let now = millis(Utc::now());
    let changed = conn.execute(
        "INSERT OR IGNORE INTO sync_queue
            (event_id, stream_key, payload, attempts, next_retry_at, enqueued_at)
         VALUES (?1, ?2, ?3, 0, ?4, ?4)",
        params![event.id, event.stream_key().storage_key(), payload, now],
    )?;
    Ok(changed == 1)
}
