//! Session cursors.
//!
//! One cursor per `(user, project, branch)`, persisted in `state.db`. An active
//! cursor reads from the stream head; pausing pins it to the head at pause time
//! so the next load resumes exactly there. A stored cursor whose position no
//! longer exists in the stream is replaced with a fresh one at head.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::db::lock;
use crate::error::{ContinuumError, Result};
use crate::events::{EventStore, StreamKey};
use crate::sync::SyncSignal;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CursorState {
    Active,
    Paused,
}

impl CursorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
        }
    }
}

impl std::str::FromStr for CursorState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            _ => Err(format!("unknown cursor status: {s}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionCursor {
    pub id: String,
    pub user_id: String,
    pub project_id: String,
    pub branch: String,
    /// Event the cursor was last pinned to. `None` for an empty stream.
    pub current_event_id: Option<String>,
    pub state: CursorState,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
}

impl SessionCursor {
    pub fn stream_key(&self) -> StreamKey {
        StreamKey::new(&self.user_id, &self.project_id, &self.branch)
    }
}

/// How `start_or_resume` satisfied the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StartKind {
    Created,
    Resumed,
    AlreadyActive,
    /// The stored cursor was unusable and has been replaced.
    Replaced,
}

#[derive(Debug, Clone, Serialize)]
pub struct CursorStart {
    pub cursor: SessionCursor,
    pub kind: StartKind,
}

#[derive(Debug, Clone, Serialize)]
pub struct CursorStatus {
    pub cursor: SessionCursor,
    /// Where a load would start: the head for an active cursor, the pin for a paused one.
    pub position: Option<String>,
    pub head: Option<String>,
    pub events_since_pause: usize,
}

/// Raw row, decoded separately so a bad status surfaces as corruption rather than a SQL error.
struct CursorRow {
    id: String,
    user_id: String,
    project_id: String,
    branch: String,
    current_event_id: Option<String>,
    status: String,
    created_at: String,
    last_active_at: String,
}

const CURSOR_COLUMNS: &str =
    "id, user_id, project_id, branch, current_event_id, status, created_at, last_active_at";

fn read_row(row: &rusqlite::Row) -> rusqlite::Result<CursorRow> {
    Ok(CursorRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        project_id: row.get(2)?,
        branch: row.get(3)?,
        current_event_id: row.get(4)?,
        status: row.get(5)?,
        created_at: row.get(6)?,
        last_active_at: row.get(7)?,
    })
}

impl CursorRow {
    fn decode(self) -> Result<SessionCursor> {
        let corrupt = |reason: String| ContinuumError::CursorCorrupted {
            id: self.id.clone(),
            reason,
        };
        let state = self.status.parse::<CursorState>().map_err(corrupt)?;
        let parse = |raw: &str| {
            DateTime::parse_from_rfc3339(raw)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| corrupt(format!("bad timestamp {raw:?}: {e}")))
        };
        let created_at = parse(&self.created_at)?;
        let last_active_at = parse(&self.last_active_at)?;
        Ok(SessionCursor {
            id: self.id,
            user_id: self.user_id,
            project_id: self.project_id,
            branch: self.branch,
            current_event_id: self.current_event_id,
            state,
            created_at,
            last_active_at,
        })
    }
}

pub struct CursorManager {
    db: Arc<Mutex<Connection>>,
    events: Arc<EventStore>,
    signals: Option<mpsc::Sender<SyncSignal>>,
}

impl CursorManager {
    pub fn new(db: Arc<Mutex<Connection>>, events: Arc<EventStore>) -> Self {
        Self {
            db,
            events,
            signals: None,
        }
    }

    /// Request an immediate sync flush when a session pauses.
    pub fn with_signals(mut self, tx: mpsc::Sender<SyncSignal>) -> Self {
        self.signals = Some(tx);
        self
    }

    fn find_row(&self, key: &StreamKey) -> Result<Option<CursorRow>> {
        let conn = lock(&self.db);
        let row = conn
            .query_row(
                &format!(
                    "SELECT {CURSOR_COLUMNS} FROM cursors
                     WHERE user_id = ?1 AND project_id = ?2 AND branch = ?3"
                ),
                params![key.user_id, key.project_id, key.branch],
                read_row,
            )
            .optional()?;
        Ok(row)
    }

    fn get_row(&self, cursor_id: &str) -> Result<CursorRow> {
        let conn = lock(&self.db);
        conn.query_row(
            &format!("SELECT {CURSOR_COLUMNS} FROM cursors WHERE id = ?1"),
            [cursor_id],
            read_row,
        )
        .optional()?
        .ok_or_else(|| ContinuumError::CursorNotFound(cursor_id.to_string()))
    }

    /// Decode a row and check its pinned position still exists in the stream.
    ///
    /// Never called with the state db locked: the event store takes that lock on append.
    fn validate(&self, row: CursorRow) -> Result<SessionCursor> {
        let cursor = row.decode()?;
        if let Some(pos) = &cursor.current_event_id {
            if !self.events.contains(&cursor.stream_key(), pos)? {
                return Err(ContinuumError::CursorCorrupted {
                    id: cursor.id,
                    reason: format!("position {pos} is not in the stream"),
                });
            }
        }
        Ok(cursor)
    }

    /// Fetch and validate a cursor by id.
    pub fn get(&self, cursor_id: &str) -> Result<SessionCursor> {
        let row = self.get_row(cursor_id)?;
        self.validate(row)
    }

    /// Return the stream's cursor, activating it if paused and creating one at
    /// the stream head if none exists (or the stored one is unusable).
    pub fn start_or_resume(&self, key: &StreamKey) -> Result<CursorStart> {
        key.validate()?;
        let existing = self.find_row(key)?;

        let Some(row) = existing else {
            let cursor = self.create(key, None)?;
            info!(cursor_id = %cursor.id, stream = %key, "cursor created");
            return Ok(CursorStart {
                cursor,
                kind: StartKind::Created,
            });
        };

        let stale_id = row.id.clone();
        match self.validate(row) {
            Ok(cursor) if cursor.state == CursorState::Active => {
                let cursor = self.set_state(cursor, CursorState::Active, None)?;
                debug!(cursor_id = %cursor.id, "cursor already active");
                Ok(CursorStart {
                    cursor,
                    kind: StartKind::AlreadyActive,
                })
            }
            Ok(cursor) => {
                let cursor = self.set_state(cursor, CursorState::Active, None)?;
                info!(cursor_id = %cursor.id, position = ?cursor.current_event_id, "cursor resumed");
                Ok(CursorStart {
                    cursor,
                    kind: StartKind::Resumed,
                })
            }
            Err(ContinuumError::CursorCorrupted { id, reason }) => {
                warn!(cursor_id = %id, reason, "replacing unusable cursor with a fresh one at head");
                let cursor = self.create(key, Some(&stale_id))?;
                Ok(CursorStart {
                    cursor,
                    kind: StartKind::Replaced,
                })
            }
            Err(other) => Err(other),
        }
    }

    /// Insert a fresh cursor at head, deleting `replacing` in the same transaction.
    fn create(&self, key: &StreamKey, replacing: Option<&str>) -> Result<SessionCursor> {
        let head = self.events.head(key)?;
        let now = Utc::now();
        let cursor = SessionCursor {
            id: uuid::Uuid::now_v7().to_string(),
            user_id: key.user_id.clone(),
            project_id: key.project_id.clone(),
            branch: key.branch.clone(),
            current_event_id: head,
            state: CursorState::Active,
            created_at: now,
            last_active_at: now,
        };

        let mut conn = lock(&self.db);
        let tx = conn.transaction()?;
        if let Some(old) = replacing {
            tx.execute("DELETE FROM cursors WHERE id = ?1", [old])?;
        }
        let inserted = tx.execute(
            &format!(
                "INSERT OR IGNORE INTO cursors ({CURSOR_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
            ),
            params![
                cursor.id,
                cursor.user_id,
                cursor.project_id,
                cursor.branch,
                cursor.current_event_id,
                cursor.state.as_str(),
                cursor.created_at.to_rfc3339(),
                cursor.last_active_at.to_rfc3339(),
            ],
        )?;
        if inserted == 0 {
            // Lost a race with another start for the same stream: use theirs.
            let row = tx.query_row(
                &format!(
                    "SELECT {CURSOR_COLUMNS} FROM cursors
                     WHERE user_id = ?1 AND project_id = ?2 AND branch = ?3"
                ),
                params![key.user_id, key.project_id, key.branch],
                read_row,
            )?;
            tx.commit()?;
            return row.decode();
        }
        tx.commit()?;
        Ok(cursor)
    }

    fn set_state(
        &self,
        mut cursor: SessionCursor,
        state: CursorState,
        position: Option<Option<String>>,
    ) -> Result<SessionCursor> {
        let now = Utc::now();
        if let Some(position) = position {
            cursor.current_event_id = position;
        }
        cursor.state = state;
        cursor.last_active_at = now;

        let conn = lock(&self.db);
        let updated = conn.execute(
            "UPDATE cursors SET current_event_id = ?1, status = ?2, last_active_at = ?3 WHERE id = ?4",
            params![
                cursor.current_event_id,
                state.as_str(),
                now.to_rfc3339(),
                cursor.id
            ],
        )?;
        if updated == 0 {
            return Err(ContinuumError::CursorNotFound(cursor.id));
        }
        Ok(cursor)
    }

    /// Pin the cursor at the current stream head and mark it paused.
    ///
    /// Also requests an immediate sync flush; the pause does not wait for it.
    pub fn pause(&self, cursor_id: &str) -> Result<SessionCursor> {
        let cursor = self.get(cursor_id)?;
        if let Some(tx) = &self.signals {
            let _ = tx.try_send(SyncSignal::FlushNow);
        }

        let head = self.events.head(&cursor.stream_key())?;
        let cursor = self.set_state(cursor, CursorState::Paused, Some(head))?;
        info!(cursor_id = %cursor.id, position = ?cursor.current_event_id, "cursor paused");
        Ok(cursor)
    }

    /// Where a load through this cursor starts.
    pub fn effective_position(&self, cursor: &SessionCursor) -> Result<Option<String>> {
        match cursor.state {
            CursorState::Active => self.events.head(&cursor.stream_key()),
            CursorState::Paused => Ok(cursor.current_event_id.clone()),
        }
    }

    pub fn status(&self, cursor_id: &str) -> Result<CursorStatus> {
        let cursor = self.get(cursor_id)?;
        let key = cursor.stream_key();
        let head = self.events.head(&key)?;
        let events_since_pause = self
            .events
            .count_after(&key, cursor.current_event_id.as_deref())?;
        let position = self.effective_position(&cursor)?;
        Ok(CursorStatus {
            cursor,
            position,
            head,
            events_since_pause,
        })
    }

    /// All cursors for a user. Rows that fail to decode are skipped with a warning.
    pub fn list(&self, user_id: &str) -> Result<Vec<SessionCursor>> {
        let rows = {
            let conn = lock(&self.db);
            let mut stmt = conn.prepare(&format!(
                "SELECT {CURSOR_COLUMNS} FROM cursors WHERE user_id = ?1
                 ORDER BY last_active_at DESC"
            ))?;
            let rows = stmt
                .query_map([user_id], read_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        let mut cursors = Vec::with_capacity(rows.len());
        for row in rows {
            match row.decode() {
                Ok(cursor) => cursors.push(cursor),
                Err(err) => warn!(error = %err, "skipping undecodable cursor"),
            }
        }
        Ok(cursors)
    }
}
