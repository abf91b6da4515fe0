//! SQL DDL for the two continuum databases.
//!
//! `state.db` is process-local: the pending sync queue, per-stream enqueue
//! watermarks and the cursor arena. `graph.db` is the replicated graph store:
//! knowledge nodes, replicated events and relationships. All DDL uses
//! `IF NOT EXISTS` for idempotent initialization.

use rusqlite::Connection;

/// Local state tables.
const LOCAL_SCHEMA_SQL: &str = r#"
-- Events awaiting replication. Removed once the graph store acknowledges them.
CREATE TABLE IF NOT EXISTS sync_queue (
    event_id TEXT PRIMARY KEY,
    stream_key TEXT NOT NULL,
    payload TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    next_retry_at INTEGER NOT NULL,
    enqueued_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sync_queue_due ON sync_queue(next_retry_at, enqueued_at);

-- Last event id handed to the queue for each stream
CREATE TABLE IF NOT EXISTS stream_watermarks (
    stream_key TEXT PRIMARY KEY,
    last_enqueued_id TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- Session cursors, one per (user, project, branch)
CREATE TABLE IF NOT EXISTS cursors (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    project_id TEXT NOT NULL,
    branch TEXT NOT NULL,
    current_event_id TEXT,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    last_active_at TEXT NOT NULL,
    UNIQUE(user_id, project_id, branch)
);

CREATE INDEX IF NOT EXISTS idx_cursors_user ON cursors(user_id);

-- Schema metadata
CREATE TABLE IF NOT EXISTS schema_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// Graph store tables.
const GRAPH_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS nodes (
    id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    title TEXT NOT NULL,
    content TEXT NOT NULL,
    status TEXT NOT NULL,
    tags TEXT NOT NULL,
    payload TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_nodes_kind ON nodes(kind);
CREATE INDEX IF NOT EXISTS idx_nodes_updated ON nodes(updated_at);

-- Replicated events, upserted by id
CREATE TABLE IF NOT EXISTS events (
    id TEXT PRIMARY KEY,
    previous_id TEXT,
    user_id TEXT NOT NULL,
    project_id TEXT NOT NULL,
    branch TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    category TEXT NOT NULL,
    payload TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_events_stream ON events(user_id, project_id, branch, timestamp);

-- Typed, similarity and mention edges
CREATE TABLE IF NOT EXISTS relationships (
    id TEXT PRIMARY KEY,
    rel_type TEXT NOT NULL,
    source_id TEXT NOT NULL,
    target_id TEXT NOT NULL,
    context TEXT NOT NULL,
    creator TEXT NOT NULL CHECK(creator IN ('ai','human','automated')),
    confidence REAL NOT NULL CHECK(confidence >= 0.0 AND confidence <= 1.0),
    created_at TEXT NOT NULL,
    UNIQUE(source_id, target_id, rel_type)
);

CREATE INDEX IF NOT EXISTS idx_relationships_source ON relationships(source_id, rel_type);
CREATE INDEX IF NOT EXISTS idx_relationships_target ON relationships(target_id);

CREATE TABLE IF NOT EXISTS schema_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// Initialize the local state tables. Idempotent (uses IF NOT EXISTS).
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(LOCAL_SCHEMA_SQL)?;

    // Set initial schema version if not already present
    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('schema_version', '1')",
        [],
    )?;

    Ok(())
}

/// Initialize the graph store tables. Idempotent.
pub fn init_graph_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(GRAPH_SCHEMA_SQL)
}
