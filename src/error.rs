//! Error types for the continuity engine.
//!
//! Local durability is the correctness boundary: only [`ContinuumError::AppendFailure`],
//! [`ContinuumError::CorruptLog`] and unrecoverable cursor state ever reach a caller as
//! hard failures. Remote-side problems are carried as [`GraphError`] and are expected to
//! be retried or degraded around.

use thiserror::Error;

use crate::graph::GraphError;

/// Main error type for continuum operations.
#[derive(Error, Debug)]
pub enum ContinuumError {
    /// An event was rejected before it reached the log (missing stream key, empty description).
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    /// The local durable write did not complete. Fatal for the append that caused it.
    #[error("append failed: {0}")]
    AppendFailure(#[source] std::io::Error),

    /// A stream log could not be replayed (broken back-link chain, undecodable line).
    #[error("stream log corrupted at {path}: {reason}")]
    CorruptLog { path: String, reason: String },

    /// The requested event id is not part of the stream.
    #[error("event not found in stream: {0}")]
    EventNotFound(String),

    #[error("cursor not found: {0}")]
    CursorNotFound(String),

    /// The stored cursor row no longer describes a valid position.
    #[error("cursor {id} corrupted: {reason}")]
    CursorCorrupted { id: String, reason: String },

    #[error("invalid relationship: {0}")]
    InvalidRelationship(String),

    #[error("knowledge node not found: {0}")]
    NodeNotFound(String),

    /// Remote graph store failure.
    #[error("graph store error: {0}")]
    Graph(#[from] GraphError),

    /// The caller cancelled an in-flight load.
    #[error("operation cancelled")]
    Cancelled,

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A blocking task panicked or was aborted.
    #[error("background task failed: {0}")]
    Task(String),
}

/// Result type alias for continuum operations.
pub type Result<T> = std::result::Result<T, ContinuumError>;

impl From<tokio::task::JoinError> for ContinuumError {
    fn from(err: tokio::task::JoinError) -> Self {
        ContinuumError::Task(err.to_string())
    }
}
