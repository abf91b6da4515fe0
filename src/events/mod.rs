//! Append-only event streams.
//!
//! Each `(user, project, branch)` stream is a back-linked chain of immutable
//! events stored in its own log file. See [`store::EventStore`] for the append
//! and read paths.

pub mod log;
pub mod store;
pub mod types;

pub use store::EventStore;
pub use types::{Event, EventCategory, EventFilter, Impact, NewEvent, StreamKey};
