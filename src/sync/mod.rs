//! Local-to-graph replication.
//!
//! Appends land in the persisted [`SyncQueue`]; the [`SyncEngine`] drains it
//! into the graph store in batches, on a timer, when the queue crosses a
//! threshold, or when a session pauses.

pub mod engine;
pub mod queue;

pub use engine::{FlushReport, SyncEngine};
pub use queue::{QueuedEvent, SyncQueue};

/// Wake-ups sent to the sync worker. Delivery is best-effort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncSignal {
    /// An event was enqueued; flush if the queue is over threshold.
    Enqueued,
    /// Flush now regardless of queue depth.
    FlushNow,
}
