//! Context continuity for AI-assisted development sessions.
//!
//! Continuum records what happened in a session as an append-only stream of
//! events per `(user, project, branch)`, replicates those events into a shared
//! knowledge graph in the background, and rebuilds a bounded context bundle
//! when a session resumes.
//!
//! | Component | Durable state | Failure mode |
//! |-----------|---------------|--------------|
//! | **Event store** | JSONL log per stream, fsynced per append | Append fails only if the local write fails |
//! | **Sync engine** | SQLite queue in `state.db` | Retries with capped exponential backoff |
//! | **Curator** | Relationships in the graph store | Duplicate edges are no-ops |
//! | **Cursors** | `state.db` | Unusable cursors are replaced at head |
//! | **Context loader** | none | Falls back to local events, marked degraded |
//!
//! # Architecture
//!
//! - **Local first**: every write lands in the local log before anything else
//!   happens; the graph store is never on the append path
//! - **Graph store**: async [`graph::GraphStore`] trait; SQLite over an r2d2 pool
//!   in production, an in-memory store with fault injection for tests
//! - **Similarity**: pluggable [`similarity::SimilarityScorer`]; lexical by
//!   default, remote embeddings optionally
//! - **Transport**: MCP over stdio (primary) or Streamable HTTP
//!
//! # Modules
//!
//! - [`config`]: Configuration loading from TOML files and environment variables
//! - [`db`]: SQLite schema, migrations, and connection helpers
//! - [`events`]: Event model, per-stream logs, append and backward reads
//! - [`sync`]: Persisted sync queue and the replication engine
//! - [`graph`]: Knowledge nodes, relationships, and graph store backends
//! - [`similarity`]: Similarity scorers
//! - [`curator`]: Automated and typed relationship curation
//! - [`cursor`]: Session cursors
//! - [`context`]: Context bundle assembly
//! - [`engine`]: Component wiring and background workers

pub mod config;
pub mod context;
pub mod curator;
pub mod cursor;
pub mod db;
pub mod engine;
pub mod error;
pub mod events;
pub mod graph;
pub mod similarity;
pub mod sync;

pub use engine::Continuum;
pub use error::{ContinuumError, Result};
