//! The replicated graph store.
//!
//! [`GraphStore`] is the seam between the engine and whatever holds the shared
//! knowledge graph. [`sqlite::SqliteGraphStore`] is the production backend;
//! [`memory::InMemoryGraphStore`] backs tests and supports fault injection.
//! Every method may fail with a [`GraphError`]; callers retry or degrade.

pub mod memory;
pub mod sqlite;
pub mod types;

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

use crate::events::types::{Event, StreamKey};
use crate::similarity::SimilarityScorer;

pub use memory::InMemoryGraphStore;
pub use sqlite::SqliteGraphStore;
pub use types::{
    Creator, KnowledgeNode, NodeKind, RelationType, Relationship, ScoredNode, SimilarityBand,
    UpsertOutcome,
};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GraphError {
    /// The store cannot be reached. The whole batch should back off.
    #[error("graph store unavailable: {0}")]
    Unavailable(String),

    /// A uniqueness conflict from a concurrent writer.
    #[error("conflicting write: {0}")]
    Conflict(String),

    #[error("graph operation timed out")]
    Timeout,

    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("graph query failed: {0}")]
    Query(String),

    #[error("similarity scoring failed: {0}")]
    Similarity(String),
}

impl GraphError {
    /// Failures that will affect every item in a batch, not just the current one.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout)
    }
}

#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Idempotently write a replicated event and its `MENTIONS` edges.
    async fn upsert_event(&self, event: &Event) -> Result<UpsertOutcome, GraphError>;

    /// Cheap reachability check.
    async fn ping(&self) -> Result<(), GraphError>;

    /// Number of replicated events for one stream.
    async fn event_count(&self, stream: &StreamKey) -> Result<usize, GraphError>;

    /// Write a node. An existing row is replaced only by a newer `updated_at`.
    async fn upsert_node(&self, node: &KnowledgeNode) -> Result<UpsertOutcome, GraphError>;

    /// Fetch nodes by id, in the order given. Unknown ids are skipped.
    async fn get_nodes(&self, ids: &[String]) -> Result<Vec<KnowledgeNode>, GraphError>;

    /// The `k` nodes most similar to `node_id`, best first.
    async fn similar_nodes(&self, node_id: &str, k: usize) -> Result<Vec<ScoredNode>, GraphError>;

    /// Write an edge unless the `(source, target, type)` triple already exists.
    async fn upsert_relationship(&self, rel: &Relationship) -> Result<UpsertOutcome, GraphError>;

    /// Non-`MENTIONS` edges with either endpoint in `node_ids`.
    async fn relationships_for(&self, node_ids: &[String]) -> Result<Vec<Relationship>, GraphError>;

    /// Edges leaving `source_id`, optionally restricted to one type.
    async fn outgoing(
        &self,
        source_id: &str,
        rel_type: Option<&RelationType>,
    ) -> Result<Vec<Relationship>, GraphError>;

    /// Keep only the `keep` strongest similarity edges leaving `source_id`.
    /// Returns how many were removed.
    async fn prune_similarity(&self, source_id: &str, keep: usize) -> Result<usize, GraphError>;
}

/// Score `candidates` against `query` and keep the best `k`.
///
/// Nodes sharing the query's content hash score 1.0 without calling the scorer.
pub(crate) async fn rank_candidates(
    scorer: &Arc<dyn SimilarityScorer>,
    query: &KnowledgeNode,
    candidates: Vec<KnowledgeNode>,
    k: usize,
) -> Result<Vec<ScoredNode>, GraphError> {
    if k == 0 || candidates.is_empty() {
        return Ok(Vec::new());
    }

    let (exact, rest): (Vec<_>, Vec<_>) = candidates
        .into_iter()
        .partition(|c| c.content_hash == query.content_hash);

    let texts: Vec<String> = rest.iter().map(KnowledgeNode::similarity_text).collect();
    let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
    let scores = scorer
        .score_many(&query.similarity_text(), &refs)
        .await
        .map_err(|e| GraphError::Similarity(e.to_string()))?;

    let mut scored: Vec<(ScoredNode, chrono::DateTime<chrono::Utc>)> = exact
        .into_iter()
        .map(|n| (ScoredNode { id: n.id, score: 1.0 }, n.updated_at))
        .chain(rest.into_iter().zip(scores).map(|(n, s)| {
            (
                ScoredNode {
                    id: n.id,
                    score: s.clamp(0.0, 1.0),
                },
                n.updated_at,
            )
        }))
        .collect();

    scored.sort_by(|a, b| {
        b.0.score
            .partial_cmp(&a.0.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.1.cmp(&a.1))
    });
    scored.truncate(k);
    Ok(scored.into_iter().map(|(s, _)| s).collect())
}
