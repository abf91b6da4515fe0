//! In-process graph store with fault injection, for tests and embedding.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{
    rank_candidates, Creator, GraphError, GraphStore, KnowledgeNode, RelationType, Relationship,
    ScoredNode, UpsertOutcome,
};
use crate::db::lock;
use crate::events::types::{Event, StreamKey};
use crate::similarity::SimilarityScorer;

#[derive(Default)]
struct MemoryState {
    events: HashMap<String, Event>,
    nodes: HashMap<String, KnowledgeNode>,
    /// Keyed by `(source, target, type)`.
    relationships: BTreeMap<(String, String, String), Relationship>,
}

pub struct InMemoryGraphStore {
    state: Mutex<MemoryState>,
    scorer: Arc<dyn SimilarityScorer>,
    available: AtomicBool,
    failing_event_upserts: AtomicUsize,
    latency_ms: AtomicU64,
    event_upserts: AtomicUsize,
}

impl InMemoryGraphStore {
    pub fn new(scorer: Arc<dyn SimilarityScorer>) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            scorer,
            available: AtomicBool::new(true),
            failing_event_upserts: AtomicUsize::new(0),
            latency_ms: AtomicU64::new(0),
            event_upserts: AtomicUsize::new(0),
        }
    }

    /// Make every operation fail with [`GraphError::Unavailable`] until restored.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Fail the next `n` event upserts.
    pub fn fail_next_event_upserts(&self, n: usize) {
        self.failing_event_upserts.store(n, Ordering::SeqCst);
    }

    /// Delay every operation by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of `upsert_event` calls that reached the store, successful or not.
    pub fn event_upsert_calls(&self) -> usize {
        self.event_upserts.load(Ordering::SeqCst)
    }

    pub fn event_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.state).events.keys().cloned().collect();
        ids.sort();
        ids
    }

    async fn enter(&self) -> Result<(), GraphError> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if !self.available.load(Ordering::SeqCst) {
            return Err(GraphError::Unavailable("in-memory store offline".into()));
        }
        Ok(())
    }
}

fn triple(rel: &Relationship) -> (String, String, String) {
    (
        rel.source_id.clone(),
        rel.target_id.clone(),
        rel.rel_type.as_str().to_string(),
    )
}

#[async_trait]
impl GraphStore for InMemoryGraphStore {
    async fn upsert_event(&self, event: &Event) -> Result<UpsertOutcome, GraphError> {
        self.event_upserts.fetch_add(1, Ordering::SeqCst);
        self.enter().await?;
        let failing = self
            .failing_event_upserts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(GraphError::Unavailable("injected failure".into()));
        }

        let mut state = lock(&self.state);
        if state.events.contains_key(&event.id) {
            return Ok(UpsertOutcome::Existing);
        }
        state.events.insert(event.id.clone(), event.clone());
        for node_id in &event.node_refs {
            let mention = Relationship::new(
                RelationType::Mentions,
                &event.id,
                node_id,
                event.category.as_str(),
                Creator::Automated,
                1.0,
            );
            state
                .relationships
                .entry(triple(&mention))
                .or_insert(mention);
        }
        Ok(UpsertOutcome::Created)
    }

    async fn ping(&self) -> Result<(), GraphError> {
        self.enter().await
    }

    async fn event_count(&self, stream: &StreamKey) -> Result<usize, GraphError> {
        self.enter().await?;
        let state = lock(&self.state);
        Ok(state
            .events
            .values()
            .filter(|e| e.user_id == stream.user_id && e.project_id == stream.project_id && e.branch == stream.branch)
            .count())
    }

    async fn upsert_node(&self, node: &KnowledgeNode) -> Result<UpsertOutcome, GraphError> {
        self.enter().await?;
        let mut state = lock(&self.state);
        match state.nodes.get_mut(&node.id) {
            Some(existing) => {
                if node.updated_at > existing.updated_at {
                    let created_at = existing.created_at;
                    *existing = KnowledgeNode {
                        created_at,
                        ..node.clone()
                    };
                }
                Ok(UpsertOutcome::Existing)
            }
            None => {
                state.nodes.insert(node.id.clone(), node.clone());
                Ok(UpsertOutcome::Created)
            }
        }
    }

    async fn get_nodes(&self, ids: &[String]) -> Result<Vec<KnowledgeNode>, GraphError> {
        self.enter().await?;
        let state = lock(&self.state);
        Ok(ids.iter().filter_map(|id| state.nodes.get(id).cloned()).collect())
    }

    async fn similar_nodes(&self, node_id: &str, k: usize) -> Result<Vec<ScoredNode>, GraphError> {
        self.enter().await?;
        let (query, candidates) = {
            let state = lock(&self.state);
            let query = state
                .nodes
                .get(node_id)
                .cloned()
                .ok_or_else(|| GraphError::NodeNotFound(node_id.to_string()))?;
            let candidates: Vec<KnowledgeNode> = state
                .nodes
                .values()
                .filter(|n| n.id != node_id && n.status == "active")
                .cloned()
                .collect();
            (query, candidates)
        };
        rank_candidates(&self.scorer, &query, candidates, k).await
    }

    async fn upsert_relationship(&self, rel: &Relationship) -> Result<UpsertOutcome, GraphError> {
        self.enter().await?;
        let mut state = lock(&self.state);
        let key = triple(rel);
        if state.relationships.contains_key(&key) {
            return Ok(UpsertOutcome::Existing);
        }
        state.relationships.insert(key, rel.clone());
        Ok(UpsertOutcome::Created)
    }

    async fn relationships_for(&self, node_ids: &[String]) -> Result<Vec<Relationship>, GraphError> {
        self.enter().await?;
        let state = lock(&self.state);
        Ok(state
            .relationships
            .values()
            .filter(|r| r.rel_type != RelationType::Mentions)
            .filter(|r| node_ids.contains(&r.source_id) || node_ids.contains(&r.target_id))
            .cloned()
            .collect())
    }

    async fn outgoing(
        &self,
        source_id: &str,
        rel_type: Option<&RelationType>,
    ) -> Result<Vec<Relationship>, GraphError> {
        self.enter().await?;
        let state = lock(&self.state);
        let mut rels: Vec<Relationship> = state
            .relationships
            .values()
            .filter(|r| r.source_id == source_id)
            .filter(|r| rel_type.map_or(true, |t| &r.rel_type == t))
            .cloned()
            .collect();
        rels.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.created_at.cmp(&a.created_at))
        });
        Ok(rels)
    }

    async fn prune_similarity(&self, source_id: &str, keep: usize) -> Result<usize, GraphError> {
        let similar = self
            .outgoing(source_id, Some(&RelationType::SimilarTo))
            .await?;
        if similar.len() <= keep {
            return Ok(0);
        }
        let mut state = lock(&self.state);
        let mut removed = 0;
        for rel in &similar[keep..] {
            if state.relationships.remove(&triple(rel)).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }
}
