//! Relationship curation.
//!
//! Automated similarity edges are proposed from the top-K most similar nodes,
//! filtered by a quality threshold and a neighborhood floor, and banded by score.
//! Typed edges go through [`RelationshipCurator::create`], which validates them
//! before they reach the graph. All writes are idempotent on
//! `(source, target, type)`: a duplicate is a no-op, never an error.

use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::CurationConfig;
use crate::db::lock;
use crate::error::{ContinuumError, Result};
use crate::graph::{
    Creator, GraphError, GraphStore, RelationType, Relationship, SimilarityBand, UpsertOutcome,
};

/// A caller-requested typed relationship.
#[derive(Debug, Clone)]
pub struct TypedRelationship {
    pub rel_type: String,
    pub source_id: String,
    pub target_id: String,
    pub context: String,
    pub creator: Creator,
    /// Defaults to 1.0.
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CreateOutcome {
    Created { relationship: Relationship },
    AlreadyExists,
}

pub struct RelationshipCurator {
    graph: Arc<dyn GraphStore>,
    config: CurationConfig,
    node_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl RelationshipCurator {
    pub fn new(graph: Arc<dyn GraphStore>, config: CurationConfig) -> Self {
        Self {
            graph,
            config,
            node_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Band for a similarity score, or `None` below the quality threshold.
    pub fn classify(&self, score: f64) -> Option<SimilarityBand> {
        if score >= self.config.near_duplicate {
            Some(SimilarityBand::NearDuplicate)
        } else if score >= self.config.highly_related {
            Some(SimilarityBand::HighlyRelated)
        } else if score >= self.config.quality_threshold {
            Some(SimilarityBand::Related)
        } else {
            None
        }
    }

    /// Similarity edges that curating `node_id` would write. Writes nothing.
    pub async fn suggest(&self, node_id: &str) -> Result<Vec<Relationship>> {
        let similar = self
            .graph
            .similar_nodes(node_id, self.config.top_k)
            .await
            .map_err(|e| match e {
                GraphError::NodeNotFound(id) => ContinuumError::NodeNotFound(id),
                other => ContinuumError::Graph(other),
            })?;

        let survivors: Vec<(String, f64, SimilarityBand)> = similar
            .into_iter()
            .filter_map(|s| self.classify(s.score).map(|band| (s.id, s.score, band)))
            .collect();
        if survivors.is_empty() {
            return Ok(Vec::new());
        }

        let average = survivors.iter().map(|(_, s, _)| s).sum::<f64>() / survivors.len() as f64;
        if average < self.config.neighborhood_floor {
            debug!(
                node_id,
                average,
                floor = self.config.neighborhood_floor,
                "neighborhood below floor; no similarity edges"
            );
            return Ok(Vec::new());
        }

        Ok(survivors
            .into_iter()
            .map(|(target, score, band)| {
                Relationship::new(
                    RelationType::SimilarTo,
                    node_id,
                    target,
                    band.as_str(),
                    Creator::Automated,
                    score,
                )
            })
            .collect())
    }

    /// Write the suggested similarity edges for `node_id` and prune its
    /// similarity edges back to the top K. Returns the edges newly created.
    pub async fn curate(&self, node_id: &str) -> Result<Vec<Relationship>> {
        let node_lock = self.node_lock(node_id);
        let created = {
            let _guard = node_lock.lock().await;
            self.curate_locked(node_id).await
        };
        self.release_lock(node_id, node_lock);
        created
    }

    async fn curate_locked(&self, node_id: &str) -> Result<Vec<Relationship>> {
        let suggestions = self.suggest(node_id).await?;
        let mut created = Vec::new();
        for rel in suggestions {
            match self.upsert_with_retry(&rel).await? {
                UpsertOutcome::Created => created.push(rel),
                UpsertOutcome::Existing => {
                    debug!(source = %rel.source_id, target = %rel.target_id, "similarity edge already present");
                }
            }
        }

        let pruned = self
            .graph
            .prune_similarity(node_id, self.config.top_k)
            .await?;
        if !created.is_empty() || pruned > 0 {
            info!(node_id, created = created.len(), pruned, "curated similarity edges");
        }
        Ok(created)
    }

    /// Validate and write a typed relationship.
    pub async fn create(&self, request: TypedRelationship) -> Result<CreateOutcome> {
        let rel_type = RelationType::typed(&request.rel_type)?;
        if request.source_id == request.target_id {
            return Err(ContinuumError::InvalidRelationship(
                "source and target must differ".into(),
            ));
        }
        let confidence = request.confidence.unwrap_or(1.0);
        if !(0.0..=1.0).contains(&confidence) {
            return Err(ContinuumError::InvalidRelationship(format!(
                "confidence {confidence} outside [0, 1]"
            )));
        }

        let ids = vec![request.source_id.clone(), request.target_id.clone()];
        let found = self.graph.get_nodes(&ids).await?;
        for id in &ids {
            if !found.iter().any(|n| &n.id == id) {
                return Err(ContinuumError::NodeNotFound(id.clone()));
            }
        }

        let rel = Relationship::new(
            rel_type,
            request.source_id,
            request.target_id,
            request.context,
            request.creator,
            confidence,
        );
        match self.upsert_with_retry(&rel).await? {
            UpsertOutcome::Created => {
                info!(rel_type = %rel.rel_type, source = %rel.source_id, target = %rel.target_id, "relationship created");
                Ok(CreateOutcome::Created { relationship: rel })
            }
            UpsertOutcome::Existing => {
                debug!(rel_type = %rel.rel_type, source = %rel.source_id, target = %rel.target_id, "relationship already exists");
                Ok(CreateOutcome::AlreadyExists)
            }
        }
    }

    async fn upsert_with_retry(&self, rel: &Relationship) -> Result<UpsertOutcome> {
        let mut attempt = 0;
        loop {
            match self.graph.upsert_relationship(rel).await {
                Ok(outcome) => return Ok(outcome),
                Err(GraphError::Conflict(msg)) if attempt < self.config.conflict_retries => {
                    attempt += 1;
                    debug!(attempt, error = %msg, "relationship write conflicted; retrying");
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn node_lock(&self, node_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = lock(&self.node_locks);
        Arc::clone(locks.entry(node_id.to_string()).or_default())
    }

    fn release_lock(&self, node_id: &str, held: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = lock(&self.node_locks);
        // Only the map and `held` reference it: nobody else is waiting.
        if Arc::strong_count(&held) == 2 {
            locks.remove(node_id);
        }
    }
}

/// Curate node ids arriving on `rx` until `shutdown` fires or the channel closes.
pub async fn run_worker(
    curator: Arc<RelationshipCurator>,
    mut rx: mpsc::Receiver<String>,
    shutdown: CancellationToken,
) {
    info!("curation worker started");
    loop {
        let first = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = rx.recv() => match next {
                Some(id) => id,
                None => break,
            },
        };

        let mut pending = BTreeSet::from([first]);
        while let Ok(id) = rx.try_recv() {
            pending.insert(id);
        }

        for node_id in pending {
            if shutdown.is_cancelled() {
                break;
            }
            match curator.curate(&node_id).await {
                Ok(_) => {}
                Err(ContinuumError::NodeNotFound(_)) => {
                    debug!(node_id, "referenced node not in graph yet; skipping curation");
                }
                Err(err) => warn!(node_id, error = %err, "curation failed"),
            }
        }
    }
    info!("curation worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{InMemoryGraphStore, KnowledgeNode, NodeKind};
    use crate::similarity::LexicalScorer;

    fn curator() -> (RelationshipCurator, Arc<InMemoryGraphStore>) {
        let graph = Arc::new(InMemoryGraphStore::new(Arc::new(LexicalScorer::new())));
        (
            RelationshipCurator::new(graph.clone(), CurationConfig::default()),
            graph,
        )
    }

    #[test]
    fn bands_follow_thresholds() {
        let (c, _) = curator();
        assert_eq!(c.classify(0.97), Some(SimilarityBand::NearDuplicate));
        assert_eq!(c.classify(0.95), Some(SimilarityBand::NearDuplicate));
        assert_eq!(c.classify(0.90), Some(SimilarityBand::HighlyRelated));
        assert_eq!(c.classify(0.80), Some(SimilarityBand::Related));
        assert_eq!(c.classify(0.75), Some(SimilarityBand::Related));
        assert_eq!(c.classify(0.74), None);
    }

    #[tokio::test]
    async fn create_validates_and_deduplicates() {
        let (c, graph) = curator();
        let a = KnowledgeNode::new(NodeKind::Note, "a", "alpha");
        let b = KnowledgeNode::new(NodeKind::Note, "b", "beta");
        graph.upsert_node(&a).await.unwrap();
        graph.upsert_node(&b).await.unwrap();

        let request = TypedRelationship {
            rel_type: "implements".into(),
            source_id: a.id.clone(),
            target_id: b.id.clone(),
            context: "a implements b".into(),
            creator: Creator::Human,
            confidence: None,
        };

        match c.create(request.clone()).await.unwrap() {
            CreateOutcome::Created { relationship } => {
                assert_eq!(relationship.rel_type.as_str(), "IMPLEMENTS");
                assert_eq!(relationship.confidence, 1.0);
            }
            other => panic!("expected created, got {other:?}"),
        }
        assert!(matches!(
            c.create(request.clone()).await.unwrap(),
            CreateOutcome::AlreadyExists
        ));

        let self_edge = TypedRelationship {
            target_id: a.id.clone(),
            ..request.clone()
        };
        assert!(matches!(
            c.create(self_edge).await,
            Err(ContinuumError::InvalidRelationship(_))
        ));

        let reserved = TypedRelationship {
            rel_type: "similar_to".into(),
            ..request.clone()
        };
        assert!(matches!(
            c.create(reserved).await,
            Err(ContinuumError::InvalidRelationship(_))
        ));

        let bad_confidence = TypedRelationship {
            confidence: Some(1.5),
            ..request.clone()
        };
        assert!(c.create(bad_confidence).await.is_err());

        let dangling = TypedRelationship {
            target_id: "missing".into(),
            ..request
        };
        assert!(matches!(
            c.create(dangling).await,
            Err(ContinuumError::NodeNotFound(_))
        ));
    }

    #[tokio::test]
    async fn suggest_on_missing_node_is_not_found() {
        let (c, _) = curator();
        assert!(matches!(
            c.suggest("nope").await,
            Err(ContinuumError::NodeNotFound(_))
        ));
    }
}
