#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use continuum::config::ContinuumConfig;
use continuum::events::{EventCategory, NewEvent, StreamKey};
use continuum::graph::{GraphStore, InMemoryGraphStore, KnowledgeNode, NodeKind};
use continuum::similarity::SimilarityScorer;
use continuum::Continuum;
use std::sync::Arc;
use tempfile::TempDir;

/// Scorer with hand-picked scores between titled nodes.
///
/// Nodes are matched by title (the first line of their similarity text). Pairs
/// are symmetric; unknown pairs score 0.
#[derive(Default)]
pub struct FixedScorer {
    pairs: Vec<(String, String, f64)>,
}

impl FixedScorer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, a: &str, b: &str, score: f64) -> Self {
        self.pairs.push((a.to_string(), b.to_string(), score));
        self
    }
}

fn title_of(text: &str) -> &str {
    text.lines().next().unwrap_or("")
}

#[async_trait]
impl SimilarityScorer for FixedScorer {
    fn name(&self) -> &str {
        "fixed"
    }

    async fn score(&self, a: &str, b: &str) -> Result<f64> {
        let (a, b) = (title_of(a), title_of(b));
        Ok(self
            .pairs
            .iter()
            .find(|(x, y, _)| (x == a && y == b) || (x == b && y == a))
            .map(|(_, _, s)| *s)
            .unwrap_or(0.0))
    }
}

/// A temp-dir rooted engine over an in-memory graph store.
pub struct TestEngine {
    pub dir: TempDir,
    pub graph: Arc<InMemoryGraphStore>,
    pub engine: Continuum,
    config: ContinuumConfig,
}

impl TestEngine {
    pub fn new() -> Self {
        Self::with_scorer(FixedScorer::new())
    }

    pub fn with_scorer(scorer: FixedScorer) -> Self {
        Self::configured(scorer, |_| {})
    }

    /// Engine with config tweaks applied on top of the temp-dir defaults.
    pub fn configured(scorer: FixedScorer, tweak: impl FnOnce(&mut ContinuumConfig)) -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = ContinuumConfig::rooted_at(dir.path());
        tweak(&mut config);
        let graph = Arc::new(InMemoryGraphStore::new(Arc::new(scorer)));
        let engine = Continuum::with_graph(config.clone(), graph.clone()).unwrap();
        Self {
            dir,
            graph,
            engine,
            config,
        }
    }

    /// Drop the engine and open a fresh one over the same directory and graph.
    pub fn restart(self) -> Self {
        let TestEngine {
            dir,
            graph,
            engine,
            config,
        } = self;
        drop(engine);
        let engine = Continuum::with_graph(config.clone(), graph.clone()).unwrap();
        Self {
            dir,
            graph,
            engine,
            config,
        }
    }
}

pub fn stream() -> StreamKey {
    StreamKey::new("alice", "continuum", "main")
}

/// Append `n` fix events numbered from 0, returning their ids oldest first.
pub fn append_n(engine: &Continuum, key: &StreamKey, n: usize) -> Vec<String> {
    (0..n)
        .map(|i| {
            engine
                .events
                .append(NewEvent::new(key.clone(), EventCategory::Fix, format!("event {i}")))
                .unwrap()
                .id
        })
        .collect()
}

pub fn note(title: &str, content: &str) -> KnowledgeNode {
    KnowledgeNode::new(NodeKind::Note, title, content)
}

/// Upsert a note straight into the graph and return it.
pub async fn seed_note(graph: &InMemoryGraphStore, title: &str, content: &str) -> KnowledgeNode {
    let node = note(title, content);
    graph.upsert_node(&node).await.unwrap();
    node
}
