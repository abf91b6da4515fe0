//! Context loading.
//!
//! A load reads recent events from the local log, expands the knowledge nodes
//! they reference through the graph, and fits the result into a token budget.
//! The local read always succeeds independently of the graph: if expansion
//! fails or exceeds its deadline the bundle carries local events only and is
//! marked degraded.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::ContextConfig;
use crate::cursor::CursorManager;
use crate::error::{ContinuumError, Result};
use crate::events::{Event, EventCategory, EventFilter, EventStore};
use crate::graph::{GraphError, GraphStore, KnowledgeNode};

/// Per-call overrides. Unset fields fall back to configuration.
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub event_limit: Option<usize>,
    pub categories: Vec<EventCategory>,
    pub since: Option<DateTime<Utc>>,
    pub depth: Option<usize>,
    pub size_budget: Option<usize>,
    /// Node ids the caller is working on right now.
    pub active_work: Vec<String>,
    pub timeout: Option<Duration>,
}

/// Why a node is in the bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeOrigin {
    /// Named in a loaded event's `node_refs`.
    Referenced,
    /// Named by the caller as current work.
    ActiveWork,
    /// Reached over a typed relationship.
    Typed,
    /// Reached over a similarity edge.
    Similar,
}

#[derive(Debug, Clone, Serialize)]
pub struct BundleNode {
    pub node: KnowledgeNode,
    pub origin: NodeOrigin,
    /// Hops from the nearest seed.
    pub depth: usize,
    /// Edge confidence for expanded nodes; 1.0 for seeds.
    pub score: f64,
    /// Relationship type the node was reached through.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub via: Option<String>,
}

impl BundleNode {
    fn tier(&self) -> u8 {
        match self.origin {
            NodeOrigin::Similar => 2,
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ContextBundle {
    pub cursor_id: String,
    /// Event the backward read started from.
    pub position: Option<String>,
    /// Newest first.
    pub events: Vec<Event>,
    pub nodes: Vec<BundleNode>,
    pub degraded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degraded_reason: Option<String>,
    /// Items cut to fit the size budget.
    pub dropped: usize,
    pub token_estimate: usize,
}

pub struct ContextLoader {
    events: Arc<EventStore>,
    cursors: Arc<CursorManager>,
    graph: Arc<dyn GraphStore>,
    config: ContextConfig,
}

struct Candidate {
    origin: NodeOrigin,
    depth: usize,
    score: f64,
    via: Option<String>,
}

impl ContextLoader {
    pub fn new(
        events: Arc<EventStore>,
        cursors: Arc<CursorManager>,
        graph: Arc<dyn GraphStore>,
        config: ContextConfig,
    ) -> Self {
        Self {
            events,
            cursors,
            graph,
            config,
        }
    }

    /// Build a context bundle for `cursor_id`.
    ///
    /// Fails only on local problems (unknown or corrupted cursor, unreadable log)
    /// or when `cancel` fires. Graph failures degrade the bundle instead.
    pub async fn load(
        &self,
        cursor_id: &str,
        options: LoadOptions,
        cancel: &CancellationToken,
    ) -> Result<ContextBundle> {
        if cancel.is_cancelled() {
            return Err(ContinuumError::Cancelled);
        }

        let limit = options
            .event_limit
            .unwrap_or(self.config.event_limit)
            .min(self.config.max_event_limit);
        let filter = EventFilter {
            categories: options.categories.clone(),
            since: options.since,
            ..Default::default()
        };

        let cursors = self.cursors.clone();
        let events = self.events.clone();
        let id = cursor_id.to_string();
        let local = tokio::task::spawn_blocking(move || -> Result<(Option<String>, Vec<Event>)> {
            let cursor = cursors.get(&id)?;
            let position = cursors.effective_position(&cursor)?;
            let loaded = match &position {
                Some(from) => events.read_backward(&cursor.stream_key(), Some(from), limit, &filter)?,
                None => Vec::new(),
            };
            Ok((position, loaded))
        });
        let (position, events) = tokio::select! {
            _ = cancel.cancelled() => return Err(ContinuumError::Cancelled),
            joined = local => joined??,
        };

        let mut referenced = Vec::new();
        let mut seen = HashSet::new();
        for event in &events {
            for node_id in &event.node_refs {
                if seen.insert(node_id.clone()) {
                    referenced.push(node_id.clone());
                }
            }
        }

        let depth = options.depth.unwrap_or(self.config.depth);
        let timeout = options.timeout.unwrap_or_else(|| self.config.timeout());
        let expansion = tokio::select! {
            _ = cancel.cancelled() => return Err(ContinuumError::Cancelled),
            res = tokio::time::timeout(timeout, self.expand(&referenced, &options.active_work, depth)) => res,
        };

        let (nodes, degraded_reason) = match expansion {
            Ok(Ok(nodes)) => (nodes, None),
            Ok(Err(err)) => {
                warn!(cursor_id, error = %err, "graph expansion failed; returning local events only");
                (Vec::new(), Some(err.to_string()))
            }
            Err(_) => {
                warn!(cursor_id, timeout_ms = timeout.as_millis() as u64, "graph expansion timed out; returning local events only");
                (Vec::new(), Some(GraphError::Timeout.to_string()))
            }
        };

        let budget = options.size_budget.unwrap_or(self.config.size_budget);
        let bundle = assemble(cursor_id, position, events, nodes, budget, degraded_reason);
        debug!(
            cursor_id,
            events = bundle.events.len(),
            nodes = bundle.nodes.len(),
            dropped = bundle.dropped,
            degraded = bundle.degraded,
            "context loaded"
        );
        Ok(bundle)
    }

    /// Breadth-first expansion from the seed nodes. Typed edges are followed
    /// before similarity edges, strongest first, capped per hop.
    async fn expand(
        &self,
        referenced: &[String],
        active_work: &[String],
        depth: usize,
    ) -> std::result::Result<Vec<BundleNode>, GraphError> {
        let mut order: Vec<String> = Vec::new();
        let mut found: HashMap<String, Candidate> = HashMap::new();

        for (ids, origin) in [
            (referenced, NodeOrigin::Referenced),
            (active_work, NodeOrigin::ActiveWork),
        ] {
            for id in ids {
                if !found.contains_key(id) {
                    order.push(id.clone());
                    found.insert(
                        id.clone(),
                        Candidate {
                            origin,
                            depth: 0,
                            score: 1.0,
                            via: None,
                        },
                    );
                }
            }
        }
        if order.is_empty() {
            // Nothing to expand, but an unreachable graph still degrades the bundle.
            self.graph.ping().await?;
            return Ok(Vec::new());
        }

        let mut frontier = order.clone();
        for hop in 1..=depth {
            if frontier.is_empty() {
                break;
            }
            let mut edges = self.graph.relationships_for(&frontier).await?;
            edges.sort_by(|a, b| {
                a.rel_type
                    .is_similarity()
                    .cmp(&b.rel_type.is_similarity())
                    .then_with(|| {
                        b.confidence
                            .partial_cmp(&a.confidence)
                            .unwrap_or(std::cmp::Ordering::Equal)
                    })
            });

            let on_frontier: HashSet<&String> = frontier.iter().collect();
            let mut next = Vec::new();
            for edge in edges {
                if next.len() >= self.config.max_neighbors_per_hop {
                    break;
                }
                let (parent, other) = if on_frontier.contains(&edge.source_id) {
                    (&edge.source_id, &edge.target_id)
                } else {
                    (&edge.target_id, &edge.source_id)
                };
                if found.contains_key(other) {
                    continue;
                }
                // Anything reached through a similarity hop ranks as similar.
                let through_similar = found
                    .get(parent)
                    .is_some_and(|p| p.origin == NodeOrigin::Similar);
                let origin = if edge.rel_type.is_similarity() || through_similar {
                    NodeOrigin::Similar
                } else {
                    NodeOrigin::Typed
                };
                order.push(other.clone());
                next.push(other.clone());
                found.insert(
                    other.clone(),
                    Candidate {
                        origin,
                        depth: hop,
                        score: edge.confidence,
                        via: Some(edge.rel_type.as_str().to_string()),
                    },
                );
            }
            frontier = next;
        }

        let nodes = self.graph.get_nodes(&order).await?;
        Ok(nodes
            .into_iter()
            .filter_map(|node| {
                let c = found.remove(&node.id)?;
                Some(BundleNode {
                    node,
                    origin: c.origin,
                    depth: c.depth,
                    score: c.score,
                    via: c.via,
                })
            })
            .collect())
    }
}

enum Item {
    Node(BundleNode),
    Event(Event),
}

impl Item {
    fn tokens(&self) -> usize {
        match self {
            Item::Node(n) => n.node.token_estimate(),
            Item::Event(e) => e.token_estimate(),
        }
    }
}

fn by_rank(a: &BundleNode, b: &BundleNode) -> std::cmp::Ordering {
    a.depth
        .cmp(&b.depth)
        .then_with(|| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal))
        .then_with(|| b.node.updated_at.cmp(&a.node.updated_at))
}

/// Keep the longest prefix of the priority order that fits `budget`:
/// seed and typed nodes, then events newest-first, then similarity nodes.
fn assemble(
    cursor_id: &str,
    position: Option<String>,
    events: Vec<Event>,
    nodes: Vec<BundleNode>,
    budget: usize,
    degraded_reason: Option<String>,
) -> ContextBundle {
    let (mut primary, mut similar): (Vec<_>, Vec<_>) = nodes.into_iter().partition(|n| n.tier() == 0);
    primary.sort_by(by_rank);
    similar.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.node.updated_at.cmp(&a.node.updated_at))
    });

    let ordered = primary
        .into_iter()
        .map(Item::Node)
        .chain(events.into_iter().map(Item::Event))
        .chain(similar.into_iter().map(Item::Node));

    let mut kept_events = Vec::new();
    let mut kept_nodes = Vec::new();
    let mut used = 0;
    let mut dropped = 0;
    let mut full = false;
    for item in ordered {
        let cost = item.tokens();
        if full || used + cost > budget {
            full = true;
            dropped += 1;
            continue;
        }
        used += cost;
        match item {
            Item::Node(n) => kept_nodes.push(n),
            Item::Event(e) => kept_events.push(e),
        }
    }

    ContextBundle {
        cursor_id: cursor_id.to_string(),
        position,
        events: kept_events,
        nodes: kept_nodes,
        degraded: degraded_reason.is_some(),
        degraded_reason,
        dropped,
        token_estimate: used,
    }
}
