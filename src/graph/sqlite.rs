//! SQLite-backed graph store over an r2d2 connection pool.
//!
//! Each operation checks out one connection inside `spawn_blocking`, so a slow
//! or locked database never stalls the async runtime.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, params_from_iter, Connection, ErrorCode, OptionalExtension, Row};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use super::{
    rank_candidates, Creator, GraphError, GraphStore, KnowledgeNode, NodeKind, RelationType,
    Relationship, ScoredNode, UpsertOutcome,
};
use crate::db::{self, migrations, GraphPool};
use crate::events::types::{Event, StreamKey};
use crate::similarity::SimilarityScorer;

const NODE_COLUMNS: &str =
    "id, title, content, status, tags, payload, content_hash, created_at, updated_at";
const REL_COLUMNS: &str =
    "id, rel_type, source_id, target_id, context, creator, confidence, created_at";

pub struct SqliteGraphStore {
    pool: GraphPool,
    scorer: Arc<dyn SimilarityScorer>,
    scan_limit: usize,
}

impl From<rusqlite::Error> for GraphError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(e, _) => match e.code {
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked | ErrorCode::CannotOpen => {
                    GraphError::Unavailable(err.to_string())
                }
                ErrorCode::ConstraintViolation => GraphError::Conflict(err.to_string()),
                _ => GraphError::Query(err.to_string()),
            },
            _ => GraphError::Query(err.to_string()),
        }
    }
}

/// Fixed-width RFC 3339 so stored timestamps compare correctly as text.
fn ts(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e)))
}

fn to_json<T: serde::Serialize>(value: &T) -> rusqlite::Result<String> {
    serde_json::to_string(value).map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
}

fn from_json<T: serde::de::DeserializeOwned>(idx: usize, raw: &str) -> rusqlite::Result<T> {
    serde_json::from_str(raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e)))
}

fn row_to_node(row: &Row) -> rusqlite::Result<KnowledgeNode> {
    let tags: String = row.get(4)?;
    let payload: String = row.get(5)?;
    let created_at: String = row.get(7)?;
    let updated_at: String = row.get(8)?;
    Ok(KnowledgeNode {
        id: row.get(0)?,
        title: row.get(1)?,
        content: row.get(2)?,
        status: row.get(3)?,
        tags: from_json(4, &tags)?,
        kind: from_json::<NodeKind>(5, &payload)?,
        content_hash: row.get(6)?,
        created_at: parse_ts(7, &created_at)?,
        updated_at: parse_ts(8, &updated_at)?,
    })
}

fn row_to_relationship(row: &Row) -> rusqlite::Result<Relationship> {
    let rel_type: String = row.get(1)?;
    let creator: String = row.get(5)?;
    let created_at: String = row.get(7)?;
    Ok(Relationship {
        id: row.get(0)?,
        rel_type: RelationType::from(rel_type),
        source_id: row.get(2)?,
        target_id: row.get(3)?,
        context: row.get(4)?,
        creator: creator.parse::<Creator>().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, e.into())
        })?,
        confidence: row.get(6)?,
        created_at: parse_ts(7, &created_at)?,
    })
}

fn placeholders(n: usize) -> String {
    (1..=n).map(|i| format!("?{i}")).collect::<Vec<_>>().join(",")
}

fn load_node(conn: &Connection, id: &str) -> rusqlite::Result<Option<KnowledgeNode>> {
    conn.query_row(
        &format!("SELECT {NODE_COLUMNS} FROM nodes WHERE id = ?1"),
        [id],
        row_to_node,
    )
    .optional()
}

fn insert_relationship(conn: &Connection, rel: &Relationship) -> rusqlite::Result<UpsertOutcome> {
    let changed = conn.execute(
        &format!(
            "INSERT INTO relationships ({REL_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(source_id, target_id, rel_type) DO NOTHING"
        ),
        params![
            rel.id,
            rel.rel_type.as_str(),
            rel.source_id,
            rel.target_id,
            rel.context,
            rel.creator.as_str(),
            rel.confidence,
            ts(&rel.created_at),
        ],
    )?;
    Ok(if changed == 1 {
        UpsertOutcome::Created
    } else {
        UpsertOutcome::Existing
    })
}

impl SqliteGraphStore {
    pub fn new(pool: GraphPool, scorer: Arc<dyn SimilarityScorer>, scan_limit: usize) -> Self {
        Self {
            pool,
            scorer,
            scan_limit,
        }
    }

    /// Open the pool at `path` and record which scorer populated the graph.
    ///
    /// Similarity edges written by one scorer are not comparable with another's;
    /// switching providers is allowed but logged.
    pub fn open(
        path: impl AsRef<Path>,
        pool_size: u32,
        scorer: Arc<dyn SimilarityScorer>,
        scan_limit: usize,
    ) -> anyhow::Result<Self> {
        let pool = db::open_graph_pool(path, pool_size)?;
        {
            let conn = pool.get()?;
            match migrations::get_meta(&conn, "similarity_provider")? {
                Some(stored) if stored != scorer.name() => {
                    tracing::warn!(
                        stored = %stored,
                        configured = %scorer.name(),
                        "similarity provider changed; existing SIMILAR_TO edges were scored differently"
                    );
                }
                _ => {}
            }
            migrations::set_meta(&conn, "similarity_provider", scorer.name())?;
        }
        Ok(Self::new(pool, scorer, scan_limit))
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, GraphError>
    where
        F: FnOnce(&mut Connection) -> Result<T, GraphError> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|e| GraphError::Unavailable(e.to_string()))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| GraphError::Query(format!("graph task failed: {e}")))?
    }
}

#[async_trait]
impl GraphStore for SqliteGraphStore {
    async fn upsert_event(&self, event: &Event) -> Result<UpsertOutcome, GraphError> {
        let event = event.clone();
        self.with_conn(move |conn| {
            let payload = to_json(&event)?;
            let tx = conn.transaction()?;
            let changed = tx.execute(
                "INSERT INTO events (id, previous_id, user_id, project_id, branch, timestamp, category, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(id) DO NOTHING",
                params![
                    event.id,
                    event.previous_id,
                    event.user_id,
                    event.project_id,
                    event.branch,
                    ts(&event.timestamp),
                    event.category.as_str(),
                    payload,
                ],
            )?;
            for node_id in &event.node_refs {
                let mention = Relationship {
                    created_at: event.timestamp,
                    ..Relationship::new(
                        RelationType::Mentions,
                        &event.id,
                        node_id,
                        event.category.as_str(),
                        Creator::Automated,
                        1.0,
                    )
                };
                insert_relationship(&tx, &mention)?;
            }
            tx.commit()?;
            Ok(if changed == 1 {
                UpsertOutcome::Created
            } else {
                UpsertOutcome::Existing
            })
        })
        .await
    }

    async fn ping(&self) -> Result<(), GraphError> {
        self.with_conn(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            Ok(())
        })
        .await
    }

    async fn event_count(&self, stream: &StreamKey) -> Result<usize, GraphError> {
        let stream = stream.clone();
        self.with_conn(move |conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM events WHERE user_id = ?1 AND project_id = ?2 AND branch = ?3",
                params![stream.user_id, stream.project_id, stream.branch],
                |row| row.get(0),
            )?;
            Ok(n as usize)
        })
        .await
    }

    async fn upsert_node(&self, node: &KnowledgeNode) -> Result<UpsertOutcome, GraphError> {
        let node = node.clone();
        self.with_conn(move |conn| {
            let existed: bool = conn
                .prepare("SELECT 1 FROM nodes WHERE id = ?1")?
                .exists([&node.id])?;
            conn.execute(
                "INSERT INTO nodes (id, kind, title, content, status, tags, payload, content_hash, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(id) DO UPDATE SET
                    kind = excluded.kind,
                    title = excluded.title,
                    content = excluded.content,
                    status = excluded.status,
                    tags = excluded.tags,
                    payload = excluded.payload,
                    content_hash = excluded.content_hash,
                    updated_at = excluded.updated_at
                 WHERE excluded.updated_at > nodes.updated_at",
                params![
                    node.id,
                    node.kind.name(),
                    node.title,
                    node.content,
                    node.status,
                    to_json(&node.tags)?,
                    to_json(&node.kind)?,
                    node.content_hash,
                    ts(&node.created_at),
                    ts(&node.updated_at),
                ],
            )?;
            Ok(if existed {
                UpsertOutcome::Existing
            } else {
                UpsertOutcome::Created
            })
        })
        .await
    }

    async fn get_nodes(&self, ids: &[String]) -> Result<Vec<KnowledgeNode>, GraphError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let ids = ids.to_vec();
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {NODE_COLUMNS} FROM nodes WHERE id IN ({})",
                placeholders(ids.len())
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut found: HashMap<String, KnowledgeNode> = stmt
                .query_map(params_from_iter(ids.iter()), row_to_node)?
                .map(|r| r.map(|n| (n.id.clone(), n)))
                .collect::<rusqlite::Result<_>>()?;
            Ok(ids.iter().filter_map(|id| found.remove(id)).collect())
        })
        .await
    }

    async fn similar_nodes(&self, node_id: &str, k: usize) -> Result<Vec<ScoredNode>, GraphError> {
        let id = node_id.to_string();
        let scan_limit = self.scan_limit as i64;
        let (query, candidates) = self
            .with_conn(move |conn| {
                let query = load_node(conn, &id)?.ok_or_else(|| GraphError::NodeNotFound(id.clone()))?;
                let mut stmt = conn.prepare(&format!(
                    "SELECT {NODE_COLUMNS} FROM nodes
                     WHERE id != ?1 AND status = 'active'
                     ORDER BY updated_at DESC
                     LIMIT ?2"
                ))?;
                let candidates = stmt
                    .query_map(params![id, scan_limit], row_to_node)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok((query, candidates))
            })
            .await?;

        rank_candidates(&self.scorer, &query, candidates, k).await
    }

    async fn upsert_relationship(&self, rel: &Relationship) -> Result<UpsertOutcome, GraphError> {
        let rel = rel.clone();
        self.with_conn(move |conn| Ok(insert_relationship(conn, &rel)?))
            .await
    }

    async fn relationships_for(&self, node_ids: &[String]) -> Result<Vec<Relationship>, GraphError> {
        if node_ids.is_empty() {
            return Ok(Vec::new());
        }
        let ids = node_ids.to_vec();
        self.with_conn(move |conn| {
            let list = placeholders(ids.len());
            let sql = format!(
                "SELECT {REL_COLUMNS} FROM relationships
                 WHERE rel_type != 'MENTIONS'
                   AND (source_id IN ({list}) OR target_id IN ({list}))"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rels = stmt
                .query_map(params_from_iter(ids.iter()), row_to_relationship)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rels)
        })
        .await
    }

    async fn outgoing(
        &self,
        source_id: &str,
        rel_type: Option<&RelationType>,
    ) -> Result<Vec<Relationship>, GraphError> {
        let source = source_id.to_string();
        let rel_type = rel_type.map(|t| t.as_str().to_string());
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {REL_COLUMNS} FROM relationships
                 WHERE source_id = ?1 AND (?2 IS NULL OR rel_type = ?2)
                 ORDER BY confidence DESC, created_at DESC"
            ))?;
            let rels = stmt
                .query_map(params![source, rel_type], row_to_relationship)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rels)
        })
        .await
    }

    async fn prune_similarity(&self, source_id: &str, keep: usize) -> Result<usize, GraphError> {
        let source = source_id.to_string();
        self.with_conn(move |conn| {
            let removed = conn.execute(
                "DELETE FROM relationships
                 WHERE rel_type = 'SIMILAR_TO' AND source_id = ?1
                   AND id NOT IN (
                     SELECT id FROM relationships
                     WHERE rel_type = 'SIMILAR_TO' AND source_id = ?1
                     ORDER BY confidence DESC, created_at DESC
                     LIMIT ?2
                   )",
                params![source, keep as i64],
            )?;
            Ok(removed)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::types::{EventCategory, Impact};
    use crate::similarity::LexicalScorer;
    use tempfile::TempDir;

    fn store(tmp: &TempDir) -> SqliteGraphStore {
        SqliteGraphStore::open(tmp.path().join("graph.db"), 2, Arc::new(LexicalScorer::new()), 100)
            .unwrap()
    }

    fn event(id: &str, refs: &[&str]) -> Event {
        Event {
            id: id.into(),
            previous_id: None,
            user_id: "u".into(),
            project_id: "p".into(),
            branch: "main".into(),
            timestamp: Utc::now(),
            category: EventCategory::Decision,
            description: "picked sqlite".into(),
            files: vec![],
            impact: Impact::High,
            tags: vec![],
            shared: false,
            commit: None,
            node_refs: refs.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn ping_succeeds_on_open_store() {
        let tmp = TempDir::new().unwrap();
        store(&tmp).ping().await.unwrap();
    }

    #[tokio::test]
    async fn upsert_event_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);

        let e = event("e1", &["n1"]);
        assert_eq!(store.upsert_event(&e).await.unwrap(), UpsertOutcome::Created);
        assert_eq!(store.upsert_event(&e).await.unwrap(), UpsertOutcome::Existing);
        assert_eq!(store.event_count(&e.stream_key()).await.unwrap(), 1);

        let mentions = store
            .outgoing("e1", Some(&RelationType::Mentions))
            .await
            .unwrap();
        assert_eq!(mentions.len(), 1);
        assert_eq!(mentions[0].target_id, "n1");
    }

    #[tokio::test]
    async fn node_upsert_keeps_newest() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);

        let node = KnowledgeNode::new(NodeKind::Note, "Title", "v1");
        store.upsert_node(&node).await.unwrap();

        let stale = KnowledgeNode {
            content: "stale".into(),
            updated_at: node.updated_at - chrono::Duration::seconds(10),
            ..node.clone()
        };
        assert_eq!(store.upsert_node(&stale).await.unwrap(), UpsertOutcome::Existing);
        let got = store.get_nodes(&[node.id.clone()]).await.unwrap();
        assert_eq!(got[0].content, "v1");

        let fresh = KnowledgeNode {
            content: "v2".into(),
            updated_at: node.updated_at + chrono::Duration::seconds(10),
            ..node.clone()
        };
        store.upsert_node(&fresh).await.unwrap();
        let got = store.get_nodes(&[node.id.clone()]).await.unwrap();
        assert_eq!(got[0].content, "v2");
    }

    #[tokio::test]
    async fn relationship_triple_deduplicates() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);

        let t = RelationType::typed("implements").unwrap();
        let a = Relationship::new(t.clone(), "x", "y", "first", Creator::Human, 1.0);
        let b = Relationship::new(t, "x", "y", "second", Creator::Ai, 0.5);
        assert_eq!(store.upsert_relationship(&a).await.unwrap(), UpsertOutcome::Created);
        assert_eq!(store.upsert_relationship(&b).await.unwrap(), UpsertOutcome::Existing);

        let rels = store.relationships_for(&["y".to_string()]).await.unwrap();
        assert_eq!(rels.len(), 1);
        assert_eq!(rels[0].context, "first");
    }

    #[tokio::test]
    async fn similar_nodes_ranks_and_short_circuits_duplicates() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);

        let query = KnowledgeNode::new(NodeKind::Note, "retry backoff", "exponential retry backoff cap");
        let dup = KnowledgeNode::new(NodeKind::Note, "Retry backoff", "exponential retry backoff cap ");
        let near = KnowledgeNode::new(NodeKind::Note, "retry backoff", "exponential retry");
        let far = KnowledgeNode::new(NodeKind::Note, "css grid", "layout columns");
        for n in [&query, &dup, &near, &far] {
            store.upsert_node(n).await.unwrap();
        }

        let scored = store.similar_nodes(&query.id, 2).await.unwrap();
        assert_eq!(scored.len(), 2);
        assert_eq!(scored[0].id, dup.id);
        assert_eq!(scored[0].score, 1.0);
        assert_eq!(scored[1].id, near.id);

        let missing = store.similar_nodes("nope", 2).await.unwrap_err();
        assert!(matches!(missing, GraphError::NodeNotFound(_)));
    }

    #[tokio::test]
    async fn prune_keeps_strongest_similarity_edges() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);

        for (target, score) in [("a", 0.9), ("b", 0.8), ("c", 0.95)] {
            let rel = Relationship::new(RelationType::SimilarTo, "src", target, "related", Creator::Automated, score);
            store.upsert_relationship(&rel).await.unwrap();
        }
        let typed = Relationship::new(
            RelationType::typed("depends_on").unwrap(),
            "src",
            "d",
            "",
            Creator::Human,
            1.0,
        );
        store.upsert_relationship(&typed).await.unwrap();

        assert_eq!(store.prune_similarity("src", 2).await.unwrap(), 1);
        let left = store
            .outgoing("src", Some(&RelationType::SimilarTo))
            .await
            .unwrap();
        let targets: Vec<&str> = left.iter().map(|r| r.target_id.as_str()).collect();
        assert_eq!(targets, vec!["c", "a"]);
        // typed edges are never pruned
        assert_eq!(store.outgoing("src", None).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn provider_is_recorded_in_meta() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let conn = store.pool.get().unwrap();
        assert_eq!(
            migrations::get_meta(&conn, "similarity_provider").unwrap(),
            Some("lexical".to_string())
        );
    }
}
