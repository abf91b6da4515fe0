pub mod append_event;
pub mod create_relationship;
pub mod curate_node;
pub mod cursor_status;
pub mod load_context;
pub mod pause_session;
pub mod start_session;
pub mod suggest_relationships;
pub mod upsert_node;

use append_event::AppendEventParams;
use chrono::{DateTime, Utc};
use create_relationship::CreateRelationshipParams;
use curate_node::CurateNodeParams;
use cursor_status::CursorStatusParams;
use load_context::LoadContextParams;
use pause_session::PauseSessionParams;
use rmcp::handler::server::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::{tool, tool_handler, tool_router, ServerHandler};
use serde::Serialize;
use start_session::StartSessionParams;
use std::sync::Arc;
use suggest_relationships::SuggestRelationshipsParams;
use upsert_node::UpsertNodeParams;

use continuum::context::LoadOptions;
use continuum::curator::TypedRelationship;
use continuum::events::{EventCategory, Impact, NewEvent, StreamKey};
use continuum::graph::{Creator, KnowledgeNode, NodeKind};
use continuum::Continuum;

fn to_json<T: Serialize>(value: &T) -> Result<String, String> {
    serde_json::to_string(value).map_err(|e| format!("serialization failed: {e}"))
}

/// The continuum MCP tool handler. Holds the shared engine and exposes every
/// session, context and curation operation via the `#[tool_router]` macro.
#[derive(Clone)]
pub struct ContinuumTools {
    tool_router: ToolRouter<Self>,
    engine: Arc<Continuum>,
}

#[tool_router]
impl ContinuumTools {
    pub fn new(engine: Arc<Continuum>) -> Self {
        Self {
            tool_router: Self::tool_router(),
            engine,
        }
    }

    /// Start a session on a stream, or resume the existing one.
    #[tool(description = "Start or resume a work session for (user, project, branch). Returns a cursor ID used by every other session tool.")]
    async fn start_session(
        &self,
        Parameters(params): Parameters<StartSessionParams>,
    ) -> Result<String, String> {
        let key = StreamKey::new(params.user_id, params.project_id, params.branch);
        tracing::info!(stream = %key, "start_session called");

        let engine = Arc::clone(&self.engine);
        let start = tokio::task::spawn_blocking(move || engine.cursors.start_or_resume(&key))
            .await
            .map_err(|e| format!("session task failed: {e}"))?
            .map_err(|e| format!("start_session failed: {e}"))?;

        to_json(&start)
    }

    /// Record a significant action in the session's stream.
    #[tool(description = "Append an event (fix, feature, decision, insight, git, achievement) to the session's stream. Durable once this returns.")]
    async fn append_event(
        &self,
        Parameters(params): Parameters<AppendEventParams>,
    ) -> Result<String, String> {
        let category: EventCategory = params.category.parse().map_err(|e: String| e)?;
        let impact = match &params.impact {
            Some(i) => i.parse::<Impact>().map_err(|e: String| e)?,
            None => Impact::default(),
        };

        tracing::info!(
            cursor_id = %params.cursor_id,
            category = %category,
            description_len = params.description.len(),
            "append_event called"
        );

        let engine = Arc::clone(&self.engine);
        let event = tokio::task::spawn_blocking(move || {
            let cursor = engine.cursors.get(&params.cursor_id)?;
            let mut new = NewEvent::new(cursor.stream_key(), category, params.description)
                .with_impact(impact)
                .with_files(params.files.unwrap_or_default())
                .with_tags(params.tags.unwrap_or_default())
                .with_node_refs(params.node_refs.unwrap_or_default())
                .shared(params.shared.unwrap_or(false));
            if let Some(commit) = params.commit {
                new = new.with_commit(commit);
            }
            engine.events.append(new)
        })
        .await
        .map_err(|e| format!("append task failed: {e}"))?
        .map_err(|e| format!("append failed: {e}"))?;

        to_json(&event)
    }

    /// Pin the session at its current head.
    #[tool(description = "Pause a session: pins the cursor at the current stream head so the next load resumes exactly there, and triggers a background sync.")]
    async fn pause_session(
        &self,
        Parameters(params): Parameters<PauseSessionParams>,
    ) -> Result<String, String> {
        tracing::info!(cursor_id = %params.cursor_id, "pause_session called");
        let engine = Arc::clone(&self.engine);
        let cursor = tokio::task::spawn_blocking(move || engine.cursors.pause(&params.cursor_id))
            .await
            .map_err(|e| format!("session task failed: {e}"))?
            .map_err(|e| format!("pause_session failed: {e}"))?;

        to_json(&cursor)
    }

    #[tool(description = "Show a cursor's position, the stream head, and how many events were appended since it was last paused.")]
    async fn cursor_status(
        &self,
        Parameters(params): Parameters<CursorStatusParams>,
    ) -> Result<String, String> {
        let engine = Arc::clone(&self.engine);
        let status = tokio::task::spawn_blocking(move || engine.cursors.status(&params.cursor_id))
            .await
            .map_err(|e| format!("session task failed: {e}"))?
            .map_err(|e| format!("cursor_status failed: {e}"))?;

        to_json(&status)
    }

    /// Build a context bundle for resuming work.
    #[tool(description = "Load recent events and the knowledge nodes they reference, expanded through relationships and fitted to a token budget. Marked degraded if the knowledge graph was unreachable.")]
    async fn load_context(
        &self,
        Parameters(params): Parameters<LoadContextParams>,
    ) -> Result<String, String> {
        let categories = params
            .categories
            .unwrap_or_default()
            .iter()
            .map(|c| c.parse::<EventCategory>())
            .collect::<Result<Vec<_>, String>>()?;
        let since = params
            .since
            .as_deref()
            .map(|s| {
                DateTime::parse_from_rfc3339(s)
                    .map(|t| t.with_timezone(&Utc))
                    .map_err(|e| format!("invalid since timestamp: {e}"))
            })
            .transpose()?;

        tracing::info!(cursor_id = %params.cursor_id, "load_context called");

        let options = LoadOptions {
            event_limit: params.event_limit,
            categories,
            since,
            depth: params.depth,
            size_budget: params.size_budget,
            active_work: params.active_work.unwrap_or_default(),
            timeout: None,
        };
        let cancel = self.engine.shutdown_token().child_token();
        let bundle = self
            .engine
            .context
            .load(&params.cursor_id, options, &cancel)
            .await
            .map_err(|e| format!("load_context failed: {e}"))?;

        tracing::info!(
            events = bundle.events.len(),
            nodes = bundle.nodes.len(),
            degraded = bundle.degraded,
            "context loaded"
        );
        to_json(&bundle)
    }

    /// Create or update a knowledge node.
    #[tool(description = "Create or update a knowledge node (decision, requirement, pattern, gotcha, component, note) in the knowledge graph.")]
    async fn upsert_node(
        &self,
        Parameters(params): Parameters<UpsertNodeParams>,
    ) -> Result<String, String> {
        if params.title.trim().is_empty() {
            return Err("title must not be empty".into());
        }

        let mut fields = match params.details {
            Some(serde_json::Value::Object(map)) => map,
            Some(_) => return Err("details must be a JSON object".into()),
            None => serde_json::Map::new(),
        };
        fields.insert("kind".into(), serde_json::Value::String(params.kind));
        let kind: NodeKind = serde_json::from_value(serde_json::Value::Object(fields))
            .map_err(|e| format!("invalid node kind or details: {e}"))?;

        let mut node = KnowledgeNode::new(kind, params.title, params.content)
            .with_tags(params.tags.unwrap_or_default());
        if let Some(id) = params.id {
            node = node.with_id(id);
        }
        if let Some(status) = params.status {
            node.status = status;
        }

        tracing::info!(id = %node.id, kind = node.kind.name(), "upsert_node called");
        let outcome = self
            .engine
            .graph
            .upsert_node(&node)
            .await
            .map_err(|e| format!("upsert_node failed: {e}"))?;

        Ok(serde_json::json!({
            "id": node.id,
            "created": outcome == continuum::graph::UpsertOutcome::Created,
        })
        .to_string())
    }

    #[tool(description = "Preview the SIMILAR_TO relationships curation would create for a node, without writing anything.")]
    async fn suggest_relationships(
        &self,
        Parameters(params): Parameters<SuggestRelationshipsParams>,
    ) -> Result<String, String> {
        let suggestions = self
            .engine
            .curator
            .suggest(&params.node_id)
            .await
            .map_err(|e| format!("suggest_relationships failed: {e}"))?;
        to_json(&suggestions)
    }

    /// Create a typed relationship between two knowledge nodes.
    #[tool(description = "Create a typed relationship between two knowledge nodes (e.g. 'implements', 'depends_on'). Creating an existing relationship is a no-op.")]
    async fn create_relationship(
        &self,
        Parameters(params): Parameters<CreateRelationshipParams>,
    ) -> Result<String, String> {
        let creator = match params.creator.as_deref() {
            Some(c) => c.parse::<Creator>().map_err(|e: String| e)?,
            None => Creator::Ai,
        };
        tracing::info!(
            rel_type = %params.rel_type,
            source = %params.source_id,
            target = %params.target_id,
            "create_relationship called"
        );

        let outcome = self
            .engine
            .curator
            .create(TypedRelationship {
                rel_type: params.rel_type,
                source_id: params.source_id,
                target_id: params.target_id,
                context: params.context.unwrap_or_default(),
                creator,
                confidence: params.confidence,
            })
            .await
            .map_err(|e| format!("create_relationship failed: {e}"))?;
        to_json(&outcome)
    }

    #[tool(description = "Write SIMILAR_TO relationships for a node's strongest neighbours and prune weaker ones beyond the top K.")]
    async fn curate_node(
        &self,
        Parameters(params): Parameters<CurateNodeParams>,
    ) -> Result<String, String> {
        let created = self
            .engine
            .curator
            .curate(&params.node_id)
            .await
            .map_err(|e| format!("curate_node failed: {e}"))?;
        to_json(&serde_json::json!({
            "node_id": params.node_id,
            "created": created,
        }))
    }
}

#[tool_handler]
impl ServerHandler for ContinuumTools {
    fn get_info(&self) -> rmcp::model::ServerInfo {
        rmcp::model::ServerInfo {
            instructions: Some(
                "Continuum keeps context across coding sessions. Call start_session first, \
                 append_event after each significant action, pause_session when stopping, \
                 and load_context when resuming."
                    .into(),
            ),
            capabilities: rmcp::model::ServerCapabilities::builder()
                .enable_tools()
                .build(),
            ..Default::default()
        }
    }
}
