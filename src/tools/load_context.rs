//! MCP `load_context` tool parameter definition.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Parameters for the `load_context` MCP tool.
///
/// Every field except `cursor_id` falls back to the server's `[context]` config.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct LoadContextParams {
    #[schemars(description = "Session cursor to load from")]
    pub cursor_id: String,

    #[schemars(description = "Maximum number of recent events. Defaults to 50.")]
    pub event_limit: Option<usize>,

    #[schemars(description = "Only include these event categories")]
    pub categories: Option<Vec<String>>,

    #[schemars(description = "Only include events at or after this RFC 3339 timestamp")]
    pub since: Option<String>,

    #[schemars(description = "Relationship hops to expand from referenced nodes. Defaults to 2.")]
    pub depth: Option<usize>,

    #[schemars(description = "Token budget for the bundle. Defaults to 8000.")]
    pub size_budget: Option<usize>,

    #[schemars(description = "IDs of knowledge nodes currently being worked on")]
    pub active_work: Option<Vec<String>>,
}
