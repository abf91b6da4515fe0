//! MCP `upsert_node` tool parameter definition.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Parameters for the `upsert_node` MCP tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct UpsertNodeParams {
    #[schemars(description = "Existing node ID to update. Omit to create a new node.")]
    pub id: Option<String>,

    #[schemars(
        description = "Node kind: 'decision', 'requirement', 'pattern', 'gotcha', 'component', 'note'"
    )]
    pub kind: String,

    #[schemars(description = "Short title")]
    pub title: String,

    #[schemars(description = "Full content")]
    pub content: String,

    #[schemars(description = "Free-form tags")]
    pub tags: Option<Vec<String>>,

    #[schemars(description = "Lifecycle status. Defaults to 'active'.")]
    pub status: Option<String>,

    /// Kind-specific fields, e.g. `{"rationale": "...", "alternatives": [...]}` for a decision.
    #[schemars(
        description = "Kind-specific fields: decision {rationale, alternatives}, requirement {acceptance_criteria}, pattern {applies_to}, gotcha {workaround}, component {paths}"
    )]
    pub details: Option<serde_json::Value>,
}
