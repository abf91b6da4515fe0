//! MCP `create_relationship` tool parameter definition.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Parameters for the `create_relationship` MCP tool.
///
/// Creates a directed, typed edge between two knowledge nodes.
/// Idempotent on the (source, target, type) triple.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct CreateRelationshipParams {
    /// Relationship type, normalized to UPPER_SNAKE_CASE (`"implements"` → `IMPLEMENTS`).
    #[schemars(
        description = "Relationship type, e.g. 'implements', 'depends_on', 'supersedes'. SIMILAR_TO and MENTIONS are reserved."
    )]
    pub rel_type: String,

    #[schemars(description = "ID of the source node")]
    pub source_id: String,

    #[schemars(description = "ID of the target node")]
    pub target_id: String,

    #[schemars(description = "Why these nodes are related")]
    pub context: Option<String>,

    #[schemars(description = "Who is asserting this: 'ai' or 'human'. Defaults to 'ai'.")]
    pub creator: Option<String>,

    #[schemars(description = "Confidence 0.0-1.0. Defaults to 1.0.")]
    pub confidence: Option<f64>,
}
