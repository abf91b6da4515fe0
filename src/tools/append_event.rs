//! MCP `append_event` tool parameter definition.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Parameters for the `append_event` MCP tool.
///
/// The stream is taken from the cursor, so callers never address streams directly.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct AppendEventParams {
    #[schemars(description = "Session cursor returned by start_session")]
    pub cursor_id: String,

    #[schemars(
        description = "Event category: 'fix', 'feature', 'decision', 'insight', 'git', 'achievement'"
    )]
    pub category: String,

    #[schemars(description = "What happened, in one or two sentences")]
    pub description: String,

    #[schemars(description = "Files touched by this change")]
    pub files: Option<Vec<String>>,

    #[schemars(description = "Impact level: 'high', 'medium', 'low'. Defaults to 'medium'.")]
    pub impact: Option<String>,

    #[schemars(description = "Free-form tags")]
    pub tags: Option<Vec<String>>,

    #[schemars(description = "Whether teammates should see this event. Defaults to false.")]
    pub shared: Option<bool>,

    #[schemars(description = "Commit hash, for 'git' events")]
    pub commit: Option<String>,

    #[schemars(description = "IDs of knowledge nodes this event mentions")]
    pub node_refs: Option<Vec<String>>,
}
