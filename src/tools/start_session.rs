//! MCP `start_session` tool parameter definition.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Parameters for the `start_session` MCP tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct StartSessionParams {
    #[schemars(description = "User identifier")]
    pub user_id: String,

    #[schemars(description = "Project identifier")]
    pub project_id: String,

    #[schemars(description = "Branch name, e.g. 'main' or 'feature/login'")]
    pub branch: String,
}
