use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct SuggestRelationshipsParams {
    #[schemars(description = "Node to find similar nodes for")]
    pub node_id: String,
}
