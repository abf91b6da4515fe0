use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct CurateNodeParams {
    #[schemars(description = "Node whose similarity edges should be written and pruned")]
    pub node_id: String,
}
