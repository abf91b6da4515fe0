use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct PauseSessionParams {
    #[schemars(description = "Cursor to pin at the current stream head")]
    pub cursor_id: String,
}
