use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct CursorStatusParams {
    #[schemars(description = "Cursor to inspect")]
    pub cursor_id: String,
}
