use crate::EngineState;
use serde::{Deserialize, Serialize};

/// Engine snapshot persisted after every completed step; sufficient to
/// resume the run at `current_node_id` with no replay.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub schema_version: u32,
    pub run_id: String,
    pub step: u64,
    pub current_node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_node_id: Option<String>,
    pub state: EngineState,
}

pub const CHECKPOINT_SCHEMA_VERSION: u32 = 1;

impl Checkpoint {
    pub fn new(
        run_id: impl Into<String>,
        step: u64,
        current_node_id: impl Into<String>,
        next_node_id: Option<String>,
        state: EngineState,
    ) -> Self {
        Self {
            schema_version: CHECKPOINT_SCHEMA_VERSION,
            run_id: run_id.into(),
            step,
            current_node_id: current_node_id.into(),
            next_node_id,
            state,
        }
    }
}
