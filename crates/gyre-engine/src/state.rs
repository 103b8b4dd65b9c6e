use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutcomeStatus {
    Succeeded,
    Failed,
    Skipped,
}

impl OutcomeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Skipped => "SKIPPED",
        }
    }
}

/// Last-known outcome per node, kept in engine state for routing and resume.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeOutcomeState {
    pub status: OutcomeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub attempts: u32,
}

/// The complete mutable state of one run's traversal. Serialized verbatim
/// into every checkpoint.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineState {
    pub context: BTreeMap<String, Value>,
    pub node_outputs: BTreeMap<String, String>,
    pub parallel_outputs: BTreeMap<String, BTreeMap<String, String>>,
    pub node_outcomes: BTreeMap<String, NodeOutcomeState>,
    pub node_retry_counts: BTreeMap<String, u32>,
    pub completed_nodes: Vec<String>,
}

impl EngineState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_output(&mut self, node_id: &str, output: Option<String>) {
        if let Some(output) = output {
            self.node_outputs.insert(node_id.to_string(), output);
        }
    }

    pub fn record_outcome(
        &mut self,
        node_id: &str,
        status: OutcomeStatus,
        failure_reason: Option<String>,
        attempts: u32,
    ) {
        self.node_outcomes.insert(
            node_id.to_string(),
            NodeOutcomeState {
                status,
                failure_reason,
                attempts,
            },
        );
        self.node_retry_counts
            .insert(node_id.to_string(), attempts.saturating_sub(1));
        self.completed_nodes.push(node_id.to_string());
    }

    /// Context lookup rendered as a plain string, the form decision
    /// selectors compare against.
    pub fn context_str(&self, key: &str) -> Option<String> {
        self.context.get(key).map(|value| match value {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        })
    }
}
