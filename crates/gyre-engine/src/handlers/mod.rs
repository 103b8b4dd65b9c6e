use serde_json::Value;
use std::collections::BTreeMap;

pub mod model;
pub mod prompt;
pub mod tool;

pub use model::*;
pub use prompt::*;
pub use tool::*;

/// Successful node evaluation.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HandlerOutcome {
    pub output: Option<String>,
    pub context_updates: BTreeMap<String, Value>,
    /// Explicit successor chosen by the node (decision match, human answer).
    pub chosen_next: Option<String>,
}

impl HandlerOutcome {
    pub fn with_output(output: impl Into<String>) -> Self {
        Self {
            output: Some(output.into()),
            ..Self::default()
        }
    }
}

/// Failed node evaluation; `retriable` feeds the retry policy.
#[derive(Clone, Debug, PartialEq)]
pub struct HandlerFailure {
    pub reason: String,
    pub retriable: bool,
}

impl HandlerFailure {
    pub fn fatal(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            retriable: false,
        }
    }

    pub fn transient(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            retriable: true,
        }
    }
}

/// The two normal ends of a node attempt. Hard engine errors (cancellation,
/// broken graphs) travel as `EngineError` instead.
#[derive(Clone, Debug, PartialEq)]
pub enum Evaluation {
    Success(HandlerOutcome),
    Failure(HandlerFailure),
}
