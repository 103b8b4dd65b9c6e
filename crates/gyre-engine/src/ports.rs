use crate::{Checkpoint, EngineError, OutcomeStatus};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Cooperative cancellation, consulted at every step boundary, before every
/// model/tool invocation, and inside human-wait polls.
#[async_trait]
pub trait CancelProbe: Send + Sync {
    async fn is_canceled(&self) -> bool;
}

#[derive(Debug, Default)]
pub struct NeverCanceled;

#[async_trait]
impl CancelProbe for NeverCanceled {
    async fn is_canceled(&self) -> bool {
        false
    }
}

/// One node attempt as recorded by the lifecycle layer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeAttemptRecord {
    pub run_id: String,
    pub node_id: String,
    pub attempt: u32,
    pub status: OutcomeStatus,
    pub payload: Value,
}

#[async_trait]
pub trait OutcomeSink: Send + Sync {
    async fn record(&self, record: NodeAttemptRecord) -> Result<(), EngineError>;
}

#[derive(Debug, Default)]
pub struct NullOutcomeSink;

#[async_trait]
impl OutcomeSink for NullOutcomeSink {
    async fn record(&self, _record: NodeAttemptRecord) -> Result<(), EngineError> {
        Ok(())
    }
}

#[async_trait]
pub trait CheckpointSink: Send + Sync {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), EngineError>;
}

#[derive(Debug, Default)]
pub struct NullCheckpointSink;

#[async_trait]
impl CheckpointSink for NullCheckpointSink {
    async fn save(&self, _checkpoint: &Checkpoint) -> Result<(), EngineError> {
        Ok(())
    }
}

/// Ticket for a registered human question; opaque beyond the id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QuestionTicket {
    pub question_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QuestionState {
    Pending,
    Answered(String),
    TimedOut,
}

/// Human-in-the-loop gate. Registration is idempotent on
/// `(run_id, node_id, prompt)`: an existing PENDING row is reused and an
/// ANSWERED row with the same key short-circuits with its answer.
#[async_trait]
pub trait HumanGate: Send + Sync {
    async fn register(
        &self,
        run_id: &str,
        node_id: &str,
        prompt: &str,
        options: &[String],
    ) -> Result<QuestionTicket, EngineError>;

    async fn poll(&self, ticket: &QuestionTicket) -> Result<QuestionState, EngineError>;

    async fn mark_timed_out(&self, ticket: &QuestionTicket) -> Result<(), EngineError>;
}

/// Selects the first offered option immediately. The default for graphs
/// executed outside the control plane (tests, CLI dry runs).
#[derive(Debug, Default)]
pub struct AutoAnswerGate;

#[async_trait]
impl HumanGate for AutoAnswerGate {
    async fn register(
        &self,
        _run_id: &str,
        _node_id: &str,
        _prompt: &str,
        options: &[String],
    ) -> Result<QuestionTicket, EngineError> {
        let answer = options.first().cloned().unwrap_or_default();
        Ok(QuestionTicket {
            question_id: format!("auto:{answer}"),
        })
    }

    async fn poll(&self, ticket: &QuestionTicket) -> Result<QuestionState, EngineError> {
        let answer = ticket
            .question_id
            .strip_prefix("auto:")
            .unwrap_or_default()
            .to_string();
        Ok(QuestionState::Answered(answer))
    }

    async fn mark_timed_out(&self, _ticket: &QuestionTicket) -> Result<(), EngineError> {
        Ok(())
    }
}

pub type SharedCancelProbe = Arc<dyn CancelProbe>;
pub type SharedOutcomeSink = Arc<dyn OutcomeSink>;
pub type SharedCheckpointSink = Arc<dyn CheckpointSink>;
pub type SharedHumanGate = Arc<dyn HumanGate>;
