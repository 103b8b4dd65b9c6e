use crate::{
    ControlError, ControlResult, QuestionStatus, RunQuestionRecord, SharedControlStore, now_rfc3339,
};
use async_trait::async_trait;
use gyre_engine::{EngineError, HumanGate, QuestionState, QuestionTicket};
use uuid::Uuid;

/// Human-in-the-loop question service backing the engine's `human` nodes and
/// the answering API.
#[derive(Clone)]
pub struct QuestionService {
    store: SharedControlStore,
}

impl QuestionService {
    pub fn new(store: SharedControlStore) -> Self {
        Self { store }
    }

    /// Answer a pending question. Re-posting the same answer after it was
    /// recorded is a no-op and never reopens the question.
    pub async fn answer(&self, question_id: &str, answer: &str) -> ControlResult<RunQuestionRecord> {
        let mut question = self.store.get_question(question_id).await?;
        match question.status {
            QuestionStatus::Pending => {
                question.status = QuestionStatus::Answered;
                question.answer = Some(answer.to_string());
                question.answered_at = Some(now_rfc3339());
                self.store.update_question(question).await
            }
            QuestionStatus::Answered => {
                if question.answer.as_deref() == Some(answer) {
                    Ok(question)
                } else {
                    Err(ControlError::Conflict(format!(
                        "question '{question_id}' was already answered differently"
                    )))
                }
            }
            QuestionStatus::Timeout => Err(ControlError::Precondition(format!(
                "question '{question_id}' timed out"
            ))),
        }
    }

    pub async fn questions_for_run(&self, run_id: &str) -> ControlResult<Vec<RunQuestionRecord>> {
        self.store.questions_for_run(run_id).await
    }

    async fn find_existing(
        &self,
        run_id: &str,
        node_id: &str,
        prompt: &str,
    ) -> ControlResult<Option<RunQuestionRecord>> {
        let questions = self.store.questions_for_run(run_id).await?;
        // ANSWERED rows win over PENDING ones so a resumed engine
        // short-circuits with the recorded answer.
        let mut pending = None;
        for question in questions {
            if question.node_id != node_id || question.prompt != prompt {
                continue;
            }
            match question.status {
                QuestionStatus::Answered
                    if question.answer.as_deref().is_some_and(|a| !a.is_empty()) =>
                {
                    return Ok(Some(question));
                }
                QuestionStatus::Pending => pending = Some(question),
                _ => {}
            }
        }
        Ok(pending)
    }
}

fn engine_error(error: ControlError) -> EngineError {
    EngineError::Runtime(error.to_string())
}

#[async_trait]
impl HumanGate for QuestionService {
    async fn register(
        &self,
        run_id: &str,
        node_id: &str,
        prompt: &str,
        options: &[String],
    ) -> Result<QuestionTicket, EngineError> {
        if let Some(existing) = self
            .find_existing(run_id, node_id, prompt)
            .await
            .map_err(engine_error)?
        {
            return Ok(QuestionTicket {
                question_id: existing.id,
            });
        }

        let question = RunQuestionRecord {
            id: Uuid::new_v4().to_string(),
            run_id: run_id.to_string(),
            node_id: node_id.to_string(),
            prompt: prompt.to_string(),
            options: options.to_vec(),
            status: QuestionStatus::Pending,
            answer: None,
            created_at: now_rfc3339(),
            answered_at: None,
        };
        let inserted = self
            .store
            .insert_question(question)
            .await
            .map_err(engine_error)?;
        Ok(QuestionTicket {
            question_id: inserted.id,
        })
    }

    async fn poll(&self, ticket: &QuestionTicket) -> Result<QuestionState, EngineError> {
        let question = self
            .store
            .get_question(&ticket.question_id)
            .await
            .map_err(engine_error)?;
        Ok(match question.status {
            QuestionStatus::Pending => QuestionState::Pending,
            QuestionStatus::Answered => {
                QuestionState::Answered(question.answer.unwrap_or_default())
            }
            QuestionStatus::Timeout => QuestionState::TimedOut,
        })
    }

    async fn mark_timed_out(&self, ticket: &QuestionTicket) -> Result<(), EngineError> {
        let mut question = self
            .store
            .get_question(&ticket.question_id)
            .await
            .map_err(engine_error)?;
        if question.status == QuestionStatus::Pending {
            question.status = QuestionStatus::Timeout;
            self.store
                .update_question(question)
                .await
                .map_err(engine_error)?;
        }
        Ok(())
    }
}
