use crate::{
    ArtifactRecord, ControlError, ControlResult, EnvironmentRecord, Project, Run, RunEvent,
    RunNodeOutcomeRow, RunQuestionRecord, RunReviewRecord, RunStatus, RunType, SpecBundleRecord,
    now_rfc3339,
};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Relational collaborator behind the control plane. All mutations are
/// either keyed inserts or guarded conditional updates; the status machine
/// is enforced here so no caller can skip it.
#[async_trait]
pub trait ControlStore: Send + Sync {
    async fn insert_project(&self, project: Project) -> ControlResult<Project>;
    async fn get_project(&self, id: &str) -> ControlResult<Project>;

    async fn insert_environment(&self, environment: EnvironmentRecord)
    -> ControlResult<EnvironmentRecord>;
    async fn get_environment(&self, id: &str) -> ControlResult<EnvironmentRecord>;
    async fn find_environment_by_name(&self, name: &str)
    -> ControlResult<Option<EnvironmentRecord>>;

    async fn insert_run(&self, run: Run) -> ControlResult<Run>;
    async fn get_run(&self, id: &str) -> ControlResult<Run>;
    async fn update_run(&self, run: Run) -> ControlResult<Run>;
    /// Guarded status transition; stamps `started_at`/`finished_at` and the
    /// error message as appropriate.
    async fn transition_run(
        &self,
        run_id: &str,
        to: RunStatus,
        error: Option<String>,
    ) -> ControlResult<Run>;
    async fn active_implementation_runs(
        &self,
        project_id: &str,
        target_branch: &str,
    ) -> ControlResult<Vec<Run>>;

    async fn append_event(&self, event: RunEvent) -> ControlResult<RunEvent>;
    async fn events_for_run(&self, run_id: &str) -> ControlResult<Vec<RunEvent>>;

    async fn upsert_checkpoint(&self, run_id: &str, checkpoint: Value) -> ControlResult<()>;
    async fn get_checkpoint(&self, run_id: &str) -> ControlResult<Option<Value>>;

    async fn insert_outcome(&self, outcome: RunNodeOutcomeRow) -> ControlResult<()>;
    async fn outcomes_for_run(&self, run_id: &str) -> ControlResult<Vec<RunNodeOutcomeRow>>;

    async fn insert_question(&self, question: RunQuestionRecord)
    -> ControlResult<RunQuestionRecord>;
    async fn get_question(&self, id: &str) -> ControlResult<RunQuestionRecord>;
    async fn update_question(&self, question: RunQuestionRecord)
    -> ControlResult<RunQuestionRecord>;
    async fn questions_for_run(&self, run_id: &str) -> ControlResult<Vec<RunQuestionRecord>>;

    async fn insert_artifact(&self, artifact: ArtifactRecord) -> ControlResult<ArtifactRecord>;
    async fn artifacts_for_run(&self, run_id: &str) -> ControlResult<Vec<ArtifactRecord>>;

    async fn insert_spec_bundle(&self, bundle: SpecBundleRecord)
    -> ControlResult<SpecBundleRecord>;
    async fn get_spec_bundle(&self, id: &str) -> ControlResult<SpecBundleRecord>;

    async fn upsert_review(&self, review: RunReviewRecord) -> ControlResult<RunReviewRecord>;
    async fn get_review(&self, run_id: &str) -> ControlResult<Option<RunReviewRecord>>;
}

pub type SharedControlStore = Arc<dyn ControlStore>;

#[derive(Default)]
struct StoreState {
    projects: BTreeMap<String, Project>,
    environments: BTreeMap<String, EnvironmentRecord>,
    runs: BTreeMap<String, Run>,
    events: Vec<RunEvent>,
    checkpoints: BTreeMap<String, Value>,
    outcomes: Vec<RunNodeOutcomeRow>,
    questions: BTreeMap<String, RunQuestionRecord>,
    artifacts: Vec<ArtifactRecord>,
    spec_bundles: BTreeMap<String, SpecBundleRecord>,
    reviews: BTreeMap<String, RunReviewRecord>,
}

#[derive(Clone, Default)]
pub struct MemoryControlStore {
    state: Arc<Mutex<StoreState>>,
}

impl MemoryControlStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> ControlResult<std::sync::MutexGuard<'_, StoreState>> {
        self.state
            .lock()
            .map_err(|_| ControlError::Internal("control store mutex poisoned".to_string()))
    }
}

#[async_trait]
impl ControlStore for MemoryControlStore {
    async fn insert_project(&self, project: Project) -> ControlResult<Project> {
        let mut state = self.lock()?;
        if state
            .projects
            .values()
            .any(|existing| existing.namespace == project.namespace && existing.id != project.id)
        {
            return Err(ControlError::Conflict(format!(
                "namespace '{}' is already taken",
                project.namespace
            )));
        }
        state.projects.insert(project.id.clone(), project.clone());
        Ok(project)
    }

    async fn get_project(&self, id: &str) -> ControlResult<Project> {
        self.lock()?
            .projects
            .get(id)
            .cloned()
            .ok_or_else(|| ControlError::not_found("project", id))
    }

    async fn insert_environment(
        &self,
        environment: EnvironmentRecord,
    ) -> ControlResult<EnvironmentRecord> {
        environment.validate()?;
        let mut state = self.lock()?;
        if state
            .environments
            .values()
            .any(|existing| existing.name == environment.name && existing.id != environment.id)
        {
            return Err(ControlError::Conflict(format!(
                "environment '{}' already exists",
                environment.name
            )));
        }
        state
            .environments
            .insert(environment.id.clone(), environment.clone());
        Ok(environment)
    }

    async fn get_environment(&self, id: &str) -> ControlResult<EnvironmentRecord> {
        self.lock()?
            .environments
            .get(id)
            .cloned()
            .ok_or_else(|| ControlError::not_found("environment", id))
    }

    async fn find_environment_by_name(
        &self,
        name: &str,
    ) -> ControlResult<Option<EnvironmentRecord>> {
        Ok(self
            .lock()?
            .environments
            .values()
            .find(|environment| environment.name == name)
            .cloned())
    }

    async fn insert_run(&self, run: Run) -> ControlResult<Run> {
        let mut state = self.lock()?;
        if run.status != RunStatus::Queued {
            return Err(ControlError::Validation(
                "runs are created in QUEUED".to_string(),
            ));
        }
        if state.runs.contains_key(&run.id) {
            return Err(ControlError::Conflict(format!(
                "run '{}' already exists",
                run.id
            )));
        }
        state.runs.insert(run.id.clone(), run.clone());
        Ok(run)
    }

    async fn get_run(&self, id: &str) -> ControlResult<Run> {
        self.lock()?
            .runs
            .get(id)
            .cloned()
            .ok_or_else(|| ControlError::not_found("run", id))
    }

    async fn update_run(&self, run: Run) -> ControlResult<Run> {
        let mut state = self.lock()?;
        let existing = state
            .runs
            .get(&run.id)
            .ok_or_else(|| ControlError::not_found("run", run.id.clone()))?;
        if existing.status != run.status {
            return Err(ControlError::Conflict(
                "status changes must go through transition_run".to_string(),
            ));
        }
        state.runs.insert(run.id.clone(), run.clone());
        Ok(run)
    }

    async fn transition_run(
        &self,
        run_id: &str,
        to: RunStatus,
        error: Option<String>,
    ) -> ControlResult<Run> {
        let mut state = self.lock()?;
        let run = state
            .runs
            .get_mut(run_id)
            .ok_or_else(|| ControlError::not_found("run", run_id))?;
        if !run.status.can_transition_to(to) {
            return Err(ControlError::Conflict(format!(
                "run '{run_id}' cannot transition {:?} -> {to:?}",
                run.status
            )));
        }
        run.status = to;
        match to {
            RunStatus::Running => run.started_at = Some(now_rfc3339()),
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Canceled => {
                run.finished_at = Some(now_rfc3339());
            }
            RunStatus::Queued => {}
        }
        if let Some(message) = error {
            run.error = Some(message);
        }
        Ok(run.clone())
    }

    async fn active_implementation_runs(
        &self,
        project_id: &str,
        target_branch: &str,
    ) -> ControlResult<Vec<Run>> {
        Ok(self
            .lock()?
            .runs
            .values()
            .filter(|run| {
                run.project_id == project_id
                    && run.target_branch == target_branch
                    && run.run_type == RunType::Implementation
                    && run.status.is_active()
            })
            .cloned()
            .collect())
    }

    async fn append_event(&self, event: RunEvent) -> ControlResult<RunEvent> {
        self.lock()?.events.push(event.clone());
        Ok(event)
    }

    async fn events_for_run(&self, run_id: &str) -> ControlResult<Vec<RunEvent>> {
        Ok(self
            .lock()?
            .events
            .iter()
            .filter(|event| event.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn upsert_checkpoint(&self, run_id: &str, checkpoint: Value) -> ControlResult<()> {
        self.lock()?.checkpoints.insert(run_id.to_string(), checkpoint);
        Ok(())
    }

    async fn get_checkpoint(&self, run_id: &str) -> ControlResult<Option<Value>> {
        Ok(self.lock()?.checkpoints.get(run_id).cloned())
    }

    async fn insert_outcome(&self, outcome: RunNodeOutcomeRow) -> ControlResult<()> {
        self.lock()?.outcomes.push(outcome);
        Ok(())
    }

    async fn outcomes_for_run(&self, run_id: &str) -> ControlResult<Vec<RunNodeOutcomeRow>> {
        Ok(self
            .lock()?
            .outcomes
            .iter()
            .filter(|outcome| outcome.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn insert_question(
        &self,
        question: RunQuestionRecord,
    ) -> ControlResult<RunQuestionRecord> {
        self.lock()?
            .questions
            .insert(question.id.clone(), question.clone());
        Ok(question)
    }

    async fn get_question(&self, id: &str) -> ControlResult<RunQuestionRecord> {
        self.lock()?
            .questions
            .get(id)
            .cloned()
            .ok_or_else(|| ControlError::not_found("run_question", id))
    }

    async fn update_question(
        &self,
        question: RunQuestionRecord,
    ) -> ControlResult<RunQuestionRecord> {
        let mut state = self.lock()?;
        if !state.questions.contains_key(&question.id) {
            return Err(ControlError::not_found("run_question", question.id.clone()));
        }
        state
            .questions
            .insert(question.id.clone(), question.clone());
        Ok(question)
    }

    async fn questions_for_run(&self, run_id: &str) -> ControlResult<Vec<RunQuestionRecord>> {
        Ok(self
            .lock()?
            .questions
            .values()
            .filter(|question| question.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn insert_artifact(&self, artifact: ArtifactRecord) -> ControlResult<ArtifactRecord> {
        let mut state = self.lock()?;
        if state
            .artifacts
            .iter()
            .any(|existing| existing.run_id == artifact.run_id && existing.key == artifact.key)
        {
            return Err(ControlError::Conflict(format!(
                "artifact key '{}' already registered for run '{}'",
                artifact.key, artifact.run_id
            )));
        }
        state.artifacts.push(artifact.clone());
        Ok(artifact)
    }

    async fn artifacts_for_run(&self, run_id: &str) -> ControlResult<Vec<ArtifactRecord>> {
        Ok(self
            .lock()?
            .artifacts
            .iter()
            .filter(|artifact| artifact.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn insert_spec_bundle(
        &self,
        bundle: SpecBundleRecord,
    ) -> ControlResult<SpecBundleRecord> {
        self.lock()?
            .spec_bundles
            .insert(bundle.id.clone(), bundle.clone());
        Ok(bundle)
    }

    async fn get_spec_bundle(&self, id: &str) -> ControlResult<SpecBundleRecord> {
        self.lock()?
            .spec_bundles
            .get(id)
            .cloned()
            .ok_or_else(|| ControlError::not_found("spec_bundle", id))
    }

    async fn upsert_review(&self, review: RunReviewRecord) -> ControlResult<RunReviewRecord> {
        self.lock()?
            .reviews
            .insert(review.run_id.clone(), review.clone());
        Ok(review)
    }

    async fn get_review(&self, run_id: &str) -> ControlResult<Option<RunReviewRecord>> {
        Ok(self.lock()?.reviews.get(run_id).cloned())
    }
}
