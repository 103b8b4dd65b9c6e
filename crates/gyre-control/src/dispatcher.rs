use crate::{ControlResult, ExecutionSpec, Services, Worker};
use gyre_llm::ModelConfig;
use std::sync::Arc;

/// Pops run ids off the dispatch queue one at a time; each popped id grants
/// exclusive ownership of the run for the worker's lifetime, so multiple
/// dispatchers are safe.
pub struct Dispatcher {
    services: Arc<Services>,
}

impl Dispatcher {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    /// Dequeue and execute at most one run; returns the run id handled.
    pub async fn poll_once(&self) -> ControlResult<Option<String>> {
        let Some(run_id) = self.services.bus.dequeue_run().await? else {
            return Ok(None);
        };
        tracing::info!(run_id = %run_id, "dispatching run");
        let spec = self.execution_spec(&run_id).await?;
        Worker::new(Arc::clone(&self.services)).execute(spec).await?;
        Ok(Some(run_id))
    }

    /// Drain the queue; test and CLI convenience.
    pub async fn run_until_idle(&self) -> ControlResult<usize> {
        let mut handled = 0;
        while self.poll_once().await?.is_some() {
            handled += 1;
        }
        Ok(handled)
    }

    async fn execution_spec(&self, run_id: &str) -> ControlResult<ExecutionSpec> {
        let run = self.services.store.get_run(run_id).await?;
        let def = self
            .services
            .attractors
            .registry()
            .get_def(&run.attractor_def_id)
            .await?;
        let model_config: ModelConfig = serde_json::from_value(def.model_config.clone())
            .map_err(|error| crate::ControlError::Internal(format!(
                "attractor '{}' lost its model configuration: {error}",
                def.name
            )))?;

        Ok(ExecutionSpec {
            run_id: run.id.clone(),
            project_id: run.project_id.clone(),
            run_type: run.run_type,
            source_branch: run.source_branch.clone(),
            target_branch: run.target_branch.clone(),
            model_config,
            environment: run.environment_snapshot.clone(),
        })
    }
}
