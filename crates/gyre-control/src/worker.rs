use crate::{
    ArtifactRegistrar, ControlError, ControlResult, EventLog, ExecutionSpec, Project, Run,
    RunNodeOutcomeRow, RunStatus, RunType, Services, SharedControlStore, event_types,
    load_spec_bundle,
};
use async_trait::async_trait;
use gyre_engine::{
    CancelProbe, Checkpoint, CheckpointSink, Engine, EngineConfig, EngineError, EngineEventKind,
    EngineEventSink, EngineRunResult, EngineStatus, NodeAttemptRecord, OutcomeSink,
    RepositoryContext, collect_task_artifacts, engine_event_channel, final_output,
    in_graph_implementation, select_implementation,
};
use gyre_graph::Graph;
use gyre_scm::{
    GitWorkspace, HostCredential, PatchArtifactHook, PatchPipelineRequest, ScmError,
    extract_unified_diff, run_patch_pipeline,
};
use gyre_store::sha256_hex;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::UnboundedReceiver;

const REPO_TREE_MAX_ENTRIES: usize = 500;
const REPO_SNAPSHOT_MAX_FILES: usize = 20;
const REPO_SNAPSHOT_MAX_FILE_BYTES: u64 = 16 * 1024;

struct BusCancelProbe {
    services: Arc<Services>,
    run_id: String,
}

#[async_trait]
impl CancelProbe for BusCancelProbe {
    async fn is_canceled(&self) -> bool {
        self.services
            .bus
            .cancel_marker_set(&self.run_id)
            .await
            .unwrap_or(false)
    }
}

struct StoreOutcomeSink {
    store: SharedControlStore,
}

#[async_trait]
impl OutcomeSink for StoreOutcomeSink {
    async fn record(&self, record: NodeAttemptRecord) -> Result<(), EngineError> {
        self.store
            .insert_outcome(RunNodeOutcomeRow {
                run_id: record.run_id,
                node_id: record.node_id,
                attempt: record.attempt,
                status: record.status.as_str().to_string(),
                payload: record.payload,
            })
            .await
            .map_err(|error| EngineError::Runtime(error.to_string()))
    }
}

struct StoreCheckpointSink {
    store: SharedControlStore,
    run_id: String,
}

#[async_trait]
impl CheckpointSink for StoreCheckpointSink {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), EngineError> {
        let value = serde_json::to_value(checkpoint)
            .map_err(|error| EngineError::Runtime(error.to_string()))?;
        self.store
            .upsert_checkpoint(&self.run_id, value)
            .await
            .map_err(|error| EngineError::Runtime(error.to_string()))
    }
}

/// Registers `implementation.patch` and the note between staging and commit,
/// in the order the pipeline contract requires.
struct PipelineArtifactHook {
    registrar: Mutex<Option<ArtifactRegistrar>>,
    events: EventLog,
    run_id: String,
}

#[async_trait]
impl PatchArtifactHook for PipelineArtifactHook {
    async fn on_patch_staged(&self, patch: &str, note: &str) -> Result<(), ScmError> {
        let mut registrar = self
            .registrar
            .lock()
            .map_err(|_| ScmError::Host("artifact hook mutex poisoned".to_string()))?
            .take()
            .ok_or_else(|| ScmError::Host("artifact hook used twice".to_string()))?;
        let result = async {
            registrar
                .register("implementation.patch", patch.as_bytes(), Some("text/x-diff"))
                .await?;
            registrar
                .register(
                    "implementation-note.md",
                    note.as_bytes(),
                    Some("text/markdown"),
                )
                .await?;
            self.events
                .append(
                    &self.run_id,
                    event_types::IMPLEMENTATION_PATCH_APPLIED,
                    json!({ "patch_bytes": patch.len() }),
                )
                .await?;
            Ok::<ArtifactRegistrar, ControlError>(registrar)
        }
        .await;

        match result {
            Ok(registrar) => {
                *self
                    .registrar
                    .lock()
                    .map_err(|_| ScmError::Host("artifact hook mutex poisoned".to_string()))? =
                    Some(registrar);
                Ok(())
            }
            Err(error) => Err(ScmError::Host(error.to_string())),
        }
    }
}

/// Executes one dispatched run end to end: clone, resolve pinned content,
/// drive the graph, then finalize per run type.
pub struct Worker {
    services: Arc<Services>,
}

impl Worker {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    /// Run the spec to a terminal state. Execution problems land in the run
    /// row and its event log; only infrastructure failures surface as `Err`.
    pub async fn execute(&self, spec: ExecutionSpec) -> ControlResult<()> {
        let services = &self.services;
        let run = services.store.get_run(&spec.run_id).await?;
        if run.status == RunStatus::Canceled {
            return Ok(());
        }

        match services
            .store
            .transition_run(&run.id, RunStatus::Running, None)
            .await
        {
            Ok(_) => {}
            // Lost the race against a cancel; nothing to execute.
            Err(ControlError::Conflict(_)) => return Ok(()),
            Err(error) => return Err(error),
        }
        services
            .events
            .append(&run.id, event_types::RUN_STARTED, json!({}))
            .await?;
        tracing::info!(run_id = %run.id, "run started");

        match self.execute_inner(&spec).await {
            Ok(()) => Ok(()),
            Err(ControlError::Canceled) => self.ensure_canceled(&spec.run_id).await,
            Err(error) => self.fail_run(&spec.run_id, &error.to_string()).await,
        }
    }

    async fn execute_inner(&self, spec: &ExecutionSpec) -> ControlResult<()> {
        let services = &self.services;
        let run = services.store.get_run(&spec.run_id).await?;
        let project = services.store.get_project(&run.project_id).await?;
        let repo_full_name = project.repo_full_name.clone().ok_or_else(|| {
            ControlError::Precondition(format!(
                "project '{}' has no repository configured",
                project.id
            ))
        })?;

        services
            .events
            .append(
                &run.id,
                event_types::ENVIRONMENT_RESOLVED,
                run.environment_snapshot.clone(),
            )
            .await?;

        let content = services.objects.get(&run.attractor_content_path).await?;
        if sha256_hex(&content) != run.attractor_content_sha256 {
            return Err(ControlError::Execution(format!(
                "attractor content at '{}' does not match the pinned digest",
                run.attractor_content_path
            )));
        }
        services
            .events
            .append(
                &run.id,
                event_types::ATTRACTOR_CONTENT_RESOLVED,
                json!({
                    "content_path": run.attractor_content_path,
                    "content_version": run.attractor_content_version,
                    "content_sha256": run.attractor_content_sha256,
                }),
            )
            .await?;
        let source = String::from_utf8_lossy(&content).to_string();
        let (graph, _diagnostics) = gyre_graph::prepare_or_raise(&source)
            .map_err(|error| ControlError::Validation(error.to_string()))?;

        // Implementation runs load their bundle before the graph starts.
        let bundle = match (&run.run_type, &run.spec_bundle_id) {
            (RunType::Implementation, Some(bundle_id)) => Some(
                load_spec_bundle(&services.store, &services.objects, bundle_id).await?,
            ),
            _ => None,
        };

        let workdir = scratch_dir(&run.id);
        let clone_url = services.config.clone_url(&repo_full_name);
        let workspace = GitWorkspace::clone_branch(&clone_url, &run.source_branch, &workdir)
            .await
            .map_err(|error| ControlError::Execution(error.to_string()))?;
        let result = self
            .drive_run(&run, &project, &repo_full_name, &graph, bundle, &workspace, spec)
            .await;
        let _ = tokio::fs::remove_dir_all(&workdir).await;
        result
    }

    async fn drive_run(
        &self,
        run: &Run,
        project: &Project,
        repo_full_name: &str,
        graph: &Graph,
        bundle: Option<crate::LoadedBundle>,
        workspace: &GitWorkspace,
        spec: &ExecutionSpec,
    ) -> ControlResult<()> {
        let services = &self.services;

        let mut config = EngineConfig::new(run.id.clone(), spec.model_config.clone());
        config.workdir = workspace.root().to_path_buf();
        config.repository = build_repository_context(workspace.root()).await?;
        config.providers = services.providers.clone();
        config.cancel = Arc::new(BusCancelProbe {
            services: Arc::clone(&self.services),
            run_id: run.id.clone(),
        });
        config.outcomes = Arc::new(StoreOutcomeSink {
            store: Arc::clone(&services.store),
        });
        config.checkpoints = Arc::new(StoreCheckpointSink {
            store: Arc::clone(&services.store),
            run_id: run.id.clone(),
        });
        config.human = Arc::new(services.questions.clone());
        config.human_poll_interval = services.config.human_poll_interval;
        config.initial_context.insert(
            "source_branch".to_string(),
            json!(run.source_branch.clone()),
        );
        config.initial_context.insert(
            "target_branch".to_string(),
            json!(run.target_branch.clone()),
        );
        config
            .initial_context
            .insert("run_type".to_string(), json!(run.run_type.as_str()));
        if let Some(bundle) = &bundle {
            config
                .initial_context
                .insert("plan".to_string(), json!(bundle.plan.clone()));
        }

        let (sender, receiver) = engine_event_channel();
        config.events = EngineEventSink::with_sender(sender);
        let forwarder = spawn_event_forwarder(services.events.clone(), run.id.clone(), receiver);

        let resume = match services.store.get_checkpoint(&run.id).await? {
            Some(value) => Some(
                serde_json::from_value::<Checkpoint>(value)
                    .map_err(|error| ControlError::Internal(error.to_string()))?,
            ),
            None => None,
        };
        // Resume only makes sense mid-run; a fresh checkpoint row with no
        // next node would mean the run already finished.
        let resume = resume.filter(|checkpoint| checkpoint.next_node_id.is_some());

        let engine = Engine::new(graph.clone(), config);
        let outcome = engine.run(resume).await;
        drop(engine);
        let _ = forwarder.await;

        let result = match outcome {
            Ok(result) => result,
            Err(EngineError::Canceled) => return Err(ControlError::Canceled),
            Err(error) => return Err(error.into()),
        };

        match result.status {
            EngineStatus::Failed => {
                let reason = result
                    .failure_reason
                    .unwrap_or_else(|| "run failed".to_string());
                self.fail_run(&run.id, &reason).await
            }
            EngineStatus::Succeeded => match run.run_type {
                RunType::Task => self.finalize_task(run, project, graph, &result).await,
                RunType::Planning => self.finalize_planning(run, project, graph, &result).await,
                RunType::Implementation => {
                    self.finalize_implementation(
                        run,
                        project,
                        repo_full_name,
                        graph,
                        &result,
                        workspace,
                    )
                    .await
                }
            },
        }
    }

    async fn finalize_task(
        &self,
        run: &Run,
        project: &Project,
        graph: &Graph,
        result: &EngineRunResult,
    ) -> ControlResult<()> {
        let services = &self.services;
        let mut registrar = ArtifactRegistrar::new(
            Arc::clone(&services.store),
            Arc::clone(&services.objects),
            project.id.clone(),
            run.id.clone(),
        );
        for artifact in collect_task_artifacts(graph, &result.state) {
            registrar
                .register(&artifact.key, artifact.content.as_bytes(), Some("text/markdown"))
                .await?;
        }
        self.complete_run(run, json!({ "artifacts": registrar.keys() }))
            .await
    }

    async fn finalize_planning(
        &self,
        run: &Run,
        project: &Project,
        graph: &Graph,
        result: &EngineRunResult,
    ) -> ControlResult<()> {
        let services = &self.services;
        let Some((_, plan_text)) = final_output(graph, &result.state) else {
            return self
                .fail_run(&run.id, "planning run produced no plan output")
                .await;
        };

        let bundle =
            crate::build_spec_bundle(&services.store, &services.objects, project, run, &plan_text)
                .await?;
        let mut updated = services.store.get_run(&run.id).await?;
        updated.spec_bundle_id = Some(bundle.id.clone());
        services.store.update_run(updated).await?;

        self.complete_run(run, json!({ "spec_bundle_id": bundle.id }))
            .await
    }

    async fn finalize_implementation(
        &self,
        run: &Run,
        project: &Project,
        repo_full_name: &str,
        graph: &Graph,
        result: &EngineRunResult,
        workspace: &GitWorkspace,
    ) -> ControlResult<()> {
        let services = &self.services;

        let (implementation_text, summary_text, patch_node) = if in_graph_implementation(graph) {
            match select_implementation(graph, &result.state) {
                Some(selection) => (
                    selection.patch_text,
                    selection.summary_text,
                    Some(selection.patch_node),
                ),
                None => {
                    services
                        .events
                        .append(&run.id, event_types::IMPLEMENTATION_PATCH_MISSING, json!({}))
                        .await?;
                    return self
                        .fail_run(&run.id, "implementation run produced no patch output")
                        .await;
                }
            }
        } else {
            match final_output(graph, &result.state) {
                Some((node_id, text)) => (text, None, Some(node_id)),
                None => {
                    services
                        .events
                        .append(&run.id, event_types::IMPLEMENTATION_PATCH_MISSING, json!({}))
                        .await?;
                    return self
                        .fail_run(&run.id, "implementation run produced no output")
                        .await;
                }
            }
        };

        match extract_unified_diff(&implementation_text) {
            Some(patch) => {
                services
                    .events
                    .append(
                        &run.id,
                        event_types::IMPLEMENTATION_PATCH_EXTRACTED,
                        json!({ "patch_bytes": patch.len(), "node_id": patch_node }),
                    )
                    .await?;
            }
            None => {
                services
                    .events
                    .append(&run.id, event_types::IMPLEMENTATION_PATCH_MISSING, json!({}))
                    .await?;
                return self
                    .fail_run(&run.id, "implementation text contains no unified diff")
                    .await;
            }
        }

        let credential = match (
            services.config.scm_installation_token.as_deref(),
            services.config.scm_personal_token.as_deref(),
        ) {
            (Some(token), _) => HostCredential::Installation(token.to_string()),
            (None, Some(token)) => HostCredential::Personal(token.to_string()),
            (None, None) => {
                return self
                    .fail_run(&run.id, "no source-control credential configured")
                    .await;
            }
        };

        let registrar = ArtifactRegistrar::new(
            Arc::clone(&services.store),
            Arc::clone(&services.objects),
            project.id.clone(),
            run.id.clone(),
        );
        let hook = PipelineArtifactHook {
            registrar: Mutex::new(Some(registrar)),
            events: services.events.clone(),
            run_id: run.id.clone(),
        };

        let request = PatchPipelineRequest {
            run_id: run.id.clone(),
            repo_full_name: repo_full_name.to_string(),
            default_branch: project.default_branch.clone(),
            target_branch: run.target_branch.clone(),
            implementation_text,
            summary_text,
            linked_issue: run
                .linked_issue_ref
                .as_deref()
                .and_then(linked_issue_number),
            remote: "origin".to_string(),
        };
        let pipeline = run_patch_pipeline(
            workspace,
            services.host.as_ref(),
            &credential,
            &hook,
            &request,
        )
        .await;

        let outcome = match pipeline {
            Ok(outcome) => outcome,
            Err(error) => {
                let reason = error.to_string();
                return self.fail_run(&run.id, &reason).await;
            }
        };

        // Supplemental reviewer artifacts ride along with the patch.
        let maybe_registrar = hook
            .registrar
            .lock()
            .map_err(|_| ControlError::Internal("artifact hook mutex poisoned".to_string()))?
            .take();
        if let Some(mut registrar) = maybe_registrar {
            for artifact in gyre_engine::collect_task_artifacts(graph, &result.state) {
                if artifact.key.starts_with("reviewers/") {
                    registrar
                        .register(&artifact.key, artifact.content.as_bytes(), Some("text/markdown"))
                        .await?;
                }
            }
        }

        let mut updated = services.store.get_run(&run.id).await?;
        updated.pr_url = Some(outcome.pull_request.url.clone());
        updated.linked_pull_request_ref =
            Some(format!("{repo_full_name}#{}", outcome.pull_request.number));
        services.store.update_run(updated).await?;

        self.complete_run(
            run,
            json!({
                "pr_url": outcome.pull_request.url,
                "pr_number": outcome.pull_request.number,
                "commit_sha": outcome.commit_sha,
            }),
        )
        .await
    }

    async fn complete_run(&self, run: &Run, payload: serde_json::Value) -> ControlResult<()> {
        let services = &self.services;
        services
            .events
            .append(&run.id, event_types::RUN_COMPLETED, payload)
            .await?;
        services
            .store
            .transition_run(&run.id, RunStatus::Succeeded, None)
            .await?;
        if run.run_type == RunType::Implementation {
            services
                .bus
                .release_branch_lock(&run.project_id, &run.target_branch)
                .await?;
        }
        tracing::info!(run_id = %run.id, "run completed");
        Ok(())
    }

    async fn fail_run(&self, run_id: &str, reason: &str) -> ControlResult<()> {
        let services = &self.services;
        let run = services.store.get_run(run_id).await?;
        if run.status.is_terminal() {
            return Ok(());
        }
        services
            .store
            .transition_run(run_id, RunStatus::Failed, Some(reason.to_string()))
            .await?;
        services
            .events
            .append(run_id, event_types::RUN_FAILED, json!({ "error": reason }))
            .await?;
        if run.run_type == RunType::Implementation {
            services
                .bus
                .release_branch_lock(&run.project_id, &run.target_branch)
                .await?;
        }
        tracing::warn!(run_id = %run_id, error = %reason, "run failed");
        Ok(())
    }

    async fn ensure_canceled(&self, run_id: &str) -> ControlResult<()> {
        let services = &self.services;
        let run = services.store.get_run(run_id).await?;
        if run.status == RunStatus::Running {
            services
                .store
                .transition_run(run_id, RunStatus::Canceled, None)
                .await?;
            services
                .events
                .append(run_id, event_types::RUN_CANCELED, json!({}))
                .await?;
            if run.run_type == RunType::Implementation {
                services
                    .bus
                    .release_branch_lock(&run.project_id, &run.target_branch)
                    .await?;
            }
        }
        Ok(())
    }
}

fn scratch_dir(run_id: &str) -> PathBuf {
    std::env::temp_dir().join(format!("gyre-run-{run_id}"))
}

/// Issue number from a linked issue ref: `owner/repo#N`, `#N`, or `N`.
fn linked_issue_number(issue_ref: &str) -> Option<u64> {
    let tail = issue_ref
        .rsplit_once('#')
        .map(|(_, tail)| tail)
        .unwrap_or(issue_ref);
    tail.trim().parse::<u64>().ok()
}


fn spawn_event_forwarder(
    events: EventLog,
    run_id: String,
    mut receiver: UnboundedReceiver<gyre_engine::EngineEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = receiver.recv().await {
            let (event_type, payload) = map_engine_event(event.kind);
            if events.append(&run_id, &event_type, payload).await.is_err() {
                return;
            }
        }
    })
}

/// Engine events become run events: lifecycle ones under the `Engine`
/// prefix, node phases as `Node.<id>.<phase>`.
fn map_engine_event(kind: EngineEventKind) -> (String, serde_json::Value) {
    match kind {
        EngineEventKind::Started { run_id, graph_id, resumed } => (
            "EngineStarted".to_string(),
            json!({ "run_id": run_id, "graph_id": graph_id, "resumed": resumed }),
        ),
        EngineEventKind::Completed { final_node } => (
            "EngineCompleted".to_string(),
            json!({ "final_node": final_node }),
        ),
        EngineEventKind::Failed { reason } => {
            ("EngineFailed".to_string(), json!({ "reason": reason }))
        }
        EngineEventKind::CheckpointSaved { node_id, step } => (
            "EngineCheckpointSaved".to_string(),
            json!({ "node_id": node_id, "step": step }),
        ),
        EngineEventKind::NodeRunning { node_id, attempt } => (
            format!("Node.{node_id}.running"),
            json!({ "attempt": attempt }),
        ),
        EngineEventKind::ModelDelta { node_id, text } => {
            (format!("Node.{node_id}.delta"), json!({ "text": text }))
        }
        EngineEventKind::NodeSucceeded { node_id, attempt, output_bytes } => (
            format!("Node.{node_id}.success"),
            json!({ "attempt": attempt, "output_bytes": output_bytes }),
        ),
        EngineEventKind::NodeFailed { node_id, attempt, reason, will_retry } => (
            format!("Node.{node_id}.failed"),
            json!({ "attempt": attempt, "reason": reason, "will_retry": will_retry }),
        ),
        EngineEventKind::NodeRetrying { node_id, attempt, next_attempt, delay_ms } => (
            format!("Node.{node_id}.retrying"),
            json!({ "attempt": attempt, "next_attempt": next_attempt, "delay_ms": delay_ms }),
        ),
        EngineEventKind::ParallelStarted { node_id, branch_count } => (
            format!("Node.{node_id}.parallel"),
            json!({ "branch_count": branch_count }),
        ),
        EngineEventKind::ParallelBranchCompleted { node_id, branch_label, succeeded } => (
            format!("Node.{node_id}.branch"),
            json!({ "branch_label": branch_label, "succeeded": succeeded }),
        ),
        EngineEventKind::HumanQuestionPending { node_id, prompt } => (
            event_types::HUMAN_QUESTION_PENDING.to_string(),
            json!({ "node_id": node_id, "prompt": prompt }),
        ),
        EngineEventKind::HumanQuestionAnswered { node_id, answer } => (
            event_types::HUMAN_QUESTION_ANSWERED.to_string(),
            json!({ "node_id": node_id, "answer": answer }),
        ),
        EngineEventKind::HumanQuestionTimedOut { node_id } => (
            event_types::HUMAN_QUESTION_TIMED_OUT.to_string(),
            json!({ "node_id": node_id }),
        ),
    }
}

/// File listing and bounded content snapshot handed to model prompts.
async fn build_repository_context(root: &Path) -> ControlResult<RepositoryContext> {
    let root = root.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut paths = Vec::new();
        for entry in walkdir::WalkDir::new(&root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| entry.file_name() != ".git")
        {
            let entry = entry.map_err(|error| ControlError::Internal(error.to_string()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            if let Ok(relative) = entry.path().strip_prefix(&root) {
                paths.push((
                    relative.to_string_lossy().replace('\\', "/"),
                    entry.path().to_path_buf(),
                ));
            }
            if paths.len() >= REPO_TREE_MAX_ENTRIES {
                break;
            }
        }

        let tree = paths
            .iter()
            .map(|(relative, _)| relative.as_str())
            .collect::<Vec<_>>()
            .join("\n");

        let mut snapshot = String::new();
        for (relative, path) in paths.iter().take(REPO_SNAPSHOT_MAX_FILES) {
            let Ok(metadata) = std::fs::metadata(path) else {
                continue;
            };
            if metadata.len() > REPO_SNAPSHOT_MAX_FILE_BYTES {
                continue;
            }
            let Ok(content) = std::fs::read_to_string(path) else {
                continue;
            };
            snapshot.push_str(&format!("=== {relative} ===\n{content}\n"));
        }

        Ok(RepositoryContext { tree, snapshot })
    })
    .await
    .map_err(|error| ControlError::Internal(error.to_string()))?
}
