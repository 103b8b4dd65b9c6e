use crate::{
    ControlError, ControlResult, EnvironmentKind, EnvironmentRecord, Project, Run, RunStatus,
    RunType, Services, derive_namespace, event_types, now_rfc3339,
};
use gyre_llm::ModelConfig;
use gyre_store::AttractorDefRecord;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Clone, Debug)]
pub struct CreateRunRequest {
    pub project_id: String,
    pub attractor_def_id: String,
    pub run_type: RunType,
    pub source_branch: String,
    pub target_branch: String,
    pub environment_id: Option<String>,
    pub spec_bundle_id: Option<String>,
    pub force: bool,
    /// Issue this run addresses (`owner/repo#N` or `#N`); titles the pull
    /// request and lands in the commit note.
    pub linked_issue_ref: Option<String>,
    /// Set by self-iteration: the planning run whose bundle feeds this run.
    pub source_planning_run_id: Option<String>,
}

/// Owns every run state transition: create, cancel, and the terminal edges
/// workers request through it.
pub struct LifecycleController {
    services: Arc<Services>,
}

impl LifecycleController {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    pub async fn create_project(
        &self,
        name: &str,
        repo_full_name: Option<&str>,
        default_branch: &str,
    ) -> ControlResult<Project> {
        let project = Project {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            namespace: derive_namespace(name)?,
            default_branch: default_branch.to_string(),
            repo_full_name: repo_full_name.map(ToOwned::to_owned),
            default_environment_id: None,
            installation_ref: None,
        };
        self.services.store.insert_project(project).await
    }

    pub async fn register_environment(
        &self,
        name: &str,
        runner_image_ref: &str,
    ) -> ControlResult<EnvironmentRecord> {
        self.services
            .store
            .insert_environment(EnvironmentRecord {
                id: Uuid::new_v4().to_string(),
                name: name.to_string(),
                kind: EnvironmentKind::ContainerJob,
                runner_image_ref: runner_image_ref.to_string(),
                service_account: self.services.config.default_service_account.clone(),
                resource_requests: None,
                resource_limits: None,
                active: true,
            })
            .await
    }

    /// Store attractor content for a project and stamp the definition with
    /// its run defaults and model configuration.
    pub async fn upsert_attractor_def(
        &self,
        project_id: &str,
        name: &str,
        content: &str,
        default_run_type: RunType,
        model_config: &ModelConfig,
    ) -> ControlResult<AttractorDefRecord> {
        let outcome = self
            .services
            .attractors
            .put_project(project_id, name, content, None)
            .await?;
        let registry = self.services.attractors.registry();
        let mut def = registry.get_def(&outcome.parent_id).await?;
        def.default_run_type = default_run_type.as_str().to_string();
        def.model_config = serde_json::to_value(model_config)
            .map_err(|error| ControlError::Internal(error.to_string()))?;
        def.active = true;
        Ok(registry.upsert_def(def).await?)
    }

    pub async fn get_run(&self, run_id: &str) -> ControlResult<Run> {
        self.services.store.get_run(run_id).await
    }

    /// Create-run: all preconditions checked before any side effect; side
    /// effects ordered pin -> environment -> lock -> insert -> event ->
    /// enqueue.
    pub async fn create_run(&self, request: CreateRunRequest) -> ControlResult<Run> {
        let services = &self.services;
        let project = services.store.get_project(&request.project_id).await?;
        let registry = services.attractors.registry();
        let def = registry.get_def(&request.attractor_def_id).await?;
        if def.project_id != project.id {
            return Err(ControlError::Precondition(format!(
                "attractor '{}' does not belong to project '{}'",
                def.name, project.id
            )));
        }
        if !def.active {
            return Err(ControlError::Precondition(format!(
                "attractor '{}' is not active",
                def.name
            )));
        }

        let model_config: ModelConfig = serde_json::from_value(def.model_config.clone())
            .map_err(|_| {
                ControlError::Precondition(format!(
                    "attractor '{}' has no valid model configuration",
                    def.name
                ))
            })?;
        services
            .catalog
            .validate_config(&model_config)
            .map_err(|error| ControlError::Precondition(error.to_string()))?;

        if services
            .secrets
            .provider_secret(&project.id, &model_config.provider)
            .await
            .is_none()
        {
            return Err(ControlError::Precondition(format!(
                "no provider secret available for '{}'",
                model_config.provider
            )));
        }

        // Pin the attractor snapshot; also the content read used by the
        // in-graph implementation check.
        let pin = services.attractors.pin_for_run(&def.id).await?;

        match request.run_type {
            RunType::Planning | RunType::Task => {
                if request.spec_bundle_id.is_some() {
                    return Err(ControlError::Validation(format!(
                        "{} runs must not carry a spec bundle",
                        request.run_type.as_str()
                    )));
                }
            }
            RunType::Implementation => match &request.spec_bundle_id {
                Some(bundle_id) => {
                    let bundle = services.store.get_spec_bundle(bundle_id).await?;
                    if bundle.schema_version != crate::SPEC_BUNDLE_SCHEMA_V1 {
                        return Err(ControlError::Precondition(format!(
                            "spec bundle '{bundle_id}' has unsupported schema '{}'",
                            bundle.schema_version
                        )));
                    }
                }
                None => {
                    let content = services.objects.get(&pin.content_path).await?;
                    let graph = gyre_graph::parse(&String::from_utf8_lossy(&content))
                        .map_err(|error| ControlError::Validation(error.to_string()))?;
                    if !gyre_engine::in_graph_implementation(&graph) {
                        return Err(ControlError::Precondition(
                            "implementation runs require a spec bundle unless the attractor opts into in-graph implementation"
                                .to_string(),
                        ));
                    }
                }
            },
        }

        if request.run_type == RunType::Implementation && !request.force {
            let active = services
                .store
                .active_implementation_runs(&project.id, &request.target_branch)
                .await?;
            if let Some(existing) = active.first() {
                return Err(ControlError::Precondition(format!(
                    "implementation run '{}' already targets branch '{}'",
                    existing.id, request.target_branch
                )));
            }
        }

        let environment = self.resolve_environment(&project, request.environment_id.as_deref()).await?;
        let run_id = Uuid::new_v4().to_string();

        if request.run_type == RunType::Implementation {
            let acquired = services
                .bus
                .acquire_branch_lock(
                    &project.id,
                    &request.target_branch,
                    &run_id,
                    services.config.branch_lock_ttl,
                )
                .await?;
            if let Err(holder) = acquired {
                if request.force {
                    services
                        .bus
                        .release_branch_lock(&project.id, &request.target_branch)
                        .await?;
                    services
                        .bus
                        .acquire_branch_lock(
                            &project.id,
                            &request.target_branch,
                            &run_id,
                            services.config.branch_lock_ttl,
                        )
                        .await?
                        .map_err(|holder| {
                            ControlError::Conflict(format!(
                                "branch lock held by run '{holder}' despite force takeover"
                            ))
                        })?;
                } else {
                    return Err(ControlError::Precondition(format!(
                        "branch lock for '{}' is held by run '{holder}'",
                        request.target_branch
                    )));
                }
            }
        }

        let run = Run {
            id: run_id.clone(),
            project_id: project.id.clone(),
            attractor_def_id: def.id.clone(),
            attractor_content_path: pin.content_path.clone(),
            attractor_content_version: pin.content_version,
            attractor_content_sha256: pin.content_sha256.clone(),
            environment_id: environment.id.clone(),
            environment_snapshot: environment.snapshot(),
            run_type: request.run_type,
            source_branch: request.source_branch.clone(),
            target_branch: request.target_branch.clone(),
            status: RunStatus::Queued,
            spec_bundle_id: request.spec_bundle_id.clone(),
            linked_issue_ref: request.linked_issue_ref.clone(),
            linked_pull_request_ref: None,
            pr_url: None,
            created_at: now_rfc3339(),
            started_at: None,
            finished_at: None,
            error: None,
        };

        let inserted = match services.store.insert_run(run).await {
            Ok(inserted) => inserted,
            Err(error) => {
                if request.run_type == RunType::Implementation {
                    services
                        .bus
                        .release_branch_lock(&project.id, &request.target_branch)
                        .await?;
                }
                return Err(error);
            }
        };

        services
            .events
            .append(
                &inserted.id,
                event_types::RUN_QUEUED,
                json!({
                    "run_type": inserted.run_type,
                    "environment": inserted.environment_snapshot,
                    "model_config": model_config,
                    "attractor": {
                        "content_path": pin.content_path,
                        "content_version": pin.content_version,
                        "content_sha256": pin.content_sha256,
                    },
                    "source_planning_run_id": request.source_planning_run_id,
                    "force": request.force,
                }),
            )
            .await?;
        services.bus.enqueue_run(&inserted.id).await?;
        tracing::info!(run_id = %inserted.id, run_type = %inserted.run_type.as_str(), "run queued");

        Ok(inserted)
    }

    /// Chain a successful planning run into an implementation run pinned to
    /// its spec bundle.
    pub async fn self_iterate(
        &self,
        planning_run_id: &str,
        source_branch: &str,
        target_branch: &str,
        force: bool,
    ) -> ControlResult<Run> {
        let planning = self.services.store.get_run(planning_run_id).await?;
        if planning.run_type != RunType::Planning {
            return Err(ControlError::Precondition(format!(
                "run '{planning_run_id}' is not a planning run"
            )));
        }
        if planning.status != RunStatus::Succeeded {
            return Err(ControlError::Precondition(format!(
                "planning run '{planning_run_id}' has not succeeded"
            )));
        }
        let bundle_id = planning.spec_bundle_id.clone().ok_or_else(|| {
            ControlError::Precondition(format!(
                "planning run '{planning_run_id}' produced no spec bundle"
            ))
        })?;

        self.create_run(CreateRunRequest {
            project_id: planning.project_id.clone(),
            attractor_def_id: planning.attractor_def_id.clone(),
            run_type: RunType::Implementation,
            source_branch: source_branch.to_string(),
            target_branch: target_branch.to_string(),
            environment_id: Some(planning.environment_id.clone()),
            spec_bundle_id: Some(bundle_id),
            force,
            linked_issue_ref: planning.linked_issue_ref.clone(),
            source_planning_run_id: Some(planning_run_id.to_string()),
        })
        .await
    }

    /// Cancel: set the terminal state, publish the TTL-bounded marker that
    /// workers poll cooperatively, log the event, and free the branch lock.
    pub async fn cancel_run(&self, run_id: &str) -> ControlResult<Run> {
        let services = &self.services;
        let run = services.store.get_run(run_id).await?;
        if run.status.is_terminal() {
            return Err(ControlError::Precondition(format!(
                "run '{run_id}' is already terminal"
            )));
        }

        let canceled = services
            .store
            .transition_run(run_id, RunStatus::Canceled, None)
            .await?;
        services
            .bus
            .set_cancel_marker(run_id, services.config.cancel_marker_ttl)
            .await?;
        services
            .events
            .append(run_id, event_types::RUN_CANCELED, json!({}))
            .await?;
        if canceled.run_type == RunType::Implementation {
            services
                .bus
                .release_branch_lock(&canceled.project_id, &canceled.target_branch)
                .await?;
        }
        tracing::info!(run_id = %run_id, "run canceled");
        Ok(canceled)
    }

    /// Environment resolution order: explicit id, project default, then the
    /// auto-provisioned system default.
    async fn resolve_environment(
        &self,
        project: &Project,
        explicit_id: Option<&str>,
    ) -> ControlResult<EnvironmentRecord> {
        let services = &self.services;
        let resolved = if let Some(id) = explicit_id {
            Some(services.store.get_environment(id).await?)
        } else if let Some(id) = project.default_environment_id.as_deref() {
            Some(services.store.get_environment(id).await?)
        } else {
            services
                .store
                .find_environment_by_name(&services.config.default_environment_name)
                .await?
        };

        let environment = match resolved {
            Some(environment) => environment,
            None => {
                services
                    .store
                    .insert_environment(EnvironmentRecord {
                        id: Uuid::new_v4().to_string(),
                        name: services.config.default_environment_name.clone(),
                        kind: EnvironmentKind::ContainerJob,
                        runner_image_ref: services.config.default_runner_image.clone(),
                        service_account: services.config.default_service_account.clone(),
                        resource_requests: None,
                        resource_limits: None,
                        active: true,
                    })
                    .await?
            }
        };

        if !environment.active {
            return Err(ControlError::Precondition(format!(
                "environment '{}' is not active",
                environment.name
            )));
        }
        Ok(environment)
    }
}
