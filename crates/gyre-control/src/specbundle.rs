use crate::{
    ArtifactRecord, ControlError, ControlResult, Project, Run, SPEC_BUNDLE_SCHEMA_V1,
    SharedControlStore, SpecBundleRecord, now_rfc3339,
};
use gyre_store::{SharedObjectStore, spec_bundle_path};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ManifestArtifact {
    pub name: String,
    pub path: String,
}

/// `manifest.json` of a spec bundle.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BundleManifest {
    pub schema_version: String,
    pub project_id: String,
    pub source_run_id: String,
    pub repo: String,
    pub source_branch: String,
    pub created_at: String,
    pub artifacts: Vec<ManifestArtifact>,
    #[serde(default)]
    pub checksums: serde_json::Map<String, serde_json::Value>,
}

/// A loaded bundle: the manifest plus the plan text implementation runs
/// feed into their prompts.
#[derive(Clone, Debug, PartialEq)]
pub struct LoadedBundle {
    pub record: SpecBundleRecord,
    pub manifest: BundleManifest,
    pub plan: String,
}

const PLAN_FILE: &str = "plan.md";
const REQUIREMENTS_FILE: &str = "requirements.md";
const TASKS_FILE: &str = "tasks.json";
const ACCEPTANCE_FILE: &str = "acceptance-tests.md";
const MANIFEST_FILE: &str = "manifest.json";

/// Deterministic planning-run output: plan, requirements boilerplate, task
/// seeds, acceptance tests, and the manifest tying them together.
pub async fn build_spec_bundle(
    store: &SharedControlStore,
    objects: &SharedObjectStore,
    project: &Project,
    run: &Run,
    plan_text: &str,
) -> ControlResult<SpecBundleRecord> {
    let repo = project.repo_full_name.clone().unwrap_or_default();
    let requirements = format!(
        "# Requirements\n\nDerived from planning run `{}`.\n\nSee `plan.md` for the full plan; each task in `tasks.json` refines one\nrequirement into an implementable unit.\n",
        run.id
    );
    let tasks = json!([
        {
            "id": "task-1",
            "title": "Implement the plan",
            "source_run_id": run.id,
            "status": "open",
        }
    ]);
    let acceptance = format!(
        "# Acceptance Tests\n\n- [ ] The implementation satisfies the plan produced by run `{}`.\n- [ ] Existing tests keep passing on `{}`.\n",
        run.id, run.source_branch
    );

    let files: Vec<(&str, Vec<u8>)> = vec![
        (PLAN_FILE, plan_text.as_bytes().to_vec()),
        (REQUIREMENTS_FILE, requirements.into_bytes()),
        (
            TASKS_FILE,
            serde_json::to_vec_pretty(&tasks)
                .map_err(|error| ControlError::Internal(error.to_string()))?,
        ),
        (ACCEPTANCE_FILE, acceptance.into_bytes()),
    ];

    let mut manifest_artifacts = Vec::with_capacity(files.len());
    for (name, bytes) in &files {
        let path = spec_bundle_path(&project.id, &run.id, name);
        objects.put(&path, bytes).await?;
        store
            .insert_artifact(ArtifactRecord {
                id: Uuid::new_v4().to_string(),
                run_id: run.id.clone(),
                key: (*name).to_string(),
                path: path.clone(),
                content_type: Some(content_type_for(name)),
                size_bytes: Some(bytes.len() as u64),
            })
            .await?;
        manifest_artifacts.push(ManifestArtifact {
            name: (*name).to_string(),
            path,
        });
    }

    let manifest = BundleManifest {
        schema_version: SPEC_BUNDLE_SCHEMA_V1.to_string(),
        project_id: project.id.clone(),
        source_run_id: run.id.clone(),
        repo,
        source_branch: run.source_branch.clone(),
        created_at: now_rfc3339(),
        artifacts: manifest_artifacts,
        checksums: serde_json::Map::new(),
    };
    let manifest_path = spec_bundle_path(&project.id, &run.id, MANIFEST_FILE);
    let manifest_bytes = serde_json::to_vec_pretty(&manifest)
        .map_err(|error| ControlError::Internal(error.to_string()))?;
    objects.put(&manifest_path, &manifest_bytes).await?;
    store
        .insert_artifact(ArtifactRecord {
            id: Uuid::new_v4().to_string(),
            run_id: run.id.clone(),
            key: MANIFEST_FILE.to_string(),
            path: manifest_path.clone(),
            content_type: Some("application/json".to_string()),
            size_bytes: Some(manifest_bytes.len() as u64),
        })
        .await?;

    store
        .insert_spec_bundle(SpecBundleRecord {
            id: Uuid::new_v4().to_string(),
            run_id: run.id.clone(),
            schema_version: SPEC_BUNDLE_SCHEMA_V1.to_string(),
            manifest_path,
        })
        .await
}

/// Load a bundle for an implementation run; only schema `v1` is accepted.
pub async fn load_spec_bundle(
    store: &SharedControlStore,
    objects: &SharedObjectStore,
    bundle_id: &str,
) -> ControlResult<LoadedBundle> {
    let record = store.get_spec_bundle(bundle_id).await?;
    if record.schema_version != SPEC_BUNDLE_SCHEMA_V1 {
        return Err(ControlError::Precondition(format!(
            "spec bundle '{bundle_id}' has unsupported schema '{}'",
            record.schema_version
        )));
    }

    let manifest_bytes = objects.get(&record.manifest_path).await?;
    let manifest: BundleManifest = serde_json::from_slice(&manifest_bytes)
        .map_err(|error| ControlError::Validation(format!("malformed bundle manifest: {error}")))?;
    if manifest.schema_version != SPEC_BUNDLE_SCHEMA_V1 {
        return Err(ControlError::Precondition(format!(
            "spec bundle manifest declares unsupported schema '{}'",
            manifest.schema_version
        )));
    }

    let plan_artifact = manifest
        .artifacts
        .iter()
        .find(|artifact| artifact.name == PLAN_FILE)
        .ok_or_else(|| {
            ControlError::Validation("bundle manifest lists no plan.md".to_string())
        })?;
    let plan_bytes = objects.get(&plan_artifact.path).await?;
    let plan = String::from_utf8_lossy(&plan_bytes).to_string();

    Ok(LoadedBundle {
        record,
        manifest,
        plan,
    })
}

fn content_type_for(name: &str) -> String {
    if name.ends_with(".json") {
        "application/json".to_string()
    } else {
        "text/markdown".to_string()
    }
}
