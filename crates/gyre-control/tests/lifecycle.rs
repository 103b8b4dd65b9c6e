use gyre_control::{
    ControlConfig, ControlError, CreateRunRequest, Dispatcher, LifecycleController, RunStatus,
    RunType, Services, event_types,
};
use gyre_llm::{ModelConfig, ScriptedProvider, ScriptedTurn};
use gyre_scm::MemorySourceControlHost;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::process::Command;

async fn git(dir: &Path, args: &[&str]) {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .stdin(Stdio::null())
        .output()
        .await
        .expect("git command runs");
    assert!(
        output.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
}

/// Clone base containing a bare `acme/web` repo seeded with one commit.
async fn seed_clone_base() -> TempDir {
    let base = TempDir::new().expect("clone base creates");
    let bare = base.path().join("acme/web");
    tokio::fs::create_dir_all(&bare).await.expect("bare dir creates");
    git(&bare, &["init", "--bare", "--initial-branch", "main", "."]).await;

    let seed = TempDir::new().expect("seed dir creates");
    git(seed.path(), &["init", "--initial-branch", "main", "."]).await;
    tokio::fs::write(seed.path().join("lib.rs"), "fn answer() -> u32 { 41 }\n")
        .await
        .expect("seed file writes");
    git(seed.path(), &["add", "."]).await;
    git(
        seed.path(),
        &["-c", "user.name=seed", "-c", "user.email=seed@localhost", "commit", "-m", "seed"],
    )
    .await;
    let bare_url = bare.to_string_lossy().to_string();
    git(seed.path(), &["remote", "add", "origin", &bare_url]).await;
    git(seed.path(), &["push", "origin", "main"]).await;
    base
}

struct Fixture {
    services: Arc<Services>,
    lifecycle: LifecycleController,
    dispatcher: Dispatcher,
    provider: Arc<ScriptedProvider>,
    host: Arc<MemorySourceControlHost>,
    _clone_base: TempDir,
}

async fn fixture() -> Fixture {
    let clone_base = seed_clone_base().await;
    let mut services = Services::in_memory(ControlConfig::local(
        clone_base.path().to_string_lossy().to_string(),
    ));

    let provider = Arc::new(ScriptedProvider::new("anthropic", Vec::new()));
    services.providers.register(provider.clone());
    let host = Arc::new(MemorySourceControlHost::new());
    services.host = host.clone();

    let secrets = gyre_llm::MemorySecrets::new();
    secrets.set_global_secret("anthropic", "sk-test");
    services.secrets = Arc::new(secrets);

    let services = Arc::new(services);
    Fixture {
        lifecycle: LifecycleController::new(Arc::clone(&services)),
        dispatcher: Dispatcher::new(Arc::clone(&services)),
        provider,
        host,
        services,
        _clone_base: clone_base,
    }
}

fn model_config() -> ModelConfig {
    ModelConfig {
        provider: "anthropic".to_string(),
        model: "claude-sonnet-4-5".to_string(),
        temperature: Some(0.2),
        max_tokens: Some(8_192),
        reasoning: None,
    }
}

const PLANNING_GRAPH: &str = r#"
digraph plan_pipeline {
    start [shape=Mdiamond]
    plan [prompt="Plan the change for $repository_tree"]
    done [shape=Msquare]
    start -> plan -> done
}
"#;

const IN_GRAPH_IMPL_GRAPH: &str = r#"
digraph impl_pipeline {
    graph [implementation_mode="dot", implementation_patch_node="implement", implementation_summary_node="summarize"]
    start [shape=Mdiamond]
    implement [prompt="Produce the patch"]
    summarize [prompt="Summarize the patch"]
    done [shape=Msquare]
    start -> implement -> summarize -> done
}
"#;

const HUMAN_GRAPH: &str = r#"
digraph human_pipeline {
    start [shape=Mdiamond]
    gate [shape=hexagon, prompt="Ship it?"]
    ship [prompt="shipping"]
    halt [prompt="halting"]
    done [shape=Msquare]
    start -> gate
    gate -> ship [label="Yes"]
    gate -> halt [label="No"]
    ship -> done
    halt -> done
}
"#;

const PATCH_TEXT: &str = "diff --git a/lib.rs b/lib.rs\n--- a/lib.rs\n+++ b/lib.rs\n@@ -1 +1 @@\n-fn answer() -> u32 { 41 }\n+fn answer() -> u32 { 42 }\n";

fn request(project_id: &str, def_id: &str, run_type: RunType, target: &str) -> CreateRunRequest {
    CreateRunRequest {
        project_id: project_id.to_string(),
        attractor_def_id: def_id.to_string(),
        run_type,
        source_branch: "main".to_string(),
        target_branch: target.to_string(),
        environment_id: None,
        spec_bundle_id: None,
        force: false,
        linked_issue_ref: None,
        source_planning_run_id: None,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn planning_run_builds_bundle_then_self_iterates() {
    let fx = fixture().await;
    let project = fx
        .lifecycle
        .create_project("Acme Web", Some("acme/web"), "main")
        .await
        .expect("project creates");
    let def = fx
        .lifecycle
        .upsert_attractor_def(&project.id, "self", PLANNING_GRAPH, RunType::Planning, &model_config())
        .await
        .expect("attractor upserts");

    fx.provider
        .push(ScriptedTurn::Text("# Plan\n\n1. Bump the answer.".to_string()));
    let planning = fx
        .lifecycle
        .create_run(request(&project.id, &def.id, RunType::Planning, "plan/1"))
        .await
        .expect("planning run creates");

    fx.dispatcher.poll_once().await.expect("dispatch succeeds");
    let finished = fx.lifecycle.get_run(&planning.id).await.expect("run reads");
    assert_eq!(finished.status, RunStatus::Succeeded, "error: {:?}", finished.error);
    let bundle_id = finished.spec_bundle_id.clone().expect("bundle recorded");

    let artifacts = fx
        .services
        .store
        .artifacts_for_run(&planning.id)
        .await
        .expect("artifact list");
    let keys: Vec<&str> = artifacts.iter().map(|a| a.key.as_str()).collect();
    for expected in ["plan.md", "requirements.md", "tasks.json", "acceptance-tests.md", "manifest.json"] {
        assert!(keys.contains(&expected), "missing artifact {expected}");
    }
    let bundle = fx
        .services
        .store
        .get_spec_bundle(&bundle_id)
        .await
        .expect("bundle reads");
    assert_eq!(
        bundle.manifest_path,
        format!("spec-bundles/{}/{}/manifest.json", project.id, planning.id)
    );
    assert_eq!(bundle.schema_version, "v1");

    // Event ordering: RunQueued precedes RunStarted precedes RunCompleted.
    let events = fx
        .services
        .events
        .events_for_run(&planning.id)
        .await
        .expect("events read");
    let positions: Vec<usize> = [
        event_types::RUN_QUEUED,
        event_types::RUN_STARTED,
        event_types::RUN_COMPLETED,
    ]
    .iter()
    .map(|needle| {
        events
            .iter()
            .position(|event| event.event_type == **needle)
            .unwrap_or_else(|| panic!("missing event {needle}"))
    })
    .collect();
    assert!(positions[0] < positions[1] && positions[1] < positions[2]);
    let terminal_count = events
        .iter()
        .filter(|event| {
            matches!(
                event.event_type.as_str(),
                "RunCompleted" | "RunFailed" | "RunCanceled"
            )
        })
        .count();
    assert_eq!(terminal_count, 1);

    // Self-iterate into an implementation run pinned to the bundle.
    let implementation = fx
        .lifecycle
        .self_iterate(&planning.id, "main", "impl/1", false)
        .await
        .expect("self-iteration creates");
    assert_eq!(implementation.run_type, RunType::Implementation);
    assert_eq!(implementation.spec_bundle_id.as_deref(), Some(bundle_id.as_str()));
    assert_eq!(implementation.status, RunStatus::Queued);

    let queued_events = fx
        .services
        .events
        .events_for_run(&implementation.id)
        .await
        .expect("events read");
    let queued = queued_events
        .iter()
        .find(|event| event.event_type == event_types::RUN_QUEUED)
        .expect("RunQueued present");
    assert_eq!(
        queued.payload["source_planning_run_id"],
        serde_json::json!(planning.id)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn branch_lock_blocks_second_implementation_run_unless_forced() {
    let fx = fixture().await;
    let project = fx
        .lifecycle
        .create_project("Acme Web", Some("acme/web"), "main")
        .await
        .expect("project creates");
    let def = fx
        .lifecycle
        .upsert_attractor_def(
            &project.id,
            "self",
            IN_GRAPH_IMPL_GRAPH,
            RunType::Implementation,
            &model_config(),
        )
        .await
        .expect("attractor upserts");

    let first = fx
        .lifecycle
        .create_run(request(&project.id, &def.id, RunType::Implementation, "impl/1"))
        .await
        .expect("first run creates");

    let error = fx
        .lifecycle
        .create_run(request(&project.id, &def.id, RunType::Implementation, "impl/1"))
        .await
        .expect_err("second run must be blocked");
    match error {
        ControlError::Precondition(message) => assert!(message.contains(&first.id)),
        other => panic!("unexpected error: {other}"),
    }

    // Another branch is free, and force bypasses the check.
    fx.lifecycle
        .create_run(request(&project.id, &def.id, RunType::Implementation, "impl/2"))
        .await
        .expect("other branch is unlocked");
    let mut forced = request(&project.id, &def.id, RunType::Implementation, "impl/1");
    forced.force = true;
    fx.lifecycle
        .create_run(forced)
        .await
        .expect("force bypasses the branch lock");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_mid_flight_interrupts_human_wait() {
    let fx = fixture().await;
    let project = fx
        .lifecycle
        .create_project("Acme Web", Some("acme/web"), "main")
        .await
        .expect("project creates");
    let def = fx
        .lifecycle
        .upsert_attractor_def(&project.id, "gate", HUMAN_GRAPH, RunType::Task, &model_config())
        .await
        .expect("attractor upserts");

    let run = fx
        .lifecycle
        .create_run(request(&project.id, &def.id, RunType::Task, "task/1"))
        .await
        .expect("run creates");

    let services = Arc::clone(&fx.services);
    let dispatch = tokio::spawn(async move {
        Dispatcher::new(services).poll_once().await.expect("dispatch succeeds")
    });

    // Wait for the engine to reach the human gate, then cancel.
    let mut waited = Duration::ZERO;
    loop {
        let events = fx
            .services
            .events
            .events_for_run(&run.id)
            .await
            .expect("events read");
        if events
            .iter()
            .any(|event| event.event_type == event_types::HUMAN_QUESTION_PENDING)
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
        waited += Duration::from_millis(25);
        assert!(waited < Duration::from_secs(10), "engine never reached the gate");
    }
    fx.lifecycle.cancel_run(&run.id).await.expect("cancel succeeds");
    dispatch.await.expect("dispatcher task joins");

    let finished = fx.lifecycle.get_run(&run.id).await.expect("run reads");
    assert_eq!(finished.status, RunStatus::Canceled);
    let events = fx
        .services
        .events
        .events_for_run(&run.id)
        .await
        .expect("events read");
    assert!(events.iter().any(|event| event.event_type == event_types::RUN_CANCELED));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn human_answer_resumes_run_to_completion() {
    let fx = fixture().await;
    let project = fx
        .lifecycle
        .create_project("Acme Web", Some("acme/web"), "main")
        .await
        .expect("project creates");
    let def = fx
        .lifecycle
        .upsert_attractor_def(&project.id, "gate", HUMAN_GRAPH, RunType::Task, &model_config())
        .await
        .expect("attractor upserts");

    let run = fx
        .lifecycle
        .create_run(request(&project.id, &def.id, RunType::Task, "task/1"))
        .await
        .expect("run creates");

    let services = Arc::clone(&fx.services);
    let dispatch = tokio::spawn(async move {
        Dispatcher::new(services).poll_once().await.expect("dispatch succeeds")
    });

    let mut waited = Duration::ZERO;
    let question = loop {
        let questions = fx
            .services
            .questions
            .questions_for_run(&run.id)
            .await
            .expect("questions read");
        if let Some(question) = questions.first() {
            break question.clone();
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
        waited += Duration::from_millis(25);
        assert!(waited < Duration::from_secs(10), "question never registered");
    };
    // Options follow target-id order, one per outgoing edge label.
    assert_eq!(question.options, vec!["No".to_string(), "Yes".to_string()]);
    fx.services
        .questions
        .answer(&question.id, "Yes")
        .await
        .expect("answer records");
    dispatch.await.expect("dispatcher task joins");

    let finished = fx.lifecycle.get_run(&run.id).await.expect("run reads");
    assert_eq!(finished.status, RunStatus::Succeeded, "error: {:?}", finished.error);
    let events = fx
        .services
        .events
        .events_for_run(&run.id)
        .await
        .expect("events read");
    assert!(
        events
            .iter()
            .any(|event| event.event_type == "Node.ship.success")
    );
    assert!(
        events
            .iter()
            .any(|event| event.event_type == event_types::HUMAN_QUESTION_ANSWERED)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn implementation_run_extracts_patch_commits_and_opens_pr() {
    let fx = fixture().await;
    let project = fx
        .lifecycle
        .create_project("Acme Web", Some("acme/web"), "main")
        .await
        .expect("project creates");
    let def = fx
        .lifecycle
        .upsert_attractor_def(
            &project.id,
            "self-impl",
            IN_GRAPH_IMPL_GRAPH,
            RunType::Implementation,
            &model_config(),
        )
        .await
        .expect("attractor upserts");

    fx.provider.push(ScriptedTurn::Text(format!(
        "Here is the change:\n```diff\n{PATCH_TEXT}```\n"
    )));
    fx.provider
        .push(ScriptedTurn::Text("Bumps the answer to 42.".to_string()));

    let mut create = request(&project.id, &def.id, RunType::Implementation, "impl/1");
    create.linked_issue_ref = Some("acme/web#7".to_string());
    let run = fx.lifecycle.create_run(create).await.expect("run creates");
    assert_eq!(run.linked_issue_ref.as_deref(), Some("acme/web#7"));
    fx.dispatcher.poll_once().await.expect("dispatch succeeds");

    let finished = fx.lifecycle.get_run(&run.id).await.expect("run reads");
    assert_eq!(finished.status, RunStatus::Succeeded, "error: {:?}", finished.error);
    assert!(finished.pr_url.is_some());
    assert_eq!(
        finished.linked_pull_request_ref.as_deref(),
        Some("acme/web#1")
    );

    // The patch artifact holds exactly the inner diff bytes.
    let artifacts = fx
        .services
        .store
        .artifacts_for_run(&run.id)
        .await
        .expect("artifact list");
    let patch = artifacts
        .iter()
        .find(|artifact| artifact.key == "implementation.patch")
        .expect("patch artifact registered");
    let patch_bytes = fx
        .services
        .objects
        .get(&patch.path)
        .await
        .expect("patch blob reads");
    assert_eq!(String::from_utf8_lossy(&patch_bytes), PATCH_TEXT);
    let note = artifacts
        .iter()
        .find(|artifact| artifact.key == "implementation-note.md")
        .expect("note artifact registered");
    let note_bytes = fx
        .services
        .objects
        .get(&note.path)
        .await
        .expect("note blob reads");
    // The linked issue rode from create-run into the commit note.
    assert!(String::from_utf8_lossy(&note_bytes).contains("Refs #7"));

    // Commit message and pushed branch on the upstream repo.
    let bare = fx._clone_base.path().join("acme/web");
    let output = Command::new("git")
        .args(["log", "-1", "--pretty=%s", "refs/heads/impl/1"])
        .current_dir(&bare)
        .output()
        .await
        .expect("git log runs");
    assert_eq!(
        String::from_utf8_lossy(&output.stdout).trim(),
        format!("attractor: implementation run {}", run.id)
    );

    // Patch lifecycle events and the single open PR.
    let events = fx
        .services
        .events
        .events_for_run(&run.id)
        .await
        .expect("events read");
    for needle in [
        event_types::IMPLEMENTATION_PATCH_EXTRACTED,
        event_types::IMPLEMENTATION_PATCH_APPLIED,
        event_types::RUN_COMPLETED,
    ] {
        assert!(
            events.iter().any(|event| event.event_type == needle),
            "missing event {needle}"
        );
    }
    assert_eq!(fx.host.pull_requests().len(), 1);

    // The branch lock is released on terminal completion.
    assert_eq!(
        fx.services
            .bus
            .branch_lock_holder(&project.id, "impl/1")
            .await
            .expect("holder query"),
        None
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn implementation_without_diff_fails_with_patch_missing_event() {
    let fx = fixture().await;
    let project = fx
        .lifecycle
        .create_project("Acme Web", Some("acme/web"), "main")
        .await
        .expect("project creates");
    let def = fx
        .lifecycle
        .upsert_attractor_def(
            &project.id,
            "self-impl",
            IN_GRAPH_IMPL_GRAPH,
            RunType::Implementation,
            &model_config(),
        )
        .await
        .expect("attractor upserts");

    fx.provider
        .push(ScriptedTurn::Text("all prose, no diff".to_string()));
    fx.provider
        .push(ScriptedTurn::Text("summary".to_string()));

    let run = fx
        .lifecycle
        .create_run(request(&project.id, &def.id, RunType::Implementation, "impl/1"))
        .await
        .expect("run creates");
    fx.dispatcher.poll_once().await.expect("dispatch succeeds");

    let finished = fx.lifecycle.get_run(&run.id).await.expect("run reads");
    assert_eq!(finished.status, RunStatus::Failed);
    let events = fx
        .services
        .events
        .events_for_run(&run.id)
        .await
        .expect("events read");
    assert!(
        events
            .iter()
            .any(|event| event.event_type == event_types::IMPLEMENTATION_PATCH_MISSING)
    );
    let failed = events
        .iter()
        .find(|event| event.event_type == event_types::RUN_FAILED)
        .expect("RunFailed present");
    assert_eq!(failed.payload["error"], serde_json::json!(finished.error.unwrap()));
    assert_eq!(
        fx.services
            .bus
            .branch_lock_holder(&project.id, "impl/1")
            .await
            .expect("holder query"),
        None
    );
}
