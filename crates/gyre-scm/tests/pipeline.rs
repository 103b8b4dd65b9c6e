use gyre_scm::{
    GitWorkspace, HostCredential, MemorySourceControlHost, NoopPatchArtifactHook,
    PatchPipelineRequest, ScmError, run_patch_pipeline,
};
use std::path::Path;
use std::process::Stdio;
use tempfile::TempDir;
use tokio::process::Command;

async fn git(dir: &Path, args: &[&str]) -> String {
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
    String::from_utf8_lossy(&output.stdout).to_string()
}

/// A bare upstream with one seeded commit on `main`, plus a working clone.
async fn fixture() -> (TempDir, TempDir, GitWorkspace) {
    let upstream = TempDir::new().expect("upstream dir creates");
    git(upstream.path(), &["init", "--bare", "--initial-branch", "main", "."]).await;

    let seed = TempDir::new().expect("seed dir creates");
    git(seed.path(), &["init", "--initial-branch", "main", "."]).await;
    tokio::fs::write(seed.path().join("lib.rs"), "fn answer() -> u32 { 41 }\n")
        .await
        .expect("seed file writes");
    git(seed.path(), &["add", "."]).await;
    git(
        seed.path(),
        &[
            "-c", "user.name=seed", "-c", "user.email=seed@localhost", "commit", "-m", "seed",
        ],
    )
    .await;
    let upstream_url = upstream.path().to_string_lossy().to_string();
    git(seed.path(), &["remote", "add", "origin", &upstream_url]).await;
    git(seed.path(), &["push", "origin", "main"]).await;

    let clone_dir = TempDir::new().expect("clone dir creates");
    let clone_path = clone_dir.path().join("work");
    let workspace = GitWorkspace::clone_branch(&upstream_url, "main", &clone_path)
        .await
        .expect("clone succeeds");
    (upstream, clone_dir, workspace)
}

const IMPLEMENTATION_TEXT: &str = "Fix the off-by-one.\n\n```diff\ndiff --git a/lib.rs b/lib.rs\n--- a/lib.rs\n+++ b/lib.rs\n@@ -1 +1 @@\n-fn answer() -> u32 { 41 }\n+fn answer() -> u32 { 42 }\n```\n";

fn request(run_id: &str) -> PatchPipelineRequest {
    PatchPipelineRequest {
        run_id: run_id.to_string(),
        repo_full_name: "acme/web".to_string(),
        default_branch: "main".to_string(),
        target_branch: "impl/1".to_string(),
        implementation_text: IMPLEMENTATION_TEXT.to_string(),
        summary_text: Some("Bumps the answer.".to_string()),
        linked_issue: None,
        remote: "origin".to_string(),
    }
}

#[tokio::test(flavor = "current_thread")]
async fn pipeline_commits_pushes_and_opens_pr() {
    let (upstream, _clone_dir, workspace) = fixture().await;
    let host = MemorySourceControlHost::new();
    let credential = HostCredential::Installation("install-token".to_string());

    let result = run_patch_pipeline(
        &workspace,
        &host,
        &credential,
        &NoopPatchArtifactHook,
        &request("r-100"),
    )
    .await
    .expect("pipeline succeeds");

    assert!(result.patch.starts_with("diff --git a/lib.rs"));
    assert_eq!(result.pull_request.number, 1);
    assert_eq!(result.pull_request.head_sha, result.commit_sha);

    // Branch landed upstream with the contractual commit message.
    let subject = git(
        upstream.path(),
        &["log", "-1", "--pretty=%s", "refs/heads/impl/1"],
    )
    .await;
    assert_eq!(subject.trim(), "attractor: implementation run r-100");
}

#[tokio::test(flavor = "current_thread")]
async fn pipeline_without_diff_expected_patch_missing() {
    let (_upstream, _clone_dir, workspace) = fixture().await;
    let host = MemorySourceControlHost::new();
    let credential = HostCredential::Personal("token".to_string());

    let mut bad = request("r-101");
    bad.implementation_text = "all prose, no patch".to_string();
    let error = run_patch_pipeline(&workspace, &host, &credential, &NoopPatchArtifactHook, &bad)
        .await
        .expect_err("pipeline must fail");
    assert!(matches!(error, ScmError::PatchMissing));
    assert!(host.pull_requests().is_empty());
}

#[tokio::test(flavor = "current_thread")]
async fn pipeline_upsert_reuses_pr_for_same_head() {
    let (_upstream, _clone_dir, workspace) = fixture().await;
    let host = MemorySourceControlHost::new();
    let credential = HostCredential::Installation("install-token".to_string());

    run_patch_pipeline(
        &workspace,
        &host,
        &credential,
        &NoopPatchArtifactHook,
        &request("r-102"),
    )
    .await
    .expect("first pipeline succeeds");

    // A follow-up run against the same target branch updates the existing
    // pull request instead of opening a second one. The clone rebuilds the
    // branch from main, so the lease-style force push replaces the head.
    let clone_root = workspace.root().to_path_buf();
    git(&clone_root, &["checkout", "main"]).await;
    git(&clone_root, &["branch", "-D", "impl/1"]).await;
    let mut follow_up = request("r-103");
    follow_up.implementation_text = IMPLEMENTATION_TEXT.replace("{ 42 }", "{ 43 }");

    let result = run_patch_pipeline(
        &workspace,
        &host,
        &credential,
        &NoopPatchArtifactHook,
        &follow_up,
    )
    .await
    .expect("second pipeline succeeds");

    assert_eq!(result.pull_request.number, 1);
    assert_eq!(host.pull_requests().len(), 1);
}
