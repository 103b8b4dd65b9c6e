use crate::{
    GitWorkspace, HostCredential, PullRequestInfo, PullRequestSpec, ScmError, SourceControlHost,
    extract_unified_diff,
};
use async_trait::async_trait;

/// Hook invoked after the diff is staged and before the commit, so the
/// caller can persist `implementation.patch` and the note as artifacts in
/// the contractual order.
#[async_trait]
pub trait PatchArtifactHook: Send + Sync {
    async fn on_patch_staged(&self, patch: &str, note: &str) -> Result<(), ScmError>;
}

pub struct NoopPatchArtifactHook;

#[async_trait]
impl PatchArtifactHook for NoopPatchArtifactHook {
    async fn on_patch_staged(&self, _patch: &str, _note: &str) -> Result<(), ScmError> {
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct PatchPipelineRequest {
    pub run_id: String,
    /// `owner/name` of the repository on the host.
    pub repo_full_name: String,
    pub default_branch: String,
    pub target_branch: String,
    pub implementation_text: String,
    pub summary_text: Option<String>,
    pub linked_issue: Option<u64>,
    pub remote: String,
}

#[derive(Clone, Debug)]
pub struct PatchPipelineResult {
    pub patch: String,
    pub note: String,
    pub commit_sha: String,
    pub pull_request: PullRequestInfo,
}

pub fn commit_message(run_id: &str) -> String {
    format!("attractor: implementation run {run_id}")
}

/// Convert a terminal implementation output into a pushed branch and an
/// open pull request. Steps are strictly sequential; any failure leaves the
/// run to be marked FAILED by the caller.
pub async fn run_patch_pipeline(
    workspace: &GitWorkspace,
    host: &dyn SourceControlHost,
    credential: &HostCredential,
    artifacts: &dyn PatchArtifactHook,
    request: &PatchPipelineRequest,
) -> Result<PatchPipelineResult, ScmError> {
    workspace.create_branch(&request.target_branch).await?;

    let patch = extract_unified_diff(&request.implementation_text).ok_or(ScmError::PatchMissing)?;
    workspace.apply_index(&patch).await?;

    let note = implementation_note(request);
    artifacts.on_patch_staged(&patch, &note).await?;

    if !workspace.has_staged_changes().await? {
        return Err(ScmError::NoStagedChanges);
    }

    let commit_sha = workspace.commit(&commit_message(&request.run_id)).await?;
    workspace
        .push_with_lease(&request.remote, &request.target_branch)
        .await?;

    let (owner, repo) = split_repo(&request.repo_full_name)?;
    let title = match request.linked_issue {
        Some(issue) => format!("attractor: implementation run {} (#{issue})", request.run_id),
        None => commit_message(&request.run_id),
    };
    let pull_request = host
        .upsert_pull_request(
            &PullRequestSpec {
                owner,
                repo,
                base: request.default_branch.clone(),
                head: request.target_branch.clone(),
                title,
                body: note.clone(),
            },
            credential,
            &commit_sha,
        )
        .await?;

    Ok(PatchPipelineResult {
        patch,
        note,
        commit_sha,
        pull_request,
    })
}

/// The commit note: summary node output when present, then the run trailer.
fn implementation_note(request: &PatchPipelineRequest) -> String {
    let mut note = String::new();
    if let Some(summary) = request.summary_text.as_deref() {
        let summary = summary.trim();
        if !summary.is_empty() {
            note.push_str(summary);
            note.push_str("\n\n");
        }
    }
    note.push_str(&commit_message(&request.run_id));
    if let Some(issue) = request.linked_issue {
        note.push_str(&format!("\n\nRefs #{issue}"));
    }
    note.push('\n');
    note
}

fn split_repo(full_name: &str) -> Result<(String, String), ScmError> {
    match full_name.split_once('/') {
        Some((owner, repo)) if !owner.is_empty() && !repo.is_empty() => {
            Ok((owner.to_string(), repo.to_string()))
        }
        _ => Err(ScmError::Host(format!(
            "repository name '{full_name}' is not in owner/name form"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_message_expected_shape() {
        assert_eq!(commit_message("r-1"), "attractor: implementation run r-1");
    }

    #[test]
    fn implementation_note_includes_summary_and_issue() {
        let note = implementation_note(&PatchPipelineRequest {
            run_id: "r-1".to_string(),
            repo_full_name: "acme/web".to_string(),
            default_branch: "main".to_string(),
            target_branch: "impl/1".to_string(),
            implementation_text: String::new(),
            summary_text: Some("Adds the widget.".to_string()),
            linked_issue: Some(42),
            remote: "origin".to_string(),
        });
        assert!(note.starts_with("Adds the widget."));
        assert!(note.contains("attractor: implementation run r-1"));
        assert!(note.contains("Refs #42"));
    }

    #[test]
    fn split_repo_rejects_malformed_names() {
        assert!(split_repo("acme/web").is_ok());
        assert!(split_repo("acme").is_err());
        assert!(split_repo("/web").is_err());
    }
}
