use crate::ScmError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Credential used against the source-control host; the installation token
/// is preferred, a personal token is the fallback.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HostCredential {
    Installation(String),
    Personal(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestSpec {
    pub owner: String,
    pub repo: String,
    pub base: String,
    pub head: String,
    pub title: String,
    pub body: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestInfo {
    pub number: u64,
    pub url: String,
    pub head_sha: String,
}

/// External source-control host contract: PR upsert plus the review
/// writeback surfaces (check runs, issue comments).
#[async_trait]
pub trait SourceControlHost: Send + Sync {
    async fn upsert_pull_request(
        &self,
        spec: &PullRequestSpec,
        credential: &HostCredential,
        head_sha: &str,
    ) -> Result<PullRequestInfo, ScmError>;

    async fn post_check_run(
        &self,
        owner: &str,
        repo: &str,
        head_sha: &str,
        name: &str,
        conclusion: &str,
        summary: &str,
    ) -> Result<(), ScmError>;

    async fn post_issue_comment(
        &self,
        owner: &str,
        repo: &str,
        issue_number: u64,
        body: &str,
    ) -> Result<(), ScmError>;
}

pub type SharedSourceControlHost = Arc<dyn SourceControlHost>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedCheckRun {
    pub head_sha: String,
    pub name: String,
    pub conclusion: String,
    pub summary: String,
}

#[derive(Default)]
struct HostState {
    next_number: u64,
    pull_requests: BTreeMap<(String, String, String), PullRequestInfo>,
    check_runs: Vec<RecordedCheckRun>,
    comments: Vec<(u64, String)>,
}

/// In-memory host fake: upserts are idempotent per `(owner, repo, head)`.
#[derive(Clone, Default)]
pub struct MemorySourceControlHost {
    state: Arc<Mutex<HostState>>,
}

impl MemorySourceControlHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pull_requests(&self) -> Vec<PullRequestInfo> {
        self.state
            .lock()
            .map(|state| state.pull_requests.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn check_runs(&self) -> Vec<RecordedCheckRun> {
        self.state
            .lock()
            .map(|state| state.check_runs.clone())
            .unwrap_or_default()
    }

    pub fn comments(&self) -> Vec<(u64, String)> {
        self.state
            .lock()
            .map(|state| state.comments.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl SourceControlHost for MemorySourceControlHost {
    async fn upsert_pull_request(
        &self,
        spec: &PullRequestSpec,
        _credential: &HostCredential,
        head_sha: &str,
    ) -> Result<PullRequestInfo, ScmError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| ScmError::Host("host mutex poisoned".to_string()))?;
        let key = (spec.owner.clone(), spec.repo.clone(), spec.head.clone());

        if let Some(existing) = state.pull_requests.get_mut(&key) {
            existing.head_sha = head_sha.to_string();
            return Ok(existing.clone());
        }

        state.next_number += 1;
        let info = PullRequestInfo {
            number: state.next_number,
            url: format!(
                "https://example.test/{}/{}/pull/{}",
                spec.owner, spec.repo, state.next_number
            ),
            head_sha: head_sha.to_string(),
        };
        state.pull_requests.insert(key, info.clone());
        Ok(info)
    }

    async fn post_check_run(
        &self,
        _owner: &str,
        _repo: &str,
        head_sha: &str,
        name: &str,
        conclusion: &str,
        summary: &str,
    ) -> Result<(), ScmError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| ScmError::Host("host mutex poisoned".to_string()))?;
        state.check_runs.push(RecordedCheckRun {
            head_sha: head_sha.to_string(),
            name: name.to_string(),
            conclusion: conclusion.to_string(),
            summary: summary.to_string(),
        });
        Ok(())
    }

    async fn post_issue_comment(
        &self,
        _owner: &str,
        _repo: &str,
        issue_number: u64,
        body: &str,
    ) -> Result<(), ScmError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| ScmError::Host("host mutex poisoned".to_string()))?;
        state.comments.push((issue_number, body.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "current_thread")]
    async fn upsert_pull_request_is_idempotent_per_head() {
        let host = MemorySourceControlHost::new();
        let spec = PullRequestSpec {
            owner: "acme".to_string(),
            repo: "web".to_string(),
            base: "main".to_string(),
            head: "impl/1".to_string(),
            title: "change".to_string(),
            body: "body".to_string(),
        };
        let credential = HostCredential::Personal("token".to_string());

        let first = host
            .upsert_pull_request(&spec, &credential, "sha-1")
            .await
            .expect("first upsert succeeds");
        let second = host
            .upsert_pull_request(&spec, &credential, "sha-2")
            .await
            .expect("second upsert succeeds");

        assert_eq!(first.number, second.number);
        assert_eq!(second.head_sha, "sha-2");
        assert_eq!(host.pull_requests().len(), 1);
    }
}
