use crate::{ControlError, ControlResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunType {
    Planning,
    Implementation,
    Task,
}

impl RunType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Planning => "planning",
            Self::Implementation => "implementation",
            Self::Task => "task",
        }
    }

    pub fn parse(value: &str) -> ControlResult<Self> {
        match value.trim() {
            "planning" => Ok(Self::Planning),
            "implementation" => Ok(Self::Implementation),
            "task" => Ok(Self::Task),
            other => Err(ControlError::Validation(format!(
                "unknown run type '{other}'"
            ))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }

    pub fn is_active(self) -> bool {
        matches!(self, Self::Queued | Self::Running)
    }

    /// The only legal edges of the status machine.
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Running)
                | (Self::Queued, Self::Canceled)
                | (Self::Running, Self::Succeeded)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::Canceled)
        )
    }
}

/// DNS-label namespace derived from the project name when absent.
pub fn derive_namespace(name: &str) -> ControlResult<String> {
    let mut namespace = String::new();
    for ch in name.trim().chars() {
        if ch.is_ascii_alphanumeric() {
            namespace.push(ch.to_ascii_lowercase());
        } else if !namespace.is_empty() && !namespace.ends_with('-') {
            namespace.push('-');
        }
    }
    while namespace.ends_with('-') {
        namespace.pop();
    }
    if namespace.is_empty() || namespace.len() > 63 {
        return Err(ControlError::Validation(format!(
            "cannot derive a DNS-label namespace from project name '{name}'"
        )));
    }
    Ok(namespace)
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    /// Unique DNS label; immutable once set.
    pub namespace: String,
    pub default_branch: String,
    pub repo_full_name: Option<String>,
    pub default_environment_id: Option<String>,
    pub installation_ref: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EnvironmentKind {
    ContainerJob,
}

/// Runner image refs must be pinned by content digest.
pub fn validate_runner_image_ref(image_ref: &str) -> ControlResult<()> {
    let Some((_, digest)) = image_ref.rsplit_once("@sha256:") else {
        return Err(ControlError::Validation(format!(
            "runner image '{image_ref}' must be pinned by digest (@sha256:<64 hex>)"
        )));
    };
    if digest.len() != 64 || !digest.chars().all(|ch| ch.is_ascii_hexdigit()) {
        return Err(ControlError::Validation(format!(
            "runner image '{image_ref}' digest must be 64 hex characters"
        )));
    }
    Ok(())
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentRecord {
    pub id: String,
    pub name: String,
    pub kind: EnvironmentKind,
    pub runner_image_ref: String,
    pub service_account: Option<String>,
    pub resource_requests: Option<Value>,
    pub resource_limits: Option<Value>,
    pub active: bool,
}

impl EnvironmentRecord {
    pub fn validate(&self) -> ControlResult<()> {
        validate_runner_image_ref(&self.runner_image_ref)
    }

    pub fn snapshot(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub project_id: String,
    pub attractor_def_id: String,
    pub attractor_content_path: String,
    pub attractor_content_version: u32,
    pub attractor_content_sha256: String,
    pub environment_id: String,
    /// Opaque snapshot of the environment at dispatch time; later edits to
    /// the environment never affect in-flight runs.
    pub environment_snapshot: Value,
    pub run_type: RunType,
    pub source_branch: String,
    pub target_branch: String,
    pub status: RunStatus,
    pub spec_bundle_id: Option<String>,
    pub linked_issue_ref: Option<String>,
    pub linked_pull_request_ref: Option<String>,
    pub pr_url: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub error: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    pub id: String,
    pub run_id: String,
    pub ts: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub payload: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunNodeOutcomeRow {
    pub run_id: String,
    pub node_id: String,
    pub attempt: u32,
    pub status: String,
    pub payload: Value,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QuestionStatus {
    Pending,
    Answered,
    Timeout,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunQuestionRecord {
    pub id: String,
    pub run_id: String,
    pub node_id: String,
    pub prompt: String,
    pub options: Vec<String>,
    pub status: QuestionStatus,
    pub answer: Option<String>,
    pub created_at: String,
    pub answered_at: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub id: String,
    pub run_id: String,
    pub key: String,
    pub path: String,
    pub content_type: Option<String>,
    pub size_bytes: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SpecBundleRecord {
    pub id: String,
    pub run_id: String,
    pub schema_version: String,
    pub manifest_path: String,
}

pub const SPEC_BUNDLE_SCHEMA_V1: &str = "v1";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewDecision {
    Approve,
    RequestChanges,
    Reject,
    Exception,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunReviewRecord {
    pub run_id: String,
    pub reviewer: String,
    pub decision: ReviewDecision,
    pub checklist: Value,
    pub summary: Option<String>,
    pub critical_findings: Option<Value>,
    pub artifact_findings: Option<Value>,
    pub attestation: Option<String>,
    pub reviewed_head_sha: Option<String>,
    pub writeback_status: String,
}

/// Everything a worker needs to execute one run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSpec {
    pub run_id: String,
    pub project_id: String,
    pub run_type: RunType,
    pub source_branch: String,
    pub target_branch: String,
    pub model_config: gyre_llm::ModelConfig,
    pub environment: Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_machine_allows_only_specified_edges() {
        use RunStatus::*;
        let legal = [
            (Queued, Running),
            (Queued, Canceled),
            (Running, Succeeded),
            (Running, Failed),
            (Running, Canceled),
        ];
        for from in [Queued, Running, Succeeded, Failed, Canceled] {
            for to in [Queued, Running, Succeeded, Failed, Canceled] {
                assert_eq!(
                    from.can_transition_to(to),
                    legal.contains(&(from, to)),
                    "transition {from:?} -> {to:?}"
                );
            }
        }
    }

    #[test]
    fn derive_namespace_folds_to_dns_label() {
        assert_eq!(derive_namespace("Acme Web App").expect("derives"), "acme-web-app");
        assert_eq!(derive_namespace("  x__y  ").expect("derives"), "x-y");
        assert!(derive_namespace("!!!").is_err());
    }

    #[test]
    fn validate_runner_image_ref_requires_digest_pin() {
        let digest = "a".repeat(64);
        assert!(validate_runner_image_ref(&format!("ghcr.io/acme/runner@sha256:{digest}")).is_ok());
        assert!(validate_runner_image_ref("ghcr.io/acme/runner:latest").is_err());
        assert!(validate_runner_image_ref("ghcr.io/acme/runner@sha256:abc").is_err());
    }

    #[test]
    fn run_type_parse_round_trip() {
        for run_type in [RunType::Planning, RunType::Implementation, RunType::Task] {
            assert_eq!(RunType::parse(run_type.as_str()).expect("parses"), run_type);
        }
        assert!(RunType::parse("bogus").is_err());
    }
}
