use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScmError {
    #[error("implementation text contains no unified diff")]
    PatchMissing,

    #[error("implementation produced no staged changes")]
    NoStagedChanges,

    #[error("git {action} failed: {detail}")]
    Git { action: String, detail: String },

    #[error("io failure: {0}")]
    Io(String),

    #[error("source-control host error: {0}")]
    Host(String),
}

impl ScmError {
    pub fn git(action: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Git {
            action: action.into(),
            detail: detail.into(),
        }
    }
}
