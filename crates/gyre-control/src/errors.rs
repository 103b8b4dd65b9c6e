use gyre_engine::EngineError;
use gyre_scm::ScmError;
use gyre_store::StoreError;
use thiserror::Error;

/// Control-plane error taxonomy. Creation paths fail before side effects;
/// during a run only `Transient` is absorbed by retry budgets.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("not found: {resource} ({id})")]
    NotFound { resource: &'static str, id: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("execution failure: {0}")]
    Execution(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("run was canceled")]
    Canceled,

    #[error("internal error: {0}")]
    Internal(String),
}

pub type ControlResult<T> = Result<T, ControlError>;

impl ControlError {
    pub fn not_found(resource: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource,
            id: id.into(),
        }
    }
}

impl From<StoreError> for ControlError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound { resource, id } => Self::NotFound { resource, id },
            StoreError::Conflict(message) => Self::Conflict(message),
            StoreError::InvalidInput(message) => Self::Validation(message),
            StoreError::InvalidContent(diagnostics) => Self::Validation(format!(
                "attractor content failed validation: {}",
                diagnostics
                    .iter()
                    .filter(|d| d.is_error())
                    .map(|d| d.message.as_str())
                    .collect::<Vec<_>>()
                    .join("; ")
            )),
            StoreError::Precondition(message) => Self::Precondition(message),
            StoreError::Backend(message) => Self::Internal(message),
        }
    }
}

impl From<EngineError> for ControlError {
    fn from(error: EngineError) -> Self {
        match error {
            EngineError::Canceled => Self::Canceled,
            EngineError::InvalidGraph(message) => Self::Validation(message),
            EngineError::Runtime(message) => Self::Execution(message),
        }
    }
}

impl From<ScmError> for ControlError {
    fn from(error: ScmError) -> Self {
        Self::Execution(error.to_string())
    }
}
