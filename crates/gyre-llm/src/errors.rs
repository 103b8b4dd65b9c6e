use thiserror::Error;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("provider '{0}' is not registered")]
    UnknownProvider(String),

    #[error("model '{model}' is not in the catalog for provider '{provider}'")]
    UnknownModel { provider: String, model: String },

    #[error("no provider secret available for '{0}'")]
    MissingSecret(String),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("provider protocol error: {0}")]
    Protocol(String),

    #[error("provider error: {message}")]
    Provider { message: String, retriable: bool },

    #[error("model call exceeded {0} ms")]
    Timeout(u64),
}

impl LlmError {
    /// Whether a retry within the node attempt budget can help.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Timeout(_) => true,
            Self::Provider { retriable, .. } => *retriable,
            _ => false,
        }
    }
}
