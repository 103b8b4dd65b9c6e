use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid graph: {0}")]
    InvalidGraph(String),

    #[error("engine runtime error: {0}")]
    Runtime(String),

    #[error("run was canceled")]
    Canceled,
}
