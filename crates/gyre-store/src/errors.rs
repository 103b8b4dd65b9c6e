use gyre_graph::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("resource not found: {resource} ({id})")]
    NotFound { resource: &'static str, id: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("attractor content failed validation with {} error(s)", .0.iter().filter(|d| d.is_error()).count())]
    InvalidContent(Vec<Diagnostic>),

    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("backend failure: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;
