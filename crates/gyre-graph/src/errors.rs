use crate::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("DOT parse error: {0}")]
    Parse(String),
    #[error("invalid graph: {0}")]
    Invalid(String),
    #[error("stylesheet parse error: {0}")]
    Stylesheet(String),
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

#[derive(Debug, Error, Clone)]
#[error("graph validation failed with {errors_count} error(s)")]
pub struct ValidationError {
    pub diagnostics: Vec<Diagnostic>,
    pub errors_count: usize,
}

impl ValidationError {
    pub fn new(diagnostics: Vec<Diagnostic>) -> Self {
        let errors_count = diagnostics.iter().filter(|d| d.is_error()).count();
        Self {
            diagnostics,
            errors_count,
        }
    }
}
