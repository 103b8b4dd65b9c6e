//! Attractor graph front-end: parse DOT, canonicalize, overlay the model
//! stylesheet, and validate before a run is allowed to pin the content.

pub mod canonical;
pub mod diagnostics;
pub mod errors;
pub mod graph;
pub mod lint;
pub mod parse;
pub mod stylesheet;

pub use canonical::*;
pub use diagnostics::*;
pub use errors::*;
pub use graph::*;
pub use lint::*;
pub use parse::parse;
pub use stylesheet::*;

/// Parse, overlay the stylesheet, and lint in one step.
///
/// This is the path run creation takes: diagnostics with errors must block
/// the run, warnings ride along.
pub fn prepare(source: &str) -> Result<(Graph, Vec<Diagnostic>), GraphError> {
    let mut graph = parse(source)?;
    apply_model_stylesheet(&mut graph)?;
    let diagnostics = validate(&graph, &[]);
    Ok((graph, diagnostics))
}

/// Like [`prepare`] but failing when any diagnostic is an error.
pub fn prepare_or_raise(source: &str) -> Result<(Graph, Vec<Diagnostic>), GraphError> {
    let (graph, diagnostics) = prepare(source)?;
    if diagnostics.iter().any(Diagnostic::is_error) {
        return Err(GraphError::Validation(ValidationError::new(diagnostics)));
    }
    Ok((graph, diagnostics))
}
