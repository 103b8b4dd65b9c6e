//! Language-model collaborator: provider contract, streaming client,
//! catalog, and secrets lookup.

pub mod catalog;
pub mod errors;
pub mod http;
pub mod provider;
pub mod sse;
pub mod types;

pub use catalog::*;
pub use errors::*;
pub use http::*;
pub use provider::*;
pub use sse::*;
pub use types::*;
