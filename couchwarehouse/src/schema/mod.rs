//! Column types, per document type schemas and their inference.

mod base;
mod inference;
mod registry;

pub use base::*;
pub use inference::*;
pub use registry::*;
