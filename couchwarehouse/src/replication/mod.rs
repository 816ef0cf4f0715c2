//! Turning change batches into applied row changes.

pub mod processor;
pub mod transform;
