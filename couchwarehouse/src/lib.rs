//! Replicates the changes feed of a CouchDB database into relational databases or search
//! indexes.
//!
//! Documents are flattened into one wide row per document, a schema is inferred per document
//! type and frozen, and every batch is applied idempotently before its position is
//! checkpointed in the destination itself. See [`pipeline::Pipeline`] for the entry point.

pub mod checkpoint;
pub mod concurrency;
pub mod conversions;
pub mod destination;
pub mod error;
mod macros;
pub mod pipeline;
pub mod replication;
pub mod schema;
pub mod source;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod types;
