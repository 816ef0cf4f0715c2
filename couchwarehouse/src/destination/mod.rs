//! Stores that flattened rows are replicated into.
//!
//! Every destination implements [`Destination`] together with
//! [`crate::checkpoint::base::CheckpointStore`]. The relational destinations share their SQL
//! text through [`sql::Dialect`].

pub mod base;
pub mod elasticsearch;
pub mod memory;
pub mod mysql;
pub mod postgres;
pub mod sql;
pub mod sqlite;

pub use base::{ApplyReport, Destination, RowChange, RowFailure, TargetBatch};
