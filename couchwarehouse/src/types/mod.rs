//! Common types used throughout the replication pipeline.

mod event;

pub use event::*;

pub use crate::conversions::Cell;
pub use crate::conversions::flatten::FlatRow;
pub use crate::schema::{ColumnSchema, ColumnType, DocumentType, Schema};
