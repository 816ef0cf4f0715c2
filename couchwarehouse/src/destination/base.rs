use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::checkpoint::base::CheckpointStore;
use crate::conversions::Cell;
use crate::conversions::flatten::FlatRow;
use crate::error::EtlResult;
use crate::schema::{ColumnType, DocumentType, Schema};
use crate::types::Document;

/// A single row operation against a target.
#[derive(Debug, Clone, PartialEq)]
pub enum RowChange {
    /// Inserts the row or replaces the row with the same id.
    Upsert {
        id: String,
        row: FlatRow,
        /// The document the row was flattened from, for destinations storing documents as is.
        document: Document,
    },
    /// Removes the row with this id, if present.
    Delete { id: String },
}

impl RowChange {
    pub fn id(&self) -> &str {
        match self {
            RowChange::Upsert { id, .. } | RowChange::Delete { id } => id,
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, RowChange::Delete { .. })
    }
}

/// Row operations for one target, in stream order.
#[derive(Debug, Clone)]
pub struct TargetBatch {
    pub target: String,
    pub document_type: DocumentType,
    pub schema: Arc<Schema>,
    pub changes: Vec<RowChange>,
}

/// A DDL statement or row that could not be applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowFailure {
    pub target: String,
    /// Id of the failed row, or the failed statement for DDL.
    pub id: String,
    pub reason: String,
}

impl fmt::Display for RowFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} in {}: {}", self.id, self.target, self.reason)
    }
}

/// Outcome of [`Destination::apply_batch`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub applied: usize,
    pub failed: Vec<RowFailure>,
}

impl ApplyReport {
    pub fn record_applied(&mut self) {
        self.applied += 1;
    }

    pub fn record_failure(
        &mut self,
        target: impl Into<String>,
        id: impl Into<String>,
        reason: impl ToString,
    ) {
        self.failed.push(RowFailure {
            target: target.into(),
            id: id.into(),
            reason: reason.to_string(),
        });
    }

    pub fn has_failures(&self) -> bool {
        !self.failed.is_empty()
    }
}

/// A store that flattened rows are replicated into.
///
/// Every destination also keeps the replication checkpoints, so that the data and the position
/// it corresponds to live in the same place.
pub trait Destination: CheckpointStore {
    /// Short name used in logs.
    fn name() -> &'static str;

    /// Prepares the store and the checkpoint storage. With `reset` prior checkpoints are
    /// dropped.
    fn initialize(&self, reset: bool) -> impl Future<Output = EtlResult<()>> + Send;

    /// Returns the statements that create the target of `schema`, preceded by a drop when
    /// `reset` is set.
    fn generate_ddl(&self, target: &str, schema: &Schema, reset: bool) -> Vec<String>;

    /// Runs `ddl` and then every row change in one unit of work.
    ///
    /// Failing statements and rows are recorded in the returned report. Only a failure of the
    /// unit of work itself is returned as an error.
    fn apply_batch(
        &self,
        ddl: Vec<String>,
        batches: Vec<TargetBatch>,
    ) -> impl Future<Output = EtlResult<ApplyReport>> + Send;

    /// Returns the target documents of `document_type` are written to.
    fn target_name_for(&self, database: &str, document_type: &DocumentType, split: bool) -> String {
        default_target_name(database, document_type, split)
    }
}

/// Removes every character other than ASCII alphanumerics and `_`.
pub fn sanitize_identifier(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect()
}

/// Returns `<database>_<type>` for named types in split mode and `<database>` otherwise,
/// sanitized.
pub fn default_target_name(database: &str, document_type: &DocumentType, split: bool) -> String {
    match document_type {
        DocumentType::Named(name) if split => sanitize_identifier(&format!("{database}_{name}")),
        _ => sanitize_identifier(database),
    }
}

/// Converts `cell` to the storage type of its column.
///
/// Values that cannot be represented in `typ` become [`Cell::Null`].
pub fn coerce(cell: &Cell, typ: ColumnType) -> Cell {
    match (typ, cell) {
        (_, Cell::Null) => Cell::Null,
        (ColumnType::Text, Cell::Text(text)) => Cell::Text(text.clone()),
        (ColumnType::Text, Cell::Real(real)) => Cell::Text(real.to_string()),
        (ColumnType::Text, Cell::Bool(b)) => Cell::Text(b.to_string()),
        (ColumnType::Real, Cell::Real(real)) => Cell::Real(*real),
        (ColumnType::Real, Cell::Text(text)) => {
            text.trim().parse().map(Cell::Real).unwrap_or(Cell::Null)
        }
        (ColumnType::Real, Cell::Bool(b)) => Cell::Real(if *b { 1.0 } else { 0.0 }),
        (ColumnType::Boolean, Cell::Bool(b)) => Cell::Bool(*b),
        (ColumnType::Boolean, Cell::Real(real)) => Cell::Bool(*real != 0.0),
        (ColumnType::Boolean, Cell::Text(text)) => match text.as_str() {
            "true" => Cell::Bool(true),
            "false" => Cell::Bool(false),
            _ => Cell::Null,
        },
    }
}

/// Projects `row` onto the columns of `schema`.
///
/// Columns the schema does not know are dropped and missing ones are null, so the result
/// always has one cell per schema column in schema order.
pub fn project_row(schema: &Schema, row: &FlatRow) -> Vec<Cell> {
    schema
        .column_schemas
        .iter()
        .map(|column| {
            row.get(&column.name)
                .map(|cell| coerce(cell, column.typ))
                .unwrap_or(Cell::Null)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversions::flatten::flatten;
    use crate::schema::ColumnSchema;
    use serde_json::json;

    #[test]
    fn target_names_follow_split_mode() {
        let order = DocumentType::Named("order".to_string());

        assert_eq!(default_target_name("sample-data", &order, true), "sampledata_order");
        assert_eq!(default_target_name("sample-data", &order, false), "sampledata");
        assert_eq!(
            default_target_name("sample-data", &DocumentType::Default, true),
            "sampledata"
        );
    }

    #[test]
    fn coercion_follows_column_type() {
        assert_eq!(coerce(&Cell::Real(2.5), ColumnType::Text), Cell::Text("2.5".into()));
        assert_eq!(coerce(&Cell::Text(" 7 ".into()), ColumnType::Real), Cell::Real(7.0));
        assert_eq!(coerce(&Cell::Text("seven".into()), ColumnType::Real), Cell::Null);
        assert_eq!(coerce(&Cell::Real(0.0), ColumnType::Boolean), Cell::Bool(false));
        assert_eq!(coerce(&Cell::Text("true".into()), ColumnType::Boolean), Cell::Bool(true));
        assert_eq!(coerce(&Cell::Bool(true), ColumnType::Real), Cell::Real(1.0));
        assert_eq!(coerce(&Cell::Null, ColumnType::Boolean), Cell::Null);
    }

    #[test]
    fn projection_drops_unknown_and_nulls_missing_columns() {
        let schema = Schema::new(vec![
            ColumnSchema::new("id", ColumnType::Text),
            ColumnSchema::new("age", ColumnType::Real),
            ColumnSchema::new("name", ColumnType::Text),
        ]);
        let document = json!({"_id": "p1", "age": 30, "extra": true});
        let row = flatten(document.as_object().unwrap());

        assert_eq!(
            project_row(&schema, &row),
            vec![Cell::Text("p1".into()), Cell::Real(30.0), Cell::Null]
        );
    }

    #[test]
    fn report_counts_applied_rows_and_failures() {
        let mut report = ApplyReport::default();
        assert!(!report.has_failures());

        report.record_applied();
        report.record_applied();
        report.record_failure("sampledata", "doc1", "constraint violated");

        assert_eq!(report.applied, 2);
        assert!(report.has_failures());
        assert_eq!(report.failed[0].to_string(), "doc1 in sampledata: constraint violated");
    }
}
