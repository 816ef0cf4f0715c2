use serde_json::Value;

use crate::conversions::Cell;
use crate::types::Document;

/// Separator placed between the segments of a nested field path.
pub const PATH_SEPARATOR: &str = "_";

/// Column holding the document identifier.
pub const ID_COLUMN: &str = "id";

/// Column holding the document revision.
pub const REV_COLUMN: &str = "rev";

const SOURCE_ID_FIELD: &str = "_id";
const SOURCE_REV_FIELD: &str = "_rev";

/// A document flattened into one level of scalar columns.
///
/// Columns keep the order in which they were first inserted. Inserting an existing column
/// replaces its value in place.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlatRow {
    cells: Vec<(String, Cell)>,
}

impl FlatRow {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            cells: Vec::with_capacity(capacity),
        }
    }

    pub fn insert(&mut self, column: impl Into<String>, cell: Cell) {
        let column = column.into();
        match self.cells.iter_mut().find(|(name, _)| *name == column) {
            Some((_, existing)) => *existing = cell,
            None => self.cells.push((column, cell)),
        }
    }

    pub fn get(&self, column: &str) -> Option<&Cell> {
        self.cells
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, cell)| cell)
    }

    /// Returns the value of the `id` column if it holds text.
    pub fn id(&self) -> Option<&str> {
        match self.get(ID_COLUMN) {
            Some(Cell::Text(id)) => Some(id),
            _ => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Cell)> {
        self.cells.iter().map(|(name, cell)| (name.as_str(), cell))
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.cells.iter().map(|(name, _)| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Converts the row back into a single level JSON document.
    pub fn to_document(&self) -> Document {
        self.cells
            .iter()
            .map(|(name, cell)| (name.clone(), cell.to_json()))
            .collect()
    }
}

/// Flattens a document into a [`FlatRow`].
///
/// Nested objects are walked recursively and every leaf is keyed by its path joined with `_`.
/// Arrays are kept whole as JSON text. `_id` and `_rev` become `id` and `rev`. A document
/// without `_id` keeps any `id` it already has, which makes flattening idempotent on flat input.
/// `null` leaves produce no column.
pub fn flatten(document: &Document) -> FlatRow {
    let mut row = FlatRow::with_capacity(document.len());
    flatten_into(&mut row, None, document);

    if let Some(id) = document.get(SOURCE_ID_FIELD) {
        row.insert(ID_COLUMN, Cell::from_json(id));
    }
    if let Some(rev) = document.get(SOURCE_REV_FIELD) {
        row.insert(REV_COLUMN, Cell::from_json(rev));
    }

    row
}

fn flatten_into(row: &mut FlatRow, prefix: Option<&str>, object: &Document) {
    for (key, value) in object {
        if prefix.is_none() && (key == SOURCE_ID_FIELD || key == SOURCE_REV_FIELD) {
            continue;
        }

        let path = match prefix {
            Some(prefix) => format!("{prefix}{PATH_SEPARATOR}{key}"),
            None => key.clone(),
        };

        match value {
            Value::Object(nested) => flatten_into(row, Some(&path), nested),
            Value::Null => {}
            leaf => row.insert(path, Cell::from_json(leaf)),
        }
    }
}
