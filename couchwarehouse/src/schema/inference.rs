use crate::conversions::flatten::{FlatRow, flatten};
use crate::schema::{ColumnSchema, Schema};
use crate::types::{DESIGN_DOCUMENT_PREFIX, Document};

/// Infers a schema from one flattened row.
///
/// Every column becomes text, real or boolean according to the kind of its value.
pub fn discover(row: &FlatRow) -> Schema {
    let column_schemas = row
        .iter()
        .map(|(name, cell)| ColumnSchema::new(name, cell.column_type()))
        .collect();

    Schema::new(column_schemas)
}

/// Returns `true` if a sample document may seed a schema.
///
/// Design documents, deletion tombstones and documents without any field are not eligible.
pub fn is_eligible_sample(document: &Document) -> bool {
    let is_design = document
        .get("_id")
        .and_then(|id| id.as_str())
        .is_some_and(|id| id.starts_with(DESIGN_DOCUMENT_PREFIX));
    let is_deleted = document
        .get("_deleted")
        .and_then(|deleted| deleted.as_bool())
        .unwrap_or(false);

    !is_design && !is_deleted && !document.is_empty()
}

/// Infers a schema from the first eligible document of a sample.
///
/// Returns that document along with its schema, or [`None`] if the sample holds no eligible
/// document.
pub fn discover_sample<'a, I>(documents: I) -> Option<(&'a Document, Schema)>
where
    I: IntoIterator<Item = &'a Document>,
{
    documents
        .into_iter()
        .find(|document| is_eligible_sample(document))
        .map(|document| (document, discover(&flatten(document))))
}
