use serde_json::Value;
use std::fmt;

use crate::types::Document;

/// Storage type of a flattened column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnType {
    Text,
    Real,
    Boolean,
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ColumnType::Text => "text",
            ColumnType::Real => "real",
            ColumnType::Boolean => "boolean",
        };

        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSchema {
    pub name: String,
    pub typ: ColumnType,
}

impl ColumnSchema {
    pub fn new(name: impl Into<String>, typ: ColumnType) -> Self {
        Self {
            name: name.into(),
            typ,
        }
    }
}

/// Ordered set of columns of one document type.
///
/// A schema is frozen once registered: documents of the same type with extra fields are
/// written with this column set only.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Schema {
    pub column_schemas: Vec<ColumnSchema>,
}

impl Schema {
    pub fn new(column_schemas: Vec<ColumnSchema>) -> Self {
        Self { column_schemas }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.column_schemas.iter().find(|c| c.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.column_schemas.iter().map(|c| c.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.column_schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.column_schemas.is_empty()
    }
}

/// Classifier deciding which target a document is written to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DocumentType {
    /// The single type used when the database is not split, or when a document lacks the split
    /// field.
    Default,
    /// The value of the configured split field.
    Named(String),
}

impl DocumentType {
    /// Classifies a document by the value of its top level `split` field.
    ///
    /// Strings are used as is, numbers and booleans by their JSON text. Anything else, including
    /// a missing field, yields [`DocumentType::Default`].
    pub fn classify(document: &Document, split: Option<&str>) -> Self {
        let Some(field) = split else {
            return DocumentType::Default;
        };

        match document.get(field) {
            Some(Value::String(value)) => DocumentType::Named(value.clone()),
            Some(value @ (Value::Number(_) | Value::Bool(_))) => {
                DocumentType::Named(value.to_string())
            }
            _ => DocumentType::Default,
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            DocumentType::Default => None,
            DocumentType::Named(name) => Some(name),
        }
    }
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocumentType::Default => f.write_str("_default"),
            DocumentType::Named(name) => f.write_str(name),
        }
    }
}
