use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::types::Document;

/// Rewrites documents before they are flattened.
///
/// Any `Fn(Document) -> Document` closure is a transform.
pub trait Transform: Send + Sync {
    fn apply(&self, document: Document) -> Document;
}

impl<F> Transform for F
where
    F: Fn(Document) -> Document + Send + Sync,
{
    fn apply(&self, document: Document) -> Document {
        self(document)
    }
}

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("failed to read transform file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid transform file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid transform rule: {0}")]
    InvalidRule(String),
}

/// Declarative transform loaded from a JSON file.
///
/// ```json
/// {
///   "drop": ["password", "address.zip"],
///   "rename": {"cust": "customer"},
///   "set": {"origin": "couchdb"}
/// }
/// ```
///
/// Paths use `.` to reach into nested objects. Rules run in the order drop, rename, set.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FieldTransform {
    #[serde(default)]
    pub drop: Vec<String>,
    #[serde(default)]
    pub rename: BTreeMap<String, String>,
    #[serde(default)]
    pub set: BTreeMap<String, Value>,
}

impl FieldTransform {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TransformError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| TransformError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let transform: FieldTransform =
            serde_json::from_str(&contents).map_err(|source| TransformError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        transform.validate()?;

        Ok(transform)
    }

    pub fn validate(&self) -> Result<(), TransformError> {
        let paths = self
            .drop
            .iter()
            .chain(self.rename.keys())
            .chain(self.rename.values())
            .chain(self.set.keys());

        for path in paths {
            if path.split('.').any(str::is_empty) {
                return Err(TransformError::InvalidRule(format!(
                    "empty segment in path `{path}`"
                )));
            }
        }

        Ok(())
    }
}

fn remove_path(document: &mut Document, path: &str) -> Option<Value> {
    match path.split_once('.') {
        None => document.remove(path),
        Some((head, rest)) => match document.get_mut(head) {
            Some(Value::Object(child)) => remove_path(child, rest),
            _ => None,
        },
    }
}

/// Sets `path`, creating intermediate objects and replacing non-object values on the way.
fn set_path(document: &mut Document, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            document.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let child = document
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Document::new()));
            if !child.is_object() {
                *child = Value::Object(Document::new());
            }
            if let Value::Object(child) = child {
                set_path(child, rest, value);
            }
        }
    }
}

impl Transform for FieldTransform {
    fn apply(&self, mut document: Document) -> Document {
        for path in &self.drop {
            remove_path(&mut document, path);
        }
        for (from, to) in &self.rename {
            if let Some(value) = remove_path(&mut document, from) {
                set_path(&mut document, to, value);
            }
        }
        for (path, value) in &self.set {
            set_path(&mut document, path, value.clone());
        }

        document
    }
}
