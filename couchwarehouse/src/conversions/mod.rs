use serde_json::Value;
use std::fmt;

use crate::schema::ColumnType;

pub mod flatten;

/// A scalar value stored in one column of a flattened row.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Null,
    Text(String),
    Real(f64),
    Bool(bool),
}

impl Cell {
    /// Converts a JSON leaf into a cell.
    ///
    /// Arrays are stored as their canonical JSON text. Objects are expected to be flattened
    /// by the caller and are serialized the same way if they still reach this point.
    pub fn from_json(value: &Value) -> Cell {
        match value {
            Value::Null => Cell::Null,
            Value::Bool(b) => Cell::Bool(*b),
            Value::Number(n) => n.as_f64().map(Cell::Real).unwrap_or(Cell::Null),
            Value::String(s) => Cell::Text(s.clone()),
            Value::Array(_) | Value::Object(_) => Cell::Text(value.to_string()),
        }
    }

    /// Returns the column type a value of this kind is stored as.
    ///
    /// Anything that is neither a number nor a boolean is text.
    pub fn column_type(&self) -> ColumnType {
        match self {
            Cell::Real(_) => ColumnType::Real,
            Cell::Bool(_) => ColumnType::Boolean,
            Cell::Null | Cell::Text(_) => ColumnType::Text,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Cell::Null)
    }

    /// Returns the cell as a JSON value.
    pub fn to_json(&self) -> Value {
        match self {
            Cell::Null => Value::Null,
            Cell::Text(s) => Value::String(s.clone()),
            Cell::Real(r) => serde_json::Number::from_f64(*r)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Cell::Bool(b) => Value::Bool(*b),
        }
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cell::Null => f.write_str("NULL"),
            Cell::Text(s) => f.write_str(s),
            Cell::Real(r) => write!(f, "{r}"),
            Cell::Bool(b) => write!(f, "{b}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_leaves_map_to_cells() {
        assert_eq!(Cell::from_json(&json!("a")), Cell::Text("a".to_string()));
        assert_eq!(Cell::from_json(&json!(30)), Cell::Real(30.0));
        assert_eq!(Cell::from_json(&json!(false)), Cell::Bool(false));
        assert_eq!(Cell::from_json(&json!(null)), Cell::Null);
        assert_eq!(
            Cell::from_json(&json!(["feet", "sections"])),
            Cell::Text(r#"["feet","sections"]"#.to_string())
        );
    }

    #[test]
    fn null_is_typed_as_text() {
        assert_eq!(Cell::Null.column_type(), ColumnType::Text);
        assert_eq!(Cell::Real(1.5).column_type(), ColumnType::Real);
    }
}
