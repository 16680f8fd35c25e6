//! Core value and row types shared across the engine.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use uuid::Uuid;

/// A single scalar cell fetched from the remote service.
///
/// Covers the scalar types the wire schema can declare. Values are kept in
/// their typed form until they are bound into a sink statement or rendered
/// into a filter expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    I16(i16),
    I32(i32),
    I64(i64),
    F64(f64),
    Text(String),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Uuid(Uuid),
}

impl Value {
    /// Returns `true` for [`Value::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Renders the value as a literal usable inside a remote filter
    /// expression: numbers stay bare, everything else is single-quoted with
    /// embedded quotes doubled.
    pub fn filter_literal(&self) -> String {
        match self {
            Value::Null => "null".to_string(),
            Value::Bool(v) => v.to_string(),
            Value::I16(v) => v.to_string(),
            Value::I32(v) => v.to_string(),
            Value::I64(v) => v.to_string(),
            Value::F64(v) => v.to_string(),
            Value::Text(v) => format!("'{}'", v.replace('\'', "''")),
            Value::Timestamp(v) => format!("'{v}'"),
            Value::TimestampTz(v) => format!("'{v}'"),
            Value::Uuid(v) => format!("'{v}'"),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::I16(v) => write!(f, "{v}"),
            Value::I32(v) => write!(f, "{v}"),
            Value::I64(v) => write!(f, "{v}"),
            Value::F64(v) => write!(f, "{v}"),
            Value::Text(v) => f.write_str(v),
            Value::Timestamp(v) => write!(f, "{v}"),
            Value::TimestampTz(v) => write!(f, "{v}"),
            Value::Uuid(v) => write!(f, "{v}"),
        }
    }
}

/// A complete row of data in table column order.
///
/// The values are ordered to match the columns of the batch the row belongs
/// to; positional correspondence is what the sink relies on when binding.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    values: Vec<Value>,
}

impl Row {
    /// Creates a new row with the given cell values.
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    /// Returns the row values in column order.
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Consumes the row and returns its values in column order.
    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    /// Number of cells in the row.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns `true` if the row has no cells.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// One record as fetched from the remote service, keyed by field name.
///
/// Records are projected into [`Row`]s in a caller-chosen field order before
/// persistence; fields the response did not carry project as [`Value::Null`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    values: HashMap<String, Value>,
}

impl Record {
    /// Creates an empty record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a field value, replacing any previous one.
    pub fn insert(&mut self, field: impl Into<String>, value: Value) {
        self.values.insert(field.into(), value);
    }

    /// Returns the value of a field, if present.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.values.get(field)
    }

    /// Projects the record into a row following `fields` order.
    pub fn project(&self, fields: &[String]) -> Row {
        let values = fields
            .iter()
            .map(|field| self.values.get(field).cloned().unwrap_or(Value::Null))
            .collect();

        Row::new(values)
    }
}

impl<S: Into<String>> FromIterator<(S, Value)> for Record {
    fn from_iter<T: IntoIterator<Item = (S, Value)>>(iter: T) -> Self {
        let values = iter
            .into_iter()
            .map(|(field, value)| (field.into(), value))
            .collect();

        Self { values }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_literal_quotes_text_only() {
        assert_eq!(Value::I64(42).filter_literal(), "42");
        assert_eq!(Value::Text("it's".to_string()).filter_literal(), "'it''s'");
    }

    #[test]
    fn projection_follows_field_order_and_fills_nulls() {
        let record: Record = [
            ("ID", Value::I32(7)),
            ("Name", Value::Text("X".to_string())),
        ]
        .into_iter()
        .collect();

        let row = record.project(&[
            "Name".to_string(),
            "ID".to_string(),
            "Missing".to_string(),
        ]);

        assert_eq!(
            row.values(),
            &[
                Value::Text("X".to_string()),
                Value::I32(7),
                Value::Null,
            ]
        );
    }
}
