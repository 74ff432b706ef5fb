//! Backend-neutral statement parameters and result rows.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DbError, DbResult};

/// A statement parameter or column value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// SQL NULL.
    Null,
    /// Boolean.
    Bool(bool),
    /// Integer (all widths).
    Int(i64),
    /// Floating point.
    Float(f64),
    /// Text.
    Text(String),
    /// JSON document.
    Json(serde_json::Value),
    /// UUID.
    Uuid(uuid::Uuid),
    /// Timestamp with time zone.
    Timestamp(DateTime<Utc>),
}

impl Value {
    /// Check if this is NULL.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Get the value as an integer.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Get the value as text.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Get the value as a boolean.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Name of the variant, for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Text(_) => "text",
            Self::Json(_) => "json",
            Self::Uuid(_) => "uuid",
            Self::Timestamp(_) => "timestamp",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Bool(b) => write!(f, "{}", b),
            Self::Int(i) => write!(f, "{}", i),
            Self::Float(x) => write!(f, "{}", x),
            Self::Text(s) => write!(f, "{}", s),
            Self::Json(j) => write!(f, "{}", j),
            Self::Uuid(u) => write!(f, "{}", u),
            Self::Timestamp(t) => write!(f, "{}", t.to_rfc3339()),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Self::Int(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Self::Float(x)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<serde_json::Value> for Value {
    fn from(j: serde_json::Value) -> Self {
        Self::Json(j)
    }
}

impl From<uuid::Uuid> for Value {
    fn from(u: uuid::Uuid) -> Self {
        Self::Uuid(u)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(t: DateTime<Utc>) -> Self {
        Self::Timestamp(t)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

/// Conversion from a column [`Value`].
pub trait FromValue: Sized {
    /// Convert, failing on a type mismatch.
    fn from_value(value: &Value) -> DbResult<Self>;
}

fn mismatch(expected: &str, value: &Value) -> DbError {
    DbError::other(format!("expected {}, found {}", expected, value.type_name()))
}

impl FromValue for Value {
    fn from_value(value: &Value) -> DbResult<Self> {
        Ok(value.clone())
    }
}

impl FromValue for i64 {
    fn from_value(value: &Value) -> DbResult<Self> {
        value.as_i64().ok_or_else(|| mismatch("int", value))
    }
}

impl FromValue for bool {
    fn from_value(value: &Value) -> DbResult<Self> {
        value.as_bool().ok_or_else(|| mismatch("bool", value))
    }
}

impl FromValue for f64 {
    fn from_value(value: &Value) -> DbResult<Self> {
        match value {
            Value::Float(x) => Ok(*x),
            Value::Int(i) => Ok(*i as f64),
            other => Err(mismatch("float", other)),
        }
    }
}

impl FromValue for String {
    fn from_value(value: &Value) -> DbResult<Self> {
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| mismatch("text", value))
    }
}

impl FromValue for uuid::Uuid {
    fn from_value(value: &Value) -> DbResult<Self> {
        match value {
            Value::Uuid(u) => Ok(*u),
            other => Err(mismatch("uuid", other)),
        }
    }
}

impl FromValue for DateTime<Utc> {
    fn from_value(value: &Value) -> DbResult<Self> {
        match value {
            Value::Timestamp(t) => Ok(*t),
            other => Err(mismatch("timestamp", other)),
        }
    }
}

impl FromValue for serde_json::Value {
    fn from_value(value: &Value) -> DbResult<Self> {
        match value {
            Value::Json(j) => Ok(j.clone()),
            other => Err(mismatch("json", other)),
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: &Value) -> DbResult<Self> {
        if value.is_null() {
            Ok(None)
        } else {
            T::from_value(value).map(Some)
        }
    }
}

/// A result row.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<Value>,
}

impl Row {
    /// Create a row. Column names are shared between rows of one result.
    pub fn new(columns: Arc<[String]>, values: Vec<Value>) -> Self {
        Self { columns, values }
    }

    /// Column names.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Values, in column order.
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Check if the row has no columns.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Get a value by column name.
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c == column)
            .and_then(|i| self.values.get(i))
    }

    /// Get a value by position.
    pub fn get_index(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Get and convert a value by column name.
    pub fn try_get<T: FromValue>(&self, column: &str) -> DbResult<T> {
        let value = self
            .get(column)
            .ok_or_else(|| DbError::undefined(format!("no column named '{}'", column)))?;
        T::from_value(value)
            .map_err(|e| DbError::other(format!("failed to get column '{}': {}", column, e.message)))
    }
}
