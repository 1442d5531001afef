//! Core Execution Engine Traits
//!
//! The engine collaborator receives a fully composed [`Statement`]. Real
//! drivers run `statement.sql()` with `statement.params()`; the in-memory
//! engine evaluates the statement structure directly.

use std::cmp::Ordering;
use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use super::DatabaseBackendType;
use crate::error::{OrmError, OrmResult};
use crate::query::Statement;

/// Execution engine collaborator
#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    /// The SQL dialect this engine speaks
    fn backend(&self) -> DatabaseBackendType;

    /// Run a statement and return its rows
    async fn execute(&self, statement: &Statement) -> OrmResult<Vec<Row>>;

    /// Begin a transaction
    async fn begin_transaction(&self) -> OrmResult<Box<dyn EngineTransaction>>;
}

/// Transaction handle handed out by an engine
#[async_trait]
pub trait EngineTransaction: Send {
    /// Run a statement within the transaction
    async fn execute(&mut self, statement: &Statement) -> OrmResult<Vec<Row>>;

    /// Commit the transaction
    async fn commit(self: Box<Self>) -> OrmResult<()>;

    /// Rollback the transaction
    async fn rollback(self: Box<Self>) -> OrmResult<()>;
}

/// A result row: ordered column labels and their values
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row {
    columns: Vec<String>,
    values: Vec<DatabaseValue>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a row from `(column, value)` pairs
    pub fn from_pairs<I, K>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, DatabaseValue)>,
        K: Into<String>,
    {
        let mut row = Row::new();
        for (column, value) in pairs {
            row.push(column, value);
        }
        row
    }

    /// Append a column, replacing an existing value with the same label
    pub fn push(&mut self, column: impl Into<String>, value: DatabaseValue) {
        let column = column.into();
        if let Some(index) = self.columns.iter().position(|c| *c == column) {
            self.values[index] = value;
        } else {
            self.columns.push(column);
            self.values.push(value);
        }
    }

    /// Get a column value by label
    pub fn get(&self, column: &str) -> Option<&DatabaseValue> {
        self.columns
            .iter()
            .position(|c| c == column)
            .map(|index| &self.values[index])
    }

    /// Get column names
    pub fn column_names(&self) -> &[String] {
        &self.columns
    }

    /// Get column count
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &DatabaseValue)> {
        self.columns
            .iter()
            .map(String::as_str)
            .zip(self.values.iter())
    }

    /// Convert row to JSON value
    pub fn to_json(&self) -> JsonValue {
        let map = self
            .iter()
            .map(|(column, value)| (column.to_string(), value.to_json()))
            .collect::<serde_json::Map<_, _>>();
        JsonValue::Object(map)
    }

    /// Convert row to HashMap
    pub fn to_map(&self) -> HashMap<String, DatabaseValue> {
        self.iter()
            .map(|(column, value)| (column.to_string(), value.clone()))
            .collect()
    }
}

/// Database value enumeration for type-safe parameter binding
#[derive(Debug, Clone, PartialEq)]
pub enum DatabaseValue {
    Null,
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Float64(f64),
    String(String),
    Bytes(Vec<u8>),
    Uuid(uuid::Uuid),
    DateTime(chrono::DateTime<chrono::Utc>),
    Date(chrono::NaiveDate),
    Json(JsonValue),
}

impl DatabaseValue {
    /// Check if the value is null
    pub fn is_null(&self) -> bool {
        matches!(self, DatabaseValue::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            DatabaseValue::Int32(i) => Some(i64::from(*i)),
            DatabaseValue::Int64(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            DatabaseValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Convert to JSON value
    pub fn to_json(&self) -> JsonValue {
        match self {
            DatabaseValue::Null => JsonValue::Null,
            DatabaseValue::Bool(b) => JsonValue::Bool(*b),
            DatabaseValue::Int32(i) => JsonValue::Number(serde_json::Number::from(*i)),
            DatabaseValue::Int64(i) => JsonValue::Number(serde_json::Number::from(*i)),
            DatabaseValue::Float64(f) => serde_json::Number::from_f64(*f)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            DatabaseValue::String(s) => JsonValue::String(s.clone()),
            DatabaseValue::Bytes(b) => JsonValue::Array(
                b.iter()
                    .map(|&x| JsonValue::Number(serde_json::Number::from(x)))
                    .collect(),
            ),
            DatabaseValue::Uuid(u) => JsonValue::String(u.to_string()),
            DatabaseValue::DateTime(dt) => JsonValue::String(dt.to_rfc3339()),
            DatabaseValue::Date(d) => JsonValue::String(d.to_string()),
            DatabaseValue::Json(j) => j.clone(),
        }
    }

    /// Hashable form used for grouping rows by key
    pub fn to_key(&self) -> KeyValue {
        match self {
            DatabaseValue::Null => KeyValue::Null,
            DatabaseValue::Bool(b) => KeyValue::Bool(*b),
            DatabaseValue::Int32(i) => KeyValue::Int(i64::from(*i)),
            DatabaseValue::Int64(i) => KeyValue::Int(*i),
            DatabaseValue::String(s) => KeyValue::Text(s.clone()),
            DatabaseValue::Bytes(b) => KeyValue::Bytes(b.clone()),
            DatabaseValue::Uuid(u) => KeyValue::Uuid(*u),
            DatabaseValue::DateTime(dt) => KeyValue::Text(dt.to_rfc3339()),
            DatabaseValue::Date(d) => KeyValue::Text(d.to_string()),
            DatabaseValue::Float64(f) => KeyValue::Text(f.to_string()),
            DatabaseValue::Json(j) => KeyValue::Text(j.to_string()),
        }
    }

    /// SQL comparison semantics: `None` when either side is NULL or the
    /// types are not comparable
    pub fn compare(&self, other: &DatabaseValue) -> Option<Ordering> {
        use DatabaseValue::*;
        match (self, other) {
            (Null, _) | (_, Null) => None,
            (Bool(a), Bool(b)) => Some(a.cmp(b)),
            (Float64(a), Float64(b)) => a.partial_cmp(b),
            (Float64(a), b) => b.as_i64().and_then(|b| a.partial_cmp(&(b as f64))),
            (a, Float64(b)) => a.as_i64().and_then(|a| (a as f64).partial_cmp(b)),
            (String(a), String(b)) => Some(a.cmp(b)),
            (Bytes(a), Bytes(b)) => Some(a.cmp(b)),
            (Uuid(a), Uuid(b)) => Some(a.cmp(b)),
            (DateTime(a), DateTime(b)) => Some(a.cmp(b)),
            (Date(a), Date(b)) => Some(a.cmp(b)),
            (a, b) => match (a.as_i64(), b.as_i64()) {
                (Some(a), Some(b)) => Some(a.cmp(&b)),
                _ => None,
            },
        }
    }
}

impl std::fmt::Display for DatabaseValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DatabaseValue::Null => write!(f, "NULL"),
            DatabaseValue::String(s) => write!(f, "'{}'", s),
            other => write!(f, "{}", other.to_json()),
        }
    }
}

impl From<i32> for DatabaseValue {
    fn from(value: i32) -> Self {
        DatabaseValue::Int32(value)
    }
}

impl From<i64> for DatabaseValue {
    fn from(value: i64) -> Self {
        DatabaseValue::Int64(value)
    }
}

impl From<f64> for DatabaseValue {
    fn from(value: f64) -> Self {
        DatabaseValue::Float64(value)
    }
}

impl From<bool> for DatabaseValue {
    fn from(value: bool) -> Self {
        DatabaseValue::Bool(value)
    }
}

impl From<&str> for DatabaseValue {
    fn from(value: &str) -> Self {
        DatabaseValue::String(value.to_string())
    }
}

impl From<String> for DatabaseValue {
    fn from(value: String) -> Self {
        DatabaseValue::String(value)
    }
}

impl From<uuid::Uuid> for DatabaseValue {
    fn from(value: uuid::Uuid) -> Self {
        DatabaseValue::Uuid(value)
    }
}

impl From<chrono::DateTime<chrono::Utc>> for DatabaseValue {
    fn from(value: chrono::DateTime<chrono::Utc>) -> Self {
        DatabaseValue::DateTime(value)
    }
}

impl<T: Into<DatabaseValue>> From<Option<T>> for DatabaseValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(DatabaseValue::Null)
    }
}

/// Hashable, normalized key component
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyValue {
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
    Bytes(Vec<u8>),
    Uuid(uuid::Uuid),
}

/// Composite key: one component per key column, in declaration order
pub type KeyTuple = Vec<KeyValue>;

/// Read the key tuple for `columns` through `lookup`; `None` when any
/// component is missing or NULL
pub fn key_tuple<'a, F>(columns: &[String], lookup: F) -> Option<KeyTuple>
where
    F: Fn(&str) -> Option<&'a DatabaseValue>,
{
    columns
        .iter()
        .map(|column| match lookup(column) {
            Some(value) if !value.is_null() => Some(value.to_key()),
            _ => None,
        })
        .collect()
}

/// Convert engine-specific failures into the concurrency errors the
/// planner propagates unchanged
pub fn classify_engine_error(code: Option<&str>, table: Option<&str>, message: String) -> OrmError {
    match code {
        // lock_not_available, query_canceled (lock_timeout)
        Some("55P03") | Some("57014") => OrmError::LockTimeout(message),
        // serialization_failure
        Some("40001") => OrmError::StaleWrite {
            table: table.unwrap_or_default().to_string(),
            detail: message,
        },
        _ => OrmError::Database(message),
    }
}
