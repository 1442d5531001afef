//! PostgreSQL Engine
//!
//! Runs rendered statements through a `sqlx` connection pool. Database
//! errors carrying a lock or serialization SQLSTATE are reported as
//! `LockTimeout` / `StaleWrite` so they reach the caller unchanged.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgArguments, PgPoolOptions, PgRow};
use sqlx::{Column, PgPool, Postgres, Row as SqlxRow, TypeInfo};

use super::core::{classify_engine_error, DatabaseValue, EngineTransaction, ExecutionEngine, Row};
use super::DatabaseBackendType;
use crate::error::{OrmError, OrmResult};
use crate::query::Statement;

type PgQuery<'q> = sqlx::query::Query<'q, Postgres, PgArguments>;

/// Execution engine backed by a PostgreSQL pool
#[derive(Debug, Clone)]
pub struct PostgresEngine {
    pool: PgPool,
}

impl PostgresEngine {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect a pool with at most `max_connections` connections
    pub async fn connect(database_url: &str, max_connections: u32) -> OrmResult<Self> {
        if !database_url.starts_with("postgresql://") && !database_url.starts_with("postgres://") {
            return Err(OrmError::Configuration(format!(
                "Invalid PostgreSQL URL scheme: {}",
                database_url
            )));
        }

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| OrmError::Database(format!("Failed to create PostgreSQL pool: {}", e)))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl ExecutionEngine for PostgresEngine {
    fn backend(&self) -> DatabaseBackendType {
        DatabaseBackendType::PostgreSQL
    }

    async fn execute(&self, statement: &Statement) -> OrmResult<Vec<Row>> {
        let sql = statement.sql();
        let params = statement.params();
        let rows = bind_all(sqlx::query(&sql), &params)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| engine_error(e, &statement.table))?;
        rows.iter().map(convert_row).collect()
    }

    async fn begin_transaction(&self) -> OrmResult<Box<dyn EngineTransaction>> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| OrmError::Transaction(format!("Failed to begin transaction: {}", e)))?;
        Ok(Box::new(PostgresTransaction { tx: Some(tx) }))
    }
}

/// Open PostgreSQL transaction
pub struct PostgresTransaction {
    tx: Option<sqlx::Transaction<'static, Postgres>>,
}

impl PostgresTransaction {
    fn active(&mut self) -> OrmResult<&mut sqlx::Transaction<'static, Postgres>> {
        self.tx
            .as_mut()
            .ok_or_else(|| OrmError::Transaction("Transaction already completed".to_string()))
    }
}

#[async_trait]
impl EngineTransaction for PostgresTransaction {
    async fn execute(&mut self, statement: &Statement) -> OrmResult<Vec<Row>> {
        let sql = statement.sql();
        let params = statement.params();
        let tx = self.active()?;
        let rows = bind_all(sqlx::query(&sql), &params)
            .fetch_all(&mut **tx)
            .await
            .map_err(|e| engine_error(e, &statement.table))?;
        rows.iter().map(convert_row).collect()
    }

    async fn commit(mut self: Box<Self>) -> OrmResult<()> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| OrmError::Transaction("Transaction already completed".to_string()))?;
        tx.commit()
            .await
            .map_err(|e| OrmError::Transaction(format!("Transaction commit failed: {}", e)))
    }

    async fn rollback(mut self: Box<Self>) -> OrmResult<()> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| OrmError::Transaction("Transaction already completed".to_string()))?;
        tx.rollback()
            .await
            .map_err(|e| OrmError::Transaction(format!("Transaction rollback failed: {}", e)))
    }
}

fn engine_error(err: sqlx::Error, table: &str) -> OrmError {
    if let sqlx::Error::Database(db) = &err {
        let code = db.code();
        let table = db.table().unwrap_or(table);
        return classify_engine_error(code.as_deref(), Some(table), db.message().to_string());
    }
    OrmError::from(err)
}

fn bind_all<'q>(mut query: PgQuery<'q>, params: &[DatabaseValue]) -> PgQuery<'q> {
    for param in params {
        query = bind_value(query, param);
    }
    query
}

fn bind_value<'q>(query: PgQuery<'q>, value: &DatabaseValue) -> PgQuery<'q> {
    match value {
        DatabaseValue::Null => query.bind(Option::<String>::None),
        DatabaseValue::Bool(b) => query.bind(*b),
        DatabaseValue::Int32(i) => query.bind(*i),
        DatabaseValue::Int64(i) => query.bind(*i),
        DatabaseValue::Float64(f) => query.bind(*f),
        DatabaseValue::String(s) => query.bind(s.clone()),
        DatabaseValue::Bytes(b) => query.bind(b.clone()),
        DatabaseValue::Uuid(u) => query.bind(*u),
        DatabaseValue::DateTime(dt) => query.bind(*dt),
        DatabaseValue::Date(d) => query.bind(*d),
        DatabaseValue::Json(j) => query.bind(j.clone()),
    }
}

fn convert_row(row: &PgRow) -> OrmResult<Row> {
    let mut converted = Row::new();
    for (index, column) in row.columns().iter().enumerate() {
        converted.push(column.name(), column_value(row, index)?);
    }
    Ok(converted)
}

fn column_value(row: &PgRow, index: usize) -> OrmResult<DatabaseValue> {
    let type_name = row.columns()[index].type_info().name().to_string();
    let fetch_error = |e: sqlx::Error| {
        OrmError::Database(format!("Failed to decode {} column {}: {}", type_name, index, e))
    };

    let value: DatabaseValue = match type_name.as_str() {
        "BOOL" => row.try_get::<Option<bool>, _>(index).map_err(fetch_error)?.into(),
        "INT2" => row
            .try_get::<Option<i16>, _>(index)
            .map_err(fetch_error)?
            .map(i32::from)
            .into(),
        "INT4" => row.try_get::<Option<i32>, _>(index).map_err(fetch_error)?.into(),
        "INT8" => row.try_get::<Option<i64>, _>(index).map_err(fetch_error)?.into(),
        "FLOAT4" => row
            .try_get::<Option<f32>, _>(index)
            .map_err(fetch_error)?
            .map(f64::from)
            .into(),
        "FLOAT8" => row.try_get::<Option<f64>, _>(index).map_err(fetch_error)?.into(),
        "BYTEA" => row
            .try_get::<Option<Vec<u8>>, _>(index)
            .map_err(fetch_error)?
            .map(DatabaseValue::Bytes)
            .unwrap_or(DatabaseValue::Null),
        "UUID" => row.try_get::<Option<uuid::Uuid>, _>(index).map_err(fetch_error)?.into(),
        "TIMESTAMPTZ" => row
            .try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(index)
            .map_err(fetch_error)?
            .into(),
        "TIMESTAMP" => row
            .try_get::<Option<chrono::NaiveDateTime>, _>(index)
            .map_err(fetch_error)?
            .map(|dt| chrono::DateTime::<chrono::Utc>::from_naive_utc_and_offset(dt, chrono::Utc))
            .into(),
        "DATE" => row
            .try_get::<Option<chrono::NaiveDate>, _>(index)
            .map_err(fetch_error)?
            .map(DatabaseValue::Date)
            .unwrap_or(DatabaseValue::Null),
        "JSON" | "JSONB" => row
            .try_get::<Option<JsonValue>, _>(index)
            .map_err(fetch_error)?
            .map(DatabaseValue::Json)
            .unwrap_or(DatabaseValue::Null),
        // TEXT, VARCHAR and anything else readable as text
        _ => row.try_get::<Option<String>, _>(index).map_err(fetch_error)?.into(),
    };

    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_database_errors_stay_generic() {
        let err = engine_error(sqlx::Error::RowNotFound, "students");
        assert!(matches!(err, OrmError::Database(_)));
    }

    #[tokio::test]
    async fn test_connect_rejects_foreign_scheme() {
        let err = PostgresEngine::connect("mysql://localhost/school", 1)
            .await
            .unwrap_err();
        assert!(matches!(err, OrmError::Configuration(_)));
    }
}
