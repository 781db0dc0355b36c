//! Database boundary
//!
//! Every statement the engine emits is a complete SQL string (identifiers quoted,
//! literals escaped by `sql::sanitize`), so the boundary only needs to run text
//! and hand back rows as JSON maps. A transaction implements the same trait and
//! can be passed anywhere a database handle is expected.

use async_trait::async_trait;
use sqlx::mysql::{MySqlPool, MySqlRow};
use sqlx::{Column, MySql, Row, TypeInfo};
use tokio::sync::Mutex;

use crate::config::EngineConfig;
use crate::error::{QueryError, Result};
use crate::record::Record;

/// Outcome of a write statement
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecResult {
    pub rows_affected: u64,
    /// Auto-increment id generated by an `INSERT`, 0 otherwise
    pub last_insert_id: u64,
}

/// A handle statements can be executed against
#[async_trait]
pub trait Database: Send + Sync {
    /// Run a query and decode every row
    async fn fetch(&self, sql: &str) -> Result<Vec<Record>>;

    /// Run a write statement
    async fn execute(&self, sql: &str) -> Result<ExecResult>;
}

/// Run a read, re-issuing it up to `retries` times on a transient error
pub async fn fetch_with_retry(db: &dyn Database, sql: &str, retries: u32) -> Result<Vec<Record>> {
    let mut attempt = 0;
    loop {
        match db.fetch(sql).await {
            Err(e) if e.is_transient() && attempt < retries => {
                attempt += 1;
                tracing::warn!(attempt, error = %e, "Retrying read after transient error");
            }
            other => return other,
        }
    }
}

/// Connection pool for one tenant database
#[derive(Debug, Clone)]
pub struct MySqlDatabase {
    pool: MySqlPool,
}

impl MySqlDatabase {
    /// Connect using the configured database URL
    pub async fn connect(config: &EngineConfig) -> Result<Self> {
        let pool = MySqlPool::connect(&config.database_url)
            .await
            .map_err(|e| QueryError::Connection(format!("Database connection failed: {}", e)))?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool
    pub fn from_pool(pool: MySqlPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &MySqlPool {
        &self.pool
    }

    /// Start a transaction every statement of a mutation can join
    pub async fn begin(&self) -> Result<MySqlTransaction> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| QueryError::sql("BEGIN", e))?;
        Ok(MySqlTransaction {
            tx: Mutex::new(Some(tx)),
        })
    }
}

#[async_trait]
impl Database for MySqlDatabase {
    async fn fetch(&self, sql: &str) -> Result<Vec<Record>> {
        tracing::debug!(sql, "fetch");
        let rows = sqlx::query(sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| QueryError::sql(sql, e))?;
        Ok(rows.iter().map(row_to_record).collect())
    }

    async fn execute(&self, sql: &str) -> Result<ExecResult> {
        tracing::debug!(sql, "execute");
        let result = sqlx::query(sql)
            .execute(&self.pool)
            .await
            .map_err(|e| QueryError::sql(sql, e))?;
        Ok(ExecResult {
            rows_affected: result.rows_affected(),
            last_insert_id: result.last_insert_id(),
        })
    }
}

/// An open transaction
///
/// Statements run sequentially on the transaction's connection. Dropping the
/// handle without committing rolls the transaction back.
#[derive(Debug)]
pub struct MySqlTransaction {
    tx: Mutex<Option<sqlx::Transaction<'static, MySql>>>,
}

impl MySqlTransaction {
    pub async fn commit(&self) -> Result<()> {
        let tx = self.tx.lock().await.take().ok_or_else(finished)?;
        tx.commit().await.map_err(|e| QueryError::sql("COMMIT", e))
    }

    pub async fn rollback(&self) -> Result<()> {
        let tx = self.tx.lock().await.take().ok_or_else(finished)?;
        tx.rollback().await.map_err(|e| QueryError::sql("ROLLBACK", e))
    }
}

fn finished() -> QueryError {
    QueryError::Connection("Transaction already committed or rolled back".to_string())
}

#[async_trait]
impl Database for MySqlTransaction {
    async fn fetch(&self, sql: &str) -> Result<Vec<Record>> {
        tracing::debug!(sql, "fetch (transaction)");
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or_else(finished)?;
        let rows = sqlx::query(sql)
            .fetch_all(&mut **tx)
            .await
            .map_err(|e| QueryError::sql(sql, e))?;
        Ok(rows.iter().map(row_to_record).collect())
    }

    async fn execute(&self, sql: &str) -> Result<ExecResult> {
        tracing::debug!(sql, "execute (transaction)");
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or_else(finished)?;
        let result = sqlx::query(sql)
            .execute(&mut **tx)
            .await
            .map_err(|e| QueryError::sql(sql, e))?;
        Ok(ExecResult {
            rows_affected: result.rows_affected(),
            last_insert_id: result.last_insert_id(),
        })
    }
}

fn row_to_record(row: &MySqlRow) -> Record {
    let mut record = Record::new();
    for column in row.columns() {
        let value = extract_column_value(row, column.ordinal(), column.type_info().name());
        record.insert(column.name().to_string(), value);
    }
    record
}

/// Decode one column by its MySQL type name
fn extract_column_value(row: &MySqlRow, index: usize, type_name: &str) -> serde_json::Value {
    use serde_json::Value;

    match type_name {
        "BOOLEAN" => row
            .try_get::<Option<bool>, _>(index)
            .ok()
            .flatten()
            .map(Value::Bool)
            .unwrap_or(Value::Null),
        "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" | "YEAR" => row
            .try_get::<Option<i64>, _>(index)
            .ok()
            .flatten()
            .map(Value::from)
            .unwrap_or(Value::Null),
        name if name.ends_with("UNSIGNED") => row
            .try_get::<Option<u64>, _>(index)
            .ok()
            .flatten()
            .map(Value::from)
            .unwrap_or(Value::Null),
        "DECIMAL" => {
            use rust_decimal::prelude::ToPrimitive;
            row.try_get::<Option<rust_decimal::Decimal>, _>(index)
                .ok()
                .flatten()
                .and_then(|d| d.to_f64())
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .unwrap_or(Value::Null)
        }
        "FLOAT" | "DOUBLE" => row
            .try_get::<Option<f64>, _>(index)
            .ok()
            .flatten()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        "DATETIME" => row
            .try_get::<Option<chrono::NaiveDateTime>, _>(index)
            .ok()
            .flatten()
            .map(|v| Value::String(v.format("%Y-%m-%d %H:%M:%S").to_string()))
            .unwrap_or(Value::Null),
        "TIMESTAMP" => row
            .try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(index)
            .ok()
            .flatten()
            .map(|v| Value::String(v.to_rfc3339()))
            .unwrap_or(Value::Null),
        "DATE" => row
            .try_get::<Option<chrono::NaiveDate>, _>(index)
            .ok()
            .flatten()
            .map(|v| Value::String(v.to_string()))
            .unwrap_or(Value::Null),
        "JSON" => row
            .try_get::<Option<serde_json::Value>, _>(index)
            .ok()
            .flatten()
            .unwrap_or(Value::Null),
        "BLOB" | "TINYBLOB" | "MEDIUMBLOB" | "LONGBLOB" | "BINARY" | "VARBINARY" => row
            .try_get::<Option<Vec<u8>>, _>(index)
            .ok()
            .flatten()
            .map(|b| Value::String(String::from_utf8_lossy(&b).into_owned()))
            .unwrap_or(Value::Null),
        _ => row
            .try_get::<Option<String>, _>(index)
            .ok()
            .flatten()
            .map(Value::String)
            .unwrap_or(Value::Null),
    }
}
