//! Datasource connectors and their shared contract.
//!
//! A [`Connector`] turns a validated [`TableConfig`] into a [`Connection`],
//! a handle on a per-database pool. Every call on a connection checks out a
//! pooled connection for its own duration and returns it on all exit paths.
//! Connections carry no "current table": the [`TableTarget`] travels with
//! every call.

pub mod config;
pub mod mysql;
pub mod postgres;
pub mod registry;
pub mod schema;
pub mod sql;
pub mod sqlite;

use async_trait::async_trait;
use serde::Serialize;
use std::future::Future;
use std::time::Duration;

use crate::error::{DataError, Result};
use crate::query::{DeleteSpec, InsertSpec, QuerySpec, Record, UpdateSpec, Value};

pub use config::{BackendKind, ServerTableConfig, SqliteTableConfig, TableConfig};
pub use mysql::MySqlConnector;
pub use postgres::PostgresConnector;
pub use registry::{ConnectorRegistry, RegistryBuilder};
pub use schema::{ColumnInfo, TableTarget, TypeFamily};
pub use sqlite::SqliteConnector;

/// Delay before the single retry of a failed connection attempt.
const RETRY_BACKOFF: Duration = Duration::from_millis(200);

/// Pool sizing shared by every connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    /// Maximum connections per database.
    pub max_size: u32,
    /// Time allowed to open or check out a connection.
    pub connect_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_size: 8,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Result of a read: column names plus rows in column order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TableData {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl TableData {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Rows as column-name keyed records.
    pub fn records(&self) -> Vec<Record> {
        self.rows
            .iter()
            .map(|row| self.columns.iter().cloned().zip(row.iter().cloned()).collect())
            .collect()
    }
}

/// Backend implementation registered under one kind tag.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Kind tag this connector accepts.
    fn kind(&self) -> BackendKind;

    /// Check that `config` is a well-formed config of this connector's kind.
    fn validate(&self, config: &TableConfig) -> Result<()> {
        if config.kind() != self.kind() {
            return Err(DataError::ConfigValidation(format!(
                "{} connector cannot serve a {} config",
                self.kind(),
                config.kind()
            )));
        }
        config.validate()
    }

    /// Obtain a handle on the pool serving `config`, creating it on first use.
    async fn connect(&self, config: &TableConfig) -> Result<Box<dyn Connection>>;

    /// Probe connectivity without touching pools or data.
    async fn test_connection(&self, config: &TableConfig) -> bool;

    /// Drop the pool serving `config`, if any.
    async fn close(&self, config: &TableConfig);

    /// Drop every pool.
    async fn shutdown(&self);
}

/// Pooled access to one database.
#[async_trait]
pub trait Connection: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Columns of `table` in declaration order; empty when the table is missing.
    async fn get_schema(&self, table: &str) -> Result<Vec<ColumnInfo>>;

    async fn read(&self, target: &TableTarget, spec: &QuerySpec) -> Result<TableData>;

    async fn begin(&self) -> Result<Box<dyn Transaction>>;

    /// Resolve `table` against its discovered schema.
    async fn describe(&self, table: &str) -> Result<TableTarget> {
        TableTarget::new(table, self.get_schema(table).await?)
    }

    /// Insert in its own transaction, returning the new row's primary key.
    async fn insert(&self, target: &TableTarget, spec: &InsertSpec) -> Result<Value> {
        let mut tx = self.begin().await?;
        let key = tx.insert(target, spec).await?;
        tx.commit().await?;
        Ok(key)
    }

    async fn update(&self, target: &TableTarget, spec: &UpdateSpec) -> Result<u64> {
        let mut tx = self.begin().await?;
        let affected = tx.update(target, spec).await?;
        tx.commit().await?;
        Ok(affected)
    }

    async fn delete(&self, target: &TableTarget, spec: &DeleteSpec) -> Result<u64> {
        let mut tx = self.begin().await?;
        let affected = tx.delete(target, spec).await?;
        tx.commit().await?;
        Ok(affected)
    }
}

/// An open backend transaction.
///
/// Dropping a transaction without committing rolls it back.
#[async_trait]
pub trait Transaction: Send {
    /// Full row with primary key `key`, or `None`.
    async fn fetch_row(&mut self, target: &TableTarget, key: &Value) -> Result<Option<Record>>;

    /// Insert a row and return its primary key.
    async fn insert(&mut self, target: &TableTarget, spec: &InsertSpec) -> Result<Value>;

    async fn update(&mut self, target: &TableTarget, spec: &UpdateSpec) -> Result<u64>;

    async fn delete(&mut self, target: &TableTarget, spec: &DeleteSpec) -> Result<u64>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Run `op`, retrying once after a short backoff if it fails to connect.
pub(crate) async fn with_retry<T, F, Fut>(what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match op().await {
        Err(DataError::Connection(reason)) => {
            tracing::warn!(op = what, %reason, "connection failed, retrying once");
            tokio::time::sleep(RETRY_BACKOFF).await;
            op().await
        }
        other => other,
    }
}

/// Map a sqlx failure onto the error taxonomy by SQLSTATE class.
pub(crate) fn map_sqlx_error(err: sqlx::Error) -> DataError {
    match &err {
        sqlx::Error::Database(db) => match db.code().as_deref().map(|c| c.get(..2)) {
            Some(Some("42")) => DataError::QuerySyntax(db.message().to_string()),
            Some(Some("08" | "28" | "3D")) => DataError::Connection(db.message().to_string()),
            _ => DataError::Backend(db.message().to_string()),
        },
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Configuration(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => DataError::Connection(err.to_string()),
        _ => DataError::Backend(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_retries_connection_errors_once() {
        let calls = AtomicUsize::new(0);
        let result: Result<()> = with_retry("probe", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(DataError::Connection("refused".into())) }
        })
        .await;
        assert!(matches!(result, Err(DataError::Connection(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_with_retry_passes_other_errors_through() {
        let calls = AtomicUsize::new(0);
        let result: Result<()> = with_retry("read", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(DataError::QuerySyntax("bad".into())) }
        })
        .await;
        assert!(matches!(result, Err(DataError::QuerySyntax(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_recovers() {
        let calls = AtomicUsize::new(0);
        let result = with_retry("connect", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(DataError::Connection("reset".into()))
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
    }

    #[test]
    fn test_table_data_records() {
        let data = TableData {
            columns: vec!["id".into(), "name".into()],
            rows: vec![vec![Value::Integer(1), Value::from("Alice")]],
        };
        let records = data.records();
        assert_eq!(records[0].get("name"), Some(&Value::from("Alice")));
    }
}
