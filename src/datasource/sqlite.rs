//! Embedded-file backend on rusqlite with an r2d2 pool per database file.
//!
//! rusqlite is synchronous, so every call runs on the blocking thread pool.
//! Files are opened read-write but never created: a missing path is a
//! connection failure, not an empty database.

use async_trait::async_trait;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params_from_iter, ErrorCode, OpenFlags};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::config::{BackendKind, SqliteTableConfig, TableConfig};
use super::schema::{ColumnInfo, TableTarget};
use super::sql::{self, Dialect, Statement};
use super::{with_retry, Connection, Connector, PoolSettings, TableData, Transaction};
use crate::error::{DataError, Result};
use crate::query::{DeleteSpec, InsertSpec, QuerySpec, Record, UpdateSpec, Value};

type SqlitePool = Pool<SqliteConnectionManager>;
type SqlitePooled = PooledConnection<SqliteConnectionManager>;

/// SQLite identifier quoting, `?NNN` placeholders and backslash LIKE escapes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDialect;

impl Dialect for SqliteDialect {
    fn quote_ident(&self, ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    fn placeholder(&self, index: usize) -> String {
        format!("?{index}")
    }

    fn like(&self, column: &str, placeholder: &str) -> String {
        format!("{column} LIKE {placeholder} ESCAPE '\\'")
    }
}

/// Connector for [`TableConfig::Sqlite`].
pub struct SqliteConnector {
    settings: PoolSettings,
    pools: Mutex<HashMap<String, SqlitePool>>,
}

impl SqliteConnector {
    pub fn new(settings: PoolSettings) -> Self {
        Self {
            settings,
            pools: Mutex::new(HashMap::new()),
        }
    }

    fn pools(&self) -> MutexGuard<'_, HashMap<String, SqlitePool>> {
        self.pools.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn pool_for(&self, config: &TableConfig, params: &SqliteTableConfig) -> Result<SqlitePool> {
        let key = config.pool_key();
        let existing = self.pools().get(&key).cloned();
        if let Some(pool) = existing {
            return Ok(pool);
        }

        let path = params.path.clone();
        let settings = self.settings;
        let pool = blocking(move || open_pool(&path, settings)).await?;

        // Another task may have raced us to the same file; keep the first pool.
        let pool = self.pools().entry(key).or_insert(pool).clone();
        Ok(pool)
    }
}

impl Default for SqliteConnector {
    fn default() -> Self {
        Self::new(PoolSettings::default())
    }
}

fn sqlite_params(config: &TableConfig) -> Result<&SqliteTableConfig> {
    match config {
        TableConfig::Sqlite(params) => Ok(params),
        other => Err(DataError::ConfigValidation(format!(
            "sqlite connector cannot serve a {} config",
            other.kind()
        ))),
    }
}

fn open_pool(path: &Path, settings: PoolSettings) -> Result<SqlitePool> {
    if !path.exists() {
        return Err(DataError::Connection(format!(
            "database file {} does not exist",
            path.display()
        )));
    }

    let manager = SqliteConnectionManager::file(path)
        .with_flags(OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX);

    Pool::builder()
        .max_size(settings.max_size)
        .connection_timeout(settings.connect_timeout)
        .connection_customizer(Box::new(BackendConnectionCustomizer))
        .build(manager)
        .map_err(|e| DataError::Connection(e.to_string()))
}

/// Connection customizer applied to every pooled backend connection.
#[derive(Debug)]
struct BackendConnectionCustomizer;

impl r2d2::CustomizeConnection<rusqlite::Connection, rusqlite::Error>
    for BackendConnectionCustomizer
{
    fn on_acquire(&self, conn: &mut rusqlite::Connection) -> Result<(), rusqlite::Error> {
        conn.execute_batch(
            "PRAGMA busy_timeout = 5000;
             PRAGMA foreign_keys = ON;",
        )
    }
}

/// Run a synchronous closure on the blocking pool.
async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| DataError::Backend(format!("blocking task failed: {e}")))?
}

fn checkout(pool: &SqlitePool) -> Result<SqlitePooled> {
    pool.get().map_err(|e| DataError::Connection(e.to_string()))
}

fn map_sqlite_error(err: rusqlite::Error) -> DataError {
    match &err {
        rusqlite::Error::SqliteFailure(failure, message) => {
            let message = message.clone().unwrap_or_else(|| failure.to_string());
            match failure.code {
                ErrorCode::CannotOpen
                | ErrorCode::NotADatabase
                | ErrorCode::SystemIoFailure
                | ErrorCode::PermissionDenied => DataError::Connection(message),
                ErrorCode::Unknown => DataError::QuerySyntax(message),
                _ => DataError::Backend(message),
            }
        }
        _ => DataError::Backend(err.to_string()),
    }
}

fn query_rows(conn: &rusqlite::Connection, stmt: &Statement) -> Result<Vec<Vec<Value>>> {
    let mut prepared = conn.prepare(&stmt.sql).map_err(map_sqlite_error)?;
    let width = prepared.column_count();
    let rows = prepared
        .query_map(params_from_iter(stmt.params.iter()), |row| {
            (0..width)
                .map(|i| row.get_ref(i).map(Value::from))
                .collect::<rusqlite::Result<Vec<_>>>()
        })
        .map_err(map_sqlite_error)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(map_sqlite_error)?;
    Ok(rows)
}

fn execute(conn: &rusqlite::Connection, stmt: &Statement) -> Result<u64> {
    let affected = conn
        .execute(&stmt.sql, params_from_iter(stmt.params.iter()))
        .map_err(map_sqlite_error)?;
    Ok(affected as u64)
}

fn read_schema(conn: &rusqlite::Connection, table: &str) -> Result<Vec<ColumnInfo>> {
    let mut stmt = conn
        .prepare(
            r#"SELECT name, type, "notnull", dflt_value IS NOT NULL, pk
               FROM pragma_table_info(?1)
               ORDER BY cid"#,
        )
        .map_err(map_sqlite_error)?;
    let mut columns = stmt
        .query_map([table], |row| {
            Ok(ColumnInfo {
                name: row.get(0)?,
                data_type: row.get(1)?,
                nullable: row.get::<_, i64>(2)? == 0,
                has_default: row.get(3)?,
                is_primary_key: row.get::<_, i64>(4)? > 0,
            })
        })
        .map_err(map_sqlite_error)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(map_sqlite_error)?;

    // pragma_table_info reports key columns as nullable. Only a lone
    // INTEGER PRIMARY KEY aliases the rowid and gets a value assigned.
    let keys = columns.iter().filter(|c| c.is_primary_key).count();
    for column in columns.iter_mut().filter(|c| c.is_primary_key) {
        column.nullable = false;
        if keys == 1 && column.data_type.eq_ignore_ascii_case("INTEGER") {
            column.has_default = true;
        }
    }
    Ok(columns)
}

#[async_trait]
impl Connector for SqliteConnector {
    fn kind(&self) -> BackendKind {
        BackendKind::Sqlite
    }

    async fn connect(&self, config: &TableConfig) -> Result<Box<dyn Connection>> {
        let params = sqlite_params(config)?;
        let pool = with_retry("connect", || self.pool_for(config, params)).await?;
        tracing::debug!(path = %params.path.display(), "sqlite pool ready");
        Ok(Box::new(SqliteConnection { pool }))
    }

    async fn test_connection(&self, config: &TableConfig) -> bool {
        let Ok(params) = sqlite_params(config) else {
            return false;
        };
        let path = params.path.clone();
        let probe = blocking(move || {
            let conn = rusqlite::Connection::open_with_flags(
                &path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )
            .map_err(map_sqlite_error)?;
            conn.query_row("SELECT count(*) FROM sqlite_master", [], |row| {
                row.get::<_, i64>(0)
            })
            .map_err(map_sqlite_error)
        })
        .await;

        match probe {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!(error = %e, "sqlite connection probe failed");
                false
            }
        }
    }

    async fn close(&self, config: &TableConfig) {
        if self.pools().remove(&config.pool_key()).is_some() {
            tracing::debug!(pool = %config.pool_key(), "sqlite pool closed");
        }
    }

    async fn shutdown(&self) {
        let closed = std::mem::take(&mut *self.pools()).len();
        tracing::debug!(closed, "sqlite pools closed");
    }
}

/// Handle on one database file's pool.
pub struct SqliteConnection {
    pool: SqlitePool,
}

#[async_trait]
impl Connection for SqliteConnection {
    fn kind(&self) -> BackendKind {
        BackendKind::Sqlite
    }

    async fn get_schema(&self, table: &str) -> Result<Vec<ColumnInfo>> {
        with_retry("schema", || {
            let pool = self.pool.clone();
            let table = table.to_string();
            blocking(move || read_schema(&*checkout(&pool)?, &table))
        })
        .await
    }

    async fn read(&self, target: &TableTarget, spec: &QuerySpec) -> Result<TableData> {
        let stmt = sql::select(&SqliteDialect, target, spec)?;
        let rows = with_retry("read", || {
            let pool = self.pool.clone();
            let stmt = stmt.clone();
            blocking(move || query_rows(&*checkout(&pool)?, &stmt))
        })
        .await?;
        Ok(TableData {
            columns: target.column_names(),
            rows,
        })
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        let guard = with_retry("begin", || {
            let pool = self.pool.clone();
            blocking(move || {
                let conn = checkout(&pool)?;
                conn.execute_batch("BEGIN IMMEDIATE")
                    .map_err(map_sqlite_error)?;
                Ok(TxGuard { conn })
            })
        })
        .await?;
        Ok(Box::new(SqliteTransaction { guard: Some(guard) }))
    }
}

/// Pooled connection inside an open transaction; rolls back if dropped open.
struct TxGuard {
    conn: SqlitePooled,
}

impl Drop for TxGuard {
    fn drop(&mut self) {
        if !self.conn.is_autocommit() {
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                tracing::warn!(error = %e, "failed to roll back abandoned sqlite transaction");
            }
        }
    }
}

pub struct SqliteTransaction {
    guard: Option<TxGuard>,
}

impl SqliteTransaction {
    /// Run `f` against the transaction's connection on the blocking pool.
    async fn run<T, F>(&mut self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&rusqlite::Connection) -> Result<T> + Send + 'static,
    {
        let guard = self
            .guard
            .take()
            .ok_or_else(|| DataError::Backend("transaction already finished".into()))?;
        let (guard, result) = blocking(move || {
            let result = f(&guard.conn);
            Ok((guard, result))
        })
        .await?;
        self.guard = Some(guard);
        result
    }
}

#[async_trait]
impl Transaction for SqliteTransaction {
    async fn fetch_row(&mut self, target: &TableTarget, key: &Value) -> Result<Option<Record>> {
        let stmt = sql::select_row(&SqliteDialect, target, key)?;
        let names = target.column_names();
        let mut rows = self.run(move |conn| query_rows(conn, &stmt)).await?;
        Ok(rows
            .pop()
            .map(|row| names.into_iter().zip(row).collect()))
    }

    async fn insert(&mut self, target: &TableTarget, spec: &InsertSpec) -> Result<Value> {
        let stmt = sql::insert(&SqliteDialect, target, spec)?;
        let pk = target.primary_key()?;
        let provided = spec
            .values()
            .get(&pk.name)
            .map(|v| pk.coerce(v.clone()))
            .filter(|v| !v.is_null());

        self.run(move |conn| {
            execute(conn, &stmt)?;
            Ok(provided.unwrap_or_else(|| Value::Integer(conn.last_insert_rowid())))
        })
        .await
    }

    async fn update(&mut self, target: &TableTarget, spec: &UpdateSpec) -> Result<u64> {
        let stmt = sql::update(&SqliteDialect, target, spec)?;
        self.run(move |conn| execute(conn, &stmt)).await
    }

    async fn delete(&mut self, target: &TableTarget, spec: &DeleteSpec) -> Result<u64> {
        let stmt = sql::delete(&SqliteDialect, target, spec)?;
        self.run(move |conn| execute(conn, &stmt)).await
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        self.run(|conn| conn.execute_batch("COMMIT").map_err(map_sqlite_error))
            .await
    }

    async fn rollback(mut self: Box<Self>) -> Result<()> {
        self.run(|conn| conn.execute_batch("ROLLBACK").map_err(map_sqlite_error))
            .await
    }
}
