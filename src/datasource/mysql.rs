//! MySQL backend on a sqlx pool per database.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use sqlx::mysql::{
    MySql, MySqlArguments, MySqlConnectOptions, MySqlConnection, MySqlPool, MySqlPoolOptions,
    MySqlRow,
};
use sqlx::{Arguments, Column, Connection as _, Row, TypeInfo};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::config::{BackendKind, ServerTableConfig, TableConfig};
use super::schema::{ColumnInfo, TableTarget};
use super::sql::{self, Dialect, Statement};
use super::{map_sqlx_error, with_retry, Connection, Connector, PoolSettings, TableData, Transaction};
use crate::error::{DataError, Result};
use crate::query::{DeleteSpec, InsertSpec, QuerySpec, Record, UpdateSpec, Value};

/// `DATA_TYPE`s decoded without a cast to `CHAR`.
const NATIVE_TYPES: &[&str] = &[
    "tinyint", "smallint", "mediumint", "int", "integer", "bigint", "float", "double", "real",
    "char", "varchar", "tinytext", "text", "mediumtext", "longtext", "binary", "varbinary",
    "tinyblob", "blob", "mediumblob", "longblob", "date", "datetime", "timestamp",
];

const SCHEMA_QUERY: &str = r#"
SELECT CAST(COLUMN_NAME AS CHAR),
       CAST(LOWER(DATA_TYPE) AS CHAR),
       CAST(IS_NULLABLE = 'YES' AS SIGNED),
       CAST(COLUMN_KEY = 'PRI' AS SIGNED),
       CAST(COLUMN_DEFAULT IS NOT NULL OR EXTRA LIKE '%auto_increment%' AS SIGNED)
FROM information_schema.COLUMNS
WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ?
ORDER BY ORDINAL_POSITION
"#;

/// Backtick quoting and positional `?` placeholders.
#[derive(Debug, Clone, Copy, Default)]
pub struct MySqlDialect;

impl Dialect for MySqlDialect {
    fn quote_ident(&self, ident: &str) -> String {
        format!("`{}`", ident.replace('`', "``"))
    }

    fn placeholder(&self, _index: usize) -> String {
        "?".to_string()
    }

    fn like(&self, column: &str, placeholder: &str) -> String {
        format!("{column} LIKE {placeholder}")
    }

    fn insert_defaults(&self, table: &str) -> String {
        format!("INSERT INTO {table} () VALUES ()")
    }

    fn select_column(&self, column: &ColumnInfo) -> String {
        let name = self.quote_ident(&column.name);
        if NATIVE_TYPES.contains(&column.data_type.as_str()) {
            name
        } else {
            format!("CAST({name} AS CHAR) AS {name}")
        }
    }
}

/// Connector for [`TableConfig::MySql`].
pub struct MySqlConnector {
    settings: PoolSettings,
    pools: Mutex<HashMap<String, MySqlPool>>,
}

impl MySqlConnector {
    pub fn new(settings: PoolSettings) -> Self {
        Self {
            settings,
            pools: Mutex::new(HashMap::new()),
        }
    }

    fn pools(&self) -> MutexGuard<'_, HashMap<String, MySqlPool>> {
        self.pools.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn pool_for(&self, config: &TableConfig, params: &ServerTableConfig) -> Result<MySqlPool> {
        let key = config.pool_key();
        let existing = self.pools().get(&key).cloned();
        if let Some(pool) = existing {
            return Ok(pool);
        }

        let pool = MySqlPoolOptions::new()
            .max_connections(self.settings.max_size)
            .acquire_timeout(self.settings.connect_timeout)
            .connect_with(connect_options(params))
            .await
            .map_err(|e| DataError::Connection(e.to_string()))?;

        let pool = self.pools().entry(key).or_insert(pool).clone();
        Ok(pool)
    }
}

impl Default for MySqlConnector {
    fn default() -> Self {
        Self::new(PoolSettings::default())
    }
}

fn mysql_params(config: &TableConfig) -> Result<&ServerTableConfig> {
    match config {
        TableConfig::MySql(params) => Ok(params),
        other => Err(DataError::ConfigValidation(format!(
            "mysql connector cannot serve a {} config",
            other.kind()
        ))),
    }
}

fn connect_options(params: &ServerTableConfig) -> MySqlConnectOptions {
    MySqlConnectOptions::new()
        .host(&params.host)
        .port(params.port)
        .username(&params.user)
        .password(&params.password)
        .database(&params.database)
}

fn arguments(params: &[Value]) -> Result<MySqlArguments> {
    let mut args = MySqlArguments::default();
    for value in params {
        let added = match value {
            Value::Null => args.add(Option::<String>::None),
            Value::Bool(b) => args.add(*b),
            Value::Integer(i) => args.add(*i),
            Value::Real(r) => args.add(*r),
            Value::Text(s) => args.add(s.clone()),
            Value::Blob(b) => args.add(b.clone()),
        };
        added.map_err(|e| DataError::Backend(format!("failed to bind parameter: {e}")))?;
    }
    Ok(args)
}

fn get<'r, T>(row: &'r MySqlRow, idx: usize) -> Result<Option<T>>
where
    T: sqlx::Decode<'r, MySql> + sqlx::Type<MySql>,
{
    row.try_get::<Option<T>, _>(idx).map_err(map_sqlx_error)
}

/// Text columns flagged binary by their collation arrive as bytes.
fn text_or_bytes(row: &MySqlRow, idx: usize) -> Result<Option<Value>> {
    match row.try_get::<Option<String>, _>(idx) {
        Ok(text) => Ok(text.map(Value::Text)),
        Err(_) => Ok(get::<Vec<u8>>(row, idx)?
            .map(|bytes| Value::Text(String::from_utf8_lossy(&bytes).into_owned()))),
    }
}

fn decode_value(row: &MySqlRow, idx: usize) -> Result<Value> {
    let type_name = row.columns()[idx].type_info().name().to_string();
    let value = match type_name.as_str() {
        "BOOLEAN" => get::<bool>(row, idx)?.map(Value::Bool),
        name if name.ends_with("UNSIGNED") => get::<u64>(row, idx)?.map(|v| {
            i64::try_from(v).map_or_else(|_| Value::Text(v.to_string()), Value::Integer)
        }),
        "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" => {
            get::<i64>(row, idx)?.map(Value::Integer)
        }
        "FLOAT" => get::<f32>(row, idx)?.map(|v| Value::Real(v.into())),
        "DOUBLE" => get::<f64>(row, idx)?.map(Value::Real),
        "DATE" => get::<NaiveDate>(row, idx)?.map(|v| Value::Text(v.to_string())),
        "DATETIME" => get::<NaiveDateTime>(row, idx)?.map(|v| Value::Text(v.to_string())),
        "TIMESTAMP" => get::<DateTime<Utc>>(row, idx)?.map(|v| Value::Text(v.to_rfc3339())),
        "BINARY" | "VARBINARY" | "TINYBLOB" | "BLOB" | "MEDIUMBLOB" | "LONGBLOB" => {
            get::<Vec<u8>>(row, idx)?.map(Value::Blob)
        }
        _ => text_or_bytes(row, idx)?,
    };
    Ok(value.unwrap_or(Value::Null))
}

fn decode_row(row: &MySqlRow) -> Result<Vec<Value>> {
    (0..row.len()).map(|idx| decode_value(row, idx)).collect()
}

#[async_trait]
impl Connector for MySqlConnector {
    fn kind(&self) -> BackendKind {
        BackendKind::MySql
    }

    async fn connect(&self, config: &TableConfig) -> Result<Box<dyn Connection>> {
        let params = mysql_params(config)?;
        let pool = with_retry("connect", || self.pool_for(config, params)).await?;
        tracing::debug!(host = %params.host, database = %params.database, "mysql pool ready");
        Ok(Box::new(MySqlConnectionHandle { pool }))
    }

    async fn test_connection(&self, config: &TableConfig) -> bool {
        let Ok(params) = mysql_params(config) else {
            return false;
        };
        let options = connect_options(params);
        let probe = async {
            let mut conn = MySqlConnection::connect_with(&options).await?;
            conn.ping().await?;
            conn.close().await
        };

        match tokio::time::timeout(self.settings.connect_timeout, probe).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::debug!(error = %e, "mysql connection probe failed");
                false
            }
            Err(_) => {
                tracing::debug!("mysql connection probe timed out");
                false
            }
        }
    }

    async fn close(&self, config: &TableConfig) {
        let pool = self.pools().remove(&config.pool_key());
        if let Some(pool) = pool {
            pool.close().await;
            tracing::debug!(pool = %config.pool_key(), "mysql pool closed");
        }
    }

    async fn shutdown(&self) {
        let pools = std::mem::take(&mut *self.pools());
        for pool in pools.into_values() {
            pool.close().await;
        }
    }
}

/// Handle on one database's pool.
pub struct MySqlConnectionHandle {
    pool: MySqlPool,
}

impl MySqlConnectionHandle {
    async fn fetch(&self, stmt: &Statement) -> Result<Vec<Vec<Value>>> {
        let rows = sqlx::query_with(&stmt.sql, arguments(&stmt.params)?)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        rows.iter().map(decode_row).collect()
    }
}

#[async_trait]
impl Connection for MySqlConnectionHandle {
    fn kind(&self) -> BackendKind {
        BackendKind::MySql
    }

    async fn get_schema(&self, table: &str) -> Result<Vec<ColumnInfo>> {
        let rows = with_retry("schema", move || async move {
            sqlx::query(SCHEMA_QUERY)
                .bind(table)
                .fetch_all(&self.pool)
                .await
                .map_err(map_sqlx_error)
        })
        .await?;

        rows.iter()
            .map(|row| -> Result<ColumnInfo> {
                Ok(ColumnInfo {
                    name: row.try_get(0).map_err(map_sqlx_error)?,
                    data_type: row.try_get(1).map_err(map_sqlx_error)?,
                    nullable: row.try_get::<i64, _>(2).map_err(map_sqlx_error)? != 0,
                    is_primary_key: row.try_get::<i64, _>(3).map_err(map_sqlx_error)? != 0,
                    has_default: row.try_get::<i64, _>(4).map_err(map_sqlx_error)? != 0,
                })
            })
            .collect()
    }

    async fn read(&self, target: &TableTarget, spec: &QuerySpec) -> Result<TableData> {
        let stmt = sql::select(&MySqlDialect, target, spec)?;
        let rows = with_retry("read", || self.fetch(&stmt)).await?;
        Ok(TableData {
            columns: target.column_names(),
            rows,
        })
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        let tx = with_retry("begin", move || async move {
            self.pool.begin().await.map_err(map_sqlx_error)
        })
        .await?;
        Ok(Box::new(MySqlTransaction { tx }))
    }
}

pub struct MySqlTransaction {
    tx: sqlx::Transaction<'static, MySql>,
}

impl MySqlTransaction {
    async fn fetch(&mut self, stmt: &Statement) -> Result<Vec<Vec<Value>>> {
        let rows = sqlx::query_with(&stmt.sql, arguments(&stmt.params)?)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?;
        rows.iter().map(decode_row).collect()
    }

    async fn execute(&mut self, stmt: &Statement) -> Result<sqlx::mysql::MySqlQueryResult> {
        sqlx::query_with(&stmt.sql, arguments(&stmt.params)?)
            .execute(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)
    }
}

#[async_trait]
impl Transaction for MySqlTransaction {
    async fn fetch_row(&mut self, target: &TableTarget, key: &Value) -> Result<Option<Record>> {
        let stmt = sql::select_row(&MySqlDialect, target, key)?;
        let mut rows = self.fetch(&stmt).await?;
        Ok(rows
            .pop()
            .map(|row| target.column_names().into_iter().zip(row).collect()))
    }

    async fn insert(&mut self, target: &TableTarget, spec: &InsertSpec) -> Result<Value> {
        let stmt = sql::insert(&MySqlDialect, target, spec)?;
        let pk = target.primary_key()?;
        let provided = spec
            .values()
            .get(&pk.name)
            .map(|v| pk.coerce(v.clone()))
            .filter(|v| !v.is_null());

        let result = self.execute(&stmt).await?;
        match provided {
            Some(key) => Ok(key),
            None => i64::try_from(result.last_insert_id())
                .map(Value::Integer)
                .map_err(|_| DataError::Backend("generated key out of range".into())),
        }
    }

    async fn update(&mut self, target: &TableTarget, spec: &UpdateSpec) -> Result<u64> {
        let stmt = sql::update(&MySqlDialect, target, spec)?;
        Ok(self.execute(&stmt).await?.rows_affected())
    }

    async fn delete(&mut self, target: &TableTarget, spec: &DeleteSpec) -> Result<u64> {
        let stmt = sql::delete(&MySqlDialect, target, spec)?;
        Ok(self.execute(&stmt).await?.rows_affected())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await.map_err(map_sqlx_error)
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await.map_err(map_sqlx_error)
    }
}
