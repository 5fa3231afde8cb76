//! PostgreSQL backend on a sqlx pool per database.
//!
//! Column types come from `udt_name`. Columns sqlx cannot decode natively
//! are read as text, and text bound against a non-text column is cast to the
//! column's type so that uuid, json, enum and timestamp columns accept it.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use sqlx::postgres::{
    PgArguments, PgConnectOptions, PgConnection, PgPool, PgPoolOptions, PgRow, Postgres,
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

/// Types decoded without a text cast.
const NATIVE_TYPES: &[&str] = &[
    "bool", "int2", "int4", "int8", "float4", "float8", "bytea", "text", "varchar", "bpchar",
    "name", "date", "time", "timestamp", "timestamptz",
];

/// Types that accept a text parameter without a cast.
const TEXT_TYPES: &[&str] = &["text", "varchar", "bpchar", "name"];

const SCHEMA_QUERY: &str = r#"
SELECT c.column_name::text,
       c.udt_name::text,
       c.is_nullable = 'YES',
       EXISTS (
           SELECT 1
           FROM information_schema.table_constraints tc
           JOIN information_schema.key_column_usage k
             ON k.constraint_name = tc.constraint_name
            AND k.table_schema = tc.table_schema
            AND k.table_name = tc.table_name
           WHERE tc.constraint_type = 'PRIMARY KEY'
             AND tc.table_schema = c.table_schema
             AND tc.table_name = c.table_name
             AND k.column_name = c.column_name
       ),
       c.column_default IS NOT NULL OR c.is_identity = 'YES'
FROM information_schema.columns c
WHERE c.table_schema = current_schema() AND c.table_name = $1
ORDER BY c.ordinal_position
"#;

/// `$n` placeholders, case-insensitive `ILIKE`, casts for non-native types.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDialect;

impl Dialect for PostgresDialect {
    fn quote_ident(&self, ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    fn placeholder(&self, index: usize) -> String {
        format!("${index}")
    }

    fn like(&self, column: &str, placeholder: &str) -> String {
        format!("CAST({column} AS TEXT) ILIKE {placeholder}")
    }

    fn select_column(&self, column: &ColumnInfo) -> String {
        let name = self.quote_ident(&column.name);
        if NATIVE_TYPES.contains(&column.data_type.as_str()) {
            name
        } else {
            format!("CAST({name} AS TEXT) AS {name}")
        }
    }

    fn bind_placeholder(&self, placeholder: String, column: &ColumnInfo, value: &Value) -> String {
        match value {
            Value::Text(_) if !TEXT_TYPES.contains(&column.data_type.as_str()) => {
                format!("CAST({placeholder} AS {})", self.quote_ident(&column.data_type))
            }
            _ => placeholder,
        }
    }
}

/// Connector for [`TableConfig::Postgres`].
pub struct PostgresConnector {
    settings: PoolSettings,
    pools: Mutex<HashMap<String, PgPool>>,
}

impl PostgresConnector {
    pub fn new(settings: PoolSettings) -> Self {
        Self {
            settings,
            pools: Mutex::new(HashMap::new()),
        }
    }

    fn pools(&self) -> MutexGuard<'_, HashMap<String, PgPool>> {
        self.pools.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn pool_for(&self, config: &TableConfig, params: &ServerTableConfig) -> Result<PgPool> {
        let key = config.pool_key();
        let existing = self.pools().get(&key).cloned();
        if let Some(pool) = existing {
            return Ok(pool);
        }

        let pool = PgPoolOptions::new()
            .max_connections(self.settings.max_size)
            .acquire_timeout(self.settings.connect_timeout)
            .connect_with(connect_options(params))
            .await
            .map_err(|e| DataError::Connection(e.to_string()))?;

        let pool = self.pools().entry(key).or_insert(pool).clone();
        Ok(pool)
    }
}

impl Default for PostgresConnector {
    fn default() -> Self {
        Self::new(PoolSettings::default())
    }
}

fn postgres_params(config: &TableConfig) -> Result<&ServerTableConfig> {
    match config {
        TableConfig::Postgres(params) => Ok(params),
        other => Err(DataError::ConfigValidation(format!(
            "postgres connector cannot serve a {} config",
            other.kind()
        ))),
    }
}

fn connect_options(params: &ServerTableConfig) -> PgConnectOptions {
    PgConnectOptions::new()
        .host(&params.host)
        .port(params.port)
        .username(&params.user)
        .password(&params.password)
        .database(&params.database)
}

fn arguments(params: &[Value]) -> Result<PgArguments> {
    let mut args = PgArguments::default();
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

fn get<'r, T>(row: &'r PgRow, idx: usize) -> Result<Option<T>>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get::<Option<T>, _>(idx).map_err(map_sqlx_error)
}

fn decode_value(row: &PgRow, idx: usize) -> Result<Value> {
    let type_name = row.columns()[idx].type_info().name().to_string();
    let value = match type_name.as_str() {
        "BOOL" => get::<bool>(row, idx)?.map(Value::Bool),
        "INT2" => get::<i16>(row, idx)?.map(|v| Value::Integer(v.into())),
        "INT4" => get::<i32>(row, idx)?.map(|v| Value::Integer(v.into())),
        "INT8" => get::<i64>(row, idx)?.map(Value::Integer),
        "FLOAT4" => get::<f32>(row, idx)?.map(|v| Value::Real(v.into())),
        "FLOAT8" => get::<f64>(row, idx)?.map(Value::Real),
        "BYTEA" => get::<Vec<u8>>(row, idx)?.map(Value::Blob),
        "DATE" => get::<NaiveDate>(row, idx)?.map(|v| Value::Text(v.to_string())),
        "TIME" => get::<NaiveTime>(row, idx)?.map(|v| Value::Text(v.to_string())),
        "TIMESTAMP" => get::<NaiveDateTime>(row, idx)?.map(|v| Value::Text(v.to_string())),
        "TIMESTAMPTZ" => get::<DateTime<Utc>>(row, idx)?.map(|v| Value::Text(v.to_rfc3339())),
        _ => get::<String>(row, idx)?.map(Value::Text),
    };
    Ok(value.unwrap_or(Value::Null))
}

fn decode_row(row: &PgRow) -> Result<Vec<Value>> {
    (0..row.len()).map(|idx| decode_value(row, idx)).collect()
}

#[async_trait]
impl Connector for PostgresConnector {
    fn kind(&self) -> BackendKind {
        BackendKind::Postgres
    }

    async fn connect(&self, config: &TableConfig) -> Result<Box<dyn Connection>> {
        let params = postgres_params(config)?;
        let pool = with_retry("connect", || self.pool_for(config, params)).await?;
        tracing::debug!(host = %params.host, database = %params.database, "postgres pool ready");
        Ok(Box::new(PostgresConnection { pool }))
    }

    async fn test_connection(&self, config: &TableConfig) -> bool {
        let Ok(params) = postgres_params(config) else {
            return false;
        };
        let options = connect_options(params);
        let probe = async {
            let mut conn = PgConnection::connect_with(&options).await?;
            conn.ping().await?;
            conn.close().await
        };

        match tokio::time::timeout(self.settings.connect_timeout, probe).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::debug!(error = %e, "postgres connection probe failed");
                false
            }
            Err(_) => {
                tracing::debug!("postgres connection probe timed out");
                false
            }
        }
    }

    async fn close(&self, config: &TableConfig) {
        let pool = self.pools().remove(&config.pool_key());
        if let Some(pool) = pool {
            pool.close().await;
            tracing::debug!(pool = %config.pool_key(), "postgres pool closed");
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
pub struct PostgresConnection {
    pool: PgPool,
}

impl PostgresConnection {
    async fn fetch(&self, stmt: &Statement) -> Result<Vec<Vec<Value>>> {
        let rows = sqlx::query_with(&stmt.sql, arguments(&stmt.params)?)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        rows.iter().map(decode_row).collect()
    }
}

#[async_trait]
impl Connection for PostgresConnection {
    fn kind(&self) -> BackendKind {
        BackendKind::Postgres
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
                    nullable: row.try_get(2).map_err(map_sqlx_error)?,
                    is_primary_key: row.try_get(3).map_err(map_sqlx_error)?,
                    has_default: row.try_get(4).map_err(map_sqlx_error)?,
                })
            })
            .collect()
    }

    async fn read(&self, target: &TableTarget, spec: &QuerySpec) -> Result<TableData> {
        let stmt = sql::select(&PostgresDialect, target, spec)?;
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
        Ok(Box::new(PostgresTransaction { tx }))
    }
}

pub struct PostgresTransaction {
    tx: sqlx::Transaction<'static, Postgres>,
}

impl PostgresTransaction {
    async fn execute(&mut self, stmt: &Statement) -> Result<u64> {
        let result = sqlx::query_with(&stmt.sql, arguments(&stmt.params)?)
            .execute(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?;
        Ok(result.rows_affected())
    }

    async fn fetch(&mut self, stmt: &Statement) -> Result<Vec<Vec<Value>>> {
        let rows = sqlx::query_with(&stmt.sql, arguments(&stmt.params)?)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?;
        rows.iter().map(decode_row).collect()
    }
}

#[async_trait]
impl Transaction for PostgresTransaction {
    async fn fetch_row(&mut self, target: &TableTarget, key: &Value) -> Result<Option<Record>> {
        let stmt = sql::select_row(&PostgresDialect, target, key)?;
        let mut rows = self.fetch(&stmt).await?;
        Ok(rows
            .pop()
            .map(|row| target.column_names().into_iter().zip(row).collect()))
    }

    async fn insert(&mut self, target: &TableTarget, spec: &InsertSpec) -> Result<Value> {
        let mut stmt = sql::insert(&PostgresDialect, target, spec)?;
        let pk = target.primary_key()?;
        stmt.sql
            .push_str(&format!(" RETURNING {}", PostgresDialect.select_column(pk)));

        let key = self
            .fetch(&stmt)
            .await?
            .pop()
            .and_then(|row| row.into_iter().next())
            .unwrap_or(Value::Null);
        if key.is_null() {
            return Err(DataError::Backend("insert returned no primary key".into()));
        }
        Ok(key)
    }

    async fn update(&mut self, target: &TableTarget, spec: &UpdateSpec) -> Result<u64> {
        let stmt = sql::update(&PostgresDialect, target, spec)?;
        self.execute(&stmt).await
    }

    async fn delete(&mut self, target: &TableTarget, spec: &DeleteSpec) -> Result<u64> {
        let stmt = sql::delete(&PostgresDialect, target, spec)?;
        self.execute(&stmt).await
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await.map_err(map_sqlx_error)
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await.map_err(map_sqlx_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasource::schema::tests::users_columns;
    use crate::query::{Condition, ConditionList};

    fn column(data_type: &str) -> ColumnInfo {
        ColumnInfo {
            name: "c".into(),
            data_type: data_type.into(),
            nullable: true,
            is_primary_key: false,
            has_default: false,
        }
    }

    #[test]
    fn test_non_native_columns_read_as_text() {
        assert_eq!(PostgresDialect.select_column(&column("int4")), "\"c\"");
        assert_eq!(
            PostgresDialect.select_column(&column("uuid")),
            "CAST(\"c\" AS TEXT) AS \"c\""
        );
    }

    #[test]
    fn test_text_bound_to_typed_column_is_cast() {
        let ph = PostgresDialect.bind_placeholder("$1".into(), &column("uuid"), &Value::from("x"));
        assert_eq!(ph, "CAST($1 AS \"uuid\")");
        let ph = PostgresDialect.bind_placeholder("$1".into(), &column("varchar"), &Value::from("x"));
        assert_eq!(ph, "$1");
        let ph = PostgresDialect.bind_placeholder("$1".into(), &column("int4"), &Value::Integer(1));
        assert_eq!(ph, "$1");
    }

    #[test]
    fn test_like_is_case_insensitive() {
        let target = TableTarget::new("users", users_columns()).unwrap();
        let spec = QuerySpec::builder()
            .filter(
                ConditionList::and(vec![Condition::parse("name", "like", "al%").unwrap().into()])
                    .unwrap(),
            )
            .build()
            .unwrap();
        let stmt = sql::select(&PostgresDialect, &target, &spec).unwrap();
        assert!(stmt.sql.contains("CAST(\"name\" AS TEXT) ILIKE $1"));
        assert!(stmt.sql.ends_with("LIMIT $2 OFFSET $3"));
    }

    #[test]
    fn test_rejects_foreign_configs() {
        let config = TableConfig::sqlite("/tmp/x.db", "t").unwrap();
        assert!(PostgresConnector::default().validate(&config).is_err());
    }
}
