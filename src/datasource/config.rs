//! Backend-tagged table configurations.
//!
//! A `TableConfig` always names its backend kind explicitly, so connector
//! resolution is a direct lookup rather than a structural guess. Shapes are
//! validated eagerly, before any connection is attempted.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::error::{DataError, Result};

/// Maximum accepted length of a table name.
const MAX_TABLE_NAME_LEN: usize = 128;

/// Backend kind tag carried by every table configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Sqlite,
    Postgres,
    #[serde(rename = "mysql")]
    MySql,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Sqlite => "sqlite",
            BackendKind::Postgres => "postgres",
            BackendKind::MySql => "mysql",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Embedded-file table: database path plus table name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SqliteTableConfig {
    pub path: PathBuf,
    pub table_name: String,
}

/// Client/server table: connection parameters plus table name.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerTableConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub password: String,
    pub database: String,
    pub table_name: String,
}

impl fmt::Debug for ServerTableConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerTableConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"***")
            .field("database", &self.database)
            .field("table_name", &self.table_name)
            .finish()
    }
}

/// Validated, backend-tagged connection and target-table descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase", try_from = "RawTableConfig")]
pub enum TableConfig {
    Sqlite(SqliteTableConfig),
    Postgres(ServerTableConfig),
    #[serde(rename = "mysql")]
    MySql(ServerTableConfig),
}

/// Unvalidated wire shape; converted through [`TableConfig::validate`].
#[derive(Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum RawTableConfig {
    Sqlite(SqliteTableConfig),
    Postgres(ServerTableConfig),
    #[serde(rename = "mysql")]
    MySql(ServerTableConfig),
}

impl TryFrom<RawTableConfig> for TableConfig {
    type Error = DataError;

    fn try_from(raw: RawTableConfig) -> Result<Self> {
        let config = match raw {
            RawTableConfig::Sqlite(c) => TableConfig::Sqlite(c),
            RawTableConfig::Postgres(c) => TableConfig::Postgres(c),
            RawTableConfig::MySql(c) => TableConfig::MySql(c),
        };
        config.validate()?;
        Ok(config)
    }
}

impl TableConfig {
    pub fn sqlite(path: impl Into<PathBuf>, table_name: impl Into<String>) -> Result<Self> {
        let config = TableConfig::Sqlite(SqliteTableConfig {
            path: path.into(),
            table_name: table_name.into(),
        });
        config.validate()?;
        Ok(config)
    }

    pub fn postgres(params: ServerTableConfig) -> Result<Self> {
        let config = TableConfig::Postgres(params);
        config.validate()?;
        Ok(config)
    }

    pub fn mysql(params: ServerTableConfig) -> Result<Self> {
        let config = TableConfig::MySql(params);
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a JSON table configuration.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| DataError::ConfigValidation(e.to_string()))
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            TableConfig::Sqlite(_) => BackendKind::Sqlite,
            TableConfig::Postgres(_) => BackendKind::Postgres,
            TableConfig::MySql(_) => BackendKind::MySql,
        }
    }

    pub fn table_name(&self) -> &str {
        match self {
            TableConfig::Sqlite(c) => &c.table_name,
            TableConfig::Postgres(c) | TableConfig::MySql(c) => &c.table_name,
        }
    }

    /// Key of the connection pool serving this config.
    ///
    /// Tables living in the same database share one pool.
    pub fn pool_key(&self) -> String {
        match self {
            TableConfig::Sqlite(c) => format!("sqlite:{}", c.path.display()),
            TableConfig::Postgres(c) | TableConfig::MySql(c) => format!(
                "{}://{}@{}:{}/{}",
                self.kind(),
                c.user,
                c.host,
                c.port,
                c.database
            ),
        }
    }

    /// Check the required-field schema for this config's kind.
    pub fn validate(&self) -> Result<()> {
        validate_table_name(self.table_name())?;
        match self {
            TableConfig::Sqlite(c) => {
                if c.path.as_os_str().is_empty() {
                    return Err(DataError::ConfigValidation("sqlite path is required".into()));
                }
            }
            TableConfig::Postgres(c) | TableConfig::MySql(c) => {
                require("host", &c.host)?;
                require("user", &c.user)?;
                require("database", &c.database)?;
                if c.port == 0 {
                    return Err(DataError::ConfigValidation("port must be non-zero".into()));
                }
            }
        }
        Ok(())
    }
}

fn require(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(DataError::ConfigValidation(format!("{field} is required")));
    }
    Ok(())
}

fn validate_table_name(name: &str) -> Result<()> {
    require("table_name", name)?;
    if name.len() > MAX_TABLE_NAME_LEN {
        return Err(DataError::ConfigValidation(format!(
            "table_name exceeds {MAX_TABLE_NAME_LEN} characters"
        )));
    }
    if name.contains('\0') {
        return Err(DataError::ConfigValidation(
            "table_name must not contain NUL".into(),
        ));
    }
    Ok(())
}
