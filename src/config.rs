//! Configuration parsing for datagate.
//!
//! Supports:
//! - CLI arguments via clap
//! - Environment variable overrides
//! - Sensible defaults for quick start

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use crate::datasource::PoolSettings;
use crate::error::{DataError, Result};
use crate::query::QueryLimits;

/// Datagate: backend-agnostic row access with edit locks and an audit trail.
#[derive(Parser, Debug, Clone)]
#[command(name = "datagate")]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Path to the SQLite audit database
    #[arg(long, env = "DATAGATE_AUDIT_DB", default_value = "./data/audit.db")]
    pub audit_db: PathBuf,

    /// Table catalog file mapping table ids to table configs (JSON)
    #[arg(long, env = "DATAGATE_CATALOG")]
    pub catalog: Option<PathBuf>,

    /// Row lock time-to-live in seconds
    #[arg(long, env = "DATAGATE_LOCK_TTL_SECS", default_value_t = 300)]
    pub lock_ttl_secs: u64,

    /// Interval between idle lock sweeps in seconds
    #[arg(long, env = "DATAGATE_LOCK_SWEEP_SECS", default_value_t = 60)]
    pub lock_sweep_secs: u64,

    /// Maximum connections per backend database
    #[arg(long, env = "DATAGATE_POOL_SIZE", default_value_t = 8)]
    pub pool_size: u32,

    /// Connection timeout in seconds
    #[arg(long, env = "DATAGATE_CONNECT_TIMEOUT_SECS", default_value_t = 5)]
    pub connect_timeout_secs: u64,

    /// Largest page a read may request
    #[arg(long, env = "DATAGATE_MAX_ROWS", default_value_t = 10_000)]
    pub max_rows: u32,

    /// Page size used when a read does not specify a limit
    #[arg(long, env = "DATAGATE_PAGE_SIZE", default_value_t = 100)]
    pub page_size: u32,

    /// Size of the audit history reader pool
    #[arg(long, env = "DATAGATE_READER_POOL_SIZE", default_value_t = 4)]
    pub reader_pool_size: u32,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_level: String,

    /// OpenTelemetry collector endpoint for metrics export (optional)
    #[arg(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    pub otel_endpoint: Option<String>,
}

impl Config {
    /// Create a configuration for testing rooted in `data_dir`.
    #[cfg(test)]
    pub fn test_config(data_dir: PathBuf) -> Self {
        Self {
            audit_db: data_dir.join("audit.db"),
            catalog: None,
            lock_ttl_secs: 5,
            lock_sweep_secs: 1,
            pool_size: 2,
            connect_timeout_secs: 1,
            max_rows: 100,
            page_size: 10,
            reader_pool_size: 2,
            log_level: "debug".into(),
            otel_endpoint: None,
        }
    }

    /// Reject settings that cannot work together.
    pub fn validate(&self) -> Result<()> {
        if self.lock_ttl_secs == 0 {
            return Err(DataError::ConfigValidation(
                "lock TTL must be at least one second".into(),
            ));
        }
        if self.pool_size == 0 || self.reader_pool_size == 0 {
            return Err(DataError::ConfigValidation(
                "pool sizes must be positive".into(),
            ));
        }
        if self.page_size > self.max_rows {
            return Err(DataError::ConfigValidation(format!(
                "page size {} exceeds max rows {}",
                self.page_size, self.max_rows
            )));
        }
        Ok(())
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn lock_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.lock_sweep_secs.max(1))
    }

    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            max_size: self.pool_size,
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
        }
    }

    pub fn query_limits(&self) -> QueryLimits {
        QueryLimits {
            max_limit: self.max_rows,
            default_limit: self.page_size,
            ..QueryLimits::default()
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            audit_db: PathBuf::from("./data/audit.db"),
            catalog: None,
            lock_ttl_secs: 300,
            lock_sweep_secs: 60,
            pool_size: 8,
            connect_timeout_secs: 5,
            max_rows: 10_000,
            page_size: 100,
            reader_pool_size: 4,
            log_level: "info".into(),
            otel_endpoint: None,
        }
    }
}
