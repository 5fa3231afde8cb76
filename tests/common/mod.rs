//! Test utilities and fixtures for datagate integration tests.
//!
//! Provides:
//! - Temporary SQLite application and audit databases
//! - A data service wired to a one-table catalog

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use datagate::datasource::{ConnectorRegistry, PoolSettings, TableConfig};
use datagate::lock::RowLockManager;
use datagate::service::{DataService, TableCatalog};
use datagate::storage::{AuditLog, AuditReader};
use datagate::TableId;

/// Catalog id of the `users` table in every fixture.
pub const USERS: TableId = 5;

/// Test fixture that manages temporary application and audit databases.
///
/// The directory is automatically cleaned up when the fixture is dropped.
pub struct TestFixture {
    /// Temporary directory holding both databases
    pub temp_dir: TempDir,
    /// Path to the application database with the `users` table
    pub app_db: PathBuf,
    /// Path to the audit database
    pub audit_db: PathBuf,
}

impl TestFixture {
    /// Create a fixture with an empty `users (id, name)` table.
    pub fn new() -> Self {
        Self::with_schema("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL);")
    }

    /// Create a fixture whose application database is initialized by `sql`.
    pub fn with_schema(sql: &str) -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let app_db = temp_dir.path().join("app.db");
        let audit_db = temp_dir.path().join("audit.db");
        rusqlite::Connection::open(&app_db)
            .and_then(|conn| conn.execute_batch(sql))
            .expect("failed to create application database");
        Self {
            temp_dir,
            app_db,
            audit_db,
        }
    }

    pub fn users_config(&self) -> TableConfig {
        TableConfig::sqlite(&self.app_db, "users").expect("valid config")
    }

    /// Service with the default lock TTL.
    pub fn service(&self) -> DataService {
        self.service_with_ttl(Duration::from_secs(300))
    }

    pub fn service_with_ttl(&self, ttl: Duration) -> DataService {
        let mut catalog = TableCatalog::new();
        catalog.insert(USERS, self.users_config());
        let audit = AuditLog::open(&self.audit_db).expect("failed to open audit log");
        let history = AuditReader::new(&self.audit_db, 2).expect("failed to open audit reader");
        DataService::new(
            ConnectorRegistry::with_defaults(PoolSettings::default()),
            catalog,
            Arc::new(RowLockManager::new(ttl)),
            audit,
            history,
        )
    }

    /// Open a raw connection to the application database.
    pub fn app_conn(&self) -> rusqlite::Connection {
        rusqlite::Connection::open(&self.app_db).expect("failed to open application database")
    }

    /// Number of rows in the `users` table, read outside the service.
    pub fn user_count(&self) -> i64 {
        self.app_conn()
            .query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))
            .expect("count users")
    }
}

impl Default for TestFixture {
    fn default() -> Self {
        Self::new()
    }
}

