//! Read connection pool for audit history queries.
//!
//! Uses r2d2 with r2d2_sqlite for pooled read access.
//! SQLite WAL mode lets readers run alongside the audit writer.

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OpenFlags, Params};
use std::path::Path;

use super::schema::apply_reader_pragmas;
use super::{AuditEntry, StorageError};
use crate::TableId;

const ENTRY_COLUMNS: &str =
    "entry_id, kind, table_id, row_key, column_name, old_value, new_value, actor, created_at";

/// Pooled read-only access to the audit log.
#[derive(Clone)]
pub struct AuditReader {
    pool: Pool<SqliteConnectionManager>,
}

impl AuditReader {
    /// Create a new reader pool for the given audit database path.
    ///
    /// # Arguments
    ///
    /// * `db_path` - Path to an audit database already initialized by [`super::AuditLog::open`]
    /// * `max_size` - Maximum number of connections in the pool
    ///
    /// # Errors
    ///
    /// Returns an error if the pool cannot be created.
    pub fn new<P: AsRef<Path>>(db_path: P, max_size: u32) -> Result<Self, StorageError> {
        let manager = SqliteConnectionManager::file(db_path)
            .with_flags(OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX);

        let pool = Pool::builder()
            .max_size(max_size)
            .connection_customizer(Box::new(ReaderConnectionCustomizer))
            .build(manager)?;

        Ok(Self { pool })
    }

    /// Get a connection from the pool.
    pub fn get(&self) -> Result<PooledConnection<SqliteConnectionManager>, StorageError> {
        Ok(self.pool.get()?)
    }

    /// Get the current pool state for monitoring.
    pub fn state(&self) -> r2d2::State {
        self.pool.state()
    }

    /// Full history of one row, oldest first.
    pub fn for_row(&self, table_id: TableId, row_key: &str) -> Result<Vec<AuditEntry>, StorageError> {
        self.query(
            &format!(
                "SELECT {ENTRY_COLUMNS} FROM audit_log
                 WHERE table_id = ?1 AND row_key = ?2 ORDER BY seq ASC"
            ),
            params![table_id, row_key],
        )
    }

    /// Most recent entries for a table, newest first.
    pub fn for_table(&self, table_id: TableId, limit: u32) -> Result<Vec<AuditEntry>, StorageError> {
        self.query(
            &format!(
                "SELECT {ENTRY_COLUMNS} FROM audit_log
                 WHERE table_id = ?1 ORDER BY seq DESC LIMIT ?2"
            ),
            params![table_id, limit],
        )
    }

    /// Most recent entries written by `actor`, newest first.
    pub fn by_actor(&self, actor: &str, limit: u32) -> Result<Vec<AuditEntry>, StorageError> {
        self.query(
            &format!(
                "SELECT {ENTRY_COLUMNS} FROM audit_log
                 WHERE actor = ?1 ORDER BY seq DESC LIMIT ?2"
            ),
            params![actor, limit],
        )
    }

    /// Entries with `from_ms <= timestamp < to_ms`, oldest first.
    pub fn between(&self, from_ms: i64, to_ms: i64) -> Result<Vec<AuditEntry>, StorageError> {
        self.query(
            &format!(
                "SELECT {ENTRY_COLUMNS} FROM audit_log
                 WHERE created_at >= ?1 AND created_at < ?2 ORDER BY created_at ASC, seq ASC"
            ),
            params![from_ms, to_ms],
        )
    }

    fn query<P: Params>(&self, sql: &str, params: P) -> Result<Vec<AuditEntry>, StorageError> {
        let conn = self.get()?;
        let mut stmt = conn.prepare_cached(sql)?;
        let entries = stmt
            .query_map(params, AuditEntry::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }
}

/// Connection customizer that applies reader pragmas.
#[derive(Debug)]
struct ReaderConnectionCustomizer;

impl r2d2::CustomizeConnection<rusqlite::Connection, rusqlite::Error>
    for ReaderConnectionCustomizer
{
    fn on_acquire(&self, conn: &mut rusqlite::Connection) -> Result<(), rusqlite::Error> {
        apply_reader_pragmas(conn)
    }
}
