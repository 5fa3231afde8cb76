//! Audit database schema and connection pragmas.

use rusqlite::Connection;

/// Current schema version, stored in `PRAGMA user_version`.
pub const SCHEMA_VERSION: i32 = 1;

/// Pragmas for the writer connection.
///
/// `synchronous = FULL` makes every committed audit entry durable before the
/// commit returns.
pub fn apply_pragmas(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = FULL;
         PRAGMA busy_timeout = 5000;
         PRAGMA foreign_keys = ON;",
    )
}

/// Pragmas for pooled history readers.
pub fn apply_reader_pragmas(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "PRAGMA busy_timeout = 5000;
         PRAGMA query_only = ON;",
    )
}

/// Create the audit tables, indexes and append-only triggers.
pub fn initialize_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS audit_log (
            seq         INTEGER PRIMARY KEY AUTOINCREMENT,
            entry_id    TEXT    NOT NULL UNIQUE,
            kind        TEXT    NOT NULL,
            table_id    INTEGER NOT NULL,
            row_key     TEXT    NOT NULL,
            column_name TEXT,
            old_value   TEXT,
            new_value   TEXT,
            actor       TEXT    NOT NULL,
            created_at  INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_audit_row
            ON audit_log (table_id, row_key, seq);
        CREATE INDEX IF NOT EXISTS idx_audit_time
            ON audit_log (created_at, seq);
        CREATE INDEX IF NOT EXISTS idx_audit_actor
            ON audit_log (actor, seq);

        CREATE TRIGGER IF NOT EXISTS audit_log_no_update
            BEFORE UPDATE ON audit_log
            BEGIN SELECT RAISE(ABORT, 'audit_log is append-only'); END;
        CREATE TRIGGER IF NOT EXISTS audit_log_no_delete
            BEFORE DELETE ON audit_log
            BEGIN SELECT RAISE(ABORT, 'audit_log is append-only'); END;
        "#,
    )?;
    conn.pragma_update(None, "user_version", SCHEMA_VERSION)
}
