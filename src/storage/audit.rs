//! Append-only audit writer.
//!
//! All writes go through one connection guarded by an async mutex. A mutation
//! first stages its entries inside an open `BEGIN IMMEDIATE` transaction, then
//! commits them once the backend mutation itself has committed. Dropping a
//! [`StagedAudit`] without committing rolls the entries back.

use rusqlite::{params, Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::schema::{apply_pragmas, initialize_schema};
use super::StorageError;
use crate::observability::metrics;
use crate::query::{Record, Value};
use crate::TableId;

/// What kind of change an audit entry describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    Insert,
    Update,
    Delete,
    /// An elevated actor force-released another holder's row lock.
    LockOverride,
}

impl MutationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MutationKind::Insert => "insert",
            MutationKind::Update => "update",
            MutationKind::Delete => "delete",
            MutationKind::LockOverride => "lock_override",
        }
    }
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MutationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "insert" => Ok(MutationKind::Insert),
            "update" => Ok(MutationKind::Update),
            "delete" => Ok(MutationKind::Delete),
            "lock_override" => Ok(MutationKind::LockOverride),
            other => Err(format!("unknown mutation kind `{other}`")),
        }
    }
}

/// One immutable audit record.
///
/// Updates produce one entry per changed column. Inserts carry the whole new
/// row in `new_value` and deletes the whole old row in `old_value`, both with
/// `column` unset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub entry_id: String,
    pub kind: MutationKind,
    pub table_id: TableId,
    pub row_key: String,
    pub column: Option<String>,
    pub old_value: Option<serde_json::Value>,
    pub new_value: Option<serde_json::Value>,
    pub actor: String,
    /// Unix timestamp in milliseconds.
    pub timestamp: i64,
}

impl AuditEntry {
    fn new(kind: MutationKind, table_id: TableId, row_key: &str, actor: &str) -> Self {
        Self {
            entry_id: crate::generate_entry_id(),
            kind,
            table_id,
            row_key: row_key.to_string(),
            column: None,
            old_value: None,
            new_value: None,
            actor: actor.to_string(),
            timestamp: crate::now_millis(),
        }
    }

    /// Entries describing a mutation from `before` to `after`.
    ///
    /// For updates only columns whose value differs are recorded, so an update
    /// that changed nothing yields no entries.
    pub fn changes(
        kind: MutationKind,
        table_id: TableId,
        row_key: &str,
        before: Option<&Record>,
        after: Option<&Record>,
        actor: &str,
    ) -> Vec<AuditEntry> {
        match kind {
            MutationKind::Update => {
                let empty = Record::new();
                let before = before.unwrap_or(&empty);
                let after = after.unwrap_or(&empty);
                after
                    .iter()
                    .filter(|(column, new)| before.get(*column) != Some(*new))
                    .map(|(column, new)| {
                        let old = before.get(column).unwrap_or(&Value::Null);
                        AuditEntry {
                            column: Some(column.clone()),
                            old_value: Some(old.to_json()),
                            new_value: Some(new.to_json()),
                            ..AuditEntry::new(kind, table_id, row_key, actor)
                        }
                    })
                    .collect()
            }
            _ => vec![AuditEntry {
                old_value: before.map(Value::record_to_json),
                new_value: after.map(Value::record_to_json),
                ..AuditEntry::new(kind, table_id, row_key, actor)
            }],
        }
    }

    /// Entry recording that `actor` forcibly took a lock away from `previous_holder`.
    pub fn lock_override(
        table_id: TableId,
        row_key: &str,
        previous_holder: &str,
        actor: &str,
    ) -> AuditEntry {
        AuditEntry {
            old_value: Some(serde_json::Value::String(previous_holder.to_string())),
            ..AuditEntry::new(MutationKind::LockOverride, table_id, row_key, actor)
        }
    }

    pub(crate) fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        let kind: String = row.get("kind")?;
        let kind = kind.parse::<MutationKind>().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                2,
                rusqlite::types::Type::Text,
                e.into(),
            )
        })?;
        Ok(Self {
            entry_id: row.get("entry_id")?,
            kind,
            table_id: row.get("table_id")?,
            row_key: row.get("row_key")?,
            column: row.get("column_name")?,
            old_value: json_column(row, "old_value")?,
            new_value: json_column(row, "new_value")?,
            actor: row.get("actor")?,
            timestamp: row.get("created_at")?,
        })
    }
}

fn json_column(row: &rusqlite::Row<'_>, name: &str) -> rusqlite::Result<Option<serde_json::Value>> {
    let text: Option<String> = row.get(name)?;
    text.map(|t| {
        serde_json::from_str(&t).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
    })
    .transpose()
}

fn encode(value: &Option<serde_json::Value>) -> Result<Option<String>, StorageError> {
    Ok(value.as_ref().map(serde_json::to_string).transpose()?)
}

fn insert_entries(conn: &Connection, entries: &[AuditEntry]) -> Result<(), StorageError> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO audit_log
            (entry_id, kind, table_id, row_key, column_name, old_value, new_value, actor, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
    )?;
    for entry in entries {
        stmt.execute(params![
            entry.entry_id,
            entry.kind.as_str(),
            entry.table_id,
            entry.row_key,
            entry.column,
            encode(&entry.old_value)?,
            encode(&entry.new_value)?,
            entry.actor,
            entry.timestamp,
        ])?;
    }
    Ok(())
}

/// Durable, append-only audit writer.
#[derive(Clone)]
pub struct AuditLog {
    path: PathBuf,
    writer: Arc<Mutex<Connection>>,
}

impl fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuditLog").field("path", &self.path).finish()
    }
}

impl AuditLog {
    /// Open (creating if needed) the audit database at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or the schema cannot be
    /// initialized.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        apply_pragmas(&conn)?;
        initialize_schema(&conn)?;
        tracing::info!(path = %path.display(), "audit log opened");
        Ok(Self {
            path,
            writer: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write `entries` inside an open transaction without committing.
    ///
    /// The writer stays reserved until the returned [`StagedAudit`] is
    /// committed, rolled back or dropped.
    pub async fn stage(&self, entries: Vec<AuditEntry>) -> Result<StagedAudit, StorageError> {
        let guard = Arc::clone(&self.writer).lock_owned().await;
        let (guard, result) = tokio::task::spawn_blocking(move || {
            let result = guard
                .execute_batch("BEGIN IMMEDIATE")
                .map_err(StorageError::from)
                .and_then(|()| insert_entries(&guard, &entries));
            match result {
                Ok(()) => (guard, Ok(entries)),
                Err(e) => {
                    if !guard.is_autocommit() {
                        let _ = guard.execute_batch("ROLLBACK");
                    }
                    (guard, Err(e))
                }
            }
        })
        .await?;

        let entries = result?;
        Ok(StagedAudit {
            guard: Some(guard),
            entries,
        })
    }

    /// Stage and immediately commit `entries`.
    pub async fn append(&self, entries: Vec<AuditEntry>) -> Result<Vec<AuditEntry>, StorageError> {
        self.stage(entries).await?.commit().await
    }

    /// Record one mutation, returning the entries written.
    pub async fn record(
        &self,
        kind: MutationKind,
        table_id: TableId,
        row_key: &str,
        before: Option<&Record>,
        after: Option<&Record>,
        actor: &str,
    ) -> Result<Vec<AuditEntry>, StorageError> {
        let entries = AuditEntry::changes(kind, table_id, row_key, before, after, actor);
        if entries.is_empty() {
            return Ok(entries);
        }
        self.append(entries).await
    }
}

/// Audit entries written but not yet committed.
pub struct StagedAudit {
    guard: Option<OwnedMutexGuard<Connection>>,
    entries: Vec<AuditEntry>,
}

impl StagedAudit {
    pub fn entries(&self) -> &[AuditEntry] {
        &self.entries
    }

    /// Commit the staged entries. Once this returns `Ok` they are durable.
    pub async fn commit(mut self) -> Result<Vec<AuditEntry>, StorageError> {
        let entries = std::mem::take(&mut self.entries);
        let Some(guard) = self.guard.take() else {
            return Ok(entries);
        };
        tokio::task::spawn_blocking(move || {
            let result = guard.execute_batch("COMMIT");
            if result.is_err() && !guard.is_autocommit() {
                let _ = guard.execute_batch("ROLLBACK");
            }
            result
        })
        .await??;

        if let Some(first) = entries.first() {
            metrics::record_audit_entries(first.table_id, entries.len());
        }
        Ok(entries)
    }

    /// Discard the staged entries.
    pub async fn rollback(mut self) -> Result<(), StorageError> {
        let Some(guard) = self.guard.take() else {
            return Ok(());
        };
        tokio::task::spawn_blocking(move || {
            if guard.is_autocommit() {
                return Ok(());
            }
            guard.execute_batch("ROLLBACK")
        })
        .await??;
        Ok(())
    }
}

impl Drop for StagedAudit {
    fn drop(&mut self) {
        if let Some(guard) = self.guard.take() {
            if !guard.is_autocommit() {
                if let Err(e) = guard.execute_batch("ROLLBACK") {
                    tracing::error!(error = %e, "failed to roll back abandoned audit entries");
                }
            }
        }
    }
}
