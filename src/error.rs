//! Error taxonomy for the data access layer.
//!
//! Validation errors are raised before any I/O. Lock conflicts are expected
//! business outcomes and carry enough context (holder, remaining TTL) for the
//! caller to render a message. `AuditWriteFailed` is fatal to the mutation
//! that triggered it.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::TableId;

/// Kind of access checked against the injected access policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Access {
    Read,
    Write,
    Delete,
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Access::Read => write!(f, "read"),
            Access::Write => write!(f, "write"),
            Access::Delete => write!(f, "delete"),
        }
    }
}

/// Every failure surfaced by datagate.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("invalid table configuration: {0}")]
    ConfigValidation(String),

    #[error("no connector registered for datasource kind `{0}`")]
    UnknownDatasource(String),

    #[error("datasource kind `{0}` is claimed by more than one connector")]
    AmbiguousDatasource(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("query translation failed: {0}")]
    QuerySyntax(String),

    #[error("invalid operator `{0}`")]
    InvalidOperator(String),

    #[error("condition nesting depth {depth} exceeds the maximum of {max}")]
    MaxDepthExceeded { depth: usize, max: usize },

    #[error("{field} must be between 0 and {max}, got {value}")]
    InvalidRange {
        field: &'static str,
        value: i64,
        max: u64,
    },

    #[error("row is locked by {holder} ({}s remaining)", .remaining.as_secs())]
    RowLocked { holder: String, remaining: Duration },

    #[error("{actor} does not hold the lock on this row")]
    NotLockHolder {
        actor: String,
        holder: Option<String>,
    },

    #[error("write denied: {0}")]
    WriteDenied(String),

    #[error("audit write failed: {reason}")]
    AuditWriteFailed {
        reason: String,
        reconciliation_required: bool,
    },

    #[error("table {0} is not registered")]
    UnknownTable(TableId),

    #[error("row `{0}` not found")]
    RowNotFound(String),

    #[error("{actor} is not permitted to {access} table {table_id}")]
    AccessDenied {
        actor: String,
        access: Access,
        table_id: TableId,
    },

    #[error("backend error: {0}")]
    Backend(String),
}

impl DataError {
    /// Lock conflicts that callers should present rather than treat as bugs.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            DataError::RowLocked { .. } | DataError::NotLockHolder { .. } | DataError::WriteDenied(_)
        )
    }

    /// Errors raised before any I/O was attempted.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            DataError::ConfigValidation(_)
                | DataError::InvalidOperator(_)
                | DataError::MaxDepthExceeded { .. }
                | DataError::InvalidRange { .. }
        )
    }
}

/// Result alias used throughout the crate.
pub type Result<T, E = DataError> = std::result::Result<T, E>;
