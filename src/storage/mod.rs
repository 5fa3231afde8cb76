//! SQLite audit store.
//!
//! Provides:
//! - Schema initialization with append-only triggers
//! - A single serialized writer that stages entries inside an open transaction
//! - A read connection pool for history queries

pub mod audit;
pub mod reader;
pub mod schema;

pub use audit::{AuditEntry, AuditLog, MutationKind, StagedAudit};
pub use reader::AuditReader;

use thiserror::Error;

/// Error type for audit store operations.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to create connection pool: {0}")]
    PoolCreation(#[from] r2d2::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Failed to encode audit value: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Audit task failed: {0}")]
    Task(String),
}

impl From<tokio::task::JoinError> for StorageError {
    fn from(e: tokio::task::JoinError) -> Self {
        StorageError::Task(e.to_string())
    }
}
