//! Datagate: backend-agnostic row access for multi-user data editing.
//!
//! Datagate gives a browser-facing data editor one uniform contract over
//! structurally different SQL backends, while keeping concurrent editors
//! from clobbering each other and recording every mutation.
//!
//! # Architecture
//!
//! - **Backend-neutral queries**: filters, ordering and pagination are described
//!   once and translated per backend with bound parameters only
//! - **Pluggable connectors**: SQLite (embedded file), PostgreSQL and MySQL,
//!   each drawing connections from a per-database pool
//! - **Cooperative row locks**: TTL-bounded, per-row exclusive edit claims
//! - **Audit trail**: append-only, durable before/after records committed
//!   together with the mutation they describe
//!
//! # Modules
//!
//! - [`config`]: CLI and environment configuration
//! - [`datasource`]: Table configs, schema discovery, SQL translation, connectors
//! - [`error`]: Error taxonomy shared by every layer
//! - [`lock`]: Row lock manager and idle-slot sweeper
//! - [`observability`]: Metrics and tracing setup
//! - [`query`]: Query spec model and value types
//! - [`service`]: CRUD orchestrator, table catalog and access policy
//! - [`storage`]: SQLite-backed audit store

// Lint configuration
#![warn(clippy::all)]
#![allow(
    clippy::module_name_repetitions,    // lock::RowLockManager is fine
    clippy::must_use_candidate,         // Not all functions need #[must_use]
    clippy::missing_errors_doc,         // Error docs can be verbose
    clippy::missing_panics_doc,         // Panic docs can be verbose
    clippy::needless_raw_string_hashes, // r#""# is fine for SQL
    clippy::similar_names,              // row/rows/row_key are fine
    clippy::too_many_lines              // Some functions are inherently long
)]

pub mod config;
pub mod datasource;
pub mod error;
pub mod lock;
pub mod observability;
pub mod query;
pub mod service;
pub mod storage;

pub use error::{DataError, Result};

use uuid::Uuid;

/// Identifier of a table registered in the catalog.
pub type TableId = i64;

/// Generate a new UUIDv7 (time-sortable) audit entry ID.
///
/// # Example
///
/// ```
/// let id = datagate::generate_entry_id();
/// assert!(id.len() == 36); // UUID string format
/// ```
#[must_use]
pub fn generate_entry_id() -> String {
    Uuid::now_v7().to_string()
}

/// Get the current Unix timestamp in milliseconds.
#[must_use]
pub fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
