//! CRUD orchestrator.
//!
//! [`DataService`] is the boundary the editing UI talks to. It composes the
//! connector registry, the row lock manager and the audit log:
//!
//! - Reads resolve a connector and run without locks
//! - Updates and deletes require the caller to hold the row lock
//! - Every mutation commits together with its audit entries, or not at all

pub mod catalog;
pub mod policy;

pub use catalog::TableCatalog;
pub use policy::{AccessPolicy, Actor, AllowAll};

use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::datasource::{
    ColumnInfo, Connection, ConnectorRegistry, TableConfig, TableData, TableTarget, Transaction,
};
use crate::error::{Access, DataError, Result};
use crate::lock::{spawn_sweeper, ReleaseOutcome, RowLock, RowLockManager};
use crate::observability::metrics;
use crate::query::{DeleteSpec, InsertSpec, QueryLimits, QuerySpec, UpdateSpec};
use crate::storage::{AuditEntry, AuditLog, AuditReader, MutationKind, StorageError};
use crate::TableId;

/// Outcome of [`DataService::release_edit_lock`]. None of these are failures.
#[derive(Debug, Clone, PartialEq)]
pub enum LockRelease {
    Released,
    /// No active lock existed.
    AlreadyReleased,
    /// Another actor holds the lock; it was left in place.
    HeldByOther { holder: String },
    /// An elevated actor removed another holder's lock.
    ForceReleased {
        previous_holder: String,
        entry: AuditEntry,
    },
}

fn audit_failed(e: &StorageError, reconciliation_required: bool) -> DataError {
    DataError::AuditWriteFailed {
        reason: e.to_string(),
        reconciliation_required,
    }
}

fn history_failed(e: &StorageError) -> DataError {
    DataError::Backend(format!("audit history unavailable: {e}"))
}

/// Row access, locking and auditing behind one interface.
pub struct DataService {
    registry: RwLock<Arc<ConnectorRegistry>>,
    catalog: TableCatalog,
    locks: Arc<RowLockManager>,
    audit: AuditLog,
    history: AuditReader,
    policy: Arc<dyn AccessPolicy>,
    limits: QueryLimits,
}

impl std::fmt::Debug for DataService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataService")
            .field("catalog", &self.catalog)
            .field("audit", &self.audit)
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl DataService {
    /// Assemble a service from its parts, allowing every access.
    pub fn new(
        registry: ConnectorRegistry,
        catalog: TableCatalog,
        locks: Arc<RowLockManager>,
        audit: AuditLog,
        history: AuditReader,
    ) -> Self {
        Self {
            registry: RwLock::new(Arc::new(registry)),
            catalog,
            locks,
            audit,
            history,
            policy: Arc::new(AllowAll),
            limits: QueryLimits::default(),
        }
    }

    /// Open the audit store and catalog named by `config`.
    ///
    /// # Errors
    ///
    /// `ConfigValidation` for bad settings or catalog files, `Connection`
    /// when the audit database cannot be opened.
    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;
        let catalog = match &config.catalog {
            Some(path) => TableCatalog::load(path)?,
            None => TableCatalog::new(),
        };
        if let Some(parent) = config.audit_db.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DataError::Connection(format!("cannot create {}: {e}", parent.display()))
            })?;
        }
        let open_err = |e: StorageError| DataError::Connection(format!("audit store: {e}"));
        let audit = AuditLog::open(&config.audit_db).map_err(open_err)?;
        let history = AuditReader::new(&config.audit_db, config.reader_pool_size).map_err(open_err)?;

        Ok(Self::new(
            ConnectorRegistry::with_defaults(config.pool_settings()),
            catalog,
            Arc::new(RowLockManager::new(config.lock_ttl())),
            audit,
            history,
        )
        .with_limits(config.query_limits()))
    }

    pub fn with_policy(mut self, policy: Arc<dyn AccessPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_limits(mut self, limits: QueryLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn catalog(&self) -> &TableCatalog {
        &self.catalog
    }

    pub fn locks(&self) -> &Arc<RowLockManager> {
        &self.locks
    }

    /// Start reclaiming idle lock slots every `interval` until `shutdown_rx` fires.
    pub fn spawn_lock_sweeper(
        &self,
        interval: Duration,
        shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        spawn_sweeper(Arc::clone(&self.locks), interval, shutdown_rx)
    }

    pub fn limits(&self) -> &QueryLimits {
        &self.limits
    }

    pub fn registry(&self) -> Arc<ConnectorRegistry> {
        Arc::clone(&self.registry.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Atomically replace the connector registry, returning the old one.
    ///
    /// Operations already running keep the registry they started with.
    pub fn swap_registry(&self, registry: ConnectorRegistry) -> Arc<ConnectorRegistry> {
        let mut current = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *current, Arc::new(registry))
    }

    fn authorize(&self, actor: &Actor, table_id: TableId, access: Access) -> Result<()> {
        if self.policy.allows(actor, table_id, access) {
            return Ok(());
        }
        tracing::info!(actor = %actor.name, table_id, %access, "access denied");
        Err(DataError::AccessDenied {
            actor: actor.name.clone(),
            access,
            table_id,
        })
    }

    async fn open(&self, config: &TableConfig) -> Result<(Box<dyn Connection>, TableTarget)> {
        let connector = self.registry().resolve(config)?;
        let conn = connector.connect(config).await?;
        let target = conn.describe(config.table_name()).await?;
        Ok((conn, target))
    }

    /// Read a page of rows from the table `config` describes.
    #[tracing::instrument(skip_all, fields(backend = %config.kind(), table = config.table_name()))]
    pub async fn get_table_data(&self, config: &TableConfig, spec: &QuerySpec) -> Result<TableData> {
        let start = Instant::now();
        let result = async {
            let (conn, target) = self.open(config).await?;
            conn.read(&target, spec).await
        }
        .await;
        observe("read", config, start, &result);
        result
    }

    /// Read a page of rows from a catalog table.
    pub async fn read_table(
        &self,
        table_id: TableId,
        spec: &QuerySpec,
        actor: &Actor,
    ) -> Result<TableData> {
        self.authorize(actor, table_id, Access::Read)?;
        let config = self.catalog.get(table_id)?;
        self.get_table_data(config, spec).await
    }

    /// Resolve the table `config` describes against its discovered schema.
    pub async fn describe(&self, config: &TableConfig) -> Result<TableTarget> {
        self.open(config).await.map(|(_, target)| target)
    }

    /// Columns of a catalog table in declaration order.
    pub async fn get_schema(&self, table_id: TableId) -> Result<Vec<ColumnInfo>> {
        let config = self.catalog.get(table_id)?;
        Ok(self.describe(config).await?.columns().to_vec())
    }

    /// Probe connectivity for `config`. Never mutates state.
    pub async fn test_connection(&self, config: &TableConfig) -> bool {
        match self.registry().resolve(config) {
            Ok(connector) => connector.test_connection(config).await,
            Err(e) => {
                tracing::debug!(error = %e, "connection probe rejected config");
                false
            }
        }
    }

    /// Canonical form of `row_key`: the string form of the typed primary key.
    ///
    /// Locks and audit entries are keyed by it, so `"01"` and `"1"` name the
    /// same row of an integer-keyed table.
    async fn row_key(&self, config: &TableConfig, row_key: &str) -> Result<String> {
        let target = self.describe(config).await?;
        Ok(target.key_value(row_key)?.to_key_string())
    }

    /// Check a row out for editing.
    ///
    /// # Errors
    ///
    /// `RowLocked` naming the current holder and remaining TTL.
    #[tracing::instrument(skip(self, actor), fields(actor = %actor.name))]
    pub async fn request_edit_lock(
        &self,
        table_id: TableId,
        row_key: &str,
        actor: &Actor,
    ) -> Result<RowLock> {
        let config = self.catalog.get(table_id)?;
        self.authorize(actor, table_id, Access::Write)?;
        let row_key = self.row_key(config, row_key).await?;
        self.locks.acquire(table_id, &row_key, &actor.name)
    }

    /// Extend the caller's lock by a full TTL.
    pub async fn refresh_edit_lock(
        &self,
        table_id: TableId,
        row_key: &str,
        actor: &Actor,
    ) -> Result<RowLock> {
        let config = self.catalog.get(table_id)?;
        let row_key = self.row_key(config, row_key).await?;
        self.locks.refresh(table_id, &row_key, &actor.name)
    }

    /// Give a row back. Idempotent.
    ///
    /// An elevated actor releasing someone else's lock force-releases it. The
    /// `lock_override` entry is staged first: if the audit store rejects it the
    /// lock stays with its holder.
    #[tracing::instrument(skip(self, actor), fields(actor = %actor.name))]
    pub async fn release_edit_lock(
        &self,
        table_id: TableId,
        row_key: &str,
        actor: &Actor,
    ) -> Result<LockRelease> {
        let config = self.catalog.get(table_id)?;
        let row_key = self.row_key(config, row_key).await?;
        match self.locks.release(table_id, &row_key, &actor.name) {
            Ok(ReleaseOutcome::Released) => Ok(LockRelease::Released),
            Ok(ReleaseOutcome::AlreadyReleased) => Ok(LockRelease::AlreadyReleased),
            Err(DataError::NotLockHolder {
                holder: Some(holder),
                ..
            }) if actor.elevated => self.force_release(table_id, &row_key, holder, actor).await,
            Err(DataError::NotLockHolder {
                holder: Some(holder),
                ..
            }) => Ok(LockRelease::HeldByOther { holder }),
            Err(e) => Err(e),
        }
    }

    async fn force_release(
        &self,
        table_id: TableId,
        row_key: &str,
        previous_holder: String,
        actor: &Actor,
    ) -> Result<LockRelease> {
        let entry = AuditEntry::lock_override(table_id, row_key, &previous_holder, &actor.name);
        let staged = self.audit.stage(vec![entry]).await.map_err(|e| {
            tracing::error!(error = %e, table_id, row_key, "lock override not audited, lock kept");
            audit_failed(&e, false)
        })?;

        if !self
            .locks
            .force_release(table_id, row_key, &previous_holder, &actor.name)
        {
            // The lock changed hands or expired while the entry was staged.
            if let Err(e) = staged.rollback().await {
                tracing::warn!(error = %e, "audit rollback failed after lock changed");
            }
            return Ok(match self.locks.holder(table_id, row_key) {
                Some(lock) => LockRelease::HeldByOther {
                    holder: lock.holder,
                },
                None => LockRelease::AlreadyReleased,
            });
        }

        let mut written = staged.commit().await.map_err(|e| {
            tracing::error!(error = %e, table_id, row_key, "lock released but override entry lost");
            audit_failed(&e, true)
        })?;
        let entry = written.pop().ok_or_else(|| DataError::AuditWriteFailed {
            reason: "override entry missing after commit".into(),
            reconciliation_required: true,
        })?;
        Ok(LockRelease::ForceReleased {
            previous_holder,
            entry,
        })
    }

    /// Apply `spec` to a row the caller holds the lock on.
    ///
    /// Returns one audit entry per changed column; an edit that changes
    /// nothing returns no entries.
    ///
    /// # Errors
    ///
    /// `WriteDenied` unless `actor` holds the row lock. `QuerySyntax` when the
    /// spec's key names a different row than `row_key`. `RowNotFound` when the
    /// row no longer exists.
    #[tracing::instrument(skip(self, spec, actor), fields(actor = %actor.name))]
    pub async fn commit_edit(
        &self,
        table_id: TableId,
        row_key: &str,
        spec: &UpdateSpec,
        actor: &Actor,
    ) -> Result<Vec<AuditEntry>> {
        self.authorize(actor, table_id, Access::Write)?;
        let config = self.catalog.get(table_id)?;

        let start = Instant::now();
        let result = async {
            let (conn, target) = self.open(config).await?;
            let key = target.key_value(row_key)?;
            let row_key = key.to_key_string();
            self.locks.check_write(table_id, &row_key, &actor.name)?;

            let requested = target.primary_key()?.coerce(spec.key().clone());
            if requested != key {
                return Err(DataError::QuerySyntax(format!(
                    "update targets row `{}` but was submitted for row `{row_key}`",
                    requested.to_key_string()
                )));
            }
            let spec = spec.clone().with_key(key.clone());
            target.check_update(&spec)?;

            let mut tx = conn.begin().await?;
            let Some(before) = tx.fetch_row(&target, &key).await? else {
                tx.rollback().await?;
                return Err(DataError::RowNotFound(row_key));
            };
            tx.update(&target, &spec).await?;
            let after = tx.fetch_row(&target, &key).await?.unwrap_or_default();

            let entries = AuditEntry::changes(
                MutationKind::Update,
                table_id,
                &row_key,
                Some(&before),
                Some(&after),
                &actor.name,
            );
            self.commit_with_audit(tx, entries).await
        }
        .await;
        observe("update", config, start, &result);
        result
    }

    /// Insert a new row. No lock is needed since the row did not exist.
    ///
    /// Returns the new row key and its audit entry.
    #[tracing::instrument(skip(self, spec, actor), fields(actor = %actor.name))]
    pub async fn insert_row(
        &self,
        table_id: TableId,
        spec: &InsertSpec,
        actor: &Actor,
    ) -> Result<(String, AuditEntry)> {
        self.authorize(actor, table_id, Access::Write)?;
        let config = self.catalog.get(table_id)?;

        let start = Instant::now();
        let result = async {
            let (conn, target) = self.open(config).await?;
            let mut tx = conn.begin().await?;
            let key = tx.insert(&target, spec).await?;
            let after = tx.fetch_row(&target, &key).await?.unwrap_or_else(|| spec.values().clone());
            let row_key = key.to_key_string();

            let entries = AuditEntry::changes(
                MutationKind::Insert,
                table_id,
                &row_key,
                None,
                Some(&after),
                &actor.name,
            );
            let mut written = self.commit_with_audit(tx, entries).await?;
            let entry = written.pop().ok_or_else(|| DataError::AuditWriteFailed {
                reason: "insert entry missing after commit".into(),
                reconciliation_required: true,
            })?;
            Ok((row_key, entry))
        }
        .await;
        observe("insert", config, start, &result);
        result
    }

    /// Delete a row the caller holds the lock on.
    ///
    /// The lock itself stays in place until released or expired.
    #[tracing::instrument(skip(self, actor), fields(actor = %actor.name))]
    pub async fn delete_row(&self, table_id: TableId, row_key: &str, actor: &Actor) -> Result<AuditEntry> {
        self.authorize(actor, table_id, Access::Delete)?;
        let config = self.catalog.get(table_id)?;

        let start = Instant::now();
        let result = async {
            let (conn, target) = self.open(config).await?;
            let key = target.key_value(row_key)?;
            let row_key = key.to_key_string();
            self.locks.check_write(table_id, &row_key, &actor.name)?;

            let mut tx = conn.begin().await?;
            let Some(before) = tx.fetch_row(&target, &key).await? else {
                tx.rollback().await?;
                return Err(DataError::RowNotFound(row_key));
            };
            tx.delete(&target, &DeleteSpec::new(key)?).await?;

            let entries = AuditEntry::changes(
                MutationKind::Delete,
                table_id,
                &row_key,
                Some(&before),
                None,
                &actor.name,
            );
            let mut written = self.commit_with_audit(tx, entries).await?;
            written.pop().ok_or_else(|| DataError::AuditWriteFailed {
                reason: "delete entry missing after commit".into(),
                reconciliation_required: true,
            })
        }
        .await;
        observe("delete", config, start, &result);
        result
    }

    /// Commit a backend transaction together with its audit entries.
    ///
    /// Entries are staged first so a failing audit store aborts the mutation.
    /// Only a failure of the final audit commit, after the backend already
    /// committed, leaves data changed without its entries; that case is
    /// reported with `reconciliation_required`.
    async fn commit_with_audit(
        &self,
        tx: Box<dyn Transaction>,
        entries: Vec<AuditEntry>,
    ) -> Result<Vec<AuditEntry>> {
        if entries.is_empty() {
            tx.commit().await?;
            return Ok(entries);
        }

        let staged = match self.audit.stage(entries).await {
            Ok(staged) => staged,
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    tracing::warn!(error = %rollback, "backend rollback failed after audit error");
                }
                tracing::error!(error = %e, "audit staging failed, mutation rolled back");
                return Err(audit_failed(&e, false));
            }
        };

        if let Err(e) = tx.commit().await {
            if let Err(rollback) = staged.rollback().await {
                tracing::warn!(error = %rollback, "audit rollback failed after backend error");
            }
            return Err(e);
        }

        staged.commit().await.map_err(|e| {
            tracing::error!(
                error = %e,
                "mutation committed but its audit entries were lost; manual reconciliation required"
            );
            audit_failed(&e, true)
        })
    }

    /// Audit history of one row, oldest first.
    pub async fn row_history(&self, table_id: TableId, row_key: &str) -> Result<Vec<AuditEntry>> {
        let reader = self.history.clone();
        let row_key = row_key.to_string();
        self.query_history(move || reader.for_row(table_id, &row_key)).await
    }

    /// Most recent audit entries of a table, newest first.
    pub async fn table_history(&self, table_id: TableId, limit: u32) -> Result<Vec<AuditEntry>> {
        let reader = self.history.clone();
        self.query_history(move || reader.for_table(table_id, limit)).await
    }

    /// Most recent audit entries written by `actor`, newest first.
    pub async fn actor_history(&self, actor: &str, limit: u32) -> Result<Vec<AuditEntry>> {
        let reader = self.history.clone();
        let actor = actor.to_string();
        self.query_history(move || reader.by_actor(&actor, limit)).await
    }

    /// Audit entries with `from_ms <= timestamp < to_ms`.
    pub async fn history_between(&self, from_ms: i64, to_ms: i64) -> Result<Vec<AuditEntry>> {
        let reader = self.history.clone();
        self.query_history(move || reader.between(from_ms, to_ms)).await
    }

    async fn query_history<F>(&self, query: F) -> Result<Vec<AuditEntry>>
    where
        F: FnOnce() -> std::result::Result<Vec<AuditEntry>, StorageError> + Send + 'static,
    {
        tokio::task::spawn_blocking(query)
            .await
            .map_err(|e| history_failed(&StorageError::from(e)))?
            .map_err(|e| history_failed(&e))
    }

    /// Release every pooled backend connection.
    pub async fn shutdown(&self) {
        self.registry().shutdown().await;
        tracing::info!("data service shut down");
    }
}

fn observe<T>(operation: &'static str, config: &TableConfig, start: Instant, result: &Result<T>) {
    let latency = start.elapsed().as_secs_f64();
    metrics::record_operation(operation, config.kind().as_str(), result.is_ok(), latency);
    if let Err(e) = result {
        if e.is_conflict() || e.is_validation() {
            tracing::debug!(operation, error = %e, "operation rejected");
        } else {
            tracing::warn!(operation, error = %e, "operation failed");
        }
    }
}
