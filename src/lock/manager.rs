//! In-memory row lock table.
//!
//! Each `(table_id, row_key)` owns a slot behind its own mutex, so
//! transitions on one row never wait on another row. The map of slots is
//! only write-locked to insert a new key or to sweep idle ones.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::time::Instant;

use crate::error::{DataError, Result};
use crate::observability::metrics;
use crate::TableId;

/// Default lock time-to-live.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(300);

/// Identity of a lockable row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockKey {
    pub table_id: TableId,
    pub row_key: String,
}

impl LockKey {
    pub fn new(table_id: TableId, row_key: impl Into<String>) -> Self {
        Self {
            table_id,
            row_key: row_key.into(),
        }
    }
}

/// Exclusive editing claim on one row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowLock {
    pub table_id: TableId,
    pub row_key: String,
    pub holder: String,
    pub acquired_at: Instant,
    pub expires_at: Instant,
}

impl RowLock {
    pub fn is_active_at(&self, now: Instant) -> bool {
        now < self.expires_at
    }

    pub fn is_active(&self) -> bool {
        self.is_active_at(Instant::now())
    }

    /// Time left before expiry, zero once expired.
    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }
}

/// Result of a release call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The caller's lock was released.
    Released,
    /// No active lock existed; nothing changed.
    AlreadyReleased,
}

type Slot = Arc<Mutex<Option<RowLock>>>;

fn lock_slot(slot: &Slot) -> MutexGuard<'_, Option<RowLock>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Process-wide row lock table with TTL expiry.
///
/// Expiry is evaluated lazily whenever a key is touched; [`RowLockManager::sweep`]
/// only reclaims memory.
#[derive(Debug)]
pub struct RowLockManager {
    ttl: Duration,
    slots: RwLock<HashMap<LockKey, Slot>>,
}

impl Default for RowLockManager {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_TTL)
    }
}

impl RowLockManager {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slots: RwLock::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Slot for `key`, created on first use.
    fn slot(&self, key: &LockKey) -> Slot {
        if let Some(slot) = self.existing_slot(key) {
            return slot;
        }
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(slots.entry(key.clone()).or_default())
    }

    fn existing_slot(&self, key: &LockKey) -> Option<Slot> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Acquire the lock on a row, or refresh it if `holder` already owns it.
    ///
    /// Never waits: a row held by someone else fails immediately.
    ///
    /// # Arguments
    ///
    /// * `table_id` - Table the row belongs to
    /// * `row_key` - Primary key of the row, in string form
    /// * `holder` - Actor claiming the row
    ///
    /// # Errors
    ///
    /// `RowLocked` with the current holder and remaining TTL.
    pub fn acquire(&self, table_id: TableId, row_key: &str, holder: &str) -> Result<RowLock> {
        let slot = self.slot(&LockKey::new(table_id, row_key));
        let mut state = lock_slot(&slot);
        let now = Instant::now();

        match state.as_mut() {
            Some(lock) if lock.is_active_at(now) && lock.holder != holder => {
                metrics::record_lock_conflict(table_id);
                Err(DataError::RowLocked {
                    holder: lock.holder.clone(),
                    remaining: lock.expires_at - now,
                })
            }
            Some(lock) if lock.is_active_at(now) => {
                lock.expires_at = now + self.ttl;
                Ok(lock.clone())
            }
            _ => {
                let lock = RowLock {
                    table_id,
                    row_key: row_key.to_string(),
                    holder: holder.to_string(),
                    acquired_at: now,
                    expires_at: now + self.ttl,
                };
                *state = Some(lock.clone());
                tracing::debug!(table_id, row_key, holder, "row lock acquired");
                Ok(lock)
            }
        }
    }

    /// Extend the TTL of a lock `holder` currently owns.
    ///
    /// # Errors
    ///
    /// `NotLockHolder` if the lock expired or belongs to someone else.
    pub fn refresh(&self, table_id: TableId, row_key: &str, holder: &str) -> Result<RowLock> {
        let key = LockKey::new(table_id, row_key);
        let not_holder = |current: Option<String>| DataError::NotLockHolder {
            actor: holder.to_string(),
            holder: current,
        };

        let Some(slot) = self.existing_slot(&key) else {
            return Err(not_holder(None));
        };
        let mut state = lock_slot(&slot);
        let now = Instant::now();

        match state.as_mut() {
            Some(lock) if lock.is_active_at(now) && lock.holder == holder => {
                lock.expires_at = now + self.ttl;
                Ok(lock.clone())
            }
            Some(lock) if lock.is_active_at(now) => Err(not_holder(Some(lock.holder.clone()))),
            _ => Err(not_holder(None)),
        }
    }

    /// Release a row lock.
    ///
    /// Releasing a lock that is absent or expired is not an error.
    ///
    /// # Errors
    ///
    /// `NotLockHolder` when another actor holds the lock.
    pub fn release(&self, table_id: TableId, row_key: &str, holder: &str) -> Result<ReleaseOutcome> {
        let Some(slot) = self.existing_slot(&LockKey::new(table_id, row_key)) else {
            return Ok(ReleaseOutcome::AlreadyReleased);
        };
        let mut state = lock_slot(&slot);
        let now = Instant::now();

        match state.as_ref() {
            Some(lock) if lock.is_active_at(now) && lock.holder == holder => {
                *state = None;
                tracing::debug!(table_id, row_key, holder, "row lock released");
                Ok(ReleaseOutcome::Released)
            }
            Some(lock) if lock.is_active_at(now) => Err(DataError::NotLockHolder {
                actor: holder.to_string(),
                holder: Some(lock.holder.clone()),
            }),
            _ => {
                *state = None;
                Ok(ReleaseOutcome::AlreadyReleased)
            }
        }
    }

    /// Remove the active lock `expected_holder` owns on behalf of `by`.
    ///
    /// Returns false, changing nothing, if the row is no longer held by
    /// `expected_holder`.
    pub fn force_release(
        &self,
        table_id: TableId,
        row_key: &str,
        expected_holder: &str,
        by: &str,
    ) -> bool {
        let Some(slot) = self.existing_slot(&LockKey::new(table_id, row_key)) else {
            return false;
        };
        let mut state = lock_slot(&slot);
        match state.as_ref() {
            Some(lock) if lock.is_active() && lock.holder == expected_holder => {
                *state = None;
                tracing::warn!(
                    table_id,
                    row_key,
                    by,
                    previous_holder = expected_holder,
                    "row lock force-released"
                );
                true
            }
            _ => false,
        }
    }

    /// Check that `actor` holds an active lock on the row.
    ///
    /// # Errors
    ///
    /// `WriteDenied` naming the current holder, if any.
    pub fn check_write(&self, table_id: TableId, row_key: &str, actor: &str) -> Result<()> {
        match self.holder(table_id, row_key) {
            Some(lock) if lock.holder == actor => Ok(()),
            Some(lock) => Err(DataError::WriteDenied(format!(
                "row `{row_key}` is locked by {}",
                lock.holder
            ))),
            None => Err(DataError::WriteDenied(format!(
                "{actor} does not hold a lock on row `{row_key}`"
            ))),
        }
    }

    /// Active lock on the row, if any.
    pub fn holder(&self, table_id: TableId, row_key: &str) -> Option<RowLock> {
        let slot = self.existing_slot(&LockKey::new(table_id, row_key))?;
        let state = lock_slot(&slot);
        state.as_ref().filter(|lock| lock.is_active()).cloned()
    }

    /// Number of active locks.
    pub fn active_count(&self) -> usize {
        let now = Instant::now();
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|slot| {
                lock_slot(slot)
                    .as_ref()
                    .is_some_and(|lock| lock.is_active_at(now))
            })
            .count()
    }

    /// Drop slots that hold no active lock and are not in use.
    ///
    /// Returns the number of slots removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        let before = slots.len();
        slots.retain(|_, slot| {
            // A slot cloned out of the map is mid-transition; leave it alone.
            if Arc::strong_count(slot) > 1 {
                return true;
            }
            let mut state = lock_slot(slot);
            if state.as_ref().is_some_and(|lock| lock.is_active_at(now)) {
                return true;
            }
            *state = None;
            false
        });
        before - slots.len()
    }

    /// Number of tracked slots, active or not.
    pub fn slot_count(&self) -> usize {
        self.slots.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}
