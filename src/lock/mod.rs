//! Cooperative row locking.
//!
//! Locks live only in memory and clear on restart. Acquisition is try-once:
//! callers get the lock or a `RowLocked` error naming the holder.

pub mod manager;
pub mod sweeper;

pub use manager::{LockKey, ReleaseOutcome, RowLock, RowLockManager, DEFAULT_LOCK_TTL};
pub use sweeper::spawn_sweeper;
