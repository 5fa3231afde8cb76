//! Background reclamation of idle lock slots.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::RowLockManager;
use crate::observability::metrics;

/// Spawn a task that sweeps `manager` every `interval` until shutdown.
///
/// The task exits when `shutdown_rx` observes `true` or its sender is dropped.
pub fn spawn_sweeper(
    manager: Arc<RowLockManager>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = manager.sweep();
                    let active = manager.active_count();
                    metrics::record_active_locks(active);
                    if removed > 0 {
                        tracing::debug!(removed, active, "swept idle lock slots");
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::debug!("lock sweeper stopped");
    })
}
