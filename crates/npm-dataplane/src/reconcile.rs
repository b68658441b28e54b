//! Background reconcile loop.
//!
//! Periodically asks the manager to clean up orphaned dataplane state. A
//! pass that cannot get the backend's reconcile lock in time is simply
//! skipped; the next tick tries again.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::manager::PolicyManager;

/// Runs reconcile passes every `interval` until `cancel` fires.
pub async fn run_reconcile_loop(
    manager: Arc<PolicyManager>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick completes immediately
    ticker.tick().await;

    info!(interval_secs = interval.as_secs(), "Reconcile loop started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                debug!("Running reconcile pass");
                manager.reconcile().await;
            }
        }
    }
    info!("Reconcile loop stopped");
}

/// Spawns [`run_reconcile_loop`] on the current runtime.
pub fn spawn_reconcile_loop(
    manager: Arc<PolicyManager>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(run_reconcile_loop(manager, interval, cancel))
}
