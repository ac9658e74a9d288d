//! Scheduler background worker.
//!
//! Periodically places pending pods, including those a recovery could not
//! re-place when it evicted their node.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, instrument};

use super::pass::{place_pending, PlacementReport};
use super::placement::Strategy;
use crate::registry::Registry;

/// Worker that runs placement passes on an interval.
pub struct SchedulerWorker {
    registry: Arc<Registry>,
    strategy: Strategy,
    interval: Duration,
}

impl SchedulerWorker {
    pub fn new(registry: Arc<Registry>, strategy: Strategy, interval: Duration) -> Self {
        Self {
            registry,
            strategy,
            interval,
        }
    }

    /// Run until shutdown is signaled.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            strategy = %self.strategy,
            "Starting scheduler worker"
        );

        let mut interval = tokio::time::interval(self.interval);
        // Skip the immediate first tick
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.run_pass().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Scheduler worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Run a single placement pass over all pending pods.
    pub async fn run_pass(&self) -> PlacementReport {
        let strategy = self.strategy;
        let report = self
            .registry
            .transact(|state| place_pending(state, strategy))
            .await;

        if report.is_empty() {
            debug!("No pending pods");
        } else {
            info!(
                placed = report.placed.len(),
                unplaced = report.unplaced.len(),
                "Scheduler pass complete"
            );
        }
        report
    }
}
