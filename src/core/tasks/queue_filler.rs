// src/core/tasks/queue_filler.rs

use crate::core::reconciler::QueueFiller;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::info;

/// A task that periodically runs one reconciliation tick: undoing stale
/// preassignments and preassigning eligible tasks to idle sites.
pub struct QueueFillerTask {
    filler: Arc<QueueFiller>,
    interval: Duration,
}

impl QueueFillerTask {
    pub fn new(filler: Arc<QueueFiller>, interval: Duration) -> Self {
        Self { filler, interval }
    }

    /// The main run loop. Tick failures are handled inside the reconciler;
    /// this loop only ends on shutdown.
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(
            "Queue filler task started. Tick interval: {:?}",
            self.interval
        );
        let mut interval = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.filler.tick().await;
                }
                _ = shutdown_rx.recv() => {
                    info!("Queue filler task shutting down.");
                    return;
                }
            }
        }
    }
}
