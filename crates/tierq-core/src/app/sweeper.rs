//! RetrySweeper: periodic cleanup of the retry ledger.
//!
//! Retry records also carry a TTL, so a sweeper that never runs only
//! delays their removal.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::domain::EngineError;
use crate::queue::PriorityQueueHandler;

pub struct RetrySweeper {
    handler: Arc<PriorityQueueHandler>,
    interval: Duration,
    horizon_hours: u64,
}

impl RetrySweeper {
    pub fn new(handler: Arc<PriorityQueueHandler>, interval: Duration, horizon_hours: u64) -> Self {
        Self {
            handler,
            interval,
            horizon_hours,
        }
    }

    /// Interval and horizon taken from the handler's config.
    pub fn from_config(handler: Arc<PriorityQueueHandler>) -> Self {
        let interval = handler.config().sweep_interval();
        let horizon_hours = handler.config().cleanup_horizon_hours;
        Self::new(handler, interval, horizon_hours)
    }

    pub async fn sweep_once(&self) -> Result<usize, EngineError> {
        self.handler.cleanup_old_retry_info(self.horizon_hours).await
    }

    /// Sweep on every tick until shutdown. The first sweep runs at once.
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            tokio::select! {
                _ = shutdown_rx.changed() => continue,
                _ = ticker.tick() => {}
            }
            // failures are logged by the handler; the next tick tries again
            let _ = self.sweep_once().await;
        }
        tracing::debug!("retry sweeper stopped");
    }

    pub fn spawn(self, shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown_rx))
    }
}
