//! Per-master capture scheduling
//!
//! One loop per captured master: block on the vendor change-event primitive
//! (or a timed poll for dialects without one), then run the capture step.
//! Failures back off exponentially between minimum and maximum sleep clamps
//! so a broken master never busy-loops, and a recovered one returns to full
//! speed on the first success.

use crate::common::dialect::Dialect;
use crate::common::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Capture step executed once per signaled event.
#[async_trait]
pub trait MasterPoller: Send + Sync {
    /// Capture pending changes, returning how many records were produced.
    async fn capture(&self) -> Result<u64>;
}

/// Scheduler timing configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How long one event wait may block before re-polling
    pub poll_interval: Duration,
    /// Smallest backoff sleep after a failure
    pub min_sleep: Duration,
    /// Largest backoff sleep after repeated failures
    pub max_sleep: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            min_sleep: Duration::from_millis(500),
            max_sleep: Duration::from_secs(60),
        }
    }
}

/// The capture loop for one master.
pub struct MasterScheduler {
    master_id: String,
    dialect: Arc<dyn Dialect>,
    poller: Arc<dyn MasterPoller>,
    config: SchedulerConfig,
}

impl MasterScheduler {
    pub fn new(
        master_id: impl Into<String>,
        dialect: Arc<dyn Dialect>,
        poller: Arc<dyn MasterPoller>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            master_id: master_id.into(),
            dialect,
            poller,
            config,
        }
    }

    /// Spawn the loop. Send `true` on the returned channel to stop it.
    pub fn spawn(self) -> (watch::Sender<bool>, JoinHandle<()>) {
        let (tx, rx) = watch::channel(false);
        let join = tokio::spawn(self.run(rx));
        (tx, join)
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(master = %self.master_id, "capture scheduler started");
        let mut backoff = self.config.min_sleep;

        loop {
            let waited = tokio::select! {
                _ = shutdown.changed() => break,
                waited = self
                    .dialect
                    .wait_for_event(&self.master_id, self.config.poll_interval) => waited,
            };

            match waited {
                Ok(false) => {
                    // Timed out without an event; wait again.
                    debug!(master = %self.master_id, "no change event");
                    continue;
                }
                Ok(true) => match self.poller.capture().await {
                    Ok(records) => {
                        debug!(master = %self.master_id, records, "capture cycle done");
                        backoff = self.config.min_sleep;
                    }
                    Err(e) => {
                        warn!(
                            master = %self.master_id,
                            error = %e,
                            backoff_ms = backoff.as_millis() as u64,
                            "capture failed, backing off"
                        );
                        backoff = self.sleep_backoff(&mut shutdown, backoff).await;
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                },
                Err(e) => {
                    warn!(
                        master = %self.master_id,
                        error = %e,
                        backoff_ms = backoff.as_millis() as u64,
                        "event wait failed, backing off"
                    );
                    backoff = self.sleep_backoff(&mut shutdown, backoff).await;
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!(master = %self.master_id, "capture scheduler stopped");
    }

    /// Sleep the current backoff, then return the next one, doubled and
    /// clamped to `[min_sleep, max_sleep]`.
    async fn sleep_backoff(
        &self,
        shutdown: &mut watch::Receiver<bool>,
        backoff: Duration,
    ) -> Duration {
        tokio::select! {
            _ = shutdown.changed() => {}
            _ = tokio::time::sleep(backoff) => {}
        }
        (backoff * 2).clamp(self.config.min_sleep, self.config.max_sleep)
    }
}
