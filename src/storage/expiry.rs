//! Active Expiry
//!
//! Lazy expiry only evicts a key when something touches it. Keys that expire
//! and are never read again would otherwise sit in memory until the next
//! snapshot skipped them, so a background task sweeps the whole keyspace on
//! a timer.
//!
//! The sweep interval adapts to the share of keys each pass evicts: a busy
//! pass halves the interval (down to `min_interval`), an idle pass doubles
//! it (up to `max_interval`).

use crate::storage::StorageEngine;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, trace};

/// Tuning for the expiry sweeper.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpiryConfig {
    /// Interval before the first pass
    pub base_interval: Duration,

    pub min_interval: Duration,

    pub max_interval: Duration,

    /// Evicting more than this share of the keyspace speeds sweeping up
    pub speedup_threshold: f64,

    /// Evicting less than this share of the keyspace slows sweeping down
    pub slowdown_threshold: f64,
}

impl Default for ExpiryConfig {
    fn default() -> Self {
        Self {
            base_interval: Duration::from_millis(100),
            min_interval: Duration::from_millis(10),
            max_interval: Duration::from_secs(1),
            speedup_threshold: 0.25,
            slowdown_threshold: 0.01,
        }
    }
}

impl ExpiryConfig {
    /// The interval to wait after a pass that evicted `expired` of
    /// `keys_before` keys.
    pub fn next_interval(&self, current: Duration, expired: u64, keys_before: usize) -> Duration {
        if keys_before == 0 {
            return current;
        }

        let rate = expired as f64 / keys_before as f64;
        if rate > self.speedup_threshold {
            (current / 2).max(self.min_interval)
        } else if expired == 0 || rate < self.slowdown_threshold {
            (current * 2).min(self.max_interval)
        } else {
            current
        }
    }
}

/// Handle to the running sweeper task. Dropping it stops the task.
#[derive(Debug)]
pub struct ExpirySweeper {
    shutdown_tx: watch::Sender<bool>,
}

impl ExpirySweeper {
    /// Spawns the sweeper onto the current Tokio runtime.
    ///
    /// ```
    /// use snapkv::storage::{ExpiryConfig, ExpirySweeper, StorageEngine};
    /// use std::sync::Arc;
    ///
    /// # #[tokio::main(flavor = "current_thread")]
    /// # async fn main() {
    /// let engine = Arc::new(StorageEngine::new());
    /// let sweeper = ExpirySweeper::start(engine, ExpiryConfig::default());
    /// drop(sweeper);
    /// # }
    /// ```
    pub fn start(engine: Arc<StorageEngine>, config: ExpiryConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(sweeper_loop(engine, config, shutdown_rx));
        info!("Background expiry sweeper started");

        Self { shutdown_tx }
    }

    pub fn stop(&self) {
        if !self.shutdown_tx.send_replace(true) {
            info!("Background expiry sweeper stopped");
        }
    }
}

impl Drop for ExpirySweeper {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn sweeper_loop(
    engine: Arc<StorageEngine>,
    config: ExpiryConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut interval = config.base_interval;

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    debug!("Expiry sweeper received shutdown signal");
                    return;
                }
            }
        }

        let keys_before = engine.stats().keys;
        let expired = engine.cleanup_expired();
        let next = config.next_interval(interval, expired, keys_before);

        if expired > 0 {
            debug!(
                expired,
                keys_remaining = keys_before - expired as usize,
                next_interval_ms = next.as_millis() as u64,
                "Expired keys cleaned up"
            );
        } else if next != interval {
            trace!(next_interval_ms = next.as_millis() as u64, "Sweeper backing off");
        }

        interval = next;
    }
}
