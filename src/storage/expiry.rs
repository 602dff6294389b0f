//! Background Expiry Sweeper
//!
//! Lazy expiry (checking on access) never reclaims a key that expires and is
//! not touched again. The sweeper is a Tokio task that periodically calls
//! [`StorageEngine::cleanup_expired`] so such keys are removed too.
//!
//! The sweep interval adapts to the observed expiry rate: a sweep that removes
//! a large share of keys halves the interval, an idle sweep doubles it, both
//! clamped to `[min_interval, max_interval]`.
//!
//! The sweeper runs on the Tokio runtime owned by `main`, independent of the
//! reactor and executor threads of the network core.

use crate::storage::{Storage, StorageEngine};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

/// Sweep pacing.
#[derive(Debug, Clone)]
pub struct ExpiryConfig {
    /// Interval of the first sweep
    pub base_interval: Duration,
    pub min_interval: Duration,
    pub max_interval: Duration,
    /// Share of keys expiring in one sweep above which the interval halves
    pub speedup_threshold: f64,
}

impl Default for ExpiryConfig {
    fn default() -> Self {
        Self {
            base_interval: Duration::from_millis(100),
            min_interval: Duration::from_millis(10),
            max_interval: Duration::from_secs(1),
            speedup_threshold: 0.25,
        }
    }
}

impl ExpiryConfig {
    /// Computes the interval after a sweep that removed `expired` of `keys_before` keys.
    fn next_interval(&self, current: Duration, expired: u64, keys_before: u64) -> Duration {
        if expired == 0 {
            return (current * 2).min(self.max_interval);
        }
        let rate = expired as f64 / keys_before.max(1) as f64;
        if rate > self.speedup_threshold {
            (current / 2).max(self.min_interval)
        } else {
            current
        }
    }
}

/// A handle to the running expiry sweeper.
///
/// Dropping the handle signals the task to stop; [`ExpirySweeper::shutdown`]
/// additionally waits for it.
#[derive(Debug)]
pub struct ExpirySweeper {
    shutdown_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl ExpirySweeper {
    /// Spawns the sweep task on the current runtime.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(engine: Arc<StorageEngine>, config: ExpiryConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        info!(
            interval_ms = config.base_interval.as_millis() as u64,
            "Expiry sweeper started"
        );
        let task = tokio::spawn(sweeper_loop(engine, config, shutdown_rx));

        Self {
            shutdown_tx,
            task: Some(task),
        }
    }

    /// Signals the sweeper to stop without waiting.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Signals the sweeper to stop and waits for the task to finish.
    pub async fn shutdown(mut self) {
        self.stop();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        info!("Expiry sweeper stopped");
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
                    debug!("Expiry sweeper shutting down");
                    return;
                }
            }
        }

        let keys_before = engine.len();
        let expired = engine.cleanup_expired();
        let next = config.next_interval(interval, expired, keys_before);

        if next != interval {
            trace!(
                old_interval_ms = interval.as_millis() as u64,
                new_interval_ms = next.as_millis() as u64,
                "Sweep interval adjusted"
            );
            interval = next;
        }

        if expired > 0 {
            debug!(
                expired,
                keys_remaining = engine.len(),
                "Expired keys cleaned up"
            );
        }
    }
}

/// [`ExpirySweeper::start`] with [`ExpiryConfig::default`].
pub fn start_expiry_sweeper(engine: Arc<StorageEngine>) -> ExpirySweeper {
    ExpirySweeper::start(engine, ExpiryConfig::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Value;
    use bytes::Bytes;

    fn put_ttl(engine: &StorageEngine, key: String, ttl: Duration) {
        engine.put(Bytes::from(key), Value::new("value", 0), Some(ttl));
    }

    #[tokio::test]
    async fn test_sweeper_cleans_expired_keys() {
        let engine = Arc::new(StorageEngine::new());

        for i in 0..10 {
            put_ttl(&engine, format!("key{}", i), Duration::from_millis(50));
        }
        engine.put(Bytes::from("persistent"), Value::new("value", 0), None);

        assert_eq!(engine.len(), 11);

        let config = ExpiryConfig {
            base_interval: Duration::from_millis(10),
            ..Default::default()
        };
        let sweeper = ExpirySweeper::start(Arc::clone(&engine), config);

        tokio::time::sleep(Duration::from_millis(200)).await;

        // Only the persistent key should remain, without any access
        assert_eq!(engine.len(), 1);
        assert!(engine.exists(b"persistent"));

        sweeper.shutdown().await;
    }

    #[tokio::test]
    async fn test_sweeper_stops_on_drop() {
        let engine = Arc::new(StorageEngine::new());

        let config = ExpiryConfig {
            base_interval: Duration::from_millis(10),
            ..Default::default()
        };

        {
            let _sweeper = ExpirySweeper::start(Arc::clone(&engine), config);
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }

        put_ttl(&engine, "key".to_string(), Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Nobody swept, so the entry is still counted until touched
        assert_eq!(engine.len(), 1);
        assert!(engine.get(b"key").is_none());
        assert_eq!(engine.len(), 0);
    }

    #[test]
    fn test_next_interval() {
        let config = ExpiryConfig {
            base_interval: Duration::from_millis(100),
            min_interval: Duration::from_millis(10),
            max_interval: Duration::from_millis(400),
            speedup_threshold: 0.25,
        };
        let base = config.base_interval;

        assert_eq!(config.next_interval(base, 0, 10), Duration::from_millis(200));
        assert_eq!(
            config.next_interval(Duration::from_millis(300), 0, 10),
            Duration::from_millis(400)
        );
        assert_eq!(config.next_interval(base, 5, 10), Duration::from_millis(50));
        assert_eq!(
            config.next_interval(Duration::from_millis(15), 5, 10),
            Duration::from_millis(10)
        );
        assert_eq!(config.next_interval(base, 1, 100), base);
    }
}
