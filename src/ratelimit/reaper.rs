//! Background eviction of idle client buckets.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::registry::ClientRegistry;

/// Shortest pass interval; `tokio::time::interval` rejects a zero period.
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Handle to a running reaper task.
///
/// The task stops when [`Reaper::shutdown`] is called or when the handle is
/// dropped, since either closes the shutdown channel.
pub struct Reaper {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Reaper {
    /// Spawn a reaper that calls `evict_idle(ttl)` on `registry` every
    /// `interval`. Must be called from within a tokio runtime.
    ///
    /// An interval below one millisecond is raised to one millisecond.
    pub fn spawn(registry: Arc<ClientRegistry>, interval: Duration, ttl: Duration) -> Self {
        let interval = if interval < MIN_INTERVAL {
            warn!(
                requested_secs = interval.as_secs_f64(),
                "Reaper interval too short, using minimum"
            );
            MIN_INTERVAL
        } else {
            interval
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        info!(
            interval_secs = interval.as_secs_f64(),
            ttl_secs = ttl.as_secs_f64(),
            "Starting idle bucket reaper"
        );

        let task = tokio::spawn(run(registry, interval, ttl, shutdown_rx));

        Self { shutdown_tx, task }
    }

    /// Stop the reaper and wait for its task to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.task.await;
        info!("Idle bucket reaper stopped");
    }

    /// Check whether the background task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

async fn run(
    registry: Arc<ClientRegistry>,
    interval: Duration,
    ttl: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; nothing can be idle yet
    ticker.tick().await;

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                // A closed channel means the owner is gone
                if changed.is_err() || *shutdown_rx.borrow() {
                    debug!("Reaper received shutdown signal");
                    return;
                }
            }
            _ = ticker.tick() => {
                let removed = registry.evict_idle(ttl);
                if removed > 0 {
                    info!(
                        removed = removed,
                        remaining = registry.len(),
                        "Evicted idle token buckets"
                    );
                } else {
                    debug!(remaining = registry.len(), "Reaper pass found no idle buckets");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reaper_evicts_idle_buckets() {
        let registry = Arc::new(ClientRegistry::new(10.0, 2.0));
        registry.get_or_create("client");

        let reaper = Reaper::spawn(
            registry.clone(),
            Duration::from_millis(20),
            Duration::from_millis(10),
        );

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(registry.is_empty());

        reaper.shutdown().await;
    }

    #[tokio::test]
    async fn test_reaper_keeps_active_buckets() {
        let registry = Arc::new(ClientRegistry::new(10.0, 2.0));
        registry.get_or_create("client");

        let reaper = Reaper::spawn(
            registry.clone(),
            Duration::from_millis(20),
            Duration::from_secs(300),
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(registry.contains("client"));

        reaper.shutdown().await;
    }

    #[tokio::test]
    async fn test_reaper_shutdown_stops_task() {
        let registry = Arc::new(ClientRegistry::new(10.0, 2.0));
        let reaper = Reaper::spawn(
            registry.clone(),
            Duration::from_secs(60),
            Duration::from_secs(300),
        );

        assert!(!reaper.is_finished());
        reaper.shutdown().await;

        // The task no longer holds the registry
        assert_eq!(Arc::strong_count(&registry), 1);
    }

    #[tokio::test]
    async fn test_zero_interval_is_clamped() {
        let registry = Arc::new(ClientRegistry::new(10.0, 2.0));
        registry.get_or_create("client");

        let reaper = Reaper::spawn(registry.clone(), Duration::ZERO, Duration::from_millis(5));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!reaper.is_finished());
        assert!(registry.is_empty());

        reaper.shutdown().await;
    }

    #[tokio::test]
    async fn test_dropping_reaper_stops_task() {
        let registry = Arc::new(ClientRegistry::new(10.0, 2.0));
        let reaper = Reaper::spawn(
            registry.clone(),
            Duration::from_secs(60),
            Duration::from_secs(300),
        );
        drop(reaper);

        tokio::time::timeout(Duration::from_secs(1), async {
            while Arc::strong_count(&registry) > 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("reaper task should exit once its handle is dropped");
    }
}
