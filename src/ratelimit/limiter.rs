//! Per-client rate limiter.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace};

use super::bucket::{BucketMetrics, TokenBucket};
use super::reaper::Reaper;
use super::registry::ClientRegistry;
use crate::error::{Result, TurnstileError};

/// Default interval between reaper passes.
const DEFAULT_REAP_INTERVAL: Duration = Duration::from_secs(60);
/// Default idle time before a client's bucket is dropped.
const DEFAULT_IDLE_TTL: Duration = Duration::from_secs(300);

/// Settings for a [`RateLimiter`].
#[derive(Debug, Clone, PartialEq)]
pub struct LimiterConfig {
    /// Maximum burst per client
    pub capacity: f64,
    /// Tokens restored per second
    pub rate: f64,
    /// How often idle buckets are looked for
    pub reap_interval: Duration,
    /// How long a bucket may sit idle before it is dropped
    pub idle_ttl: Duration,
}

impl LimiterConfig {
    /// Create a configuration with the default reaper schedule.
    pub fn new(capacity: f64, rate: f64) -> Self {
        Self {
            capacity,
            rate,
            reap_interval: DEFAULT_REAP_INTERVAL,
            idle_ttl: DEFAULT_IDLE_TTL,
        }
    }

    /// Check that capacity and rate are positive and finite, and that the
    /// reaper schedule is non-zero.
    pub fn validate(&self) -> Result<()> {
        validate_positive("capacity", self.capacity)?;
        validate_positive("rate", self.rate)?;

        if self.reap_interval.is_zero() {
            return Err(TurnstileError::Config(
                "reap interval must be greater than zero".to_string(),
            ));
        }
        if self.idle_ttl.is_zero() {
            return Err(TurnstileError::Config(
                "idle TTL must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}

fn validate_positive(name: &str, value: f64) -> Result<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(TurnstileError::Config(format!(
            "{} must be a positive number, got {}",
            name, value
        )))
    }
}

/// Admission control keyed by client identifier.
///
/// Every client gets its own token bucket on first sight. A background
/// reaper, started with [`RateLimiter::start`], drops buckets that have been
/// idle for longer than the configured TTL. The limiter is `Send + Sync` and
/// meant to be shared behind an `Arc`.
pub struct RateLimiter {
    /// Client buckets
    registry: Arc<ClientRegistry>,
    /// Reaper schedule
    reap_interval: Duration,
    idle_ttl: Duration,
    /// Running reaper, if started
    reaper: Mutex<Option<Reaper>>,
}

impl RateLimiter {
    /// Create a limiter with the given burst capacity and refill rate.
    pub fn new(capacity: f64, rate: f64) -> Result<Self> {
        Self::with_config(LimiterConfig::new(capacity, rate))
    }

    /// Create a limiter from a full configuration.
    pub fn with_config(config: LimiterConfig) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            registry: Arc::new(ClientRegistry::new(config.capacity, config.rate)),
            reap_interval: config.reap_interval,
            idle_ttl: config.idle_ttl,
            reaper: Mutex::new(None),
        })
    }

    /// Start the background reaper. Calling this again while it runs is a
    /// no-op. Must be called from within a tokio runtime.
    pub fn start(&self) {
        let mut reaper = self.reaper.lock();
        if reaper.is_none() {
            *reaper = Some(Reaper::spawn(
                self.registry.clone(),
                self.reap_interval,
                self.idle_ttl,
            ));
        }
    }

    /// Stop the background reaper and wait for it to exit.
    pub async fn shutdown(&self) {
        let reaper = self.reaper.lock().take();
        if let Some(reaper) = reaper {
            reaper.shutdown().await;
            info!("Rate limiter shut down");
        }
    }

    /// Check whether the background reaper is running.
    pub fn is_running(&self) -> bool {
        self.reaper
            .lock()
            .as_ref()
            .map(|reaper| !reaper.is_finished())
            .unwrap_or(false)
    }

    /// Admit one request from `client_id` if it has a token left.
    pub fn allow(&self, client_id: &str) -> bool {
        self.allow_n(client_id, 1.0)
    }

    /// Admit a request costing `n` tokens from `client_id`.
    pub fn allow_n(&self, client_id: &str, n: f64) -> bool {
        trace!(client_id = %client_id, tokens = n, "Checking rate limit");

        let allowed = self.registry.get_or_create(client_id).take(n);
        if !allowed {
            debug!(client_id = %client_id, tokens = n, "Rate limit exceeded");
        }
        allowed
    }

    /// Report capacity, rate and available tokens for `client_id`.
    ///
    /// Creates the client's bucket if needed and counts as activity for the
    /// reaper.
    pub fn get_metrics(&self, client_id: &str) -> BucketMetrics {
        self.registry.get_or_create(client_id).metrics()
    }

    /// Change the refill rate for new and existing clients.
    pub fn set_rate(&self, rate: f64) -> Result<()> {
        validate_positive("rate", rate)?;

        self.registry.set_rate(rate);
        info!(rate = rate, clients = self.registry.len(), "Refill rate updated");
        Ok(())
    }

    /// Get the bucket for `client_id`, for callers that want to wait for
    /// tokens rather than be rejected.
    pub fn bucket(&self, client_id: &str) -> Arc<TokenBucket> {
        self.registry.get_or_create(client_id)
    }

    /// Run one eviction pass now. Returns the number of buckets removed.
    pub fn evict_idle(&self) -> usize {
        self.registry.evict_idle(self.idle_ttl)
    }

    /// Get the number of tracked clients.
    pub fn client_count(&self) -> usize {
        self.registry.len()
    }

    /// Get the burst capacity given to each client.
    pub fn capacity(&self) -> f64 {
        self.registry.capacity()
    }

    /// Get the current refill rate.
    pub fn rate(&self) -> f64 {
        self.registry.rate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    const EPSILON: f64 = 1e-6;

    #[test]
    fn test_rate_limiter_creation() {
        let limiter = RateLimiter::new(10.0, 2.0).unwrap();
        assert_eq!(limiter.client_count(), 0);
        assert_eq!(limiter.capacity(), 10.0);
        assert_eq!(limiter.rate(), 2.0);
        assert!(!limiter.is_running());
    }

    #[test]
    fn test_invalid_configuration_rejected() {
        assert!(matches!(
            RateLimiter::new(0.0, 2.0),
            Err(TurnstileError::Config(_))
        ));
        assert!(RateLimiter::new(10.0, 0.0).is_err());
        assert!(RateLimiter::new(-1.0, 2.0).is_err());
        assert!(RateLimiter::new(10.0, f64::NAN).is_err());
        assert!(RateLimiter::new(f64::INFINITY, 2.0).is_err());

        let mut config = LimiterConfig::new(10.0, 2.0);
        config.idle_ttl = Duration::ZERO;
        assert!(RateLimiter::with_config(config).is_err());
    }

    #[test]
    fn test_allow_until_exhausted() {
        let limiter = RateLimiter::new(10.0, 2.0).unwrap();

        for i in 1..=10 {
            assert!(limiter.allow("client"), "Request {} should be allowed", i);
        }

        // The 11th request should be rejected
        assert!(!limiter.allow("client"));
    }

    #[test]
    fn test_refill_after_one_second() {
        let limiter = RateLimiter::new(10.0, 2.0).unwrap();
        let bucket = limiter.bucket("client");
        let t0 = bucket.last_refill();

        for _ in 0..10 {
            assert!(bucket.take_at(1.0, t0));
        }

        let t1 = t0 + Duration::from_secs(1);
        let metrics = bucket.metrics_at(t1);
        assert!((metrics.available_tokens - 2.0).abs() < EPSILON);

        assert!(bucket.take_at(1.0, t1));
        assert!(bucket.take_at(1.0, t1));
        assert!(!bucket.take_at(1.0, t1));
    }

    #[test]
    fn test_allow_n_over_capacity_never_succeeds() {
        let limiter = RateLimiter::new(10.0, 2.0).unwrap();

        assert!(!limiter.allow_n("client", 15.0));

        let bucket = limiter.bucket("client");
        let later = Instant::now() + Duration::from_secs(3600);
        assert!(!bucket.take_at(15.0, later));
    }

    #[test]
    fn test_allow_n_fractional() {
        let limiter = RateLimiter::new(10.0, 0.001).unwrap();

        assert!(limiter.allow_n("client", 9.5));
        assert!(limiter.allow_n("client", 0.5));
        assert!(!limiter.allow_n("client", 0.5));
    }

    #[test]
    fn test_get_metrics_does_not_consume() {
        let limiter = RateLimiter::new(10.0, 2.0).unwrap();

        let metrics = limiter.get_metrics("client");
        assert_eq!(metrics.capacity, 10.0);
        assert_eq!(metrics.rate, 2.0);
        assert_eq!(metrics.available_tokens, 10.0);

        let again = limiter.get_metrics("client");
        assert_eq!(again.available_tokens, 10.0);
        assert_eq!(limiter.client_count(), 1);
    }

    #[test]
    fn test_different_clients_have_separate_buckets() {
        let limiter = Arc::new(RateLimiter::new(20.0, 0.001).unwrap());

        let handles: Vec<_> = ["alice", "bob"]
            .into_iter()
            .map(|client| {
                let limiter = limiter.clone();
                thread::spawn(move || (0..30).filter(|_| limiter.allow(client)).count())
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), 20);
        }
        assert_eq!(limiter.client_count(), 2);
    }

    #[test]
    fn test_set_rate_applies_to_existing_clients() {
        let limiter = RateLimiter::new(10.0, 2.0).unwrap();
        limiter.allow("existing");

        limiter.set_rate(7.5).unwrap();

        assert_eq!(limiter.rate(), 7.5);
        assert_eq!(limiter.get_metrics("existing").rate, 7.5);
        assert_eq!(limiter.get_metrics("new").rate, 7.5);
    }

    #[test]
    fn test_set_rate_rejects_invalid_rate() {
        let limiter = RateLimiter::new(10.0, 2.0).unwrap();

        assert!(limiter.set_rate(0.0).is_err());
        assert!(limiter.set_rate(-3.0).is_err());
        assert_eq!(limiter.rate(), 2.0);
    }

    #[test]
    fn test_evicted_client_returns_at_full_capacity() {
        let config = LimiterConfig {
            idle_ttl: Duration::from_millis(1),
            ..LimiterConfig::new(10.0, 0.001)
        };
        let limiter = RateLimiter::with_config(config).unwrap();

        for _ in 0..10 {
            assert!(limiter.allow("client"));
        }
        assert!(!limiter.allow("client"));

        thread::sleep(Duration::from_millis(10));
        assert_eq!(limiter.evict_idle(), 1);

        assert_eq!(limiter.get_metrics("client").available_tokens, 10.0);
        assert!(limiter.allow("client"));
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let limiter = RateLimiter::new(10.0, 2.0).unwrap();

        limiter.start();
        assert!(limiter.is_running());

        // Starting twice keeps the single reaper
        limiter.start();
        assert!(limiter.is_running());

        limiter.shutdown().await;
        assert!(!limiter.is_running());

        // Shutting down again is harmless
        limiter.shutdown().await;
    }

    #[tokio::test]
    async fn test_background_reaper_evicts() {
        let config = LimiterConfig {
            reap_interval: Duration::from_millis(20),
            idle_ttl: Duration::from_millis(10),
            ..LimiterConfig::new(10.0, 2.0)
        };
        let limiter = RateLimiter::with_config(config).unwrap();
        limiter.start();

        limiter.allow("client");
        assert_eq!(limiter.client_count(), 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(limiter.client_count(), 0);

        limiter.shutdown().await;
    }

    #[tokio::test]
    async fn test_take_with_timeout_through_facade() {
        let limiter = RateLimiter::new(1.0, 100.0).unwrap();
        assert!(limiter.allow("client"));

        let bucket = limiter.bucket("client");
        assert!(bucket.take_with_timeout(1.0, Duration::from_millis(500)).await);
    }
}
