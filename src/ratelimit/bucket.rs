//! Token bucket implementation.

use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tracing::warn;

/// How often `take_with_cancellation` re-attempts a take.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Point-in-time view of a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BucketMetrics {
    /// Maximum token balance
    pub capacity: f64,
    /// Tokens restored per second
    pub rate: f64,
    /// Tokens currently available
    pub available_tokens: f64,
}

/// A token bucket for a single client.
///
/// The balance refills continuously at `rate` tokens per second up to
/// `capacity`. Refill and consumption happen together under one lock, so
/// concurrent takes observe a linear history of balance changes.
pub struct TokenBucket {
    /// Maximum balance
    capacity: f64,
    /// Mutable accounting state
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    rate: f64,
    last_refill: Instant,
}

/// Map a rate or capacity that is negative, NaN or infinite to zero.
fn sanitize(value: f64) -> f64 {
    if value.is_finite() && value > 0.0 {
        value
    } else {
        0.0
    }
}

/// Time for `deficit` tokens to accrue at `rate`, saturating at
/// `Duration::MAX` when the estimate does not fit in a `Duration`.
fn wait_estimate(deficit: f64, rate: f64) -> Duration {
    let secs = (deficit / rate).max(0.0);
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

impl BucketState {
    /// Credit time elapsed since the last refill. A `now` that trails
    /// `last_refill` credits nothing and leaves the timestamp alone.
    fn refill(&mut self, capacity: f64, now: Instant) {
        if now <= self.last_refill {
            return;
        }
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(capacity);
        self.last_refill = now;
    }
}

impl TokenBucket {
    /// Create a full bucket.
    ///
    /// A capacity or rate that is negative or not finite is treated as zero.
    /// [`RateLimiter`](super::RateLimiter) rejects such values up front.
    pub fn new(capacity: f64, rate: f64) -> Self {
        Self::new_at(capacity, rate, Instant::now())
    }

    pub(crate) fn new_at(capacity: f64, rate: f64, now: Instant) -> Self {
        let capacity = sanitize(capacity);
        let rate = sanitize(rate);
        Self {
            capacity,
            state: Mutex::new(BucketState {
                tokens: capacity,
                rate,
                last_refill: now,
            }),
        }
    }

    /// Try to consume `n` tokens.
    ///
    /// Returns `true` and debits the balance if enough tokens are available,
    /// `false` otherwise. Negative or NaN amounts are always refused.
    pub fn take(&self, n: f64) -> bool {
        self.take_at(n, Instant::now())
    }

    pub(crate) fn take_at(&self, n: f64, now: Instant) -> bool {
        // `!(n >= 0.0)` also catches NaN
        if !(n >= 0.0) {
            return false;
        }

        let mut state = self.state.lock();
        state.refill(self.capacity, now);

        if state.tokens >= n {
            state.tokens -= n;
            true
        } else {
            false
        }
    }

    /// Keep trying to take `n` tokens until `timeout` elapses.
    ///
    /// Between attempts the task sleeps for the estimated time until enough
    /// tokens have accrued, bounded by the remaining time. Requests that can
    /// never succeed (zero rate, or more than `capacity`) fail immediately.
    /// A timeout too large to represent as a deadline waits without one.
    pub async fn take_with_timeout(&self, n: f64, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);

        loop {
            let now = Instant::now();
            let wait = {
                let mut state = self.state.lock();
                state.refill(self.capacity, now);

                if n >= 0.0 && state.tokens >= n {
                    state.tokens -= n;
                    return true;
                }

                if !(n >= 0.0) || n > self.capacity || state.rate <= 0.0 {
                    return false;
                }

                wait_estimate(n - state.tokens, state.rate)
            };

            let wait = match deadline {
                Some(deadline) if now >= deadline => return false,
                Some(deadline) => wait.min(deadline - now),
                None => wait,
            };

            tokio::time::sleep(wait).await;
        }
    }

    /// Poll for `n` tokens every 10ms until the take succeeds or `cancel`
    /// resolves. Cancellation consumes nothing.
    pub async fn take_with_cancellation<F>(&self, cancel: F, n: f64) -> bool
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(cancel);

        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = &mut cancel => return false,
                _ = ticker.tick() => {
                    if self.take(n) {
                        return true;
                    }
                }
            }
        }
    }

    /// Take at most `max_burst` tokens, regardless of how many were asked for.
    pub fn take_with_burst_limit(&self, n: f64, max_burst: f64) -> bool {
        self.take(n.min(max_burst))
    }

    /// Current capacity, rate and balance. Refreshes the refill timestamp.
    pub fn metrics(&self) -> BucketMetrics {
        self.metrics_at(Instant::now())
    }

    pub(crate) fn metrics_at(&self, now: Instant) -> BucketMetrics {
        let mut state = self.state.lock();
        state.refill(self.capacity, now);

        BucketMetrics {
            capacity: self.capacity,
            rate: state.rate,
            available_tokens: state.tokens,
        }
    }

    /// Change the refill rate. Time already elapsed is credited at the old
    /// rate first. Negative or non-finite rates are ignored.
    pub fn set_rate(&self, rate: f64) {
        self.set_rate_at(rate, Instant::now());
    }

    pub(crate) fn set_rate_at(&self, rate: f64, now: Instant) {
        if !rate.is_finite() || rate < 0.0 {
            warn!(rate = rate, "Ignoring invalid refill rate");
            return;
        }

        let mut state = self.state.lock();
        state.refill(self.capacity, now);
        state.rate = rate;
    }

    /// Get the capacity of this bucket.
    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    /// When the balance was last brought up to date.
    pub fn last_refill(&self) -> Instant {
        self.state.lock().last_refill
    }
}

impl std::fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("TokenBucket")
            .field("capacity", &self.capacity)
            .field("rate", &state.rate)
            .field("tokens", &state.tokens)
            .finish()
    }
}
