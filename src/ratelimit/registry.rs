//! Per-client bucket registry.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use super::bucket::TokenBucket;

/// Concurrent map from client identifier to its token bucket.
///
/// Lookups of existing clients only take the shared lock. Creating a bucket,
/// evicting idle ones and changing the rate take the exclusive lock.
/// Buckets are handed out as `Arc`s, so an evicted bucket stays usable by
/// whoever already holds it.
pub struct ClientRegistry {
    /// Capacity given to every new bucket
    capacity: f64,
    /// Buckets and the default rate, behind one lock
    inner: RwLock<RegistryState>,
}

struct RegistryState {
    buckets: HashMap<String, Arc<TokenBucket>>,
    rate: f64,
}

impl ClientRegistry {
    /// Create an empty registry.
    pub fn new(capacity: f64, rate: f64) -> Self {
        Self {
            capacity,
            inner: RwLock::new(RegistryState {
                buckets: HashMap::new(),
                rate,
            }),
        }
    }

    /// Get the bucket for `client_id`, creating a full one on first use.
    pub fn get_or_create(&self, client_id: &str) -> Arc<TokenBucket> {
        if let Some(bucket) = self.inner.read().buckets.get(client_id) {
            return bucket.clone();
        }

        let mut inner = self.inner.write();

        // Another caller may have inserted it while we waited for the write lock
        if let Some(bucket) = inner.buckets.get(client_id) {
            return bucket.clone();
        }

        debug!(
            client_id = %client_id,
            capacity = self.capacity,
            rate = inner.rate,
            "Creating new token bucket"
        );

        let bucket = Arc::new(TokenBucket::new(self.capacity, inner.rate));
        inner.buckets.insert(client_id.to_string(), bucket.clone());
        bucket
    }

    /// Remove buckets that have not been refilled for longer than `ttl`.
    ///
    /// Reading metrics refreshes the refill timestamp, so it counts as
    /// activity. Returns the number of buckets removed.
    pub fn evict_idle(&self, ttl: Duration) -> usize {
        self.evict_idle_at(ttl, Instant::now())
    }

    pub(crate) fn evict_idle_at(&self, ttl: Duration, now: Instant) -> usize {
        let mut inner = self.inner.write();
        let before = inner.buckets.len();

        inner
            .buckets
            .retain(|_, bucket| now.saturating_duration_since(bucket.last_refill()) <= ttl);

        before - inner.buckets.len()
    }

    /// Replace the default rate and apply it to every live bucket.
    pub fn set_rate(&self, rate: f64) {
        let mut inner = self.inner.write();
        inner.rate = rate;
        for bucket in inner.buckets.values() {
            bucket.set_rate(rate);
        }
    }

    /// Rate given to newly created buckets.
    pub fn rate(&self) -> f64 {
        self.inner.read().rate
    }

    /// Capacity given to newly created buckets.
    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    /// Check whether a bucket exists for `client_id`.
    pub fn contains(&self, client_id: &str) -> bool {
        self.inner.read().buckets.contains_key(client_id)
    }

    /// Get the number of tracked clients.
    pub fn len(&self) -> usize {
        self.inner.read().buckets.len()
    }

    /// Check whether no clients are tracked.
    pub fn is_empty(&self) -> bool {
        self.inner.read().buckets.is_empty()
    }
}
