//! Concurrent map from rate-limit key to token bucket.
//!
//! # Locking
//!
//! The map is sharded (`DashMap`). [`BucketRegistry::try_consume`] takes
//! tokens while still holding its shard guard (shared for an existing key,
//! exclusive while creating one), so [`BucketRegistry::evict_idle`] can never
//! remove a bucket between lookup and consumption. Consumers of one shard
//! only share the read side of its lock and otherwise contend on the
//! bucket's own mutex. Lock order is always shard, then bucket.
//!
//! # Growth
//!
//! Keys are created on first access and, for client-scoped rules, one key
//! exists per client IP. [`BucketRegistry::evict_idle`] bounds memory by
//! dropping buckets nobody has touched for a while; the application state
//! runs it periodically.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::debug;

use super::bucket::TokenBucket;
use super::rule::BucketRule;

/// Shared, clonable registry of token buckets.
///
/// Clones share the same underlying map.
#[derive(Debug, Clone, Default)]
pub struct BucketRegistry {
    buckets: Arc<DashMap<String, Arc<TokenBucket>>>,
}

impl BucketRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the bucket for `key`, creating it from `rule` on first access.
    ///
    /// Under concurrent first access exactly one bucket is inserted and every
    /// caller receives that same bucket. The handle may outlive the bucket's
    /// registration if it is evicted; use [`BucketRegistry::try_consume`] to
    /// take tokens.
    pub fn get_or_create(&self, key: &str, rule: &BucketRule) -> Arc<TokenBucket> {
        if let Some(bucket) = self.buckets.get(key) {
            return Arc::clone(bucket.value());
        }

        // Losers of a creation race find the winner's bucket in the entry
        self.buckets
            .entry(key.to_owned())
            .or_insert_with(|| new_bucket(key, rule))
            .value()
            .clone()
    }

    /// Take one request's worth of tokens (`rule.quantum()`) from `key`'s bucket.
    ///
    /// Returns the number of tokens granted (zero on rejection). Tokens are
    /// taken under the shard guard, so the bucket charged is always the one
    /// registered for `key`.
    pub fn try_consume(&self, key: &str, rule: &BucketRule) -> u64 {
        if let Some(bucket) = self.buckets.get(key) {
            return bucket.try_consume(rule.quantum());
        }

        self.buckets
            .entry(key.to_owned())
            .or_insert_with(|| new_bucket(key, rule))
            .try_consume(rule.quantum())
    }

    /// Drop the bucket for `key`. Returns `true` if one existed.
    pub fn remove(&self, key: &str) -> bool {
        self.buckets.remove(key).is_some()
    }

    /// Number of live buckets.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Evict buckets that have been idle for at least `max_idle`.
    ///
    /// A bucket is kept until it has also been idle long enough to refill
    /// completely, so evicting it and recreating it later never changes an
    /// admission decision. Returns the number of buckets removed.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| {
            let threshold = max_idle.max(bucket.time_to_full());
            bucket.idle_for() < threshold
        });
        before.saturating_sub(self.buckets.len())
    }
}

fn new_bucket(key: &str, rule: &BucketRule) -> Arc<TokenBucket> {
    debug!(
        key,
        capacity = rule.capacity(),
        fill_rate = rule.fill_rate(),
        "Creating token bucket"
    );
    Arc::new(TokenBucket::new_unchecked(rule.capacity(), rule.fill_rate()))
}
