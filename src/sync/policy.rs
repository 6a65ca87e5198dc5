//! Read-only inspection and tuning of the eviction policy.

use crate::sync::cache::Inner;

use std::{
    hash::{BuildHasher, Hash},
    sync::Arc,
};

/// An entry captured by a policy snapshot.
pub struct CacheEntry<K, V> {
    pub(crate) key: Arc<K>,
    pub(crate) value: Arc<V>,
    pub(crate) weight: u32,
}

impl<K, V> CacheEntry<K, V> {
    pub fn key(&self) -> &Arc<K> {
        &self.key
    }

    pub fn value(&self) -> &Arc<V> {
        &self.value
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }
}

impl<K: std::fmt::Debug, V: std::fmt::Debug> std::fmt::Debug for CacheEntry<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntry")
            .field("key", &self.key)
            .field("value", &self.value)
            .field("weight", &self.weight)
            .finish()
    }
}

/// Inspection and tuning surface returned by
/// [`Cache::policy`](crate::Cache::policy).
///
/// Snapshots run under the eviction lock after applying pending events,
/// so they observe a quiesced policy state; they are weakly consistent
/// with concurrent operations.
pub struct Policy<'a, K, V, S> {
    pub(crate) inner: &'a Arc<Inner<K, V, S>>,
}

impl<'a, K, V, S> Policy<'a, K, V, S>
where
    K: Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
    S: BuildHasher + Clone + Send + Sync + 'static,
{
    /// The current bound, in entries or total weight. `None` when the
    /// cache is unbounded.
    pub fn maximum(&self) -> Option<u64> {
        self.inner.policy_maximum()
    }

    /// Changes the bound and evicts immediately if the cache now exceeds
    /// it.
    pub fn set_maximum(&self, maximum: u64) {
        self.inner.policy_set_maximum(maximum);
    }

    /// The combined policy weight of all entries.
    pub fn weighted_size(&self) -> u64 {
        self.inner.policy_weighted_size()
    }

    /// The weight of one entry, as last measured.
    pub fn weight_of(&self, key: &K) -> Option<u32> {
        self.inner.policy_weight_of(key)
    }

    /// Up to `limit` entries, most frequently useful first.
    pub fn hottest(&self, limit: usize) -> Vec<CacheEntry<K, V>> {
        self.inner.policy_hottest(limit)
    }

    /// Up to `limit` entries in eviction order, next victim first.
    pub fn coldest(&self, limit: usize) -> Vec<CacheEntry<K, V>> {
        self.inner.policy_coldest(limit)
    }

    /// Up to `limit` entries ordered by write age, oldest write first.
    /// Empty unless `expire_after_write` is configured.
    pub fn oldest(&self, limit: usize) -> Vec<CacheEntry<K, V>> {
        self.inner.policy_oldest(limit)
    }

    /// Up to `limit` entries ordered by write age, newest write first.
    /// Empty unless `expire_after_write` is configured.
    pub fn youngest(&self, limit: usize) -> Vec<CacheEntry<K, V>> {
        self.inner.policy_youngest(limit)
    }

    /// Up to `limit` entries ordered by variable-expiration deadline,
    /// soonest first. Empty unless `expire_after` is configured.
    pub fn expiring_soonest(&self, limit: usize) -> Vec<CacheEntry<K, V>> {
        self.inner.policy_expiring_soonest(limit)
    }
}
