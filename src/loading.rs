//! User-supplied collaborators for populating and mirroring the cache.

use crate::notification::RemovalCause;

use std::sync::Arc;

/// Computes values for keys on behalf of `get_all` and `refresh`.
///
/// `load` returning `None` means the key has no value; the cache stores
/// nothing for it.
pub trait CacheLoader<K, V>: Send + Sync + 'static {
    fn load(&self, key: &K) -> Option<V>;

    /// Recomputes the value during a refresh. Defaults to `load`.
    /// Returning `None` keeps the current value and restarts the refresh
    /// clock without notifying anyone.
    fn reload(&self, key: &K, old_value: &V) -> Option<V> {
        let _ = old_value;
        self.load(key)
    }

    /// Bulk hook used by `get_all`. Returning `None` (the default) makes
    /// the cache fall back to one `load` call per missing key.
    fn load_all(&self, keys: &[Arc<K>]) -> Option<Vec<(Arc<K>, V)>> {
        let _ = keys;
        None
    }
}

/// Mirrors cache mutations into a secondary store, synchronously with the
/// mutating operation.
///
/// `write` runs inside `insert` before the new value becomes visible;
/// `delete` runs inside `invalidate` and inside eviction. A panic from
/// either surfaces to the caller of the mutating operation; mutations
/// already applied are not rolled back.
pub trait CacheWriter<K, V>: Send + Sync + 'static {
    fn write(&self, key: &K, value: &V);
    fn delete(&self, key: &K, value: Option<&V>, cause: RemovalCause);
}

/// The default writer; does nothing and costs nothing.
pub(crate) struct DisabledCacheWriter;

impl<K, V> CacheWriter<K, V> for DisabledCacheWriter
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn write(&self, _key: &K, _value: &V) {}
    fn delete(&self, _key: &K, _value: Option<&V>, _cause: RemovalCause) {}
}
