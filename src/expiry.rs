use std::time::Duration;

/// Per-entry variable expiration.
///
/// Each hook returns how long the entry may live from now. Durations are
/// clamped to roughly 146 years; returning that clamp effectively pins
/// the entry. The hooks run on the calling thread of the triggering
/// operation, so they should be cheap.
pub trait Expiry<K, V>: Send + Sync + 'static {
    /// Duration after an entry is created.
    fn expire_after_create(&self, key: &K, value: &V) -> Duration;

    /// Duration after an entry's value is replaced. `current` is the
    /// remaining time the entry had. Defaults to keeping it.
    fn expire_after_update(&self, key: &K, value: &V, current: Duration) -> Duration {
        let _ = (key, value);
        current
    }

    /// Duration after an entry is read. `current` is the remaining time
    /// the entry had. Defaults to keeping it.
    fn expire_after_read(&self, key: &K, value: &V, current: Duration) -> Duration {
        let _ = (key, value);
        current
    }
}
