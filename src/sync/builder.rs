use crate::{
    common::time::Clock,
    error::BuildError,
    expiry::Expiry,
    loading::{CacheLoader, CacheWriter},
    notification::{RemovalCause, RemovalListener},
    stats::{ConcurrentStatsCounter, StatsCounter},
    sync::{Cache, Weigher},
};

use std::{
    collections::hash_map::RandomState,
    hash::{BuildHasher, Hash},
    marker::PhantomData,
    sync::Arc,
    time::Duration,
};

/// Resolved configuration handed to the cache constructor.
pub(crate) struct Config<K, V> {
    pub(crate) maximum: Option<u64>,
    pub(crate) weigher: Option<Weigher<K, V>>,
    pub(crate) initial_capacity: Option<usize>,
    pub(crate) time_to_live: Option<Duration>,
    pub(crate) time_to_idle: Option<Duration>,
    pub(crate) expiry: Option<Arc<dyn Expiry<K, V>>>,
    pub(crate) refresh_after_write: Option<Duration>,
    pub(crate) loader: Option<Arc<dyn CacheLoader<K, V>>>,
    pub(crate) removal_listener: Option<RemovalListener<K, V>>,
    pub(crate) cache_writer: Option<Arc<dyn CacheWriter<K, V>>>,
    pub(crate) stats_counter: Option<Arc<dyn StatsCounter>>,
    pub(crate) ticker: Clock,
}

/// Builds a [`Cache`] from the recognized configuration options.
///
/// # Examples
///
/// ```
/// use arabica::Cache;
/// use std::time::Duration;
///
/// let cache: Cache<String, String> = Cache::builder()
///     .max_capacity(10_000)
///     .expire_after_write(Duration::from_secs(30 * 60))
///     .build();
/// cache.insert("a".into(), "Alice".into());
/// ```
pub struct CacheBuilder<K, V> {
    max_capacity: Option<u64>,
    max_weight: Option<u64>,
    weigher: Option<Weigher<K, V>>,
    initial_capacity: Option<usize>,
    time_to_live: Option<Duration>,
    time_to_idle: Option<Duration>,
    expiry: Option<Arc<dyn Expiry<K, V>>>,
    refresh_after_write: Option<Duration>,
    loader: Option<Arc<dyn CacheLoader<K, V>>>,
    removal_listener: Option<RemovalListener<K, V>>,
    cache_writer: Option<Arc<dyn CacheWriter<K, V>>>,
    record_stats: bool,
    stats_counter: Option<Arc<dyn StatsCounter>>,
    ticker: Option<Clock>,
    _marker: PhantomData<(K, V)>,
}

impl<K, V> Default for CacheBuilder<K, V> {
    fn default() -> Self {
        Self {
            max_capacity: None,
            max_weight: None,
            weigher: None,
            initial_capacity: None,
            time_to_live: None,
            time_to_idle: None,
            expiry: None,
            refresh_after_write: None,
            loader: None,
            removal_listener: None,
            cache_writer: None,
            record_stats: false,
            stats_counter: None,
            ticker: None,
            _marker: PhantomData,
        }
    }
}

impl<K, V> CacheBuilder<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bounds the cache by entry count; every entry weighs one.
    pub fn max_capacity(mut self, max_capacity: u64) -> Self {
        self.max_capacity = Some(max_capacity);
        self
    }

    /// Bounds the cache by the total weight of its entries, as measured
    /// by the weigher.
    pub fn max_weight(mut self, max_weight: u64) -> Self {
        self.max_weight = Some(max_weight);
        self
    }

    /// Measures each entry at insertion and update time. Weights are
    /// never re-measured spontaneously.
    pub fn weigher(mut self, weigher: impl Fn(&K, &V) -> u32 + Send + Sync + 'static) -> Self {
        self.weigher = Some(Arc::new(weigher));
        self
    }

    /// A sizing hint for the backing map and the frequency sketch.
    pub fn initial_capacity(mut self, capacity: usize) -> Self {
        self.initial_capacity = Some(capacity);
        self
    }

    /// Expires entries a fixed duration after their last write.
    pub fn expire_after_write(mut self, duration: Duration) -> Self {
        self.time_to_live = Some(duration);
        self
    }

    /// Expires entries a fixed duration after their last read or write.
    pub fn expire_after_access(mut self, duration: Duration) -> Self {
        self.time_to_idle = Some(duration);
        self
    }

    /// Gives each entry its own expiration deadline, recomputed on
    /// create, update and read.
    pub fn expire_after(mut self, expiry: impl Expiry<K, V>) -> Self {
        self.expiry = Some(Arc::new(expiry));
        self
    }

    /// Reloads an entry in the background when a read finds it older
    /// than the given duration. Requires a loader.
    pub fn refresh_after_write(mut self, duration: Duration) -> Self {
        self.refresh_after_write = Some(duration);
        self
    }

    /// Computes values for `get_all`, `refresh`, and
    /// `refresh_after_write`.
    pub fn loader(mut self, loader: impl CacheLoader<K, V>) -> Self {
        self.loader = Some(Arc::new(loader));
        self
    }

    /// Notified of every removal, with its cause, outside the removing
    /// operation.
    pub fn removal_listener(
        mut self,
        listener: impl Fn(Arc<K>, Arc<V>, RemovalCause) + Send + Sync + 'static,
    ) -> Self {
        self.removal_listener = Some(Arc::new(listener));
        self
    }

    /// Mirrors writes and deletes into a secondary store, synchronously
    /// with the mutating operation.
    pub fn cache_writer(mut self, writer: impl CacheWriter<K, V>) -> Self {
        self.cache_writer = Some(Arc::new(writer));
        self
    }

    /// Turns on hit, miss, load and eviction counting.
    pub fn record_stats(mut self) -> Self {
        self.record_stats = true;
        self
    }

    /// Routes statistics into a caller-supplied counter. Implies
    /// `record_stats`.
    pub fn stats_counter(mut self, counter: impl StatsCounter) -> Self {
        self.record_stats = true;
        self.stats_counter = Some(Arc::new(counter));
        self
    }

    /// Overrides the nanosecond time source. Tests use this with
    /// [`Clock::mock`].
    pub fn ticker(mut self, clock: Clock) -> Self {
        self.ticker = Some(clock);
        self
    }

    fn into_config(self) -> Result<Config<K, V>, BuildError> {
        if self.max_capacity.is_some() && self.max_weight.is_some() {
            return Err(BuildError::ConflictingBounds);
        }
        if self.max_capacity.is_some() && self.weigher.is_some() {
            return Err(BuildError::WeigherWithMaxCapacity);
        }
        if self.max_weight.is_some() && self.weigher.is_none() {
            return Err(BuildError::MissingWeigher);
        }
        if self.refresh_after_write.is_some() && self.loader.is_none() {
            return Err(BuildError::MissingLoader);
        }
        let durations: [(&'static str, Option<Duration>); 3] = [
            ("expire_after_write", self.time_to_live),
            ("expire_after_access", self.time_to_idle),
            ("refresh_after_write", self.refresh_after_write),
        ];
        for (name, duration) in durations.iter() {
            if let Some(duration) = duration {
                if duration.as_nanos() == 0 {
                    return Err(BuildError::ZeroDuration(*name));
                }
            }
        }

        let stats_counter = match (self.stats_counter, self.record_stats) {
            (Some(counter), _) => Some(counter),
            (None, true) => {
                Some(Arc::new(ConcurrentStatsCounter::new()) as Arc<dyn StatsCounter>)
            }
            (None, false) => None,
        };

        Ok(Config {
            maximum: self.max_capacity.or(self.max_weight),
            weigher: self.weigher,
            initial_capacity: self.initial_capacity,
            time_to_live: self.time_to_live,
            time_to_idle: self.time_to_idle,
            expiry: self.expiry,
            refresh_after_write: self.refresh_after_write,
            loader: self.loader,
            removal_listener: self.removal_listener,
            cache_writer: self.cache_writer,
            stats_counter,
            ticker: self.ticker.unwrap_or_default(),
        })
    }
}

impl<K, V> CacheBuilder<K, V>
where
    K: Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Builds the cache.
    ///
    /// # Panics
    ///
    /// Panics when the configuration is contradictory; `try_build`
    /// returns the error instead.
    pub fn build(self) -> Cache<K, V, RandomState> {
        self.try_build().unwrap_or_else(|e| panic!("{}", e))
    }

    pub fn try_build(self) -> Result<Cache<K, V, RandomState>, BuildError> {
        self.try_build_with_hasher(RandomState::default())
    }

    pub fn build_with_hasher<S>(self, hasher: S) -> Cache<K, V, S>
    where
        S: BuildHasher + Clone + Send + Sync + 'static,
    {
        self.try_build_with_hasher(hasher)
            .unwrap_or_else(|e| panic!("{}", e))
    }

    pub fn try_build_with_hasher<S>(self, hasher: S) -> Result<Cache<K, V, S>, BuildError>
    where
        S: BuildHasher + Clone + Send + Sync + 'static,
    {
        let config = self.into_config()?;
        Ok(Cache::with_everything(config, hasher))
    }
}

#[cfg(test)]
mod tests {
    use super::CacheBuilder;
    use crate::error::BuildError;

    use std::time::Duration;

    #[test]
    fn rejects_weigher_with_count_bound() {
        let result = CacheBuilder::<u32, u32>::new()
            .max_capacity(100)
            .weigher(|_k, v| *v)
            .try_build();
        assert_eq!(result.err(), Some(BuildError::WeigherWithMaxCapacity));
    }

    #[test]
    fn rejects_weight_bound_without_weigher() {
        let result = CacheBuilder::<u32, u32>::new().max_weight(100).try_build();
        assert_eq!(result.err(), Some(BuildError::MissingWeigher));
    }

    #[test]
    fn rejects_both_bounds() {
        let result = CacheBuilder::<u32, u32>::new()
            .max_capacity(10)
            .max_weight(100)
            .try_build();
        assert_eq!(result.err(), Some(BuildError::ConflictingBounds));
    }

    #[test]
    fn rejects_refresh_without_loader() {
        let result = CacheBuilder::<u32, u32>::new()
            .max_capacity(10)
            .refresh_after_write(Duration::from_secs(1))
            .try_build();
        assert_eq!(result.err(), Some(BuildError::MissingLoader));
    }

    #[test]
    fn rejects_zero_durations() {
        let result = CacheBuilder::<u32, u32>::new()
            .max_capacity(10)
            .expire_after_write(Duration::from_secs(0))
            .try_build();
        assert_eq!(
            result.err(),
            Some(BuildError::ZeroDuration("expire_after_write"))
        );
    }

    #[test]
    #[should_panic(expected = "requires a weigher")]
    fn build_panics_on_misconfiguration() {
        let _ = CacheBuilder::<u32, u32>::new().max_weight(100).build();
    }

    #[test]
    fn builds_with_defaults() {
        let cache = CacheBuilder::<u32, u32>::new().max_capacity(10).build();
        cache.insert(1, 1);
        assert_eq!(cache.get(&1).as_deref(), Some(&1));
    }
}
