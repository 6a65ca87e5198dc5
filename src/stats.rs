//! Hit, miss, load and eviction accounting.

use std::sync::atomic::{AtomicU64, Ordering};

/// Accumulates cache statistics. The default implementation installed by
/// `CacheBuilder::record_stats` is [`ConcurrentStatsCounter`]; callers
/// with their own metrics pipeline can supply an implementation through
/// `CacheBuilder::stats_counter`.
///
/// Implementations must tolerate concurrent calls from many threads. A
/// panicking counter never fails the cache operation that recorded the
/// event; the panic is caught and logged.
pub trait StatsCounter: Send + Sync + 'static {
    fn record_hits(&self, count: u32);
    fn record_misses(&self, count: u32);
    fn record_load_success(&self, load_time_nanos: u64);
    fn record_load_failure(&self, load_time_nanos: u64);
    fn record_eviction(&self, weight: u32);
    fn snapshot(&self) -> CacheStats;
}

/// A point-in-time view of the counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hit_count: u64,
    pub miss_count: u64,
    pub load_success_count: u64,
    pub load_failure_count: u64,
    pub total_load_time_nanos: u64,
    pub eviction_count: u64,
    pub eviction_weight: u64,
}

impl CacheStats {
    pub fn request_count(&self) -> u64 {
        self.hit_count.saturating_add(self.miss_count)
    }

    pub fn hit_rate(&self) -> f64 {
        match self.request_count() {
            0 => 1.0,
            total => self.hit_count as f64 / total as f64,
        }
    }

    pub fn miss_rate(&self) -> f64 {
        match self.request_count() {
            0 => 0.0,
            total => self.miss_count as f64 / total as f64,
        }
    }

    pub fn load_count(&self) -> u64 {
        self.load_success_count
            .saturating_add(self.load_failure_count)
    }

    pub fn average_load_penalty_nanos(&self) -> f64 {
        match self.load_count() {
            0 => 0.0,
            loads => self.total_load_time_nanos as f64 / loads as f64,
        }
    }
}

/// The default thread-safe counter.
#[derive(Default)]
pub struct ConcurrentStatsCounter {
    hit_count: AtomicU64,
    miss_count: AtomicU64,
    load_success_count: AtomicU64,
    load_failure_count: AtomicU64,
    total_load_time_nanos: AtomicU64,
    eviction_count: AtomicU64,
    eviction_weight: AtomicU64,
}

impl ConcurrentStatsCounter {
    pub fn new() -> Self {
        Self::default()
    }
}

fn saturating_add(counter: &AtomicU64, value: u64) {
    let mut current = counter.load(Ordering::Relaxed);
    loop {
        let new = current.saturating_add(value);
        match counter.compare_exchange_weak(current, new, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return,
            Err(actual) => current = actual,
        }
    }
}

impl StatsCounter for ConcurrentStatsCounter {
    fn record_hits(&self, count: u32) {
        saturating_add(&self.hit_count, count as u64);
    }

    fn record_misses(&self, count: u32) {
        saturating_add(&self.miss_count, count as u64);
    }

    fn record_load_success(&self, load_time_nanos: u64) {
        saturating_add(&self.load_success_count, 1);
        saturating_add(&self.total_load_time_nanos, load_time_nanos);
    }

    fn record_load_failure(&self, load_time_nanos: u64) {
        saturating_add(&self.load_failure_count, 1);
        saturating_add(&self.total_load_time_nanos, load_time_nanos);
    }

    fn record_eviction(&self, weight: u32) {
        saturating_add(&self.eviction_count, 1);
        saturating_add(&self.eviction_weight, weight as u64);
    }

    fn snapshot(&self) -> CacheStats {
        CacheStats {
            hit_count: self.hit_count.load(Ordering::Acquire),
            miss_count: self.miss_count.load(Ordering::Acquire),
            load_success_count: self.load_success_count.load(Ordering::Acquire),
            load_failure_count: self.load_failure_count.load(Ordering::Acquire),
            total_load_time_nanos: self.total_load_time_nanos.load(Ordering::Acquire),
            eviction_count: self.eviction_count.load(Ordering::Acquire),
            eviction_weight: self.eviction_weight.load(Ordering::Acquire),
        }
    }
}

/// Installed when stats recording is off; every record is a no-op.
pub(crate) struct DisabledStatsCounter;

impl StatsCounter for DisabledStatsCounter {
    fn record_hits(&self, _count: u32) {}
    fn record_misses(&self, _count: u32) {}
    fn record_load_success(&self, _load_time_nanos: u64) {}
    fn record_load_failure(&self, _load_time_nanos: u64) {}
    fn record_eviction(&self, _weight: u32) {}

    fn snapshot(&self) -> CacheStats {
        CacheStats::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let counter = ConcurrentStatsCounter::new();
        counter.record_hits(2);
        counter.record_misses(1);
        counter.record_load_success(100);
        counter.record_load_failure(50);
        counter.record_eviction(7);

        let stats = counter.snapshot();
        assert_eq!(stats.hit_count, 2);
        assert_eq!(stats.miss_count, 1);
        assert_eq!(stats.request_count(), 3);
        assert_eq!(stats.load_success_count, 1);
        assert_eq!(stats.load_failure_count, 1);
        assert_eq!(stats.total_load_time_nanos, 150);
        assert_eq!(stats.eviction_count, 1);
        assert_eq!(stats.eviction_weight, 7);
        assert!((stats.hit_rate() - 2.0 / 3.0).abs() < f64::EPSILON);
        assert!((stats.average_load_penalty_nanos() - 75.0).abs() < f64::EPSILON);
    }

    #[test]
    fn empty_stats_rates() {
        let stats = CacheStats::default();
        assert_eq!(stats.hit_rate(), 1.0);
        assert_eq!(stats.miss_rate(), 0.0);
        assert_eq!(stats.average_load_penalty_nanos(), 0.0);
    }

    #[test]
    fn disabled_counter_stays_empty() {
        let counter = DisabledStatsCounter;
        counter.record_hits(10);
        counter.record_eviction(10);
        assert_eq!(counter.snapshot(), CacheStats::default());
    }
}
