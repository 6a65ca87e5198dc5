use crate::{
    common::{
        ceiling_next_power_of_two,
        concurrent::{
            deques::Deques,
            housekeeper::{Housekeeper, InnerSync, SyncPace, MAX_SYNC_REPEATS},
            read_buffer::{OfferResult, StripedBuffer},
            thread_pool::{shared_pool, PoolName},
            write_buffer::MpscGrowableQueue,
            EntryInfo, EntryState, KeyHash, KeyHashDate, ReadOp, ValueEntry, WriteOp,
        },
        deque::{CacheRegion, Deque},
        frequency_sketch::FrequencySketch,
        time::{Clock, Instant, ASYNC_EXPIRY_NANOS},
        timer_wheel::TimerWheel,
    },
    expiry::Expiry,
    loading::{CacheLoader, CacheWriter, DisabledCacheWriter},
    notification::{RemovalCause, RemovalNotifier},
    stats::{CacheStats, DisabledStatsCounter, StatsCounter},
    sync::{
        builder::Config,
        policy::{CacheEntry, Policy},
        value_initializer::{InitResult, ValueInitializer},
        CacheBuilder, Weigher,
    },
};

use parking_lot::{Mutex, RwLock};
use std::{
    collections::{hash_map::RandomState, HashMap, HashSet},
    hash::{BuildHasher, Hash, Hasher},
    panic::{catch_unwind, resume_unwind, AssertUnwindSafe},
    ptr::NonNull,
    rc::Rc,
    sync::{
        atomic::{AtomicU64, AtomicU8, Ordering},
        Arc,
    },
    time::Duration,
};
use triomphe::Arc as TrioArc;

const READ_LOG_FLUSH_POINT: usize = 64;

const WRITE_LOG_FLUSH_POINT: usize = 256;
const WRITE_LOG_LOW_WATER_MARK: usize = 128;
const WRITE_BUFFER_INITIAL_CAPACITY: usize = 16;
const WRITE_RETRY_ATTEMPTS: usize = 100;

const EVICTION_BATCH_SIZE: usize = 500;

// Size of the window segment relative to the whole cache, and of the
// protected segment relative to the main space.
const PERCENT_MAIN: f64 = 0.99;
const PERCENT_MAIN_PROTECTED: f64 = 0.80;

// A candidate this unpopular is never admitted, defeating hash-flooding
// attempts that would otherwise warm artificial candidates.
const ADMIT_HASHDOS_THRESHOLD: u8 = 5;

// An update within this interval of the previous write keeps the old
// write time, so that write-heavy keys do not thrash the write-order
// queue and the refresh clock.
const WRITE_TIME_TOLERANCE: Duration = Duration::from_secs(1);

/// A thread-safe, bounded key→value cache.
///
/// Entries are admitted and evicted by a Window-TinyLFU policy: a small
/// recency window absorbs new entries while a frequency sketch decides,
/// at eviction time, whether a candidate is more useful than the coldest
/// resident. Reads and writes record events into lock-free buffers which
/// a single maintenance task drains, so no public operation contends on
/// the policy structures.
///
/// The cache is cheap to clone; clones share the same store.
pub struct Cache<K, V, S = RandomState> {
    inner: Arc<Inner<K, V, S>>,
    housekeeper: Option<Arc<Housekeeper<Inner<K, V, S>>>>,
}

impl<K, V, S> Drop for Cache<K, V, S> {
    fn drop(&mut self) {
        // The housekeeper observes the inner through a weak reference;
        // dropping it first stops the periodic job promptly.
        std::mem::drop(self.housekeeper.take());
    }
}

impl<K, V, S> Clone for Cache<K, V, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            housekeeper: self.housekeeper.as_ref().map(Arc::clone),
        }
    }
}

impl<K, V> Cache<K, V, RandomState>
where
    K: Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// A cache bounded to `max_capacity` entries, with every other option
    /// at its default.
    pub fn new(max_capacity: u64) -> Self {
        Self::builder().max_capacity(max_capacity).build()
    }

    pub fn builder() -> CacheBuilder<K, V> {
        CacheBuilder::new()
    }
}

impl<K, V, S> Cache<K, V, S>
where
    K: Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
    S: BuildHasher + Clone + Send + Sync + 'static,
{
    pub(crate) fn with_everything(config: Config<K, V>, build_hasher: S) -> Self {
        let inner = Arc::new(Inner::new(config, build_hasher));
        let housekeeper = Housekeeper::new(Arc::downgrade(&inner));
        Self {
            inner,
            housekeeper: Some(Arc::new(housekeeper)),
        }
    }

    /// Returns the value for `key` without attempting any load. Records a
    /// hit or a miss when statistics are enabled; an expired entry reads
    /// as a miss.
    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        let hash = self.inner.hash(key);
        self.get_with_hash(key, hash)
    }

    /// Whether a live entry exists for `key`. Records nothing.
    pub fn contains_key(&self, key: &K) -> bool {
        let now = self.inner.current_time();
        self.inner.peek(key, now).is_some()
    }

    /// Returns the value for `key`, computing and inserting it with
    /// `init` if absent. For any number of concurrent callers on the same
    /// key, `init` runs at most once; the other callers block and receive
    /// the computed value.
    ///
    /// `init` must not reenter the cache for the same key.
    pub fn get_with(&self, key: K, init: impl FnOnce() -> V) -> Arc<V> {
        let hash = self.inner.hash(&key);
        let key = Arc::new(key);
        if let Some(value) = self.get_with_hash(&key, hash) {
            return value;
        }

        let start = self.inner.current_time();
        let result = catch_unwind(AssertUnwindSafe(|| {
            self.inner.value_initializer.init_or_read(
                Arc::clone(&key),
                || {
                    let now = self.inner.current_time();
                    self.inner.peek(&key, now)
                },
                init,
                |value| self.insert_with_hash(Arc::clone(&key), hash, Arc::new(value)),
            )
        }));
        let elapsed = self.load_elapsed(start);
        match result {
            Ok(InitResult::Initialized(value)) => {
                self.inner.record_load_success(elapsed);
                value
            }
            Ok(InitResult::ReadExisting(value)) => value,
            Err(payload) => {
                self.inner.record_load_failure(elapsed);
                resume_unwind(payload);
            }
        }
    }

    /// Returns the values for `keys`, loading the missing ones through
    /// the configured loader. With no loader this is a filter over the
    /// present entries. A bulk `load_all` hook is preferred when the
    /// loader provides one.
    pub fn get_all(&self, keys: impl IntoIterator<Item = K>) -> HashMap<Arc<K>, Arc<V>> {
        let mut found = HashMap::new();
        let mut missing: Vec<Arc<K>> = Vec::new();
        let mut seen = HashSet::new();

        for key in keys {
            let key = Arc::new(key);
            if !seen.insert(Arc::clone(&key)) {
                continue;
            }
            let hash = self.inner.hash(&key);
            match self.get_with_hash(&key, hash) {
                Some(value) => {
                    found.insert(key, value);
                }
                None => missing.push(key),
            }
        }

        let loader = match &self.inner.loader {
            Some(loader) if !missing.is_empty() => Arc::clone(loader),
            _ => return found,
        };

        let start = self.inner.current_time();
        if let Some(pairs) = loader.load_all(&missing) {
            self.inner.record_load_success(self.load_elapsed(start));
            for (key, value) in pairs {
                let hash = self.inner.hash(&key);
                let value = self.insert_with_hash(Arc::clone(&key), hash, Arc::new(value));
                found.insert(key, value);
            }
            return found;
        }

        for key in missing {
            let start = self.inner.current_time();
            let result = catch_unwind(AssertUnwindSafe(|| loader.load(&key)));
            let elapsed = self.load_elapsed(start);
            match result {
                Ok(Some(value)) => {
                    self.inner.record_load_success(elapsed);
                    let hash = self.inner.hash(&key);
                    let value = self.insert_with_hash(Arc::clone(&key), hash, Arc::new(value));
                    found.insert(key, value);
                }
                Ok(None) => self.inner.record_load_failure(elapsed),
                Err(payload) => {
                    self.inner.record_load_failure(elapsed);
                    resume_unwind(payload);
                }
            }
        }
        found
    }

    /// Inserts or replaces the entry. The cache writer's `write` runs
    /// before the value becomes visible; its panics reach the caller.
    pub fn insert(&self, key: K, value: V) -> Arc<V> {
        let hash = self.inner.hash(&key);
        self.insert_with_hash(Arc::new(key), hash, Arc::new(value))
    }

    pub fn insert_all(&self, entries: impl IntoIterator<Item = (K, V)>) {
        for (key, value) in entries {
            self.insert(key, value);
        }
    }

    /// Removes the entry, returning its value if one was live. The cache
    /// writer's `delete` runs synchronously; the removal listener is
    /// notified once, asynchronously.
    pub fn invalidate(&self, key: &K) -> Option<Arc<V>> {
        let entry = self.inner.cache.remove(key)?;
        let info = entry.entry_info();
        let now = self.inner.current_time();
        let was_alive = info.is_alive();
        let expired = self.inner.is_expired_entry(info, now);
        info.set_state(EntryState::Retired);

        let value = Arc::clone(&entry.value);
        let cause = if expired {
            RemovalCause::Expired
        } else {
            RemovalCause::Explicit
        };
        self.inner.writer().delete(key, Some(&value), cause);
        if was_alive {
            self.inner
                .notify(Arc::clone(entry.key()), Arc::clone(&value), cause);
        }
        self.schedule_write_op(WriteOp::Remove(entry));

        if expired {
            None
        } else {
            Some(value)
        }
    }

    pub fn invalidate_keys<'a>(&self, keys: impl IntoIterator<Item = &'a K>)
    where
        K: 'a,
    {
        for key in keys {
            self.invalidate(key);
        }
    }

    /// Discards every entry, notifying the writer and listener with
    /// cause `Explicit` for each.
    pub fn invalidate_all(&self) {
        self.inner.invalidate_all();
    }

    /// Reloads the entry for `key` in the background through the
    /// configured loader, without blocking the caller. An absent key is
    /// loaded and inserted if still absent on completion.
    pub fn refresh(&self, key: &K)
    where
        K: Clone,
    {
        if self.inner.loader.is_none() {
            log::warn!("refresh called on a cache without a loader; ignored");
            return;
        }
        let hash = self.inner.hash(key);
        match self.inner.cache.get(key) {
            Some(entry) if entry.entry_info().is_alive() => {
                if let Some(write_time) = entry.entry_info().last_modified() {
                    if write_time.as_nanos() < ASYNC_EXPIRY_NANOS {
                        self.spawn_refresh(entry, write_time);
                    }
                }
            }
            _ => {
                let key = Arc::new(key.clone());
                let cache = self.clone();
                shared_pool(PoolName::Refresh)
                    .pool
                    .execute_after(Duration::from_millis(0), move || {
                        cache.load_absent(key, hash);
                    });
            }
        }
    }

    /// The approximate number of live entries.
    pub fn entry_count(&self) -> u64 {
        self.inner.cache.len() as u64
    }

    /// The combined policy weight of all entries, as of the last drain.
    pub fn weighted_size(&self) -> u64 {
        self.inner.policy_weighted_size()
    }

    /// A snapshot of the statistics counters.
    pub fn stats(&self) -> CacheStats {
        self.inner.stats.snapshot()
    }

    /// The eviction policy inspection and tuning surface.
    pub fn policy(&self) -> Policy<'_, K, V, S> {
        Policy { inner: &self.inner }
    }

    /// Applies all pending reads and writes, runs expiration and
    /// eviction, and delivers queued removal notifications. The policy
    /// quiesces: afterwards the weighted size is within the bound.
    pub fn sync(&self) {
        self.inner.sync(MAX_SYNC_REPEATS);
    }

    fn load_elapsed(&self, start: Instant) -> u64 {
        self.inner
            .current_time()
            .saturating_duration_since(start)
            .as_nanos() as u64
    }

    pub(crate) fn get_with_hash(&self, key: &K, hash: u64) -> Option<Arc<V>> {
        let now = self.inner.current_time();
        match self.inner.cache.get(key) {
            None => {
                self.inner.record_misses(1);
                self.record_read_op(ReadOp::Miss(hash));
                None
            }
            Some(entry) => {
                let info = entry.entry_info();
                if !info.is_alive() || self.inner.is_expired_entry(info, now) {
                    self.inner.record_misses(1);
                    self.record_read_op(ReadOp::Miss(hash));
                    return None;
                }

                self.inner.record_hits(1);
                info.set_last_accessed(now);
                if let Some(expiry) = &self.inner.expiry {
                    let remaining = remaining_duration(info, now);
                    let duration = expiry.expire_after_read(key, &entry.value, remaining);
                    info.set_variable_time(now.saturating_add(duration));
                }
                self.maybe_refresh(&entry, now);

                let value = Arc::clone(&entry.value);
                self.record_read_op(ReadOp::Hit(entry));
                Some(value)
            }
        }
    }

    fn record_read_op(&self, op: ReadOp<K, V>) {
        match self.inner.read_buffer.offer(op) {
            OfferResult::Full => {
                // The cache produces events faster than it drains them.
                if let Some(housekeeper) = &self.housekeeper {
                    housekeeper.try_schedule_sync();
                }
            }
            OfferResult::Added | OfferResult::Failed => {
                let should_drain = self
                    .housekeeper
                    .as_ref()
                    .map_or(false, |h| h.should_apply())
                    || self.inner.read_buffer.len() >= READ_LOG_FLUSH_POINT;
                if should_drain {
                    if let Some(housekeeper) = &self.housekeeper {
                        housekeeper.try_schedule_sync();
                    }
                }
            }
        }
    }

    pub(crate) fn insert_with_hash(&self, key: Arc<K>, hash: u64, value: Arc<V>) -> Arc<V> {
        let now = self.inner.current_time();
        let weight = self.inner.weigh(&key, &value);

        // Mirror the write before the value becomes visible. A panic here
        // aborts the insert and reaches the caller.
        self.inner.writer().write(&key, &value);

        // The store employs optimistic locking, so the insert and modify
        // closures may run more than once. A shared serial number marks
        // the op produced by the last run, which is the one that stuck.
        let op_cnt1 = Rc::new(AtomicU8::new(0));
        let op_cnt2 = Rc::clone(&op_cnt1);
        let mut op1: Option<(u8, WriteOp<K, V>)> = None;
        let mut op2: Option<(u8, WriteOp<K, V>)> = None;
        let mut replaced: Option<(Arc<V>, RemovalCause)> = None;

        self.inner.cache.insert_with_or_modify(
            Arc::clone(&key),
            // on_insert
            || {
                let entry = self.inner.new_value_entry(&key, hash, &value, now, weight);
                let cnt = op_cnt1.fetch_add(1, Ordering::Relaxed);
                op1 = Some((cnt, WriteOp::Insert(TrioArc::clone(&entry))));
                entry
            },
            // on_modify
            |_k, old| {
                let cnt = op_cnt2.fetch_add(1, Ordering::Relaxed);
                let info = old.entry_info();
                if info.is_alive() {
                    // Writing over an entry that had quietly expired is a
                    // removal by expiration, not a replacement.
                    let cause = if self.inner.is_expired_entry(info, now) {
                        RemovalCause::Expired
                    } else {
                        RemovalCause::Replaced
                    };
                    let entry = TrioArc::new(ValueEntry::new_with(Arc::clone(&value), old));
                    info.set_weight(weight);
                    info.set_last_accessed(now);
                    match info.last_modified() {
                        // A sentinel from an in-flight refresh, or a write
                        // older than the tolerance: restart the clock.
                        Some(wt) if wt > now => info.set_last_modified(now),
                        Some(wt) if now.saturating_duration_since(wt) > WRITE_TIME_TOLERANCE => {
                            info.set_last_modified(now)
                        }
                        None => info.set_last_modified(now),
                        _ => (),
                    }
                    if let Some(expiry) = &self.inner.expiry {
                        let remaining = remaining_duration(info, now);
                        let duration = expiry.expire_after_update(&key, &value, remaining);
                        info.set_variable_time(now.saturating_add(duration));
                    }
                    replaced = Some((Arc::clone(&old.value), cause));
                    op2 = Some((cnt, WriteOp::Update(TrioArc::clone(&entry))));
                    entry
                } else {
                    // The old entry was retired by a concurrent
                    // invalidation; revive the key with a fresh entry.
                    let entry = self.inner.new_value_entry(&key, hash, &value, now, weight);
                    replaced = None;
                    op2 = Some((cnt, WriteOp::Insert(TrioArc::clone(&entry))));
                    entry
                }
            },
        );

        if let Some((old_value, cause)) = replaced {
            self.inner.notify(Arc::clone(&key), old_value, cause);
        }

        let op = match (op1, op2) {
            (Some((_, op)), None) => op,
            (None, Some((_, op))) => op,
            (Some((cnt1, op1)), Some((cnt2, op2))) => {
                if cnt1 > cnt2 {
                    op1
                } else {
                    op2
                }
            }
            (None, None) => unreachable!(),
        };
        self.schedule_write_op(op);
        value
    }

    /// Appends a write event, running maintenance inline when the buffer
    /// stays full; the buffer is lossless so the event must land.
    fn schedule_write_op(&self, op: WriteOp<K, V>) {
        let mut op = op;
        let mut attempts = 0;
        loop {
            match self.inner.write_buffer.enqueue(op) {
                Ok(()) => break,
                Err(returned) => {
                    op = returned;
                    attempts += 1;
                    if attempts >= WRITE_RETRY_ATTEMPTS {
                        // Make room ourselves instead of spinning further.
                        self.inner.sync(MAX_SYNC_REPEATS);
                        attempts = 0;
                    } else {
                        std::thread::yield_now();
                    }
                }
            }
        }

        if let Some(housekeeper) = &self.housekeeper {
            housekeeper.try_schedule_sync();
        }
    }

    fn maybe_refresh(&self, entry: &TrioArc<ValueEntry<K, V>>, now: Instant) {
        let refresh_after = match self.inner.refresh_after_write {
            Some(duration) if self.inner.loader.is_some() => duration,
            _ => return,
        };
        if let Some(write_time) = entry.entry_info().last_modified() {
            if write_time.as_nanos() >= ASYNC_EXPIRY_NANOS {
                // A refresh is already in flight.
                return;
            }
            if now.saturating_duration_since(write_time) > refresh_after {
                self.spawn_refresh(TrioArc::clone(entry), write_time);
            }
        }
    }

    /// Claims the entry for refreshing by swapping its write time for a
    /// far-future sentinel, then reloads on the background pool.
    fn spawn_refresh(&self, entry: TrioArc<ValueEntry<K, V>>, old_write_time: Instant) {
        let now = self.inner.current_time();
        let sentinel = Instant::new(now.as_nanos().saturating_add(ASYNC_EXPIRY_NANOS));
        if !entry.entry_info().cas_write_time(old_write_time, sentinel) {
            // Another reader claimed the refresh first.
            return;
        }

        let cache = self.clone();
        shared_pool(PoolName::Refresh)
            .pool
            .execute_after(Duration::from_millis(0), move || {
                cache.run_refresh(entry, old_write_time, sentinel);
            });
    }

    fn run_refresh(
        &self,
        entry: TrioArc<ValueEntry<K, V>>,
        old_write_time: Instant,
        sentinel: Instant,
    ) {
        let key = Arc::clone(entry.key());
        let loader = match &self.inner.loader {
            Some(loader) => Arc::clone(loader),
            None => return,
        };

        let start = self.inner.current_time();
        let result = catch_unwind(AssertUnwindSafe(|| loader.reload(&key, &entry.value)));
        let completion = self.inner.current_time();
        let elapsed = completion.saturating_duration_since(start).as_nanos() as u64;

        match result {
            Ok(Some(new_value)) => {
                self.inner.record_load_success(elapsed);
                self.apply_refresh(entry, Arc::new(new_value), sentinel, completion);
            }
            Ok(None) => {
                // The loader chose to keep the current value; restart the
                // refresh clock.
                self.inner.record_load_success(elapsed);
                let _ = entry.entry_info().cas_write_time(sentinel, completion);
            }
            Err(_) => {
                log::warn!("refresh reload panicked; keeping the current value");
                self.inner.record_load_failure(elapsed);
                // Restore the original write time so the entry becomes
                // refreshable again.
                let _ = entry.entry_info().cas_write_time(sentinel, old_write_time);
            }
        }
    }

    /// Installs a reloaded value iff the entry version is unchanged and
    /// no writer touched the entry while the reload ran.
    fn apply_refresh(
        &self,
        entry: TrioArc<ValueEntry<K, V>>,
        new_value: Arc<V>,
        sentinel: Instant,
        completion: Instant,
    ) {
        let key = Arc::clone(entry.key());
        let removed = self.inner.cache.remove_if(&*key, |_k, current| {
            TrioArc::ptr_eq(current, &entry)
                && current.entry_info().last_modified() == Some(sentinel)
        });
        let old_entry = match removed {
            Some(old_entry) => old_entry,
            // Replaced or invalidated while we reloaded; discard.
            None => return,
        };

        let info = old_entry.entry_info();
        info.set_last_modified(completion);
        info.set_last_accessed(completion);
        let new_entry = TrioArc::new(ValueEntry::new_with(Arc::clone(&new_value), &old_entry));

        let previous = self.inner.cache.insert_with_or_modify(
            Arc::clone(&key),
            || TrioArc::clone(&new_entry),
            // A writer slipped in between our remove and reinstall; its
            // value wins and the refresh result is discarded.
            |_k, current| TrioArc::clone(current),
        );

        if previous.is_none() {
            // Our reinstall landed.
            self.inner.notify(
                Arc::clone(&key),
                Arc::clone(&old_entry.value),
                RemovalCause::Replaced,
            );
            self.schedule_write_op(WriteOp::Update(new_entry));
        } else {
            // The old version left the map for good; retire it so the
            // policy structures release it.
            info.set_state(EntryState::Retired);
            self.schedule_write_op(WriteOp::Remove(old_entry));
        }
    }

    /// Loads a key that was absent at `refresh` time and inserts it if
    /// still absent.
    fn load_absent(&self, key: Arc<K>, hash: u64) {
        let loader = match &self.inner.loader {
            Some(loader) => Arc::clone(loader),
            None => return,
        };
        let start = self.inner.current_time();
        let result = catch_unwind(AssertUnwindSafe(|| loader.load(&key)));
        let elapsed = self.load_elapsed(start);
        match result {
            Ok(Some(value)) => {
                self.inner.record_load_success(elapsed);
                let value = Arc::new(value);
                let now = self.inner.current_time();
                let weight = self.inner.weigh(&key, &value);
                let entry = self.inner.new_value_entry(&key, hash, &value, now, weight);
                let previous = self.inner.cache.insert_with_or_modify(
                    Arc::clone(&key),
                    || TrioArc::clone(&entry),
                    |_k, current| TrioArc::clone(current),
                );
                if previous.is_none() {
                    self.schedule_write_op(WriteOp::Insert(entry));
                }
            }
            Ok(None) => self.inner.record_load_failure(elapsed),
            Err(_) => {
                log::warn!("refresh load panicked; nothing inserted");
                self.inner.record_load_failure(elapsed);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn reconfigure_for_testing(&self) {
        // Keep maintenance off background threads so tests drive it
        // deterministically through sync().
        if let Some(housekeeper) = &self.housekeeper {
            housekeeper.disable_auto_sync();
        }
    }
}

fn remaining_duration<K>(info: &EntryInfo<K>, now: Instant) -> Duration {
    info.variable_time()
        .map(|vt| vt.saturating_duration_since(now))
        .unwrap_or_else(|| Duration::from_nanos(0))
}

type CacheStore<K, V, S> = cht::SegmentedHashMap<Arc<K>, TrioArc<ValueEntry<K, V>>, S>;

const NUM_SEGMENTS: usize = 64;
const DEFAULT_INITIAL_CAPACITY: usize = 16;

// Sketch tables are sized from the maximum; weighted bounds can be
// enormous, so the table is capped.
const MAX_SKETCH_CAPACITY: u64 = 1 << 20;

const UNBOUNDED: u64 = u64::MAX;

pub(crate) struct Inner<K, V, S> {
    cache: CacheStore<K, V, S>,
    build_hasher: S,
    value_initializer: ValueInitializer<K, V, S>,

    // Policy structures, owned by the maintenance task. The deques mutex
    // is the eviction lock; the policy fields below are written only
    // while it is held.
    deques: Mutex<Deques<K>>,
    timer_wheel: Mutex<TimerWheel<K>>,
    frequency_sketch: RwLock<FrequencySketch>,

    read_buffer: StripedBuffer<ReadOp<K, V>>,
    write_buffer: MpscGrowableQueue<WriteOp<K, V>>,

    maximum: AtomicU64,
    window_maximum: AtomicU64,
    protected_maximum: AtomicU64,
    total_weight: AtomicU64,
    window_weight: AtomicU64,
    protected_weight: AtomicU64,

    weigher: Option<Weigher<K, V>>,
    time_to_live: Option<Duration>,
    time_to_idle: Option<Duration>,
    expiry: Option<Arc<dyn Expiry<K, V>>>,
    refresh_after_write: Option<Duration>,
    loader: Option<Arc<dyn CacheLoader<K, V>>>,
    removal_notifier: Option<RemovalNotifier<K, V>>,
    cache_writer: Arc<dyn CacheWriter<K, V>>,
    stats: Arc<dyn StatsCounter>,
    clock: Clock,
    admission_seed: AtomicU64,
}

impl<K, V, S> Inner<K, V, S>
where
    K: Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
    S: BuildHasher + Clone + Send + Sync + 'static,
{
    fn new(config: Config<K, V>, build_hasher: S) -> Self {
        let initial_capacity = config.initial_capacity.unwrap_or(DEFAULT_INITIAL_CAPACITY);
        let cache = cht::SegmentedHashMap::with_num_segments_capacity_and_hasher(
            NUM_SEGMENTS,
            initial_capacity,
            build_hasher.clone(),
        );
        let value_initializer = ValueInitializer::with_hasher(build_hasher.clone());

        let write_buffer_max = (128 * ceiling_next_power_of_two(num_cpus::get() as u64) as usize)
            .max(WRITE_BUFFER_INITIAL_CAPACITY);
        let clock = config.ticker;
        let now = clock.now();

        let inner = Self {
            cache,
            build_hasher,
            value_initializer,
            deques: Mutex::new(Deques::default()),
            timer_wheel: Mutex::new(TimerWheel::new(now)),
            frequency_sketch: RwLock::new(FrequencySketch::default()),
            read_buffer: StripedBuffer::new(),
            write_buffer: MpscGrowableQueue::new(WRITE_BUFFER_INITIAL_CAPACITY, write_buffer_max),
            maximum: AtomicU64::new(UNBOUNDED),
            window_maximum: AtomicU64::new(UNBOUNDED),
            protected_maximum: AtomicU64::new(UNBOUNDED),
            total_weight: AtomicU64::new(0),
            window_weight: AtomicU64::new(0),
            protected_weight: AtomicU64::new(0),
            weigher: config.weigher,
            time_to_live: config.time_to_live,
            time_to_idle: config.time_to_idle,
            expiry: config.expiry,
            refresh_after_write: config.refresh_after_write,
            loader: config.loader,
            removal_notifier: config.removal_listener.map(RemovalNotifier::new),
            cache_writer: config
                .cache_writer
                .unwrap_or_else(|| Arc::new(DisabledCacheWriter)),
            stats: config
                .stats_counter
                .unwrap_or_else(|| Arc::new(DisabledStatsCounter)),
            clock,
            admission_seed: AtomicU64::new(random_seed()),
        };
        if let Some(maximum) = config.maximum {
            inner.set_maximum_targets(maximum);
        }
        inner
    }

    #[inline]
    fn hash(&self, key: &K) -> u64 {
        let mut hasher = self.build_hasher.build_hasher();
        key.hash(&mut hasher);
        hasher.finish()
    }

    #[inline]
    fn current_time(&self) -> Instant {
        self.clock.now()
    }

    #[inline]
    fn weigh(&self, key: &K, value: &V) -> u32 {
        self.weigher.as_ref().map_or(1, |weigher| weigher(key, value))
    }

    #[inline]
    fn writer(&self) -> &dyn CacheWriter<K, V> {
        &*self.cache_writer
    }

    fn new_value_entry(
        &self,
        key: &Arc<K>,
        hash: u64,
        value: &Arc<V>,
        now: Instant,
        weight: u32,
    ) -> TrioArc<ValueEntry<K, V>> {
        let info = TrioArc::new(EntryInfo::new(
            KeyHash::new(Arc::clone(key), hash),
            now,
            weight,
        ));
        if let Some(expiry) = &self.expiry {
            let duration = expiry.expire_after_create(key, value);
            info.set_variable_time(now.saturating_add(duration));
        }
        TrioArc::new(ValueEntry::new(Arc::clone(value), info))
    }

    /// A read with no side effects: no stats, no buffered event.
    fn peek(&self, key: &K, now: Instant) -> Option<Arc<V>> {
        let entry = self.cache.get(key)?;
        let info = entry.entry_info();
        if info.is_alive() && !self.is_expired_entry(info, now) {
            Some(Arc::clone(&entry.value))
        } else {
            None
        }
    }

    #[inline]
    fn evicts(&self) -> bool {
        self.maximum.load(Ordering::Acquire) != UNBOUNDED
    }

    #[inline]
    fn expires_after_write(&self) -> bool {
        self.time_to_live.is_some()
    }

    #[inline]
    fn has_expiry(&self) -> bool {
        self.time_to_live.is_some() || self.time_to_idle.is_some() || self.expiry.is_some()
    }

    fn is_expired_entry(&self, info: &EntryInfo<K>, now: Instant) -> bool {
        if let (Some(accessed), Some(tti)) = (info.last_accessed(), self.time_to_idle) {
            if accessed.saturating_add(tti) <= now {
                return true;
            }
        }
        if let (Some(modified), Some(ttl)) = (info.last_modified(), self.time_to_live) {
            if modified.saturating_add(ttl) <= now {
                return true;
            }
        }
        if self.expiry.is_some() {
            if let Some(deadline) = info.variable_time() {
                if deadline <= now {
                    return true;
                }
            }
        }
        false
    }

    fn notify(&self, key: Arc<K>, value: Arc<V>, cause: RemovalCause) {
        if let Some(notifier) = &self.removal_notifier {
            notifier.enqueue(key, value, cause);
        }
    }

    fn deliver_notifications(&self) {
        if let Some(notifier) = &self.removal_notifier {
            notifier.deliver_pending();
        }
    }

    fn record_hits(&self, count: u32) {
        let stats = &self.stats;
        if catch_unwind(AssertUnwindSafe(|| stats.record_hits(count))).is_err() {
            log::warn!("stats counter panicked in record_hits");
        }
    }

    fn record_misses(&self, count: u32) {
        let stats = &self.stats;
        if catch_unwind(AssertUnwindSafe(|| stats.record_misses(count))).is_err() {
            log::warn!("stats counter panicked in record_misses");
        }
    }

    fn record_load_success(&self, nanos: u64) {
        let stats = &self.stats;
        if catch_unwind(AssertUnwindSafe(|| stats.record_load_success(nanos))).is_err() {
            log::warn!("stats counter panicked in record_load_success");
        }
    }

    fn record_load_failure(&self, nanos: u64) {
        let stats = &self.stats;
        if catch_unwind(AssertUnwindSafe(|| stats.record_load_failure(nanos))).is_err() {
            log::warn!("stats counter panicked in record_load_failure");
        }
    }

    fn record_eviction(&self, weight: u32) {
        let stats = &self.stats;
        if catch_unwind(AssertUnwindSafe(|| stats.record_eviction(weight))).is_err() {
            log::warn!("stats counter panicked in record_eviction");
        }
    }

    fn set_maximum_targets(&self, maximum: u64) {
        self.maximum.store(maximum, Ordering::Release);
        if maximum == UNBOUNDED {
            self.window_maximum.store(UNBOUNDED, Ordering::Release);
            self.protected_maximum.store(UNBOUNDED, Ordering::Release);
            return;
        }
        let main = (maximum as f64 * PERCENT_MAIN) as u64;
        let window = maximum - main;
        let protected = (main as f64 * PERCENT_MAIN_PROTECTED) as u64;
        self.window_maximum.store(window, Ordering::Release);
        self.protected_maximum.store(protected, Ordering::Release);
    }

    fn next_random(&self) -> u64 {
        let mut x = self.admission_seed.load(Ordering::Relaxed);
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.admission_seed.store(x, Ordering::Relaxed);
        x
    }

    fn add_weight(counter: &AtomicU64, weight: u64) {
        let _ = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
            Some(current.saturating_add(weight))
        });
    }

    fn sub_weight(counter: &AtomicU64, weight: u64) {
        let _ = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
            Some(current.saturating_sub(weight))
        });
    }

    // --- Maintenance -----------------------------------------------------

    fn do_sync(
        &self,
        deqs: &mut Deques<K>,
        timer: &mut TimerWheel<K>,
        max_repeats: usize,
    ) -> Option<SyncPace> {
        let mut calls = 0;
        let mut should_sync = true;

        while should_sync && calls <= max_repeats {
            if !self.read_buffer.is_empty() {
                self.apply_reads(deqs, timer);
            }
            let write_count = self.write_buffer.len();
            if write_count > 0 {
                self.apply_writes(deqs, timer, write_count);
            }
            calls += 1;
            should_sync = self.read_buffer.len() >= READ_LOG_FLUSH_POINT
                || self.write_buffer.len() >= WRITE_LOG_FLUSH_POINT;
        }

        if self.has_expiry() {
            self.evict_expired(deqs, timer, EVICTION_BATCH_SIZE);
        }
        self.evict_by_size(deqs, timer);

        if should_sync {
            Some(SyncPace::Fast)
        } else if self.write_buffer.len() <= WRITE_LOG_LOW_WATER_MARK {
            Some(SyncPace::Normal)
        } else {
            // Keep the current pace.
            None
        }
    }

    fn apply_reads(&self, deqs: &mut Deques<K>, timer: &mut TimerWheel<K>) {
        let mut freq = self.frequency_sketch.write();
        self.read_buffer.drain(&mut |op| match op {
            ReadOp::Hit(entry) => {
                let info = entry.entry_info();
                freq.increment(info.hash());
                self.on_access(deqs, timer, info);
            }
            ReadOp::Miss(hash) => freq.increment(hash),
        });
    }

    fn apply_writes(&self, deqs: &mut Deques<K>, timer: &mut TimerWheel<K>, count: usize) {
        for _ in 0..count {
            match self.write_buffer.dequeue() {
                Some(WriteOp::Insert(entry)) => self.handle_insert(deqs, timer, entry),
                Some(WriteOp::Update(entry)) => self.handle_update(deqs, timer, entry),
                Some(WriteOp::Remove(entry)) => {
                    self.unlink_and_account(deqs, timer, entry.entry_info())
                }
                None => break,
            }
        }
    }

    /// Applies one recorded access: recency reordering, probation to
    /// protected promotion, and a timer reschedule for variable expiry.
    fn on_access(
        &self,
        deqs: &mut Deques<K>,
        timer: &mut TimerWheel<K>,
        info: &TrioArc<EntryInfo<K>>,
    ) {
        if info.state() == EntryState::Dead {
            return;
        }
        match info.region() {
            Some(CacheRegion::Window) => deqs.move_to_back_ao(info),
            Some(CacheRegion::MainProbation) => {
                let weight = info.policy_weight() as u64;
                deqs.transfer_ao(CacheRegion::MainProtected, info);
                Self::add_weight(&self.protected_weight, weight);
                self.demote_protected(deqs);
            }
            Some(CacheRegion::MainProtected) => deqs.move_to_back_ao(info),
            // Not linked yet; its add task is still buffered.
            _ => (),
        }

        if self.expiry.is_some() {
            let timer_node = info.nodes().timer_node;
            if let Some(ptr) = timer_node {
                unsafe { timer.reschedule(ptr) };
            }
        }
    }

    /// Shrinks the protected segment back to its target by demoting its
    /// head into probation.
    fn demote_protected(&self, deqs: &mut Deques<K>) {
        let target = self.protected_maximum.load(Ordering::Acquire);
        while self.protected_weight.load(Ordering::Acquire) > target {
            let info = match deqs.protected.peek_front() {
                Some(node) => TrioArc::clone(&node.element.entry_info),
                None => break,
            };
            let weight = info.policy_weight() as u64;
            deqs.transfer_ao(CacheRegion::MainProbation, &info);
            Self::sub_weight(&self.protected_weight, weight);
        }
    }

    fn handle_insert(
        &self,
        deqs: &mut Deques<K>,
        timer: &mut TimerWheel<K>,
        entry: TrioArc<ValueEntry<K, V>>,
    ) {
        let info = entry.entry_info();
        if info.state() != EntryState::Alive {
            // Removed before this task drained; the matching remove task
            // has or will run, and nothing was linked yet.
            return;
        }

        if self.evicts() {
            let mut freq = self.frequency_sketch.write();
            if !freq.is_initialized() {
                let capacity = self.maximum.load(Ordering::Acquire).min(MAX_SKETCH_CAPACITY);
                freq.ensure_capacity(capacity as usize);
            }
        }

        let weight = info.weight();
        info.set_policy_weight(weight);
        Self::add_weight(&self.total_weight, weight as u64);
        Self::add_weight(&self.window_weight, weight as u64);

        // Every new entry starts in the window segment.
        deqs.push_back_ao(CacheRegion::Window, info);
        if self.expires_after_write() {
            deqs.push_back_wo(info);
        }
        if self.expiry.is_some() {
            timer.schedule(info);
        }
    }

    fn handle_update(
        &self,
        deqs: &mut Deques<K>,
        timer: &mut TimerWheel<K>,
        entry: TrioArc<ValueEntry<K, V>>,
    ) {
        let info = entry.entry_info();
        if info.state() != EntryState::Alive {
            return;
        }
        let region = match info.region() {
            Some(region) => region,
            // The add task has not drained yet; it will account the
            // entry with its current weight.
            None => return,
        };

        let old_weight = info.policy_weight() as u64;
        let new_weight = info.weight() as u64;
        if new_weight != old_weight {
            info.set_policy_weight(new_weight as u32);
            if new_weight > old_weight {
                let delta = new_weight - old_weight;
                Self::add_weight(&self.total_weight, delta);
                match region {
                    CacheRegion::Window => Self::add_weight(&self.window_weight, delta),
                    CacheRegion::MainProtected => Self::add_weight(&self.protected_weight, delta),
                    _ => (),
                }
            } else {
                let delta = old_weight - new_weight;
                Self::sub_weight(&self.total_weight, delta);
                match region {
                    CacheRegion::Window => Self::sub_weight(&self.window_weight, delta),
                    CacheRegion::MainProtected => Self::sub_weight(&self.protected_weight, delta),
                    _ => (),
                }
            }
        }

        self.on_access(deqs, timer, info);
        if self.expires_after_write() {
            deqs.move_to_back_wo(info);
        }
        if self.expiry.is_some() {
            // The guard must be released before scheduling relocks it.
            let unscheduled = info.nodes().timer_node.is_none();
            if unscheduled {
                timer.schedule(info);
            }
        }
    }

    /// Makes the entry dead exactly once: weights released, every policy
    /// structure unlinked.
    fn unlink_and_account(
        &self,
        deqs: &mut Deques<K>,
        timer: &mut TimerWheel<K>,
        info: &TrioArc<EntryInfo<K>>,
    ) {
        if !info.make_dead() {
            return;
        }
        let weight = info.policy_weight() as u64;
        match info.region() {
            Some(CacheRegion::Window) => Self::sub_weight(&self.window_weight, weight),
            Some(CacheRegion::MainProtected) => Self::sub_weight(&self.protected_weight, weight),
            _ => (),
        }
        Self::sub_weight(&self.total_weight, weight);

        deqs.unlink_ao(info);
        deqs.unlink_wo(info);
        let timer_node = info.nodes().timer_node;
        if let Some(ptr) = timer_node {
            unsafe { timer.deschedule(ptr) };
        }
    }

    fn evict_expired(&self, deqs: &mut Deques<K>, timer: &mut TimerWheel<K>, batch_size: usize) {
        let now = self.current_time();

        if self.expiry.is_some() {
            for info in timer.advance(now) {
                let evicted = self.evict_entry(deqs, timer, &info, RemovalCause::Expired, now, false);
                if !evicted && info.state() == EntryState::Alive {
                    // Resurrected: a read moved the deadline while the
                    // wheel had already unlinked the node, so put it back.
                    let unscheduled = info.nodes().timer_node.is_none();
                    if unscheduled {
                        timer.schedule(&info);
                    }
                }
            }
        }

        if self.time_to_live.is_some() {
            for _ in 0..batch_size {
                let info = match deqs.write_order.peek_front() {
                    Some(node) => TrioArc::clone(&node.element.entry_info),
                    None => break,
                };
                if !self.is_expired_entry(&info, now)
                    || !self.evict_entry(deqs, timer, &info, RemovalCause::Expired, now, false)
                {
                    break;
                }
            }
        }

        if self.time_to_idle.is_some() {
            for region in [
                CacheRegion::Window,
                CacheRegion::MainProbation,
                CacheRegion::MainProtected,
            ]
            .iter()
            {
                for _ in 0..batch_size {
                    let info = match deqs.select_ao_mut(*region).peek_front() {
                        Some(node) => TrioArc::clone(&node.element.entry_info),
                        None => break,
                    };
                    if !self.is_expired_entry(&info, now)
                        || !self.evict_entry(deqs, timer, &info, RemovalCause::Expired, now, false)
                    {
                        break;
                    }
                }
            }
        }
    }

    /// Removes one entry on behalf of the policy, after rechecking that
    /// the removal is still justified (an entry whose deadline moved or
    /// whose weight dropped to zero is resurrected by simply leaving it
    /// in place). Returns whether the entry was removed.
    fn evict_entry(
        &self,
        deqs: &mut Deques<K>,
        timer: &mut TimerWheel<K>,
        info: &TrioArc<EntryInfo<K>>,
        cause: RemovalCause,
        now: Instant,
        force: bool,
    ) -> bool {
        if info.state() == EntryState::Dead {
            return false;
        }
        if !force {
            match cause {
                RemovalCause::Expired => {
                    if !self.is_expired_entry(info, now) {
                        return false;
                    }
                }
                RemovalCause::Size => {
                    if info.policy_weight() == 0 {
                        return false;
                    }
                }
                _ => (),
            }
        }

        let key = Arc::clone(info.key());
        let weight = info.policy_weight();
        let removed = self
            .cache
            .remove_if(&*key, |_k, current| {
                TrioArc::ptr_eq(current.entry_info(), info)
            });

        match removed {
            Some(entry) => {
                let value = Arc::clone(&entry.value);
                self.unlink_and_account(deqs, timer, info);
                let writer = &self.cache_writer;
                if catch_unwind(AssertUnwindSafe(|| {
                    writer.delete(&key, Some(&value), cause)
                }))
                .is_err()
                {
                    log::warn!("cache writer panicked in delete during eviction");
                }
                if cause.was_evicted() {
                    self.record_eviction(weight);
                }
                self.notify(key, value, cause);
                true
            }
            None => {
                // The key now maps to a different entry (or none); a
                // remove task owns the map-side removal, but the policy
                // structures can release this one now.
                self.unlink_and_account(deqs, timer, info);
                false
            }
        }
    }

    fn evict_by_size(&self, deqs: &mut Deques<K>, timer: &mut TimerWheel<K>) {
        if !self.evicts() {
            return;
        }
        self.evict_from_window(deqs);
        self.evict_from_main(deqs, timer);
    }

    /// Demotes window overflow into the probation segment, where each
    /// moved entry becomes an admission candidate.
    fn evict_from_window(&self, deqs: &mut Deques<K>) {
        let target = self.window_maximum.load(Ordering::Acquire);
        while self.window_weight.load(Ordering::Acquire) > target {
            let info = match deqs.window.peek_front() {
                Some(node) => TrioArc::clone(&node.element.entry_info),
                None => break,
            };
            let weight = info.policy_weight() as u64;
            deqs.transfer_ao(CacheRegion::MainProbation, &info);
            Self::sub_weight(&self.window_weight, weight);
        }
    }

    /// W-TinyLFU admission: while over capacity, compare the coldest
    /// resident (the victim) against the most recent candidate and evict
    /// the loser.
    fn evict_from_main(&self, deqs: &mut Deques<K>, timer: &mut TimerWheel<K>) {
        let maximum = self.maximum.load(Ordering::Acquire);
        let now = self.current_time();

        while self.total_weight.load(Ordering::Acquire) > maximum {
            let victim = first_weighted(&deqs.probation)
                .or_else(|| first_weighted(&deqs.protected))
                .or_else(|| first_weighted(&deqs.window));
            let candidate = last_weighted(&deqs.probation);

            match (victim, candidate) {
                (None, None) => break,
                (Some(victim), None) => {
                    self.evict_entry(deqs, timer, &victim, RemovalCause::Size, now, false);
                }
                (None, Some(candidate)) => {
                    self.evict_entry(deqs, timer, &candidate, RemovalCause::Size, now, false);
                }
                (Some(victim), Some(candidate)) => {
                    if TrioArc::ptr_eq(&victim, &candidate) {
                        self.evict_entry(deqs, timer, &victim, RemovalCause::Size, now, false);
                        continue;
                    }
                    // An entry heavier than the whole cache can never be
                    // admitted.
                    if candidate.policy_weight() as u64 > maximum {
                        self.evict_entry(deqs, timer, &candidate, RemovalCause::Size, now, false);
                        continue;
                    }
                    if self.admit(candidate.hash(), victim.hash()) {
                        self.evict_entry(deqs, timer, &victim, RemovalCause::Size, now, false);
                    } else {
                        self.evict_entry(deqs, timer, &candidate, RemovalCause::Size, now, false);
                    }
                }
            }
        }
    }

    /// Whether the candidate should replace the victim. Mostly a straight
    /// frequency comparison; a sparse random admission defeats attackers
    /// who warm artificial victims.
    fn admit(&self, candidate_hash: u64, victim_hash: u64) -> bool {
        let freq = self.frequency_sketch.read();
        let candidate_freq = freq.frequency(candidate_hash);
        let victim_freq = freq.frequency(victim_hash);
        drop(freq);

        if candidate_freq > victim_freq {
            true
        } else if candidate_freq <= ADMIT_HASHDOS_THRESHOLD {
            false
        } else {
            (self.next_random() & 127) == 0
        }
    }

    fn invalidate_all(&self) {
        {
            let mut deqs = self.deques.lock();
            let mut timer = self.timer_wheel.lock();
            // Quiesce pending events so the deques hold every entry.
            self.apply_reads(&mut deqs, &mut timer);
            let write_count = self.write_buffer.len();
            if write_count > 0 {
                self.apply_writes(&mut deqs, &mut timer, write_count);
            }

            let now = self.current_time();
            for region in [
                CacheRegion::Window,
                CacheRegion::MainProbation,
                CacheRegion::MainProtected,
            ]
            .iter()
            {
                loop {
                    let info = match deqs.select_ao_mut(*region).peek_front() {
                        Some(node) => TrioArc::clone(&node.element.entry_info),
                        None => break,
                    };
                    self.evict_entry(
                        &mut deqs,
                        &mut timer,
                        &info,
                        RemovalCause::Explicit,
                        now,
                        true,
                    );
                }
            }
        }
        self.deliver_notifications();
    }

    // --- Policy facade ---------------------------------------------------

    pub(crate) fn policy_maximum(&self) -> Option<u64> {
        match self.maximum.load(Ordering::Acquire) {
            UNBOUNDED => None,
            maximum => Some(maximum),
        }
    }

    pub(crate) fn policy_set_maximum(&self, maximum: u64) {
        {
            let mut deqs = self.deques.lock();
            let mut timer = self.timer_wheel.lock();
            self.set_maximum_targets(maximum);
            if maximum != UNBOUNDED {
                let mut freq = self.frequency_sketch.write();
                freq.ensure_capacity(maximum.min(MAX_SKETCH_CAPACITY) as usize);
            }
            self.evict_by_size(&mut deqs, &mut timer);
        }
        self.deliver_notifications();
    }

    pub(crate) fn policy_weighted_size(&self) -> u64 {
        self.total_weight.load(Ordering::Acquire)
    }

    pub(crate) fn policy_weight_of(&self, key: &K) -> Option<u32> {
        let entry = self.cache.get(key)?;
        if entry.entry_info().is_alive() {
            Some(entry.entry_info().weight())
        } else {
            None
        }
    }

    fn snapshot_entry(&self, info: &TrioArc<EntryInfo<K>>) -> Option<CacheEntry<K, V>> {
        let entry = self.cache.get(&**info.key())?;
        if !TrioArc::ptr_eq(entry.entry_info(), info) {
            return None;
        }
        Some(CacheEntry {
            key: Arc::clone(info.key()),
            value: Arc::clone(&entry.value),
            weight: info.weight(),
        })
    }

    /// Runs a drain and snapshots entry infos under the eviction lock,
    /// then resolves values outside it.
    fn snapshot_infos(
        &self,
        collect: impl FnOnce(&Deques<K>, &TimerWheel<K>) -> Vec<TrioArc<EntryInfo<K>>>,
    ) -> Vec<TrioArc<EntryInfo<K>>> {
        let mut deqs = self.deques.lock();
        let mut timer = self.timer_wheel.lock();
        self.apply_reads(&mut deqs, &mut timer);
        let write_count = self.write_buffer.len();
        if write_count > 0 {
            self.apply_writes(&mut deqs, &mut timer, write_count);
        }
        collect(&deqs, &timer)
    }

    fn resolve_entries(
        &self,
        infos: Vec<TrioArc<EntryInfo<K>>>,
        limit: usize,
    ) -> Vec<CacheEntry<K, V>> {
        infos
            .iter()
            .filter_map(|info| self.snapshot_entry(info))
            .take(limit)
            .collect()
    }

    pub(crate) fn policy_coldest(&self, limit: usize) -> Vec<CacheEntry<K, V>> {
        let infos = self.snapshot_infos(|deqs, _| {
            let mut infos = Vec::new();
            for deque in [&deqs.probation, &deqs.protected, &deqs.window].iter() {
                infos.extend(
                    deque
                        .iter()
                        .map(|node| TrioArc::clone(&node.element.entry_info)),
                );
            }
            infos
        });
        self.resolve_entries(infos, limit)
    }

    pub(crate) fn policy_hottest(&self, limit: usize) -> Vec<CacheEntry<K, V>> {
        let infos = self.snapshot_infos(|deqs, _| {
            let mut infos = Vec::new();
            for deque in [&deqs.window, &deqs.protected, &deqs.probation].iter() {
                let mut chunk: Vec<_> = deque
                    .iter()
                    .map(|node| TrioArc::clone(&node.element.entry_info))
                    .collect();
                chunk.reverse();
                infos.extend(chunk);
            }
            infos
        });
        self.resolve_entries(infos, limit)
    }

    pub(crate) fn policy_oldest(&self, limit: usize) -> Vec<CacheEntry<K, V>> {
        let infos = self.snapshot_infos(|deqs, _| {
            deqs.write_order
                .iter()
                .map(|node| TrioArc::clone(&node.element.entry_info))
                .collect()
        });
        self.resolve_entries(infos, limit)
    }

    pub(crate) fn policy_youngest(&self, limit: usize) -> Vec<CacheEntry<K, V>> {
        let infos = self.snapshot_infos(|deqs, _| {
            let mut infos: Vec<_> = deqs
                .write_order
                .iter()
                .map(|node| TrioArc::clone(&node.element.entry_info))
                .collect();
            infos.reverse();
            infos
        });
        self.resolve_entries(infos, limit)
    }

    pub(crate) fn policy_expiring_soonest(&self, limit: usize) -> Vec<CacheEntry<K, V>> {
        let mut infos = self.snapshot_infos(|_, timer| timer.scheduled_entries());
        infos.sort_by_key(|info| info.variable_time());
        self.resolve_entries(infos, limit)
    }
}

impl<K, V, S> InnerSync for Inner<K, V, S>
where
    K: Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
    S: BuildHasher + Clone + Send + Sync + 'static,
{
    fn sync(&self, max_repeats: usize) -> Option<SyncPace> {
        let over_capacity = self.evicts()
            && self.total_weight.load(Ordering::Acquire) > self.maximum.load(Ordering::Acquire);
        if self.read_buffer.is_empty()
            && self.write_buffer.is_empty()
            && !self.has_expiry()
            && !over_capacity
        {
            return None;
        }

        let pace = {
            let mut deqs = self.deques.lock();
            let mut timer = self.timer_wheel.lock();
            self.do_sync(&mut deqs, &mut timer, max_repeats)
        };
        self.deliver_notifications();
        pace
    }
}

fn first_weighted<K>(deque: &Deque<KeyHashDate<K>>) -> Option<TrioArc<EntryInfo<K>>> {
    deque
        .iter()
        .find(|node| node.element.entry_info.policy_weight() > 0)
        .map(|node| TrioArc::clone(&node.element.entry_info))
}

fn last_weighted<K>(deque: &Deque<KeyHashDate<K>>) -> Option<TrioArc<EntryInfo<K>>> {
    let mut current = deque.peek_back().map(NonNull::from);
    while let Some(ptr) = current {
        let node = unsafe { ptr.as_ref() };
        if node.element.entry_info.policy_weight() > 0 {
            return Some(TrioArc::clone(&node.element.entry_info));
        }
        current = node.prev_node_ptr();
    }
    None
}

fn random_seed() -> u64 {
    let mut buf = [0u8; 8];
    match getrandom::getrandom(&mut buf) {
        Ok(()) => u64::from_ne_bytes(buf) | 1,
        Err(_) => 0x9e37_79b9_7f4a_7c15,
    }
}
