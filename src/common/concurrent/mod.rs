use crate::common::{
    deque::{CacheRegion, DeqNode},
    time::{AtomicInstant, Instant},
    timer_wheel::TimerNode,
};

use parking_lot::{Mutex, MutexGuard};
use std::{
    ptr::NonNull,
    sync::{
        atomic::{AtomicU32, AtomicU8, Ordering},
        Arc,
    },
};
use triomphe::Arc as TrioArc;

pub(crate) mod deques;
pub(crate) mod housekeeper;
pub(crate) mod read_buffer;
pub(crate) mod thread_pool;
pub(crate) mod write_buffer;

/// The lifecycle of an entry. An entry is `Alive` while it is reachable
/// through the store, `Retired` once it has been removed from the store but
/// is still linked into policy structures awaiting a drain, and `Dead` once
/// every structure has released it. A dead entry is never relinked.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum EntryState {
    Alive,
    Retired,
    Dead,
}

impl EntryState {
    fn as_u8(self) -> u8 {
        match self {
            Self::Alive => 0,
            Self::Retired => 1,
            Self::Dead => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Alive,
            1 => Self::Retired,
            _ => Self::Dead,
        }
    }
}

pub(crate) struct KeyHash<K> {
    pub(crate) key: Arc<K>,
    pub(crate) hash: u64,
}

impl<K> KeyHash<K> {
    pub(crate) fn new(key: Arc<K>, hash: u64) -> Self {
        Self { key, hash }
    }
}

impl<K> Clone for KeyHash<K> {
    fn clone(&self) -> Self {
        Self {
            key: Arc::clone(&self.key),
            hash: self.hash,
        }
    }
}

const REGION_NONE: u8 = u8::MAX;

/// Pointers to the intrusive deque nodes an entry occupies. Read and
/// written only under the eviction lock.
pub(crate) struct DeqNodes<K> {
    pub(crate) access_order_q_node: Option<NonNull<DeqNode<KeyHashDate<K>>>>,
    pub(crate) write_order_q_node: Option<NonNull<DeqNode<KeyDate<K>>>>,
    pub(crate) timer_node: Option<NonNull<DeqNode<TimerNode<K>>>>,
}

impl<K> Default for DeqNodes<K> {
    fn default() -> Self {
        Self {
            access_order_q_node: None,
            write_order_q_node: None,
            timer_node: None,
        }
    }
}

// The raw pointers are dereferenced only by the maintenance task, which
// owns the deques they point into.
unsafe impl<K> Send for DeqNodes<K> {}

/// Metadata shared by every version of an entry's value. Replacing a value
/// creates a new `ValueEntry` but keeps the `EntryInfo`, so the policy
/// structures keep observing one object per logical entry.
pub(crate) struct EntryInfo<K> {
    key_hash: KeyHash<K>,
    state: AtomicU8,
    region: AtomicU8,
    weight: AtomicU32,
    policy_weight: AtomicU32,
    access_time: AtomicInstant,
    write_time: AtomicInstant,
    variable_time: AtomicInstant,
    nodes: Mutex<DeqNodes<K>>,
}

impl<K> EntryInfo<K> {
    pub(crate) fn new(key_hash: KeyHash<K>, timestamp: Instant, weight: u32) -> Self {
        Self {
            key_hash,
            state: AtomicU8::new(EntryState::Alive.as_u8()),
            region: AtomicU8::new(REGION_NONE),
            weight: AtomicU32::new(weight),
            policy_weight: AtomicU32::new(0),
            access_time: AtomicInstant::new(timestamp),
            write_time: AtomicInstant::new(timestamp),
            variable_time: AtomicInstant::default(),
            nodes: Mutex::default(),
        }
    }

    pub(crate) fn key(&self) -> &Arc<K> {
        &self.key_hash.key
    }

    pub(crate) fn hash(&self) -> u64 {
        self.key_hash.hash
    }

    pub(crate) fn state(&self) -> EntryState {
        EntryState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.state() == EntryState::Alive
    }

    pub(crate) fn set_state(&self, state: EntryState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    /// Transitions to `Dead` and reports whether this call made the
    /// transition. Used to keep unlink-and-account idempotent.
    pub(crate) fn make_dead(&self) -> bool {
        self.state.swap(EntryState::Dead.as_u8(), Ordering::AcqRel) != EntryState::Dead.as_u8()
    }

    pub(crate) fn region(&self) -> Option<CacheRegion> {
        CacheRegion::from_u8(self.region.load(Ordering::Acquire))
    }

    pub(crate) fn set_region(&self, region: CacheRegion) {
        self.region.store(region.as_u8(), Ordering::Release);
    }

    pub(crate) fn clear_region(&self) {
        self.region.store(REGION_NONE, Ordering::Release);
    }

    pub(crate) fn weight(&self) -> u32 {
        self.weight.load(Ordering::Acquire)
    }

    pub(crate) fn set_weight(&self, weight: u32) {
        self.weight.store(weight, Ordering::Release);
    }

    pub(crate) fn policy_weight(&self) -> u32 {
        self.policy_weight.load(Ordering::Acquire)
    }

    /// Only the maintenance task may call this (spec: policy weight is
    /// mutated under the eviction lock).
    pub(crate) fn set_policy_weight(&self, weight: u32) {
        self.policy_weight.store(weight, Ordering::Release);
    }

    pub(crate) fn last_accessed(&self) -> Option<Instant> {
        self.access_time.instant()
    }

    pub(crate) fn set_last_accessed(&self, timestamp: Instant) {
        self.access_time.set_instant(timestamp);
    }

    pub(crate) fn last_modified(&self) -> Option<Instant> {
        self.write_time.instant()
    }

    pub(crate) fn set_last_modified(&self, timestamp: Instant) {
        self.write_time.set_instant(timestamp);
    }

    pub(crate) fn cas_write_time(&self, current: Instant, new: Instant) -> bool {
        self.write_time.compare_exchange(current, new).is_ok()
    }

    pub(crate) fn variable_time(&self) -> Option<Instant> {
        self.variable_time.instant()
    }

    pub(crate) fn set_variable_time(&self, timestamp: Instant) {
        self.variable_time.set_instant(timestamp);
    }

    pub(crate) fn nodes(&self) -> MutexGuard<'_, DeqNodes<K>> {
        self.nodes.lock()
    }
}

/// Element of the access-order deques.
pub(crate) struct KeyHashDate<K> {
    pub(crate) entry_info: TrioArc<EntryInfo<K>>,
}

impl<K> KeyHashDate<K> {
    pub(crate) fn new(entry_info: TrioArc<EntryInfo<K>>) -> Self {
        Self { entry_info }
    }

    pub(crate) fn key(&self) -> &Arc<K> {
        self.entry_info.key()
    }
}

/// Element of the write-order deque.
pub(crate) struct KeyDate<K> {
    pub(crate) entry_info: TrioArc<EntryInfo<K>>,
}

impl<K> KeyDate<K> {
    pub(crate) fn new(entry_info: TrioArc<EntryInfo<K>>) -> Self {
        Self { entry_info }
    }

    pub(crate) fn key(&self) -> &Arc<K> {
        self.entry_info.key()
    }
}

/// One version of an entry's value. The store maps a key to the current
/// version; superseded versions die as soon as their readers drop them.
pub(crate) struct ValueEntry<K, V> {
    pub(crate) value: Arc<V>,
    info: TrioArc<EntryInfo<K>>,
}

impl<K, V> ValueEntry<K, V> {
    pub(crate) fn new(value: Arc<V>, info: TrioArc<EntryInfo<K>>) -> Self {
        Self { value, info }
    }

    /// A new version carrying `value`, sharing the other version's
    /// `EntryInfo`.
    pub(crate) fn new_with(value: Arc<V>, other: &Self) -> Self {
        Self {
            value,
            info: TrioArc::clone(&other.info),
        }
    }

    pub(crate) fn key(&self) -> &Arc<K> {
        self.info.key()
    }

    pub(crate) fn hash(&self) -> u64 {
        self.info.hash()
    }

    pub(crate) fn entry_info(&self) -> &TrioArc<EntryInfo<K>> {
        &self.info
    }
}

pub(crate) enum ReadOp<K, V> {
    Hit(TrioArc<ValueEntry<K, V>>),
    Miss(u64),
}

pub(crate) enum WriteOp<K, V> {
    Insert(TrioArc<ValueEntry<K, V>>),
    Update(TrioArc<ValueEntry<K, V>>),
    Remove(TrioArc<ValueEntry<K, V>>),
}
