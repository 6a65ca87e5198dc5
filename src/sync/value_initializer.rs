use parking_lot::RwLock;
use std::{
    hash::{BuildHasher, Hash},
    panic::{catch_unwind, resume_unwind, AssertUnwindSafe},
    sync::Arc,
};
use triomphe::Arc as TrioArc;

const WAITER_MAP_NUM_SEGMENTS: usize = 16;

pub(crate) enum InitResult<V> {
    Initialized(Arc<V>),
    ReadExisting(Arc<V>),
}

enum WaiterValue<V> {
    Computing,
    Ready(Arc<V>),
    // The thread running the init closure panicked; waiters retry.
    InitClosurePanicked,
}

type Waiter<V> = TrioArc<RwLock<WaiterValue<V>>>;
type WaiterMap<K, V, S> = cht::SegmentedHashMap<Arc<K>, Waiter<V>, S>;

/// Runs the `get_with` init closure at most once per key across threads.
///
/// The computing thread parks a waiter carrying a write-locked slot; every
/// other thread for the same key finds the waiter and blocks on the read
/// lock until the value (or a panic marker) is published.
pub(crate) struct ValueInitializer<K, V, S> {
    waiters: WaiterMap<K, V, S>,
}

impl<K, V, S> ValueInitializer<K, V, S>
where
    K: Eq + Hash,
    S: BuildHasher + Clone,
{
    pub(crate) fn with_hasher(hasher: S) -> Self {
        Self {
            waiters: cht::SegmentedHashMap::with_num_segments_capacity_and_hasher(
                WAITER_MAP_NUM_SEGMENTS,
                16,
                hasher,
            ),
        }
    }

    /// # Panics
    ///
    /// Panics if the `init` closure panicked (the panic is propagated) or
    /// kept panicking on other threads past the retry bound.
    pub(crate) fn init_or_read(
        &self,
        key: Arc<K>,
        get: impl Fn() -> Option<Arc<V>>,
        init: impl FnOnce() -> V,
        insert: impl FnOnce(V) -> Arc<V>,
    ) -> InitResult<V> {
        use InitResult::*;

        const MAX_RETRIES: usize = 200;
        let mut retries = 0;
        let mut init = Some(init);
        let mut insert = Some(insert);

        loop {
            let waiter = TrioArc::new(RwLock::new(WaiterValue::Computing));
            let mut lock = waiter.write();

            match self.try_insert_waiter(&key, &waiter) {
                None => {
                    // Our waiter was installed; we do the computing.
                    // Check whether another thread inserted the value
                    // between our cache miss and now.
                    if let Some(existing) = get() {
                        *lock = WaiterValue::Ready(Arc::clone(&existing));
                        self.remove_waiter(&key);
                        return ReadExisting(existing);
                    }

                    let init = init.take().expect("init closure already consumed");
                    match catch_unwind(AssertUnwindSafe(init)) {
                        Ok(value) => {
                            let insert = insert.take().expect("insert closure already consumed");
                            let stored = insert(value);
                            *lock = WaiterValue::Ready(Arc::clone(&stored));
                            self.remove_waiter(&key);
                            return Initialized(stored);
                        }
                        Err(payload) => {
                            *lock = WaiterValue::InitClosurePanicked;
                            // Remove the waiter so that others can retry.
                            self.remove_waiter(&key);
                            resume_unwind(payload);
                        }
                    }
                }
                Some(existing) => {
                    // Somebody else is computing; drop our unused waiter
                    // and block until theirs resolves.
                    drop(lock);
                    let published = existing.read();
                    match &*published {
                        WaiterValue::Ready(value) => return ReadExisting(Arc::clone(value)),
                        WaiterValue::InitClosurePanicked => {
                            retries += 1;
                            assert!(
                                retries < MAX_RETRIES,
                                "the init closure kept panicking on other threads; giving up \
                                 after {} retries",
                                retries
                            );
                            continue;
                        }
                        // The write lock is not released while computing,
                        // so a readable waiter always carries a result.
                        WaiterValue::Computing => unreachable!(),
                    }
                }
            }
        }
    }

    fn try_insert_waiter(&self, key: &Arc<K>, waiter: &Waiter<V>) -> Option<Waiter<V>> {
        self.waiters.insert_with_or_modify(
            Arc::clone(key),
            || TrioArc::clone(waiter),
            |_k, existing| TrioArc::clone(existing),
        )
    }

    fn remove_waiter(&self, key: &Arc<K>) {
        self.waiters.remove(&**key);
    }
}

#[cfg(test)]
mod tests {
    use super::{InitResult, ValueInitializer};
    use std::{
        collections::hash_map::RandomState,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc, Barrier, Mutex,
        },
    };

    #[test]
    fn init_runs_once_across_threads() {
        let initializer: Arc<ValueInitializer<u32, u32, RandomState>> =
            Arc::new(ValueInitializer::with_hasher(RandomState::default()));
        let init_calls = Arc::new(AtomicUsize::new(0));
        let slot: Arc<Mutex<Option<Arc<u32>>>> = Arc::new(Mutex::new(None));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let initializer = Arc::clone(&initializer);
                let init_calls = Arc::clone(&init_calls);
                let slot = Arc::clone(&slot);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    let result = initializer.init_or_read(
                        Arc::new(7),
                        || slot.lock().unwrap().clone(),
                        || {
                            init_calls.fetch_add(1, Ordering::AcqRel);
                            42
                        },
                        |v| {
                            let value = Arc::new(v);
                            *slot.lock().unwrap() = Some(Arc::clone(&value));
                            value
                        },
                    );
                    match result {
                        InitResult::Initialized(v) | InitResult::ReadExisting(v) => *v,
                    }
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), 42);
        }
        assert_eq!(init_calls.load(Ordering::Acquire), 1);
    }

    #[test]
    fn panicked_init_lets_the_next_caller_retry() {
        let initializer: ValueInitializer<u32, u32, RandomState> =
            ValueInitializer::with_hasher(RandomState::default());

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            initializer.init_or_read(Arc::new(1), || None, || panic!("boom"), Arc::new)
        }));
        assert!(result.is_err());

        // The waiter was removed, so a fresh attempt succeeds.
        match initializer.init_or_read(Arc::new(1), || None, || 5, Arc::new) {
            InitResult::Initialized(v) => assert_eq!(*v, 5),
            InitResult::ReadExisting(_) => panic!("expected a fresh initialization"),
        }
    }
}
