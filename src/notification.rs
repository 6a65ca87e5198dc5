//! Removal notifications delivered to a user-supplied listener.

use crossbeam_channel::{unbounded, Receiver, Sender};
use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
};

/// Why an entry was removed from the cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RemovalCause {
    /// The entry was manually invalidated.
    Explicit,
    /// The entry's value was replaced by a write or a completed refresh.
    Replaced,
    /// The entry's referent was reclaimed. Carried for interface
    /// compatibility; the cache holds strong references and never emits
    /// this cause itself.
    Collected,
    /// The entry passed one of its expiration deadlines.
    Expired,
    /// The entry was evicted to keep the cache within its size bound.
    Size,
}

impl RemovalCause {
    /// Whether the removal was decided by the cache rather than the
    /// caller.
    pub fn was_evicted(&self) -> bool {
        matches!(self, Self::Collected | Self::Expired | Self::Size)
    }
}

pub type RemovalListener<K, V> = Arc<dyn Fn(Arc<K>, Arc<V>, RemovalCause) + Send + Sync + 'static>;

pub(crate) struct RemovalNotification<K, V> {
    pub(crate) key: Arc<K>,
    pub(crate) value: Arc<V>,
    pub(crate) cause: RemovalCause,
}

/// Queues notifications from whichever thread removed the entry and
/// replays them to the listener outside the eviction lock. Each logical
/// removal is delivered at most once.
pub(crate) struct RemovalNotifier<K, V> {
    listener: RemovalListener<K, V>,
    snd: Sender<RemovalNotification<K, V>>,
    rcv: Receiver<RemovalNotification<K, V>>,
}

impl<K, V> RemovalNotifier<K, V> {
    pub(crate) fn new(listener: RemovalListener<K, V>) -> Self {
        let (snd, rcv) = unbounded();
        Self { listener, snd, rcv }
    }

    /// Safe to call under the eviction lock; the channel never blocks.
    pub(crate) fn enqueue(&self, key: Arc<K>, value: Arc<V>, cause: RemovalCause) {
        // Sending fails only when the receiver is gone, and we own it.
        let _ = self.snd.send(RemovalNotification { key, value, cause });
    }

    /// Replays queued notifications. A panicking listener is logged and
    /// does not stop delivery of the remaining notifications.
    pub(crate) fn deliver_pending(&self) {
        while let Ok(notification) = self.rcv.try_recv() {
            let listener = &self.listener;
            let result = catch_unwind(AssertUnwindSafe(|| {
                listener(
                    notification.key,
                    notification.value,
                    notification.cause,
                )
            }));
            if result.is_err() {
                log::warn!("removal listener panicked; notification dropped");
            }
        }
    }
}

impl<K, V> Drop for RemovalNotifier<K, V> {
    fn drop(&mut self) {
        self.deliver_pending();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn delivers_in_order_at_most_once() {
        let seen: Arc<Mutex<Vec<(u32, RemovalCause)>>> = Arc::new(Mutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        let listener: RemovalListener<u32, String> = Arc::new(move |k, _v, cause| {
            seen2.lock().unwrap().push((*k, cause));
        });

        let notifier = RemovalNotifier::new(listener);
        notifier.enqueue(Arc::new(1), Arc::new("a".into()), RemovalCause::Explicit);
        notifier.enqueue(Arc::new(2), Arc::new("b".into()), RemovalCause::Size);
        notifier.deliver_pending();
        notifier.deliver_pending();

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![(1, RemovalCause::Explicit), (2, RemovalCause::Size)]
        );
    }

    #[test]
    fn panicking_listener_does_not_poison_delivery() {
        let seen: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        let listener: RemovalListener<u32, u32> = Arc::new(move |k, _v, _cause| {
            if *k == 1 {
                panic!("boom");
            }
            seen2.lock().unwrap().push(*k);
        });

        let notifier = RemovalNotifier::new(listener);
        notifier.enqueue(Arc::new(1), Arc::new(0), RemovalCause::Expired);
        notifier.enqueue(Arc::new(2), Arc::new(0), RemovalCause::Expired);
        notifier.deliver_pending();

        assert_eq!(*seen.lock().unwrap(), vec![2]);
    }

    #[test]
    fn was_evicted_classification() {
        assert!(!RemovalCause::Explicit.was_evicted());
        assert!(!RemovalCause::Replaced.was_evicted());
        assert!(RemovalCause::Collected.was_evicted());
        assert!(RemovalCause::Expired.was_evicted());
        assert!(RemovalCause::Size.was_evicted());
    }
}
