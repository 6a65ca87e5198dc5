// A striped, lossy, multi-producer single-consumer buffer recording read
// events. Producers are wait-free: an offer either claims a slot, fails on
// CAS contention (the caller's probe is rehashed and the stripe table may
// grow), or reports the ring full. The maintenance task is the only
// consumer.
//
// Each stripe is a small sequence-numbered ring. A slot whose sequence
// equals the producer's ticket is free for that ticket; once written, the
// sequence is bumped to ticket + 1 to hand the value to the consumer, who
// releases the slot for the next lap by storing ticket + capacity.

use crate::common::ceiling_next_power_of_two;

use crossbeam_utils::CachePadded;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use smallvec::SmallVec;
use std::{
    cell::{Cell, UnsafeCell},
    mem::MaybeUninit,
    sync::atomic::{AtomicU64, Ordering},
};

/// Slots per stripe. Kept small; a full ring is the signal that the cache
/// is producing events faster than maintenance drains them.
const RING_CAPACITY: usize = 16;

/// The stripe table starts with one ring and doubles under contention up
/// to four times the next power of two of the CPU count.
static MAX_STRIPES: Lazy<usize> =
    Lazy::new(|| 4 * ceiling_next_power_of_two(num_cpus::get() as u64) as usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum OfferResult {
    Added,
    /// Lost a CAS race. The buffer has rehashed the caller's probe and
    /// possibly grown; the event is dropped.
    Failed,
    /// The selected ring was at capacity. The caller must schedule a
    /// drain eagerly.
    Full,
}

struct Slot<T> {
    sequence: AtomicU64,
    value: UnsafeCell<MaybeUninit<T>>,
}

struct Ring<T> {
    head: CachePadded<AtomicU64>,
    tail: CachePadded<AtomicU64>,
    slots: Box<[Slot<T>]>,
}

unsafe impl<T: Send> Send for Ring<T> {}
unsafe impl<T: Send> Sync for Ring<T> {}

impl<T> Ring<T> {
    fn new() -> Self {
        let slots = (0..RING_CAPACITY)
            .map(|i| Slot {
                sequence: AtomicU64::new(i as u64),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect();
        Self {
            head: CachePadded::new(AtomicU64::new(0)),
            tail: CachePadded::new(AtomicU64::new(0)),
            slots,
        }
    }

    fn offer(&self, value: T) -> OfferResult {
        let mask = (RING_CAPACITY - 1) as u64;
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        if tail.wrapping_sub(head) >= RING_CAPACITY as u64 {
            return OfferResult::Full;
        }

        let slot = &self.slots[(tail & mask) as usize];
        if slot.sequence.load(Ordering::Acquire) != tail {
            return OfferResult::Failed;
        }
        if self
            .tail
            .compare_exchange(tail, tail + 1, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return OfferResult::Failed;
        }

        // The ticket is ours; the slot is free until we publish.
        unsafe { (*slot.value.get()).as_mut_ptr().write(value) };
        slot.sequence.store(tail + 1, Ordering::Release);
        OfferResult::Added
    }

    /// Single consumer only.
    fn drain(&self, consumer: &mut impl FnMut(T)) {
        let mask = (RING_CAPACITY - 1) as u64;
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[(head & mask) as usize];
            if slot.sequence.load(Ordering::Acquire) != head + 1 {
                // Empty, or a producer has claimed the slot but not yet
                // published it; stop rather than wait.
                break;
            }
            let value = unsafe { (*slot.value.get()).as_ptr().read() };
            slot.sequence
                .store(head + RING_CAPACITY as u64, Ordering::Release);
            head += 1;
            consumer(value);
        }
        self.head.store(head, Ordering::Release);
    }

    fn len(&self) -> usize {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Relaxed);
        tail.saturating_sub(head) as usize
    }
}

impl<T> Drop for Ring<T> {
    fn drop(&mut self) {
        self.drain(&mut |value| drop(value));
    }
}

pub(crate) struct StripedBuffer<T> {
    table: RwLock<SmallVec<[Box<Ring<T>>; 4]>>,
    max_stripes: usize,
}

impl<T> StripedBuffer<T> {
    pub(crate) fn new() -> Self {
        Self::with_max_stripes(*MAX_STRIPES)
    }

    fn with_max_stripes(max_stripes: usize) -> Self {
        let mut table = SmallVec::new();
        table.push(Box::new(Ring::new()));
        Self {
            table: RwLock::new(table),
            max_stripes: max_stripes.max(1),
        }
    }

    pub(crate) fn offer(&self, value: T) -> OfferResult {
        let result = {
            let table = self.table.read();
            let index = (probe() as usize) & (table.len() - 1);
            table[index].offer(value)
        };
        if result == OfferResult::Failed {
            // Contention: move this producer to another stripe and give
            // the table a chance to grow.
            rehash_probe();
            self.expand();
        }
        result
    }

    /// Single consumer only.
    pub(crate) fn drain(&self, consumer: &mut impl FnMut(T)) {
        let table = self.table.read();
        for ring in table.iter() {
            ring.drain(consumer);
        }
    }

    pub(crate) fn len(&self) -> usize {
        let table = self.table.read();
        table.iter().map(|ring| ring.len()).sum()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn expand(&self) {
        let mut table = self.table.write();
        let len = table.len();
        if len >= self.max_stripes {
            return;
        }
        for _ in 0..len {
            table.push(Box::new(Ring::new()));
        }
    }
}

thread_local! {
    static PROBE: Cell<u64> = Cell::new(initial_probe());
}

fn initial_probe() -> u64 {
    let mut buf = [0u8; 8];
    match getrandom::getrandom(&mut buf) {
        Ok(()) => u64::from_ne_bytes(buf) | 1,
        Err(_) => 0x9e37_79b9_7f4a_7c15,
    }
}

fn probe() -> u64 {
    PROBE.with(|probe| probe.get())
}

fn rehash_probe() {
    PROBE.with(|probe| {
        let mut x = probe.get();
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        probe.set(x);
    });
}

#[cfg(test)]
mod tests {
    use super::{OfferResult, StripedBuffer, RING_CAPACITY};

    #[test]
    fn offer_and_drain_in_order() {
        let buffer = StripedBuffer::with_max_stripes(1);
        for i in 0..4 {
            assert_eq!(buffer.offer(i), OfferResult::Added);
        }
        assert_eq!(buffer.len(), 4);

        let mut drained = Vec::new();
        buffer.drain(&mut |v| drained.push(v));
        assert_eq!(drained, vec![0, 1, 2, 3]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn rejects_when_full() {
        let buffer = StripedBuffer::with_max_stripes(1);
        for i in 0..RING_CAPACITY {
            assert_eq!(buffer.offer(i), OfferResult::Added);
        }
        assert_eq!(buffer.offer(99), OfferResult::Full);

        // Draining makes room again.
        let mut count = 0;
        buffer.drain(&mut |_| count += 1);
        assert_eq!(count, RING_CAPACITY);
        assert_eq!(buffer.offer(99), OfferResult::Added);
    }

    #[test]
    fn slots_are_reusable_across_laps() {
        let buffer = StripedBuffer::with_max_stripes(1);
        for lap in 0..5 {
            for i in 0..RING_CAPACITY {
                assert_eq!(buffer.offer(lap * 100 + i), OfferResult::Added);
            }
            let mut drained = Vec::new();
            buffer.drain(&mut |v| drained.push(v));
            assert_eq!(drained.len(), RING_CAPACITY);
            assert_eq!(drained[0], lap * 100);
        }
    }

    #[test]
    fn concurrent_offers_are_not_lost_unless_reported() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        const NUM_PRODUCERS: usize = 4;

        let buffer = Arc::new(StripedBuffer::with_max_stripes(8));
        let added = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));

        let producers: Vec<_> = (0..NUM_PRODUCERS)
            .map(|t| {
                let buffer = Arc::clone(&buffer);
                let added = Arc::clone(&added);
                let done = Arc::clone(&done);
                std::thread::spawn(move || {
                    for i in 0..1000usize {
                        if buffer.offer(t * 1000 + i) == OfferResult::Added {
                            added.fetch_add(1, Ordering::Relaxed);
                        } else {
                            // Lossy by contract: rejected events are
                            // simply dropped.
                            std::thread::yield_now();
                        }
                    }
                    done.fetch_add(1, Ordering::Release);
                })
            })
            .collect();

        let mut drained = 0usize;
        while done.load(Ordering::Acquire) < NUM_PRODUCERS {
            buffer.drain(&mut |_| drained += 1);
        }
        for p in producers {
            p.join().unwrap();
        }
        buffer.drain(&mut |_| drained += 1);
        assert_eq!(drained, added.load(Ordering::Relaxed));
    }
}
