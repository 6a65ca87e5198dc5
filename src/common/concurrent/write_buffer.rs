// A lossless, growable, multi-producer single-consumer queue recording
// write events. The queue starts at a small power-of-two capacity and
// grows by chaining fixed-size chunks until the configured maximum; a
// producer that observes the queue at its maximum has the value handed
// back and is expected to run maintenance itself before retrying.
//
// Producers claim a global ticket by CAS, bounded by the maximum
// capacity, then publish the value through a per-slot ready flag. The
// chunk chain is kept behind a short mutex held only to map a ticket to
// its chunk; the value hand-off itself never blocks the consumer.

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;
use std::{
    cell::UnsafeCell,
    collections::VecDeque,
    mem::MaybeUninit,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

struct Chunk<T> {
    /// Ticket of the first slot in this chunk.
    base: u64,
    ready: Box<[AtomicBool]>,
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
}

unsafe impl<T: Send> Send for Chunk<T> {}
unsafe impl<T: Send> Sync for Chunk<T> {}

impl<T> Chunk<T> {
    fn new(base: u64, capacity: usize) -> Self {
        Self {
            base,
            ready: (0..capacity).map(|_| AtomicBool::new(false)).collect(),
            slots: (0..capacity)
                .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
                .collect(),
        }
    }
}

pub(crate) struct MpscGrowableQueue<T> {
    chunk_capacity: usize,
    max_capacity: usize,
    producer_index: CachePadded<AtomicU64>,
    consumer_index: CachePadded<AtomicU64>,
    chunks: Mutex<VecDeque<Arc<Chunk<T>>>>,
}

impl<T: Send> MpscGrowableQueue<T> {
    /// Both capacities must be powers of two, with
    /// `initial_capacity <= max_capacity`.
    pub(crate) fn new(initial_capacity: usize, max_capacity: usize) -> Self {
        assert!(initial_capacity.is_power_of_two());
        assert!(max_capacity.is_power_of_two());
        assert!(initial_capacity <= max_capacity);

        let mut chunks = VecDeque::new();
        chunks.push_back(Arc::new(Chunk::new(0, initial_capacity)));
        Self {
            chunk_capacity: initial_capacity,
            max_capacity,
            producer_index: CachePadded::new(AtomicU64::new(0)),
            consumer_index: CachePadded::new(AtomicU64::new(0)),
            chunks: Mutex::new(chunks),
        }
    }

    /// Enqueues a value, growing the chunk chain on demand. Hands the
    /// value back when the queue holds `max_capacity` unconsumed values,
    /// so the producer can run maintenance and retry.
    pub(crate) fn enqueue(&self, value: T) -> Result<(), T> {
        // Claim a ticket, bounded by the maximum capacity.
        let ticket = loop {
            let ticket = self.producer_index.load(Ordering::Relaxed);
            let consumed = self.consumer_index.load(Ordering::Acquire);
            if ticket.wrapping_sub(consumed) >= self.max_capacity as u64 {
                return Err(value);
            }
            if self
                .producer_index
                .compare_exchange_weak(ticket, ticket + 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                break ticket;
            }
        };

        let chunk = self.chunk_for(ticket);
        let index = (ticket - chunk.base) as usize;
        unsafe { (*chunk.slots[index].get()).as_mut_ptr().write(value) };
        chunk.ready[index].store(true, Ordering::Release);
        Ok(())
    }

    /// Single consumer only. Returns `None` when the queue is empty or
    /// the next producer has claimed its slot but not yet published.
    pub(crate) fn dequeue(&self) -> Option<T> {
        let index = self.consumer_index.load(Ordering::Relaxed);
        if index == self.producer_index.load(Ordering::Acquire) {
            return None;
        }

        let capacity = self.chunk_capacity as u64;
        let chunk = {
            let mut chunks = self.chunks.lock();
            // Drop chunks the consumer has fully passed. The chain keeps
            // at least one chunk so producers always have a tail to
            // extend from.
            while chunks.len() > 1 && index >= chunks.front().map_or(0, |c| c.base + capacity) {
                chunks.pop_front();
            }
            let front = chunks.front()?;
            if index < front.base || index >= front.base + capacity {
                // The producer that claimed this ticket has not linked
                // its chunk yet.
                return None;
            }
            Arc::clone(front)
        };

        let slot = (index - chunk.base) as usize;
        if !chunk.ready[slot].load(Ordering::Acquire) {
            return None;
        }
        let value = unsafe { (*chunk.slots[slot].get()).as_ptr().read() };
        chunk.ready[slot].store(false, Ordering::Relaxed);
        self.consumer_index.store(index + 1, Ordering::Release);
        Some(value)
    }

    pub(crate) fn len(&self) -> usize {
        let produced = self.producer_index.load(Ordering::Relaxed);
        let consumed = self.consumer_index.load(Ordering::Relaxed);
        produced.saturating_sub(consumed) as usize
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maps a claimed ticket to its chunk, allocating and publishing the
    /// next chunk when the ticket crosses the end of the chain.
    fn chunk_for(&self, ticket: u64) -> Arc<Chunk<T>> {
        let mut chunks = self.chunks.lock();
        loop {
            // Search from the back; a fresh ticket is almost always in
            // the newest chunk.
            for chunk in chunks.iter().rev() {
                if ticket >= chunk.base && ticket < chunk.base + self.chunk_capacity as u64 {
                    return Arc::clone(chunk);
                }
            }
            let next_base = chunks
                .back()
                .map(|chunk| chunk.base + self.chunk_capacity as u64)
                .expect("chunk chain is never empty");
            chunks.push_back(Arc::new(Chunk::new(next_base, self.chunk_capacity)));
        }
    }
}

impl<T> Drop for MpscGrowableQueue<T> {
    fn drop(&mut self) {
        let consumed = self.consumer_index.load(Ordering::Relaxed);
        let chunks = self.chunks.get_mut();
        for chunk in chunks.iter() {
            for slot in 0..self.chunk_capacity {
                let ticket = chunk.base + slot as u64;
                if ticket >= consumed && chunk.ready[slot].load(Ordering::Relaxed) {
                    unsafe { drop((*chunk.slots[slot].get()).as_ptr().read()) };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::MpscGrowableQueue;

    #[test]
    fn grows_to_max_and_preserves_fifo_order() {
        let queue = MpscGrowableQueue::new(2, 4);
        for i in 0..4 {
            assert!(queue.enqueue(i).is_ok());
        }
        // At maximum capacity until the consumer makes room.
        assert!(queue.enqueue(99).is_err());
        assert_eq!(queue.len(), 4);

        for i in 0..4 {
            assert_eq!(queue.dequeue(), Some(i));
        }
        assert_eq!(queue.dequeue(), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn chunks_are_recycled() {
        let queue = MpscGrowableQueue::new(2, 8);
        for round in 0..20 {
            for i in 0..6 {
                assert!(queue.enqueue(round * 10 + i).is_ok());
            }
            for i in 0..6 {
                assert_eq!(queue.dequeue(), Some(round * 10 + i));
            }
        }
        assert!(queue.is_empty());
        // Only the chunk holding the consumer cursor survives.
        assert!(queue.chunks.lock().len() <= 2);
    }

    #[test]
    fn drops_unconsumed_values() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        struct Counted(Arc<AtomicUsize>);
        impl Drop for Counted {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }

        let drops = Arc::new(AtomicUsize::new(0));
        {
            let queue = MpscGrowableQueue::new(2, 8);
            for _ in 0..5 {
                assert!(queue.enqueue(Counted(Arc::clone(&drops))).is_ok());
            }
            drop(queue.dequeue());
        }
        assert_eq!(drops.load(Ordering::Relaxed), 5);
    }

    #[test]
    fn concurrent_producers_deliver_every_value() {
        use std::collections::HashSet;
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        const NUM_PRODUCERS: usize = 4;
        const PER_PRODUCER: usize = 2_000;

        let queue = Arc::new(MpscGrowableQueue::new(16, 1024));
        let done = Arc::new(AtomicUsize::new(0));

        let producers: Vec<_> = (0..NUM_PRODUCERS)
            .map(|t| {
                let queue = Arc::clone(&queue);
                let done = Arc::clone(&done);
                std::thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        while queue.enqueue(t * PER_PRODUCER + i).is_err() {
                            std::thread::yield_now();
                        }
                    }
                    done.fetch_add(1, Ordering::Release);
                })
            })
            .collect();

        let mut received = HashSet::new();
        while received.len() < NUM_PRODUCERS * PER_PRODUCER {
            match queue.dequeue() {
                Some(v) => {
                    assert!(received.insert(v), "duplicate value {}", v);
                }
                None => {
                    if done.load(Ordering::Acquire) == NUM_PRODUCERS && queue.is_empty() {
                        break;
                    }
                    std::thread::yield_now();
                }
            }
        }
        for p in producers {
            p.join().unwrap();
        }
        assert_eq!(received.len(), NUM_PRODUCERS * PER_PRODUCER);
    }
}
