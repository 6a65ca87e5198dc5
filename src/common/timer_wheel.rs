// A hierarchical timer wheel for per-entry variable expiration, providing
// amortized O(1) scheduling, descheduling and advance. Entries are placed
// in the coarsest bucket whose span covers their remaining duration and
// cascade toward finer wheels as time passes.

use crate::common::{
    concurrent::EntryInfo,
    deque::{CacheRegion, DeqNode, Deque},
    time::Instant,
};

use smallvec::SmallVec;
use std::{cell::Cell, ptr::NonNull};
use triomphe::Arc as TrioArc;

pub(crate) const BUCKET_COUNTS: [u64; 5] = [64, 64, 32, 4, 1];

// Power-of-two ceilings of one second, minute, hour and day in
// nanoseconds, plus a catch-all level spanning four days.
pub(crate) const SPANS: [u64; 5] = [
    1 << 30, // 1.07s
    1 << 36, // 1.14m
    1 << 42, // 1.22h
    1 << 47, // 1.63d
    BUCKET_COUNTS[3] * (1 << 47), // 6.5d
];

const SHIFT: [u64; 5] = [30, 36, 42, 47, 49];

/// Element of a timer wheel bucket. Remembers which bucket holds it so
/// that descheduling needs no recomputation after the entry's deadline
/// has been rewritten.
pub(crate) struct TimerNode<K> {
    pub(crate) entry_info: TrioArc<EntryInfo<K>>,
    level: Cell<u8>,
    index: Cell<u8>,
}

impl<K> TimerNode<K> {
    fn new(entry_info: TrioArc<EntryInfo<K>>) -> Self {
        Self {
            entry_info,
            level: Cell::new(0),
            index: Cell::new(0),
        }
    }
}

pub(crate) struct TimerWheel<K> {
    wheels: Vec<Vec<Deque<TimerNode<K>>>>,
    /// The time of the last advance.
    nanos: u64,
}

impl<K> TimerWheel<K> {
    pub(crate) fn new(now: Instant) -> Self {
        let wheels = BUCKET_COUNTS
            .iter()
            .map(|count| {
                (0..*count)
                    .map(|_| Deque::new(CacheRegion::Other))
                    .collect()
            })
            .collect();
        Self {
            wheels,
            nanos: now.as_nanos(),
        }
    }

    /// Schedules the entry at its current variable time, recording the
    /// node pointer in the entry. No-op when the deadline is unset.
    pub(crate) fn schedule(&mut self, entry_info: &TrioArc<EntryInfo<K>>) {
        if let Some(time) = entry_info.variable_time() {
            let node = Box::new(DeqNode::new(TimerNode::new(TrioArc::clone(entry_info))));
            let ptr = self.schedule_node(node, time.as_nanos(), self.nanos);
            entry_info.nodes().timer_node = Some(ptr);
        }
    }

    /// Moves an already scheduled node to the bucket matching the entry's
    /// rewritten deadline.
    ///
    /// # Safety
    ///
    /// The pointer must have been returned by this wheel and not yet
    /// descheduled.
    pub(crate) unsafe fn reschedule(&mut self, ptr: NonNull<DeqNode<TimerNode<K>>>) {
        let node = self.unlink(ptr);
        let entry_info = TrioArc::clone(&node.element.entry_info);
        match entry_info.variable_time() {
            Some(time) => {
                let ptr = self.schedule_node(node, time.as_nanos(), self.nanos);
                entry_info.nodes().timer_node = Some(ptr);
            }
            None => {
                entry_info.nodes().timer_node = None;
            }
        }
    }

    /// Removes a scheduled node.
    ///
    /// # Safety
    ///
    /// The pointer must have been returned by this wheel and not yet
    /// descheduled.
    pub(crate) unsafe fn deschedule(&mut self, ptr: NonNull<DeqNode<TimerNode<K>>>) {
        let node = self.unlink(ptr);
        node.element.entry_info.nodes().timer_node = None;
    }

    /// Advances the wheel to `now`, cascading live entries toward finer
    /// buckets and returning the entries whose deadlines have passed.
    /// Expired entries are fully unlinked from the wheel before they are
    /// returned; the caller decides whether to evict or resurrect them.
    ///
    /// The new time is committed only once every traversed bucket has
    /// been processed; no user code runs in between, and an unwinding
    /// allocation failure leaves the previous time in place so the
    /// traversed range is retried.
    pub(crate) fn advance(&mut self, now: Instant) -> Vec<TrioArc<EntryInfo<K>>> {
        let current = now.as_nanos();
        let previous = self.nanos;
        let mut expired = Vec::new();
        if current <= previous {
            return expired;
        }

        for level in 0..BUCKET_COUNTS.len() {
            let previous_ticks = previous >> SHIFT[level];
            let current_ticks = current >> SHIFT[level];
            let delta = current_ticks.saturating_sub(previous_ticks);
            if delta == 0 {
                break;
            }
            self.expire_level(level, previous_ticks, delta, current, &mut expired);
        }
        self.nanos = current;
        expired
    }

    fn expire_level(
        &mut self,
        level: usize,
        previous_ticks: u64,
        delta: u64,
        now: u64,
        expired: &mut Vec<TrioArc<EntryInfo<K>>>,
    ) {
        let buckets = BUCKET_COUNTS[level];
        let mask = buckets - 1;
        // Revisit the previous (partially elapsed) bucket as well, since
        // entries may have been scheduled into it after its tick began.
        let steps = (delta + 1).min(buckets);
        let start = previous_ticks & mask;

        for step in 0..steps {
            let index = ((start + step) & mask) as usize;
            let mut drained: SmallVec<[Box<DeqNode<TimerNode<K>>>; 8]> = SmallVec::new();
            while let Some(node) = self.wheels[level][index].pop_front() {
                drained.push(node);
            }

            for node in drained {
                let entry_info = TrioArc::clone(&node.element.entry_info);
                match entry_info.variable_time() {
                    Some(time) if time.as_nanos() <= now => {
                        entry_info.nodes().timer_node = None;
                        expired.push(entry_info);
                    }
                    Some(time) => {
                        // Cascade relative to the time being advanced to.
                        let ptr = self.schedule_node(node, time.as_nanos(), now);
                        entry_info.nodes().timer_node = Some(ptr);
                    }
                    None => {
                        entry_info.nodes().timer_node = None;
                    }
                }
            }
        }
    }

    fn schedule_node(
        &mut self,
        node: Box<DeqNode<TimerNode<K>>>,
        time: u64,
        now: u64,
    ) -> NonNull<DeqNode<TimerNode<K>>> {
        let (level, index) = Self::bucket_indexes(time, now);
        node.element.level.set(level as u8);
        node.element.index.set(index as u8);
        self.wheels[level][index].push_back(node)
    }

    unsafe fn unlink(&mut self, ptr: NonNull<DeqNode<TimerNode<K>>>) -> Box<DeqNode<TimerNode<K>>> {
        let (level, index) = {
            let node = ptr.as_ref();
            (
                node.element.level.get() as usize,
                node.element.index.get() as usize,
            )
        };
        self.wheels[level][index].unlink(ptr)
    }

    /// Every scheduled entry, in no particular order. Snapshot use only.
    pub(crate) fn scheduled_entries(&self) -> Vec<TrioArc<EntryInfo<K>>> {
        let mut entries = Vec::new();
        for wheel in self.wheels.iter() {
            for bucket in wheel.iter() {
                for node in bucket.iter() {
                    entries.push(TrioArc::clone(&node.element.entry_info));
                }
            }
        }
        entries
    }

    fn bucket_indexes(time: u64, now: u64) -> (usize, usize) {
        let duration = time.saturating_sub(now);
        for level in 0..(BUCKET_COUNTS.len() - 1) {
            if duration < SPANS[level + 1] {
                let ticks = time >> SHIFT[level];
                return (level, (ticks & (BUCKET_COUNTS[level] - 1)) as usize);
            }
        }
        // Beyond every span: the single overflow bucket.
        (BUCKET_COUNTS.len() - 1, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::{TimerWheel, SPANS};
    use crate::common::{
        concurrent::{EntryInfo, KeyHash},
        time::Instant,
    };

    use std::{sync::Arc, time::Duration};
    use triomphe::Arc as TrioArc;

    fn entry(key: u32, deadline: Instant) -> TrioArc<EntryInfo<u32>> {
        let info = TrioArc::new(EntryInfo::new(
            KeyHash::new(Arc::new(key), key as u64),
            Instant::new(0),
            1,
        ));
        info.set_variable_time(deadline);
        info
    }

    fn secs(n: u64) -> Instant {
        Instant::new(Duration::from_secs(n).as_nanos() as u64)
    }

    #[test]
    fn spans_are_power_of_two_ceilings() {
        let expected = [
            Duration::from_secs(1),
            Duration::from_secs(60),
            Duration::from_secs(60 * 60),
            Duration::from_secs(24 * 60 * 60),
        ];
        for (span, duration) in SPANS.iter().zip(expected.iter()) {
            let nanos = duration.as_nanos() as u64;
            assert!(span.is_power_of_two());
            assert!(*span >= nanos && *span < nanos * 2);
        }
        assert_eq!(SPANS[4], 4 * SPANS[3]);
    }

    #[test]
    fn expires_at_deadline() {
        let mut wheel = TimerWheel::new(secs(0));
        let info = entry(1, secs(5));
        wheel.schedule(&info);
        assert!(info.nodes().timer_node.is_some());

        assert!(wheel.advance(secs(4)).is_empty());
        let expired = wheel.advance(secs(7));
        assert_eq!(expired.len(), 1);
        assert_eq!(**expired[0].key(), 1);
        assert!(info.nodes().timer_node.is_none());
    }

    #[test]
    fn cascades_through_levels() {
        let mut wheel = TimerWheel::new(secs(0));
        // 90s lands on the minute wheel.
        let info = entry(1, secs(90));
        wheel.schedule(&info);

        // Passing the minute boundary must not fire it early, only move
        // it down to the second wheel.
        assert!(wheel.advance(secs(80)).is_empty());
        assert!(info.nodes().timer_node.is_some());

        let expired = wheel.advance(secs(91));
        assert_eq!(expired.len(), 1);
    }

    #[test]
    fn far_deadline_uses_overflow_level() {
        let mut wheel = TimerWheel::new(secs(0));
        let thirty_days = 30 * 24 * 60 * 60;
        let info = entry(1, secs(thirty_days));
        wheel.schedule(&info);

        assert!(wheel.advance(secs(thirty_days - 1)).is_empty());
        assert_eq!(wheel.advance(secs(thirty_days + 1)).len(), 1);
    }

    #[test]
    fn deschedule_removes_node() {
        let mut wheel = TimerWheel::new(secs(0));
        let info = entry(1, secs(5));
        wheel.schedule(&info);

        let ptr = info.nodes().timer_node.take().unwrap();
        unsafe { wheel.deschedule(ptr) };
        assert!(wheel.advance(secs(10)).is_empty());
    }

    #[test]
    fn reschedule_moves_deadline() {
        let mut wheel = TimerWheel::new(secs(0));
        let info = entry(1, secs(5));
        wheel.schedule(&info);

        info.set_variable_time(secs(20));
        let ptr = info.nodes().timer_node.unwrap();
        unsafe { wheel.reschedule(ptr) };

        assert!(wheel.advance(secs(6)).is_empty());
        assert_eq!(wheel.advance(secs(21)).len(), 1);
    }

    #[test]
    fn advance_is_monotonic() {
        let mut wheel = TimerWheel::new(secs(10));
        let info = entry(1, secs(12));
        wheel.schedule(&info);
        // Going backwards is ignored.
        assert!(wheel.advance(secs(5)).is_empty());
        assert_eq!(wheel.advance(secs(13)).len(), 1);
    }
}
