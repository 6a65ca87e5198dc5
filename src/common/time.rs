use std::{
    convert::TryFrom,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

/// The largest duration, in nanoseconds, that an expiration policy will
/// honor. Durations beyond this are clamped so that every addition of a
/// deadline to a timestamp stays representable in 63-bit arithmetic.
pub(crate) const MAX_EXPIRY_NANOS: u64 = (i64::MAX >> 1) as u64;

/// Write-time sentinel marking an entry whose value is being reloaded in
/// the background. Far enough in the future that no concurrent reader will
/// observe the entry as stale and start a second reload.
pub(crate) const ASYNC_EXPIRY_NANOS: u64 = (MAX_EXPIRY_NANOS >> 1) + (MAX_EXPIRY_NANOS >> 2);

/// A point in time, measured in nanoseconds from the clock's origin.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct Instant(u64);

impl Instant {
    pub(crate) fn new(nanos: u64) -> Self {
        Self(nanos)
    }

    pub(crate) fn as_nanos(self) -> u64 {
        self.0
    }

    /// Adds a duration, clamping it to `MAX_EXPIRY_NANOS` first and
    /// saturating on overflow.
    pub(crate) fn saturating_add(self, duration: Duration) -> Instant {
        let nanos = duration_to_nanos(duration);
        Instant(self.0.saturating_add(nanos))
    }

    pub(crate) fn saturating_duration_since(self, earlier: Instant) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }
}

/// Converts a duration to clamped nanoseconds.
pub(crate) fn duration_to_nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos())
        .unwrap_or(MAX_EXPIRY_NANOS)
        .min(MAX_EXPIRY_NANOS)
}

/// The nanosecond ticker used for all expiration decisions.
///
/// Backed by a monotonic `quanta` clock by default. Tests (and callers
/// that need deterministic time) inject a mocked clock through
/// `CacheBuilder::ticker`.
#[derive(Clone, Debug)]
pub struct Clock(quanta::Clock, quanta::Instant);

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock {
    pub fn new() -> Self {
        let clock = quanta::Clock::new();
        let epoch = clock.now();
        Self(clock, epoch)
    }

    /// Returns a clock paired with a handle that controls it. The clock
    /// starts at zero and only moves when the mock is advanced.
    pub fn mock() -> (Clock, std::sync::Arc<quanta::Mock>) {
        let (clock, mock) = quanta::Clock::mock();
        let epoch = clock.now();
        (Clock(clock, epoch), mock)
    }

    pub(crate) fn now(&self) -> Instant {
        let elapsed = self.0.now().saturating_duration_since(self.1);
        Instant(u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX))
    }
}

/// An `Option<Instant>` with atomic access. `u64::MAX` encodes the unset
/// state, which doubles as "never expires" for deadline fields.
#[derive(Debug)]
pub(crate) struct AtomicInstant {
    instant: AtomicU64,
}

impl Default for AtomicInstant {
    fn default() -> Self {
        Self {
            instant: AtomicU64::new(u64::MAX),
        }
    }
}

impl AtomicInstant {
    pub(crate) fn new(instant: Instant) -> Self {
        Self {
            instant: AtomicU64::new(instant.as_nanos()),
        }
    }

    pub(crate) fn is_set(&self) -> bool {
        self.instant.load(Ordering::Acquire) != u64::MAX
    }

    pub(crate) fn instant(&self) -> Option<Instant> {
        match self.instant.load(Ordering::Acquire) {
            u64::MAX => None,
            nanos => Some(Instant(nanos)),
        }
    }

    pub(crate) fn set_instant(&self, instant: Instant) {
        self.instant.store(instant.as_nanos(), Ordering::Release);
    }

    pub(crate) fn clear(&self) {
        self.instant.store(u64::MAX, Ordering::Release);
    }

    pub(crate) fn compare_exchange(&self, current: Instant, new: Instant) -> Result<(), Instant> {
        self.instant
            .compare_exchange(
                current.as_nanos(),
                new.as_nanos(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(Instant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn saturating_arithmetic() {
        let i = Instant::new(u64::MAX - 10);
        assert_eq!(i.saturating_add(Duration::from_secs(1)).as_nanos(), u64::MAX);

        let early = Instant::new(100);
        let late = Instant::new(250);
        assert_eq!(late.saturating_duration_since(early), Duration::from_nanos(150));
        assert_eq!(early.saturating_duration_since(late), Duration::from_nanos(0));
    }

    #[test]
    fn durations_are_clamped() {
        assert_eq!(duration_to_nanos(Duration::from_secs(u64::MAX)), MAX_EXPIRY_NANOS);
        assert_eq!(duration_to_nanos(Duration::from_nanos(7)), 7);
    }

    #[test]
    fn atomic_instant_roundtrip() {
        let ai = AtomicInstant::default();
        assert!(!ai.is_set());
        assert_eq!(ai.instant(), None);

        ai.set_instant(Instant::new(42));
        assert_eq!(ai.instant(), Some(Instant::new(42)));

        assert!(ai.compare_exchange(Instant::new(42), Instant::new(43)).is_ok());
        assert_eq!(ai.instant(), Some(Instant::new(43)));
        assert!(ai.compare_exchange(Instant::new(42), Instant::new(44)).is_err());

        ai.clear();
        assert!(!ai.is_set());
    }

    #[test]
    fn mock_clock_advances() {
        let (clock, mock) = Clock::mock();
        let t0 = clock.now();
        mock.increment(Duration::from_secs(3));
        let t1 = clock.now();
        assert_eq!(t1.saturating_duration_since(t0), Duration::from_secs(3));
    }
}
