use crate::common::concurrent::thread_pool::{shared_pool, PoolName, ThreadPool};

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;
use scheduled_thread_pool::JobHandle;
use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicU8, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

pub(crate) const MAX_SYNC_REPEATS: usize = 4;

const PERIODICAL_SYNC_INITIAL_DELAY_MILLIS: u64 = 500;
const PERIODICAL_SYNC_NORMAL_PACE_MILLIS: u64 = 300;
const PERIODICAL_SYNC_FAST_PACE_NANOS: u64 = 500;

/// How soon the next periodic maintenance should run, as reported by the
/// previous run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SyncPace {
    Normal,
    Fast,
}

impl SyncPace {
    fn make_duration(self) -> Duration {
        match self {
            SyncPace::Normal => Duration::from_millis(PERIODICAL_SYNC_NORMAL_PACE_MILLIS),
            SyncPace::Fast => Duration::from_nanos(PERIODICAL_SYNC_FAST_PACE_NANOS),
        }
    }
}

/// Implemented by the cache engine; called with the eviction work to do.
pub(crate) trait InnerSync {
    fn sync(&self, max_repeats: usize) -> Option<SyncPace>;
}

/// The drain-status state machine coordinating when maintenance runs with
/// respect to concurrent readers and writers.
pub(crate) mod drain_status {
    pub(crate) const IDLE: u8 = 0;
    pub(crate) const REQUIRED: u8 = 1;
    pub(crate) const PROCESSING_TO_IDLE: u8 = 2;
    pub(crate) const PROCESSING_TO_REQUIRED: u8 = 3;
}

use drain_status::*;

pub(crate) struct Housekeeper<T> {
    inner: Weak<T>,
    drain_status: Arc<CachePadded<AtomicU8>>,
    pool: Arc<ThreadPool>,
    periodical_sync_job: Arc<Mutex<Option<JobHandle>>>,
    /// Cleared by tests to keep maintenance off background threads.
    auto_sync_enabled: Arc<AtomicBool>,
}

impl<T: InnerSync + Send + Sync + 'static> Housekeeper<T> {
    pub(crate) fn new(inner: Weak<T>) -> Self {
        let pool = shared_pool(PoolName::Housekeeper);
        let drain_status = Arc::new(CachePadded::new(AtomicU8::new(IDLE)));
        let auto_sync_enabled = Arc::new(AtomicBool::new(true));
        let periodical_sync_job = Arc::new(Mutex::new(None));

        schedule_periodical_sync(
            &pool,
            Duration::from_millis(PERIODICAL_SYNC_INITIAL_DELAY_MILLIS),
            Weak::clone(&inner),
            Arc::clone(&drain_status),
            Arc::clone(&auto_sync_enabled),
            Arc::clone(&periodical_sync_job),
        );

        Self {
            inner,
            drain_status,
            pool,
            periodical_sync_job,
            auto_sync_enabled,
        }
    }

    pub(crate) fn should_apply(&self) -> bool {
        self.drain_status.load(Ordering::Acquire) == REQUIRED
    }

    /// Requests a maintenance run. From `Idle` or `Required` the status
    /// moves to `ProcessingToIdle` and a run is submitted; while a run is
    /// in flight the status is bumped to `ProcessingToRequired` so the
    /// run repeats once before going idle.
    pub(crate) fn try_schedule_sync(&self) -> bool {
        if !self.auto_sync_enabled.load(Ordering::Acquire) {
            self.drain_status.store(REQUIRED, Ordering::Release);
            return false;
        }

        loop {
            let status = self.drain_status.load(Ordering::Acquire);
            match status {
                IDLE | REQUIRED => {
                    if self
                        .drain_status
                        .compare_exchange(
                            status,
                            PROCESSING_TO_IDLE,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        self.submit_sync_task();
                        return true;
                    }
                }
                PROCESSING_TO_IDLE => {
                    if self
                        .drain_status
                        .compare_exchange(
                            PROCESSING_TO_IDLE,
                            PROCESSING_TO_REQUIRED,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        return false;
                    }
                }
                _ => return false,
            }
        }
    }

    fn submit_sync_task(&self) {
        let inner = Weak::clone(&self.inner);
        let drain_status = Arc::clone(&self.drain_status);
        self.pool
            .pool
            .execute_after(Duration::from_millis(0), move || {
                if let Some(inner) = inner.upgrade() {
                    finish_scheduled_sync(&*inner, &drain_status);
                }
            });
    }

    #[cfg(test)]
    pub(crate) fn disable_auto_sync(&self) {
        self.auto_sync_enabled.store(false, Ordering::Release);
        let mut job = self.periodical_sync_job.lock();
        if let Some(job) = job.take() {
            job.cancel();
        }
    }
}

impl<T> Drop for Housekeeper<T> {
    fn drop(&mut self) {
        let mut job = self.periodical_sync_job.lock();
        if let Some(job) = job.take() {
            job.cancel();
        }
    }
}

/// Runs one periodic maintenance pass and chains the next run at the
/// pace the pass reported. The chain ends when the cache is dropped or
/// auto sync is switched off; `job_slot` always holds the handle of the
/// upcoming run so `cancel` can break the chain.
fn schedule_periodical_sync<T>(
    pool: &Arc<ThreadPool>,
    delay: Duration,
    inner: Weak<T>,
    drain_status: Arc<CachePadded<AtomicU8>>,
    auto_sync_enabled: Arc<AtomicBool>,
    job_slot: Arc<Mutex<Option<JobHandle>>>,
) where
    T: InnerSync + Send + Sync + 'static,
{
    let pool_for_next = Arc::clone(pool);
    let slot_for_next = Arc::clone(&job_slot);
    let job = pool.pool.execute_after(delay, move || {
        if !auto_sync_enabled.load(Ordering::Acquire) {
            return;
        }
        let pace = match inner.upgrade() {
            Some(inner) => run_sync(&*inner, &drain_status),
            // The cache is gone; end the chain.
            None => return,
        };
        let next_delay = pace.unwrap_or(SyncPace::Normal).make_duration();
        schedule_periodical_sync(
            &pool_for_next,
            next_delay,
            inner,
            drain_status,
            auto_sync_enabled,
            slot_for_next,
        );
    });
    *job_slot.lock() = Some(job);
}

/// Claims the state machine (if claimable) and runs maintenance.
fn run_sync<T: InnerSync>(inner: &T, drain_status: &AtomicU8) -> Option<SyncPace> {
    loop {
        let status = drain_status.load(Ordering::Acquire);
        match status {
            IDLE | REQUIRED => {
                if drain_status
                    .compare_exchange(status, PROCESSING_TO_IDLE, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return finish_scheduled_sync(inner, drain_status);
                }
            }
            // Another thread is already processing.
            _ => return None,
        }
    }
}

/// Runs maintenance from the `ProcessingToIdle` state until the status
/// settles at `Idle`. A panic in maintenance is logged and leaves the
/// status at `Required` so the next cycle retries.
fn finish_scheduled_sync<T: InnerSync>(inner: &T, drain_status: &AtomicU8) -> Option<SyncPace> {
    let mut last_pace = None;
    loop {
        match catch_unwind(AssertUnwindSafe(|| inner.sync(MAX_SYNC_REPEATS))) {
            Ok(pace) => last_pace = pace.or(last_pace),
            Err(_) => {
                log::error!("cache maintenance task panicked; will retry on the next cycle");
                drain_status.store(REQUIRED, Ordering::Release);
                return last_pace;
            }
        }
        match drain_status.compare_exchange(
            PROCESSING_TO_IDLE,
            IDLE,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => return last_pace,
            Err(PROCESSING_TO_REQUIRED) => {
                // New work arrived while we were draining; run once more.
                drain_status.store(PROCESSING_TO_IDLE, Ordering::Release);
            }
            Err(_) => return last_pace,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingInner {
        syncs: AtomicUsize,
    }

    impl InnerSync for CountingInner {
        fn sync(&self, _max_repeats: usize) -> Option<SyncPace> {
            self.syncs.fetch_add(1, Ordering::AcqRel);
            Some(SyncPace::Normal)
        }
    }

    #[test]
    fn scheduled_sync_runs_and_goes_idle() {
        let inner = Arc::new(CountingInner {
            syncs: AtomicUsize::new(0),
        });
        let housekeeper = Housekeeper::new(Arc::downgrade(&inner));

        assert!(housekeeper.try_schedule_sync());
        for _ in 0..200 {
            if inner.syncs.load(Ordering::Acquire) > 0
                && housekeeper.drain_status.load(Ordering::Acquire) == IDLE
            {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("scheduled sync did not complete");
    }

    #[test]
    fn new_work_during_processing_runs_again() {
        let inner = Arc::new(CountingInner {
            syncs: AtomicUsize::new(0),
        });
        let housekeeper = Housekeeper::new(Arc::downgrade(&inner));
        housekeeper
            .drain_status
            .store(PROCESSING_TO_REQUIRED, Ordering::Release);

        // Simulates the completion path of an in-flight run.
        finish_scheduled_sync(&*inner, &housekeeper.drain_status);
        assert_eq!(inner.syncs.load(Ordering::Acquire), 2);
        assert_eq!(housekeeper.drain_status.load(Ordering::Acquire), IDLE);
    }

    #[test]
    fn disabled_auto_sync_records_required() {
        let inner = Arc::new(CountingInner {
            syncs: AtomicUsize::new(0),
        });
        let housekeeper = Housekeeper::new(Arc::downgrade(&inner));
        housekeeper.disable_auto_sync();

        assert!(!housekeeper.try_schedule_sync());
        assert!(housekeeper.should_apply());
        assert_eq!(inner.syncs.load(Ordering::Acquire), 0);
    }
}
