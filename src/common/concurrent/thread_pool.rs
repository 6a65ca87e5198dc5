use once_cell::sync::Lazy;
use parking_lot::Mutex;
use scheduled_thread_pool::ScheduledThreadPool;
use std::{collections::HashMap, sync::Arc};

/// The shared pools used by every cache in the process. Each purpose gets
/// its own pool so a slow user callback (refresh) cannot starve
/// maintenance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) enum PoolName {
    Housekeeper,
    Refresh,
}

impl PoolName {
    fn as_str(&self) -> &'static str {
        match self {
            PoolName::Housekeeper => "housekeeper",
            PoolName::Refresh => "refresh",
        }
    }

    fn num_threads(&self) -> usize {
        match self {
            // Maintenance is single-consumer per cache; a small pool
            // covers many caches.
            PoolName::Housekeeper => (num_cpus::get() / 2).max(1),
            PoolName::Refresh => num_cpus::get().max(1),
        }
    }
}

pub(crate) struct ThreadPool {
    pub(crate) pool: ScheduledThreadPool,
    pub(crate) name: PoolName,
}

static REGISTRY: Lazy<Mutex<HashMap<PoolName, Arc<ThreadPool>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Returns the process-wide pool for the given purpose, creating it on
/// first use.
pub(crate) fn shared_pool(name: PoolName) -> Arc<ThreadPool> {
    let mut registry = REGISTRY.lock();
    Arc::clone(registry.entry(name).or_insert_with(|| {
        // The uuid distinguishes pools across processes sharing logs.
        let thread_name = format!(
            "arabica-{}-{}-{{}}",
            name.as_str(),
            uuid::Uuid::new_v4().as_simple()
        );
        let pool = ScheduledThreadPool::with_name(&thread_name, name.num_threads());
        Arc::new(ThreadPool { pool, name })
    }))
}

#[cfg(test)]
mod tests {
    use super::{shared_pool, PoolName};
    use std::{
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        time::Duration,
    };

    #[test]
    fn pools_are_shared_per_purpose() {
        let a = shared_pool(PoolName::Housekeeper);
        let b = shared_pool(PoolName::Housekeeper);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.name, PoolName::Housekeeper);

        let c = shared_pool(PoolName::Refresh);
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn jobs_run() {
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = Arc::clone(&ran);
        let pool = shared_pool(PoolName::Refresh);
        pool.pool.execute_after(Duration::from_millis(0), move || {
            ran2.store(true, Ordering::Release);
        });
        for _ in 0..100 {
            if ran.load(Ordering::Acquire) {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("job did not run");
    }
}
