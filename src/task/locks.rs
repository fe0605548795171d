//! Reference-counted power and network locks.
//!
//! Overlapping tasks share one underlying platform lock per kind. The lock
//! is created and acquired when the count goes 0 → 1 and released and
//! dropped when it returns to 0. A released platform lock is never reused;
//! the next cycle creates a fresh one.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// One platform lock object. Acquired at most once, released at most once.
pub trait PlatformLock: Send {
    fn acquire(&mut self);
    fn release(&mut self);
    /// Identity of this lock object.
    fn id(&self) -> u64;
}

pub trait LockProvider: Send + Sync {
    fn create(&self) -> Box<dyn PlatformLock>;
}

/// Provider for hosts without power management: the lock only logs.
pub struct LoggingLockProvider {
    name: &'static str,
    next_id: AtomicU64,
}

impl LoggingLockProvider {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            next_id: AtomicU64::new(1),
        }
    }
}

struct LoggingLock {
    name: &'static str,
    id: u64,
}

impl PlatformLock for LoggingLock {
    fn acquire(&mut self) {
        tracing::debug!(lock = self.name, id = self.id, "Lock acquired");
    }

    fn release(&mut self) {
        tracing::debug!(lock = self.name, id = self.id, "Lock released");
    }

    fn id(&self) -> u64 {
        self.id
    }
}

impl LockProvider for LoggingLockProvider {
    fn create(&self) -> Box<dyn PlatformLock> {
        Box::new(LoggingLock {
            name: self.name,
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
        })
    }
}

#[derive(Default)]
struct CountState {
    count: usize,
    lock: Option<Box<dyn PlatformLock>>,
}

pub struct RefCountedLock {
    name: &'static str,
    provider: Box<dyn LockProvider>,
    state: Mutex<CountState>,
}

impl RefCountedLock {
    pub fn new(name: &'static str, provider: Box<dyn LockProvider>) -> Self {
        Self {
            name,
            provider,
            state: Mutex::new(CountState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, CountState> {
        // The state is two plain fields; a panic elsewhere cannot leave it
        // half-written.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self) {
        let mut state = self.state();
        if state.count == 0 {
            let mut lock = self.provider.create();
            lock.acquire();
            state.lock = Some(lock);
        }
        state.count += 1;
    }

    pub fn put(&self) {
        let mut state = self.state();
        if state.count == 0 {
            tracing::warn!(lock = self.name, "Lock released more often than acquired");
            return;
        }
        state.count -= 1;
        if state.count == 0 {
            if let Some(mut lock) = state.lock.take() {
                lock.release();
            }
        }
    }

    pub fn count(&self) -> usize {
        self.state().count
    }

    /// Identity of the currently held platform lock, if any.
    pub fn current_id(&self) -> Option<u64> {
        self.state().lock.as_ref().map(|l| l.id())
    }
}

/// Which locks a job holds while it runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LockKinds {
    pub wake: bool,
    pub network: bool,
}

impl LockKinds {
    pub const NONE: Self = Self {
        wake: false,
        network: false,
    };
    pub const ALL: Self = Self {
        wake: true,
        network: true,
    };
}

pub struct LockManager {
    wake: RefCountedLock,
    network: RefCountedLock,
}

impl LockManager {
    pub fn new(wake: Box<dyn LockProvider>, network: Box<dyn LockProvider>) -> Self {
        Self {
            wake: RefCountedLock::new("wake", wake),
            network: RefCountedLock::new("network", network),
        }
    }

    /// Manager whose locks only log.
    pub fn logging() -> Self {
        Self::new(
            Box::new(LoggingLockProvider::new("wake")),
            Box::new(LoggingLockProvider::new("network")),
        )
    }

    pub fn wake(&self) -> &RefCountedLock {
        &self.wake
    }

    pub fn network(&self) -> &RefCountedLock {
        &self.network
    }

    /// Takes the requested locks until the guard drops.
    pub fn acquire(self: &Arc<Self>, kinds: LockKinds) -> LockGuard {
        if kinds.wake {
            self.wake.get();
        }
        if kinds.network {
            self.network.get();
        }
        LockGuard {
            manager: Arc::clone(self),
            kinds,
        }
    }
}

/// Releases its locks on drop, unwinding included.
pub struct LockGuard {
    manager: Arc<LockManager>,
    kinds: LockKinds,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.kinds.network {
            self.manager.network.put();
        }
        if self.kinds.wake {
            self.manager.wake.put();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Counters {
        created: AtomicUsize,
        acquired: AtomicUsize,
        released: AtomicUsize,
    }

    struct CountingProvider(Arc<Counters>);

    struct CountingLock {
        id: u64,
        counters: Arc<Counters>,
    }

    impl PlatformLock for CountingLock {
        fn acquire(&mut self) {
            self.counters.acquired.fetch_add(1, Ordering::SeqCst);
        }
        fn release(&mut self) {
            self.counters.released.fetch_add(1, Ordering::SeqCst);
        }
        fn id(&self) -> u64 {
            self.id
        }
    }

    impl LockProvider for CountingProvider {
        fn create(&self) -> Box<dyn PlatformLock> {
            let id = self.0.created.fetch_add(1, Ordering::SeqCst) as u64;
            Box::new(CountingLock {
                id,
                counters: Arc::clone(&self.0),
            })
        }
    }

    #[test]
    fn test_n_gets_need_n_puts() {
        let counters = Arc::new(Counters::default());
        let lock = RefCountedLock::new("wake", Box::new(CountingProvider(Arc::clone(&counters))));

        for _ in 0..3 {
            lock.get();
        }
        assert_eq!(counters.acquired.load(Ordering::SeqCst), 1);

        lock.put();
        lock.put();
        assert_eq!(counters.released.load(Ordering::SeqCst), 0);
        assert_eq!(lock.count(), 1);

        lock.put();
        assert_eq!(counters.released.load(Ordering::SeqCst), 1);
        assert_eq!(lock.current_id(), None);
    }

    #[test]
    fn test_new_lock_object_after_full_cycle() {
        let counters = Arc::new(Counters::default());
        let lock = RefCountedLock::new("wake", Box::new(CountingProvider(Arc::clone(&counters))));

        lock.get();
        let first = lock.current_id();
        lock.put();
        lock.get();
        let second = lock.current_id();
        lock.put();

        assert!(first.is_some() && second.is_some());
        assert_ne!(first, second);
        assert_eq!(counters.created.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unbalanced_put_is_ignored() {
        let lock = RefCountedLock::new("network", Box::new(LoggingLockProvider::new("network")));
        lock.put();
        assert_eq!(lock.count(), 0);
    }

    #[test]
    fn test_guard_releases_on_drop_and_panic() {
        let manager = Arc::new(LockManager::logging());
        {
            let _a = manager.acquire(LockKinds::ALL);
            let _b = manager.acquire(LockKinds {
                wake: true,
                network: false,
            });
            assert_eq!(manager.wake().count(), 2);
            assert_eq!(manager.network().count(), 1);
        }
        assert_eq!(manager.wake().count(), 0);
        assert_eq!(manager.network().count(), 0);

        let m = Arc::clone(&manager);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _guard = m.acquire(LockKinds::ALL);
            panic!("job blew up");
        }));
        assert!(result.is_err());
        assert_eq!(manager.wake().count(), 0);
        assert_eq!(manager.network().count(), 0);
    }
}
