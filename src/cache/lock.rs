//! The lock guarding the LRU registry.
//!
//! The registry only ever touches its state through [`StateLock::with`], so
//! every critical section is a closure that cannot leak a guard or call out to
//! band code while the lock is held.

use parking_lot::lock_api::{self, GuardSend, RawMutex};
use parking_lot::{Mutex, ReentrantMutex};
use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use crate::config::LockStrategy;

/// A test-and-test-and-set spin lock.
pub(crate) struct RawSpinLock {
    locked: AtomicBool,
}

unsafe impl RawMutex for RawSpinLock {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = RawSpinLock { locked: AtomicBool::new(false) };

    type GuardMarker = GuardSend;

    fn lock(&self) {
        while !self.try_lock() {
            while self.locked.load(Ordering::Relaxed) {
                std::hint::spin_loop();
            }
        }
    }

    fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    unsafe fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

type SpinMutex<T> = lock_api::Mutex<RawSpinLock, T>;

enum Inner<T> {
    Adaptive(Mutex<T>),
    Recursive(ReentrantMutex<RefCell<T>>),
    Spin(SpinMutex<T>),
}

/// Hold-time tracing, only updated while the lock is held.
#[derive(Default)]
struct ContentionTrace {
    acquisitions: AtomicU64,
    contended: AtomicU64,
    max_hold_nanos: AtomicU64,
    total_hold_nanos: AtomicU64,
}

/// Snapshot of lock contention counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LockStats {
    /// Acquisitions traced so far.
    pub acquisitions: u64,
    /// Acquisitions that found the lock already held.
    pub contended: u64,
    /// Longest observed critical section, in nanoseconds.
    pub max_hold_nanos: u64,
    /// Sum of all traced critical sections, in nanoseconds.
    pub total_hold_nanos: u64,
}

pub(crate) struct StateLock<T> {
    inner: Inner<T>,
    debug_contention: bool,
    trace: ContentionTrace,
}

impl<T> StateLock<T> {
    pub(crate) fn new(strategy: LockStrategy, debug_contention: bool, value: T) -> Self {
        let inner = match strategy {
            LockStrategy::Adaptive => Inner::Adaptive(Mutex::new(value)),
            LockStrategy::Recursive => Inner::Recursive(ReentrantMutex::new(RefCell::new(value))),
            LockStrategy::Spin => Inner::Spin(SpinMutex::new(value)),
        };
        Self { inner, debug_contention, trace: ContentionTrace::default() }
    }

    pub(crate) fn strategy(&self) -> LockStrategy {
        match self.inner {
            Inner::Adaptive(_) => LockStrategy::Adaptive,
            Inner::Recursive(_) => LockStrategy::Recursive,
            Inner::Spin(_) => LockStrategy::Spin,
        }
    }

    /// Runs `f` with exclusive access to the guarded state.
    ///
    /// `f` must not call `with` on the same lock. Under
    /// [`LockStrategy::Recursive`] the nested call panics on the state borrow;
    /// the other strategies deadlock.
    pub(crate) fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        if self.debug_contention {
            return self.with_traced(f);
        }
        match &self.inner {
            Inner::Adaptive(m) => f(&mut m.lock()),
            Inner::Recursive(m) => {
                let guard = m.lock();
                let mut state = guard.borrow_mut();
                f(&mut state)
            }
            Inner::Spin(m) => f(&mut m.lock()),
        }
    }

    fn with_traced<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        match &self.inner {
            Inner::Adaptive(m) => {
                let mut guard = m.try_lock().unwrap_or_else(|| {
                    self.trace.contended.fetch_add(1, Ordering::Relaxed);
                    m.lock()
                });
                self.timed(|| f(&mut guard))
            }
            Inner::Recursive(m) => {
                let guard = m.try_lock().unwrap_or_else(|| {
                    self.trace.contended.fetch_add(1, Ordering::Relaxed);
                    m.lock()
                });
                let mut state = guard.borrow_mut();
                self.timed(|| f(&mut state))
            }
            Inner::Spin(m) => {
                let mut guard = m.try_lock().unwrap_or_else(|| {
                    self.trace.contended.fetch_add(1, Ordering::Relaxed);
                    m.lock()
                });
                self.timed(|| f(&mut guard))
            }
        }
    }

    fn timed<R>(&self, f: impl FnOnce() -> R) -> R {
        let start = Instant::now();
        let result = f();
        let held = u64::try_from(start.elapsed().as_nanos()).unwrap_or(u64::MAX);

        let iters = self.trace.acquisitions.fetch_add(1, Ordering::Relaxed) + 1;
        let total = self.trace.total_hold_nanos.fetch_add(held, Ordering::Relaxed) + held;
        let previous_max = self.trace.max_hold_nanos.fetch_max(held, Ordering::Relaxed);

        if held > previous_max || iters % 1_000_000 == 0 {
            log::debug!(
                "registry lock contention: max = {}ns, avg = {}ns over {} acquisitions",
                held.max(previous_max),
                total / iters,
                iters
            );
        }
        result
    }

    pub(crate) fn stats(&self) -> LockStats {
        LockStats {
            acquisitions: self.trace.acquisitions.load(Ordering::Relaxed),
            contended: self.trace.contended.load(Ordering::Relaxed),
            max_hold_nanos: self.trace.max_hold_nanos.load(Ordering::Relaxed),
            total_hold_nanos: self.trace.total_hold_nanos.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn reset_stats(&self) {
        self.trace.acquisitions.store(0, Ordering::Relaxed);
        self.trace.contended.store(0, Ordering::Relaxed);
        self.trace.max_hold_nanos.store(0, Ordering::Relaxed);
        self.trace.total_hold_nanos.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn hammer(strategy: LockStrategy, debug_contention: bool) {
        let lock = Arc::new(StateLock::new(strategy, debug_contention, 0u64));
        let mut handles = vec![];

        for _ in 0..4 {
            let lock_clone = Arc::clone(&lock);
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    lock_clone.with(|n| *n += 1);
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(lock.with(|n| *n), 4000);
        assert_eq!(lock.strategy(), strategy);
    }

    #[test]
    fn test_every_strategy_serializes() {
        for strategy in [LockStrategy::Adaptive, LockStrategy::Recursive, LockStrategy::Spin] {
            hammer(strategy, false);
        }
    }

    #[test]
    fn test_contention_trace_counts_acquisitions() {
        hammer(LockStrategy::Spin, true);

        let lock = StateLock::new(LockStrategy::Adaptive, true, ());
        lock.with(|_| ());
        lock.with(|_| ());
        assert_eq!(lock.stats().acquisitions, 2);

        lock.reset_stats();
        assert_eq!(lock.stats(), LockStats::default());
    }

    #[test]
    fn test_recursive_nesting_panics_and_unlocks() {
        let lock = StateLock::new(LockStrategy::Recursive, false, 1u32);
        let nested = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            lock.with(|_| lock.with(|n| *n))
        }));
        assert!(nested.is_err());

        let other = Arc::new(lock);
        let clone = Arc::clone(&other);
        let seen = thread::spawn(move || clone.with(|n| *n)).join().unwrap();
        assert_eq!(seen, 1);
    }

    #[test]
    fn test_untraced_lock_reports_nothing() {
        let lock = StateLock::new(LockStrategy::Recursive, false, 5u32);
        assert_eq!(lock.with(|n| *n * 2), 10);
        assert_eq!(lock.stats().acquisitions, 0);
    }
}
