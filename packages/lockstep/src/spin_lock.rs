use std::hint;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::lock_api::{self, GuardSend, RawMutex};

/// A mutual exclusion primitive that busy-waits instead of blocking.
///
/// This is only appropriate for very short critical sections, where the lock holder is expected
/// to release the lock faster than a thread could be put to sleep and woken up again. There is no
/// fairness guarantee and the lock is not re-entrant: calling [`lock()`][Self::lock] again from
/// the thread that holds the lock spins forever.
///
/// The raw lock does not own any data. To guard a value, use [`SpinMutex`], which is built on
/// this type through [`lock_api`]. Because `SpinLock` implements [`RawMutex`], code written
/// against `lock_api::Mutex<R, T>` can switch to a blocking mutex such as
/// [`parking_lot::RawMutex`] if contention turns out to be a problem.
///
/// # Example
///
/// ```rust
/// use lockstep::SpinLock;
///
/// let lock = SpinLock::new();
///
/// lock.lock();
/// assert!(lock.is_locked());
/// assert!(!lock.try_lock());
/// lock.unlock();
///
/// assert!(!lock.is_locked());
/// ```
#[derive(Debug, Default)]
pub struct SpinLock {
    locked: AtomicBool,
}

impl SpinLock {
    /// Creates a new lock in the unlocked state.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    /// Acquires the lock, spinning until it becomes available.
    #[inline]
    pub fn lock(&self) {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            // Wait for the holder to let go before retrying the exchange, so contending threads
            // spin on a shared cache line instead of bouncing it between processors.
            while self.locked.load(Ordering::Relaxed) {
                hint::spin_loop();
            }
        }
    }

    /// Attempts to acquire the lock once, without spinning.
    ///
    /// Returns `true` if the lock was acquired.
    #[inline]
    #[must_use = "the lock is only held if this returns true"]
    pub fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Releases the lock.
    ///
    /// This must only be called after a successful [`lock()`][Self::lock] or
    /// [`try_lock()`][Self::try_lock]. Unlocking a lock held by someone else silently breaks
    /// mutual exclusion for them.
    #[inline]
    pub fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }

    /// Whether the lock is currently held.
    ///
    /// The answer may be stale by the time it is returned. Use it for diagnostics only; checking
    /// this before calling [`lock()`][Self::lock] does not make the subsequent call any safer.
    #[inline]
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }
}

// SAFETY: The lock hands out exclusive access: the flag can only move from unlocked to locked
// through a successful compare-exchange, and `unlock` is only called by the `lock_api` guard that
// observed that success.
unsafe impl RawMutex for SpinLock {
    #[allow(
        clippy::declare_interior_mutable_const,
        reason = "required by lock_api; each use creates a fresh lock"
    )]
    const INIT: Self = Self::new();

    // Nothing ties the lock to the thread that acquired it.
    type GuardMarker = GuardSend;

    #[inline]
    fn lock(&self) {
        Self::lock(self);
    }

    #[inline]
    fn try_lock(&self) -> bool {
        Self::try_lock(self)
    }

    #[inline]
    unsafe fn unlock(&self) {
        Self::unlock(self);
    }

    #[inline]
    fn is_locked(&self) -> bool {
        Self::is_locked(self)
    }
}

/// A value guarded by a [`SpinLock`].
///
/// # Example
///
/// ```rust
/// use lockstep::SpinMutex;
///
/// let total = SpinMutex::new(0_u64);
///
/// *total.lock() += 5;
///
/// assert_eq!(*total.lock(), 5);
/// ```
pub type SpinMutex<T> = lock_api::Mutex<SpinLock, T>;

/// RAII guard returned by [`SpinMutex::lock()`]. The lock is released when the guard is dropped.
pub type SpinMutexGuard<'a, T> = lock_api::MutexGuard<'a, SpinLock, T>;

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::thread;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(SpinLock: Send, Sync);
    assert_impl_all!(SpinMutex<Vec<u8>>: Send, Sync);

    #[test]
    fn lock_unlock_leaves_lock_released() {
        let lock = SpinLock::new();

        lock.lock();
        assert!(lock.is_locked());

        lock.unlock();
        assert!(!lock.is_locked());
    }

    #[test]
    fn try_lock_fails_while_held() {
        let lock = SpinLock::new();

        assert!(lock.try_lock());
        assert!(!lock.try_lock());

        lock.unlock();
        assert!(lock.try_lock());
        lock.unlock();
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn try_lock_from_other_thread_fails_without_blocking() {
        let lock = Arc::new(SpinLock::new());
        lock.lock();

        let (tx, rx) = mpsc::channel();

        thread::spawn({
            let lock = Arc::clone(&lock);
            move || tx.send(lock.try_lock()).unwrap()
        })
        .join()
        .unwrap();

        assert!(!rx.recv().unwrap());

        lock.unlock();
        assert!(!lock.is_locked());
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn raw_lock_provides_mutual_exclusion() {
        const THREADS: usize = 8;
        const ITERATIONS: usize = 1000;

        let lock = Arc::new(SpinLock::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let entries = Arc::new(AtomicUsize::new(0));

        let handles = (0..THREADS)
            .map(|_| {
                let lock = Arc::clone(&lock);
                let inside = Arc::clone(&inside);
                let entries = Arc::clone(&entries);

                thread::spawn(move || {
                    for _ in 0..ITERATIONS {
                        lock.lock();
                        assert_eq!(inside.fetch_add(1, Ordering::Relaxed), 0);
                        entries.fetch_add(1, Ordering::Relaxed);
                        inside.fetch_sub(1, Ordering::Relaxed);
                        lock.unlock();
                    }
                })
            })
            .collect::<Vec<_>>();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(entries.load(Ordering::Relaxed), THREADS * ITERATIONS);
        assert!(!lock.is_locked());
    }

    #[test]
    fn mutex_guard_releases_on_drop() {
        let m = SpinMutex::new(0);

        {
            let mut g = m.lock();
            *g += 1;
            assert!(m.is_locked());
        }

        assert!(!m.is_locked());
        assert_eq!(*m.lock(), 1);
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn mutex_contention() {
        let m = Arc::new(SpinMutex::new(0));

        let handles = (0..10)
            .map(|_| {
                let m = Arc::clone(&m);
                thread::spawn(move || {
                    for _ in 0..100 {
                        *m.lock() += 1;
                    }
                })
            })
            .collect::<Vec<_>>();

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(*m.lock(), 1000);
    }

    fn push_twice<R: RawMutex>(m: &lock_api::Mutex<R, Vec<u32>>) {
        m.lock().push(1);
        m.lock().push(2);
    }

    #[test]
    fn call_sites_accept_blocking_mutex_substitute() {
        let spinning = SpinMutex::new(Vec::new());
        let blocking = parking_lot::Mutex::new(Vec::new());

        push_twice(&spinning);
        push_twice(&blocking);

        assert_eq!(*spinning.lock(), *blocking.lock());
    }
}
