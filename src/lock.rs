//! Low-level lock guarding multi-field state transitions
//!
//! The packed atomic words handle single-CAS transitions; everything that
//! couples several of them (goal changes together with controller state,
//! blocking-adjustment bookkeeping) goes through this lock. Waiters spin a
//! bounded, geometrically growing number of iterations before falling back to
//! a futex block.

use atomic_wait::{wait, wake_one};
use std::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicU32, Ordering},
};

/// Lock state: free for the taking
const UNLOCKED: u32 = 0;

/// Lock state: held, no waiter parked
const LOCKED: u32 = 1;

/// Lock state: held, at least one waiter parked on the futex
const CONTENDED: u32 = 2;

/// Spin iterations between two lock-state checks, doubled each round
const INITIAL_SPIN_ITERS: u32 = 1;

/// Total spin rounds before parking on the futex
const SPIN_ROUNDS: u32 = 6;

/// Mutual exclusion with spin-then-block waiting
#[derive(Debug, Default)]
pub(crate) struct LowLevelLock<T> {
    /// One of [`UNLOCKED`], [`LOCKED`], [`CONTENDED`]
    state: AtomicU32,

    /// Data guarded by the lock
    data: UnsafeCell<T>,
}
//
impl<T> LowLevelLock<T> {
    /// Set up the lock
    pub fn new(data: T) -> Self {
        Self {
            state: AtomicU32::new(UNLOCKED),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquire the lock, blocking until it is available
    pub fn lock(&self) -> LockGuard<'_, T> {
        // Uncontended fast path
        //
        // Acquire ordering pairs with the Release store in the guard's Drop so
        // the previous holder's writes are visible to us.
        if self
            .state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            self.lock_slow();
        }
        LockGuard(self)
    }

    /// Acquire the lock only if it is immediately available
    pub fn try_lock(&self) -> Option<LockGuard<'_, T>> {
        self.state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_unlocked| LockGuard(self))
    }

    /// Spin for a while, then park on the futex until the lock can be taken
    #[cold]
    fn lock_slow(&self) {
        // Spin as long as the lock looks uncontended, re-checking at
        // geometrically growing intervals
        let mut spin_iters = INITIAL_SPIN_ITERS;
        for _ in 0..SPIN_ROUNDS {
            if self.state.load(Ordering::Relaxed) == UNLOCKED
                && self
                    .state
                    .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                return;
            }
            for _ in 0..spin_iters {
                std::hint::spin_loop();
            }
            spin_iters = spin_iters.saturating_mul(2);
        }

        // Park until the holder releases, advertising our presence by keeping
        // the state at CONTENDED so the holder knows a wake-up is owed
        while self.state.swap(CONTENDED, Ordering::Acquire) != UNLOCKED {
            wait(&self.state, CONTENDED);
        }
    }
}
//
// SAFETY: The lock protocol hands out exclusive access to the data, so it can
//         be shared between threads whenever it could be sent to one
unsafe impl<T: Send> Send for LowLevelLock<T> {}
unsafe impl<T: Send> Sync for LowLevelLock<T> {}

/// Proof of [`LowLevelLock`] ownership, releasing the lock on `Drop`
#[derive(Debug)]
pub(crate) struct LockGuard<'lock, T>(&'lock LowLevelLock<T>);
//
impl<T> Deref for LockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: Holding the guard means holding the lock, which grants
        //         exclusive access to the data.
        unsafe { &*self.0.data.get() }
    }
}
//
impl<T> DerefMut for LockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: Holding the guard means holding the lock, which grants
        //         exclusive access to the data.
        unsafe { &mut *self.0.data.get() }
    }
}
//
impl<T> Drop for LockGuard<'_, T> {
    fn drop(&mut self) {
        // Release ordering publishes our writes to the next holder. A parked
        // waiter re-CASes the state to CONTENDED before sleeping again, so
        // waking one waiter is always enough.
        if self.0.state.swap(UNLOCKED, Ordering::Release) == CONTENDED {
            wake_one(&self.0.state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn guards_data() {
        let lock = LowLevelLock::new(41);
        *lock.lock() += 1;
        assert_eq!(*lock.lock(), 42);
    }

    #[test]
    fn try_lock_fails_while_held() {
        let lock = LowLevelLock::new(());
        let guard = lock.lock();
        assert!(lock.try_lock().is_none());
        drop(guard);
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn mutual_exclusion() {
        const THREADS: usize = 4;
        const INCREMENTS: usize = 10_000;

        let lock = Arc::new(LowLevelLock::new(0usize));
        let threads = (0..THREADS)
            .map(|_| {
                let lock = lock.clone();
                std::thread::spawn(move || {
                    for _ in 0..INCREMENTS {
                        *lock.lock() += 1;
                    }
                })
            })
            .collect::<Vec<_>>();
        for thread in threads {
            thread.join().unwrap();
        }
        assert_eq!(*lock.lock(), THREADS * INCREMENTS);
    }
}
