//! Counting semaphore used to park and dispense idle workers
//!
//! The semaphore keeps its entire bookkeeping in one packed atomic word and
//! prefers handing signals to the most recently active threads: releasers
//! first satisfy spinning waiters (which are the threads that parked last and
//! still have warm caches) and only post OS wake-ups for the remainder. The
//! parked path blocks on a `Condvar` because worker retirement needs a timed
//! wait, which the futex crate used elsewhere does not provide.
//!
//! Invariant: the number of OS wake-ups posted never exceeds the number of
//! successful waits attributable to them, so no wake-up is lost and no parked
//! waiter is woken twice for one signal.

use crossbeam::utils::CachePadded;
#[cfg(test)]
use proptest::prelude::*;
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Condvar, Mutex,
    },
    time::{Duration, Instant},
};

/// Counting semaphore that wakes recently-parked waiters first
#[derive(Debug)]
pub(crate) struct LifoSemaphore {
    /// Packed counts word
    counts: CachePadded<AtomicU64>,

    /// Spin rounds performed before parking, when spinning is allowed
    spin_count: u32,

    /// Bound on concurrently spinning waiters
    max_spinners: u8,

    /// OS blocking primitive for the parked path
    parked: ParkedWaiters,
}
//
impl LifoSemaphore {
    /// Set up a semaphore with no pending signals
    pub fn new(spin_count: u32, max_spinners: usize) -> Self {
        Self {
            counts: CachePadded::new(AtomicU64::new(SemaphoreCounts::default().to_raw())),
            spin_count,
            max_spinners: max_spinners.min(usize::from(u8::MAX)) as u8,
            parked: ParkedWaiters::default(),
        }
    }

    /// Wait for a signal, spinning first if allowed
    ///
    /// Returns true if a signal was acquired, false if the timeout elapsed
    /// first. Spurious OS wake-ups are re-validated internally and never
    /// produce a spurious success.
    pub fn wait(&self, timeout: Duration, allow_spin: bool) -> bool {
        let spin_count = if allow_spin { self.spin_count } else { 0 };

        // Acquire a signal if one is pending, otherwise register either as a
        // spinner or as a parked waiter
        let mut counts = self.load(Ordering::Acquire);
        loop {
            let mut new = counts;
            let mut spinning = false;
            if counts.signal > 0 {
                new.signal -= 1;
            } else if timeout.is_zero() {
                return false;
            } else if spin_count > 0 && counts.spinners < self.max_spinners {
                new.spinners += 1;
                spinning = true;
            } else {
                new.waiters += 1;
            }
            match self.try_update(counts, new) {
                Ok(()) => {
                    if counts.signal > 0 {
                        return true;
                    }
                    if !spinning {
                        return self.wait_for_signal(timeout);
                    }
                    break;
                }
                Err(updated) => counts = updated,
            }
        }

        // Spin a bounded, geometrically growing number of iterations while
        // re-checking the signal count
        let mut spin_iters = 1u32;
        for _ in 0..spin_count {
            for _ in 0..spin_iters {
                std::hint::spin_loop();
            }
            spin_iters = (spin_iters * 2).min(MAX_SPIN_ITERS_PER_CHECK);
            counts = self.load(Ordering::Acquire);
            while counts.signal > 0 {
                let mut new = counts;
                new.signal -= 1;
                new.spinners -= 1;
                match self.try_update(counts, new) {
                    Ok(()) => return true,
                    Err(updated) => counts = updated,
                }
            }
        }

        // Spinning did not pay off: deregister as a spinner, grabbing a signal
        // if one appeared in the meantime, otherwise becoming a parked waiter
        counts = self.load(Ordering::Acquire);
        loop {
            let mut new = counts;
            new.spinners -= 1;
            if counts.signal > 0 {
                new.signal -= 1;
            } else {
                new.waiters += 1;
            }
            match self.try_update(counts, new) {
                Ok(()) => {
                    return counts.signal > 0 || self.wait_for_signal(timeout);
                }
                Err(updated) => counts = updated,
            }
        }
    }

    /// Make `count` signals available, waking parked waiters as needed
    pub fn release(&self, count: u32) {
        debug_assert!(count > 0);
        let mut counts = self.load(Ordering::Acquire);
        loop {
            let mut new = counts;
            new.signal += count;

            // Waiters that deserve an OS wake-up: signals that spinners and
            // already-posted wake-ups won't consume
            let max_consumers = u64::from(counts.waiters) + u64::from(counts.spinners);
            let to_wake = (u64::from(new.signal).min(max_consumers) as i64
                - i64::from(counts.spinners)
                - i64::from(counts.signaled_to_wake))
            .clamp(0, i64::from(count)) as u32;
            if to_wake > 0 {
                // The in-flight counter saturates; extra wake-ups then show up
                // as spurious OS wakes, which the wait path re-validates
                new.signaled_to_wake = new
                    .signaled_to_wake
                    .saturating_add(to_wake.min(u32::from(u8::MAX)) as u8);
            }
            match self.try_update(counts, new) {
                Ok(()) => {
                    if to_wake > 0 {
                        self.parked.release(to_wake);
                    }
                    return;
                }
                Err(updated) => counts = updated,
            }
        }
    }

    /// Park on the OS primitive until a signal can be acquired or the timeout
    /// elapses
    fn wait_for_signal(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.parked.wait_until(deadline) {
                // Timed out: deregister as a waiter. A wake-up posted for us
                // in the meantime will surface as a spurious wake elsewhere.
                let mut counts = self.load(Ordering::Acquire);
                loop {
                    let mut new = counts;
                    new.waiters -= 1;
                    match self.try_update(counts, new) {
                        Ok(()) => return false,
                        Err(updated) => counts = updated,
                    }
                }
            }

            // Account for the wake-up we consumed, and take a signal with it
            // if one is still available
            let mut counts = self.load(Ordering::Acquire);
            loop {
                let mut new = counts;
                if counts.signal > 0 {
                    new.signal -= 1;
                    new.waiters -= 1;
                }
                if counts.signaled_to_wake > 0 {
                    new.signaled_to_wake -= 1;
                }
                if new == counts {
                    // Spurious wake with nothing to account for
                    break;
                }
                match self.try_update(counts, new) {
                    Ok(()) => break,
                    Err(updated) => counts = updated,
                }
            }
            if counts.signal > 0 {
                return true;
            }
        }
    }

    /// Read out the current counts
    fn load(&self, order: Ordering) -> SemaphoreCounts {
        SemaphoreCounts::from_raw(self.counts.load(order))
    }

    /// Attempt to replace the counts, assuming a certain initial state
    fn try_update(
        &self,
        current: SemaphoreCounts,
        new: SemaphoreCounts,
    ) -> Result<(), SemaphoreCounts> {
        self.counts
            .compare_exchange_weak(
                current.to_raw(),
                new.to_raw(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(std::mem::drop)
            .map_err(SemaphoreCounts::from_raw)
    }
}

/// Decoded semaphore state
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
struct SemaphoreCounts {
    /// Signals released but not yet acquired
    signal: u32,

    /// Threads parked on the OS primitive
    waiters: u16,

    /// Threads spinning before parking
    spinners: u8,

    /// OS wake-ups posted but not yet consumed by a parked waiter
    signaled_to_wake: u8,
}
//
impl SemaphoreCounts {
    /// Decode the raw state from the atomic word
    fn from_raw(raw: RawSemaphoreCounts) -> Self {
        Self {
            signal: (raw & SIGNAL_MASK) as u32,
            waiters: ((raw >> WAITERS_SHIFT) & WAITERS_MASK) as u16,
            spinners: ((raw >> SPINNERS_SHIFT) & BYTE_MASK) as u8,
            signaled_to_wake: ((raw >> SIGNALED_SHIFT) & BYTE_MASK) as u8,
        }
    }

    /// Convert back to the raw atomic word
    fn to_raw(self) -> RawSemaphoreCounts {
        RawSemaphoreCounts::from(self.signal)
            | (RawSemaphoreCounts::from(self.waiters) << WAITERS_SHIFT)
            | (RawSemaphoreCounts::from(self.spinners) << SPINNERS_SHIFT)
            | (RawSemaphoreCounts::from(self.signaled_to_wake) << SIGNALED_SHIFT)
    }
}
//
#[cfg(test)]
impl Arbitrary for SemaphoreCounts {
    type Parameters = ();
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(_args: Self::Parameters) -> Self::Strategy {
        (any::<u32>(), any::<u16>(), any::<u8>())
            .prop_flat_map(|(signal, waiters, spinners)| {
                let max_signaled =
                    (u32::from(waiters) + u32::from(spinners)).min(u32::from(u8::MAX)) as u8;
                (0..=max_signaled).prop_map(move |signaled_to_wake| Self {
                    signal,
                    waiters,
                    spinners,
                    signaled_to_wake,
                })
            })
            .boxed()
    }
}

/// Inner atomic word data
type RawSemaphoreCounts = u64;

/// Mask of the signal count at the start of the word
const SIGNAL_MASK: RawSemaphoreCounts = (1 << 32) - 1;

/// Bit shift from the start of the word to the waiter count
const WAITERS_SHIFT: u32 = 32;

/// Width mask of the waiter count
const WAITERS_MASK: RawSemaphoreCounts = (1 << 16) - 1;

/// Bit shift from the start of the word to the spinner count
const SPINNERS_SHIFT: u32 = 48;

/// Bit shift from the start of the word to the in-flight wake-up count
const SIGNALED_SHIFT: u32 = 56;

/// Width mask of the two byte-sized counters
const BYTE_MASK: RawSemaphoreCounts = (1 << 8) - 1;

/// Spin-iteration growth cap between two signal-count checks
const MAX_SPIN_ITERS_PER_CHECK: u32 = 64;

/// Wake-up tokens for parked waiters
///
/// A plain counting semaphore over `Mutex`/`Condvar`; the interesting
/// accounting lives in [`LifoSemaphore`], this only provides timed blocking.
#[derive(Debug, Default)]
struct ParkedWaiters {
    /// Wake-up tokens not yet consumed
    tokens: Mutex<u32>,

    /// Signaled when tokens become available
    available: Condvar,
}
//
impl ParkedWaiters {
    /// Consume one token, waiting until `deadline` for one to appear
    fn wait_until(&self, deadline: Instant) -> bool {
        let mut tokens = self
            .tokens
            .lock()
            .expect("a panic while holding the park lock is a bug");
        loop {
            if *tokens > 0 {
                *tokens -= 1;
                return true;
            }
            let Some(remaining) = deadline.checked_duration_since(Instant::now()).filter(|d| !d.is_zero()) else {
                return false;
            };
            (tokens, _) = self
                .available
                .wait_timeout(tokens, remaining)
                .expect("a panic while holding the park lock is a bug");
        }
    }

    /// Post `count` tokens
    fn release(&self, count: u32) {
        let mut tokens = self
            .tokens
            .lock()
            .expect("a panic while holding the park lock is a bug");
        *tokens += count;
        if count == 1 {
            self.available.notify_one();
        } else {
            self.available.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{atomic::AtomicU32, Arc};

    proptest! {
        #[test]
        fn raw_roundtrip(counts: SemaphoreCounts) {
            prop_assert_eq!(SemaphoreCounts::from_raw(counts.to_raw()), counts);
        }
    }

    #[test]
    fn zero_timeout_fails_without_signal() {
        let semaphore = LifoSemaphore::new(0, 0);
        assert!(!semaphore.wait(Duration::ZERO, false));
    }

    #[test]
    fn release_then_wait() {
        let semaphore = LifoSemaphore::new(0, 0);
        semaphore.release(1);
        assert!(semaphore.wait(Duration::ZERO, false));
        assert!(!semaphore.wait(Duration::ZERO, false));
    }

    #[test]
    fn timed_wait_expires() {
        let semaphore = LifoSemaphore::new(0, 0);
        assert!(!semaphore.wait(Duration::from_millis(50), false));
        // The waiter registration must have been rolled back
        semaphore.release(1);
        assert!(semaphore.wait(Duration::ZERO, false));
    }

    #[test]
    fn wakes_parked_waiter() {
        let semaphore = Arc::new(LifoSemaphore::new(70, 2));
        let waiter = {
            let semaphore = semaphore.clone();
            std::thread::spawn(move || semaphore.wait(Duration::from_secs(10), true))
        };
        std::thread::sleep(Duration::from_millis(50));
        semaphore.release(1);
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn successful_waits_never_exceed_released_signals() {
        const WAITERS: usize = 8;
        const RELEASED: u32 = 5;

        let semaphore = Arc::new(LifoSemaphore::new(70, 4));
        let successes = Arc::new(AtomicU32::new(0));
        let threads = (0..WAITERS)
            .map(|_| {
                let semaphore = semaphore.clone();
                let successes = successes.clone();
                std::thread::spawn(move || {
                    if semaphore.wait(Duration::from_millis(500), true) {
                        successes.fetch_add(1, Ordering::Relaxed);
                    }
                })
            })
            .collect::<Vec<_>>();
        std::thread::sleep(Duration::from_millis(50));
        semaphore.release(RELEASED);
        for thread in threads {
            thread.join().unwrap();
        }
        assert_eq!(successes.load(Ordering::Relaxed), RELEASED);
    }
}
