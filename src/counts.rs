//! Packed worker-thread accounting word
//!
//! This tracks the following information in one atomic word:
//!
//! - How many workers are currently running a dispatch loop (`processing`)
//! - How many worker OS threads exist (`existing`)
//! - The target concurrency chosen by the sizing controller (`goal`)
//!
//! Packing all three into one word lets multi-counter transitions (claiming a
//! processing slot while reserving a new OS thread, retiring a thread while
//! clamping the goal down) commit with a single compare-and-swap. The word is
//! never locked; callers run the usual unbounded CAS retry loop, which
//! terminates under finite contention.

use crossbeam::utils::CachePadded;
#[cfg(test)]
use proptest::prelude::*;
use std::sync::atomic::{AtomicU64, Ordering};

/// Packed thread accounting word
#[derive(Debug, Default)]
pub(crate) struct AtomicThreadCounts(CachePadded<AtomicU64>);
//
impl AtomicThreadCounts {
    /// Set up the accounting word for a pool whose initial goal is `goal`
    pub fn new(goal: u16) -> Self {
        Self(CachePadded::new(AtomicU64::new(
            ThreadCounts {
                processing: 0,
                existing: 0,
                goal,
            }
            .to_raw(),
        )))
    }

    /// Read out the current counts
    pub fn load(&self, order: Ordering) -> ThreadCounts {
        ThreadCounts::from_raw(self.0.load(order))
    }

    /// Attempt to replace the counts, assuming a certain initial state
    ///
    /// Thin wrapper over [`AtomicU64::compare_exchange_weak()`] with the same
    /// semantics: `Ok` on successful replacement, the updated counts on
    /// failure.
    pub fn try_update(
        &self,
        current: ThreadCounts,
        new: ThreadCounts,
        success: Ordering,
        failure: Ordering,
    ) -> Result<(), ThreadCounts> {
        new.debug_check_state();
        self.0
            .compare_exchange_weak(current.to_raw(), new.to_raw(), success, failure)
            .map(std::mem::drop)
            .map_err(ThreadCounts::from_raw)
    }

    /// Replace the goal field, leaving the other counters alone
    ///
    /// Returns the counts as they were just before the goal change. Must only
    /// be called while holding the thread-adjustment lock, which serializes
    /// all goal mutations.
    pub fn set_goal(&self, new_goal: u16) -> ThreadCounts {
        let mut counts = self.load(Ordering::Acquire);
        loop {
            let new = ThreadCounts {
                goal: new_goal,
                ..counts
            };
            match self.try_update(counts, new, Ordering::AcqRel, Ordering::Acquire) {
                Ok(()) => return counts,
                Err(updated) => counts = updated,
            }
        }
    }

    /// Release a processing slot, e.g. when a worker runs out of work
    pub fn decrement_processing(&self) -> ThreadCounts {
        let mut counts = self.load(Ordering::Acquire);
        loop {
            let new = ThreadCounts {
                processing: counts.processing - 1,
                ..counts
            };
            match self.try_update(counts, new, Ordering::AcqRel, Ordering::Acquire) {
                Ok(()) => return new,
                Err(updated) => counts = updated,
            }
        }
    }

    /// Roll back a reservation after OS thread creation fails, or account for
    /// a worker dying with a processing slot held
    ///
    /// Subtracts from both `existing` and `processing` so no partial state
    /// remains; the gate thread's starvation check will retry the spawn later.
    pub fn rollback_thread(&self, processing_held: bool) {
        let mut counts = self.load(Ordering::Acquire);
        loop {
            let new = ThreadCounts {
                processing: counts.processing - u16::from(processing_held),
                existing: counts.existing - 1,
                ..counts
            };
            match self.try_update(counts, new, Ordering::AcqRel, Ordering::Acquire) {
                Ok(()) => return,
                Err(updated) => counts = updated,
            }
        }
    }
}

/// Decoded thread accounting state
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub(crate) struct ThreadCounts {
    /// Workers currently running a dispatch loop
    pub processing: u16,

    /// Worker OS threads alive
    pub existing: u16,

    /// Target concurrency
    pub goal: u16,
}
//
impl ThreadCounts {
    /// Decode the raw state from the atomic word
    fn from_raw(raw: RawThreadCounts) -> Self {
        let result = Self {
            processing: (raw & FIELD_MASK) as u16,
            existing: ((raw >> EXISTING_SHIFT) & FIELD_MASK) as u16,
            goal: ((raw >> GOAL_SHIFT) & FIELD_MASK) as u16,
        };
        result.debug_check_state();
        result
    }

    /// Convert back to the raw atomic word
    fn to_raw(self) -> RawThreadCounts {
        self.debug_check_state();
        RawThreadCounts::from(self.processing)
            | (RawThreadCounts::from(self.existing) << EXISTING_SHIFT)
            | (RawThreadCounts::from(self.goal) << GOAL_SHIFT)
    }

    /// Check that the current counts make sense in debug builds
    fn debug_check_state(&self) {
        debug_assert!(
            self.processing <= self.existing,
            "a processing worker must be an existing worker ({self:?})"
        );
    }
}
//
#[cfg(test)]
impl Arbitrary for ThreadCounts {
    type Parameters = ();
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(_args: Self::Parameters) -> Self::Strategy {
        (any::<u16>(), any::<u16>())
            .prop_flat_map(|(existing, goal)| {
                (0..=existing).prop_map(move |processing| Self {
                    processing,
                    existing,
                    goal,
                })
            })
            .boxed()
    }
}

/// Inner atomic word data
type RawThreadCounts = u64;

/// Width mask of each packed counter
const FIELD_MASK: RawThreadCounts = (1 << 16) - 1;

/// Bit shift from the start of the word to the `existing` counter
const EXISTING_SHIFT: u32 = 16;

/// Bit shift from the start of the word to the `goal` counter
const GOAL_SHIFT: u32 = 32;

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn raw_roundtrip(counts: ThreadCounts) {
            prop_assert_eq!(ThreadCounts::from_raw(counts.to_raw()), counts);
        }

        #[test]
        fn load_returns_stored(counts: ThreadCounts) {
            let word = AtomicThreadCounts::new(0);
            word.0.store(counts.to_raw(), Ordering::Relaxed);
            prop_assert_eq!(word.load(Ordering::Relaxed), counts);
        }

        #[test]
        fn set_goal_only_touches_goal(counts: ThreadCounts, new_goal: u16) {
            let word = AtomicThreadCounts::new(0);
            word.0.store(counts.to_raw(), Ordering::Relaxed);
            let before = word.set_goal(new_goal);
            prop_assert_eq!(before, counts);
            let after = word.load(Ordering::Relaxed);
            prop_assert_eq!(after, ThreadCounts { goal: new_goal, ..counts });
        }
    }

    #[test]
    fn new_starts_empty() {
        let word = AtomicThreadCounts::new(7);
        assert_eq!(
            word.load(Ordering::Relaxed),
            ThreadCounts {
                processing: 0,
                existing: 0,
                goal: 7
            }
        );
    }

    #[test]
    fn try_update_detects_interference() {
        let word = AtomicThreadCounts::new(2);
        let seen = word.load(Ordering::Relaxed);
        let stale = ThreadCounts {
            processing: 1,
            existing: 1,
            goal: 2,
        };
        let target = ThreadCounts {
            processing: 1,
            existing: 2,
            goal: 2,
        };
        assert_eq!(
            word.try_update(stale, target, Ordering::AcqRel, Ordering::Acquire),
            Err(seen)
        );
        assert_eq!(word.load(Ordering::Relaxed), seen);
    }
}
