//! Cooperative blocking compensation
//!
//! A worker about to block in a callback says so, and the pool temporarily
//! raises its thread-count goal so throughput does not stall behind the
//! blocked thread. Growth is immediate up to a configured allowance, then
//! rate-limited in delay steps, and always capped by the memory budget;
//! shrinking after unblock only ever takes back threads that were added for
//! blocking in the first place.

use crate::{
    config::BlockingConfig,
    gate,
    hill_climbing::Transition,
    pool::{Adjustments, PoolShared},
    worker,
};
use std::sync::{atomic::Ordering, Arc};

/// Blocking-adjustment work the gate thread owes the pool
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum PendingAdjustment {
    /// Nothing to do
    None,

    /// The goal should shrink; no reason to wait
    Immediate,

    /// The goal should grow, honoring the step delays
    DelayedIfNecessary,
}
//
impl PendingAdjustment {
    /// Decode from the atomic mirror
    pub(crate) fn from_raw(raw: u8) -> Self {
        match raw {
            RAW_PENDING_NONE => Self::None,
            RAW_PENDING_IMMEDIATE => Self::Immediate,
            _ => Self::DelayedIfNecessary,
        }
    }

    /// Encode for the atomic mirror
    pub(crate) fn to_raw(self) -> u8 {
        match self {
            Self::None => RAW_PENDING_NONE,
            Self::Immediate => RAW_PENDING_IMMEDIATE,
            Self::DelayedIfNecessary => RAW_PENDING_DELAYED,
        }
    }
}

/// Raw encoding of [`PendingAdjustment::None`]
const RAW_PENDING_NONE: u8 = 0;

/// Raw encoding of [`PendingAdjustment::Immediate`]
const RAW_PENDING_IMMEDIATE: u8 = 1;

/// Raw encoding of [`PendingAdjustment::DelayedIfNecessary`]
const RAW_PENDING_DELAYED: u8 = 2;

/// Blocked-worker bookkeeping, guarded by the adjustment lock
#[derive(Debug, Default)]
pub(crate) struct BlockingState {
    /// Workers currently blocked in a callback
    pub(crate) num_blocked_threads: u32,

    /// Goal increments attributable to blocking, the only ones an unblock
    /// may take back
    pub(crate) num_threads_added_due_to_blocking: u16,
}

impl PoolShared {
    /// The pending-adjustment state, readable without the adjustment lock
    pub(crate) fn pending_adjustment(&self) -> PendingAdjustment {
        PendingAdjustment::from_raw(self.pending_blocking_adjustment.load(Ordering::Acquire))
    }

    /// Publish a new pending-adjustment state (adjustment lock held)
    pub(crate) fn set_pending_adjustment(&self, pending: PendingAdjustment) {
        self.pending_blocking_adjustment
            .store(pending.to_raw(), Ordering::Release);
    }

    /// The goal that blocked workers currently justify
    pub(crate) fn target_threads_goal_for_blocking(&self, blocking: &BlockingState) -> u16 {
        let min_threads = self.min_threads();
        if blocking.num_blocked_threads == 0 {
            min_threads
        } else {
            (u32::from(min_threads) + blocking.num_blocked_threads)
                .min(u32::from(self.max_threads())) as u16
        }
    }

    /// Lower clamp for the sizing controller
    ///
    /// While workers are blocked, the controller must not undercut the
    /// compensated goal.
    pub(crate) fn min_threads_goal(&self, blocking: &BlockingState) -> u16 {
        self.counts
            .load(Ordering::Acquire)
            .goal
            .min(self.target_threads_goal_for_blocking(blocking))
    }
}

/// Record that a pool worker is about to block, scheduling compensation if
/// the goal no longer covers the blocked threads
pub(crate) fn notify_blocking_begin(shared: &Arc<PoolShared>) {
    {
        let mut adjustments = shared.adjustment.lock();
        adjustments.blocking.num_blocked_threads += 1;
        let target = shared.target_threads_goal_for_blocking(&adjustments.blocking);
        if shared.pending_adjustment() == PendingAdjustment::None
            && shared.counts.load(Ordering::Acquire).goal < target
        {
            shared.set_pending_adjustment(PendingAdjustment::DelayedIfNecessary);
        }
    }
    gate::wake_and_ensure_running(shared);
}

/// Record that a pool worker stopped blocking, scheduling a prompt shrink if
/// compensation threads are no longer justified
pub(crate) fn notify_blocking_end(shared: &Arc<PoolShared>) {
    {
        let mut adjustments = shared.adjustment.lock();
        debug_assert!(
            adjustments.blocking.num_blocked_threads > 0,
            "unbalanced blocking notification"
        );
        adjustments.blocking.num_blocked_threads =
            adjustments.blocking.num_blocked_threads.saturating_sub(1);
        let target = shared.target_threads_goal_for_blocking(&adjustments.blocking);
        if shared.pending_adjustment() != PendingAdjustment::Immediate
            && adjustments.blocking.num_threads_added_due_to_blocking > 0
            && shared.counts.load(Ordering::Acquire).goal > target
        {
            shared.set_pending_adjustment(PendingAdjustment::Immediate);
        }
    }
    gate::wake_and_ensure_running(shared);
}

/// Move the goal toward the blocking-adjusted target
///
/// Invoked by the gate thread. Returns the delay in milliseconds after which
/// the gate should check again, 0 when the adjustment has settled.
pub(crate) fn perform_blocking_adjustment(
    shared: &Arc<PoolShared>,
    previous_delay_elapsed: bool,
) -> u32 {
    let mut add_worker = false;
    let next_delay_ms = {
        let mut adjustments = shared.adjustment.lock();
        perform_locked(
            shared,
            &mut adjustments,
            previous_delay_elapsed,
            &mut add_worker,
        )
    };
    if add_worker {
        worker::maybe_add_working_worker(shared);
    }
    next_delay_ms
}

/// [`perform_blocking_adjustment()`] body, with the adjustment lock held
fn perform_locked(
    shared: &Arc<PoolShared>,
    adjustments: &mut Adjustments,
    previous_delay_elapsed: bool,
    add_worker: &mut bool,
) -> u32 {
    shared.set_pending_adjustment(PendingAdjustment::None);
    let config = &shared.config.blocking;
    let target = shared.target_threads_goal_for_blocking(&adjustments.blocking);
    let counts = shared.counts.load(Ordering::Acquire);
    let goal = counts.goal;
    if goal == target {
        return 0;
    }

    if goal > target {
        // Shrink, but never cannibalize threads that exist for other reasons
        if adjustments.blocking.num_threads_added_due_to_blocking == 0 {
            return 0;
        }
        let to_subtract =
            (goal - target).min(adjustments.blocking.num_threads_added_due_to_blocking);
        adjustments.blocking.num_threads_added_due_to_blocking -= to_subtract;
        let new_goal = goal - to_subtract;
        shared.counts.set_goal(new_goal);
        adjustments
            .hill
            .force_change(new_goal, Transition::CooperativeBlocking);
        return 0;
    }

    // Grow: the first increments are delay-free, up to the configured
    // allowance or the number of threads that already exist
    let max_threads = shared.max_threads();
    let configured_without_delay = (usize::from(shared.min_threads())
        + config.threads_to_add_without_delay)
        .min(usize::from(max_threads)) as u16;
    let without_delay_cap = configured_without_delay.max(counts.existing.min(max_threads));
    let target_without_delay = target.min(without_delay_cap);
    let proposed = if goal < target_without_delay {
        Some(target_without_delay)
    } else if previous_delay_elapsed {
        Some(goal + 1)
    } else {
        None
    };
    if let Some(proposed_goal) = proposed {
        let new_goal = cap_goal_by_memory(shared, config, proposed_goal, counts.existing);
        if new_goal <= goal {
            // Memory pressure forbids any growth right now; the next blocking
            // notification or housekeeping refresh will revisit
            return 0;
        }
        adjustments.blocking.num_threads_added_due_to_blocking += new_goal - goal;
        let before = shared.counts.set_goal(new_goal);
        adjustments
            .hill
            .force_change(new_goal, Transition::CooperativeBlocking);
        if before.processing >= goal
            && shared.num_requested_workers.load(Ordering::Acquire) > 0
        {
            *add_worker = true;
        }
        if new_goal >= target {
            return 0;
        }
    }

    // More growth is owed but rate-limited; tell the gate when to come back
    shared.set_pending_adjustment(PendingAdjustment::DelayedIfNecessary);
    let steps = 1
        + u32::from(adjustments.blocking.num_threads_added_due_to_blocking)
            / config.threads_per_delay_step.max(1) as u32;
    (steps * config.delay_step_ms).min(config.max_delay_ms)
}

/// Bound a proposed goal so new threads cannot push memory usage over the
/// configured fraction of the budget
fn cap_goal_by_memory(
    shared: &PoolShared,
    config: &BlockingConfig,
    proposed_goal: u16,
    existing: u16,
) -> u16 {
    if proposed_goal <= existing {
        return proposed_goal;
    }
    let limit = shared.memory_limit_bytes.load(Ordering::Relaxed);
    if limit == 0 {
        return proposed_goal;
    }
    let budget = (limit as f64 * config.high_memory_fraction) as u64;
    let usage = shared.memory_usage_bytes.load(Ordering::Relaxed);
    let headroom_threads = (budget.saturating_sub(usage)
        / config.estimated_thread_memory_bytes.max(1))
    .min(u64::from(u16::MAX)) as u16;
    proposed_goal.min(existing.saturating_add(headroom_threads))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{MemoryUsage, MemoryUsageSource, ThreadPoolConfig},
        ThreadPool,
    };

    fn pool(min: usize, max: usize) -> ThreadPool {
        ThreadPool::with_config(ThreadPoolConfig {
            min_threads: min,
            max_threads: max,
            ..Default::default()
        })
        .unwrap()
    }

    /// Drive the adjustment loop the way the gate thread would, without the
    /// gate thread's timing
    fn settle(shared: &Arc<PoolShared>) {
        for _ in 0..64 {
            if perform_blocking_adjustment(shared, true) == 0 {
                return;
            }
        }
        panic!("blocking adjustment never settled");
    }

    #[test]
    fn blocked_threads_raise_the_goal_to_the_effective_target() {
        let pool = pool(2, 10);
        for _ in 0..3 {
            notify_blocking_begin(&pool.shared);
        }
        settle(&pool.shared);
        assert_eq!(pool.shared.counts.load(Ordering::Relaxed).goal, 5);

        // Blocked threads beyond the maximum cannot be compensated
        for _ in 0..20 {
            notify_blocking_begin(&pool.shared);
        }
        settle(&pool.shared);
        assert_eq!(pool.shared.counts.load(Ordering::Relaxed).goal, 10);

        for _ in 0..23 {
            notify_blocking_end(&pool.shared);
        }
        settle(&pool.shared);
        assert_eq!(pool.shared.counts.load(Ordering::Relaxed).goal, 2);
    }

    #[test]
    fn unblock_decays_back_to_the_baseline() {
        let pool = pool(1, 8);
        for _ in 0..4 {
            notify_blocking_begin(&pool.shared);
        }
        settle(&pool.shared);
        assert_eq!(pool.shared.counts.load(Ordering::Relaxed).goal, 5);
        for _ in 0..4 {
            notify_blocking_end(&pool.shared);
        }
        settle(&pool.shared);
        assert!(pool.shared.counts.load(Ordering::Relaxed).goal <= 1);
    }

    #[test]
    fn shrink_never_cannibalizes_foreign_goal_increments() {
        let pool = pool(2, 10);
        // Raise the goal for a non-blocking reason
        pool.shared.counts.set_goal(6);
        {
            let mut adjustments = pool.shared.adjustment.lock();
            adjustments
                .hill
                .force_change(6, Transition::ConfigurationChange);
        }
        notify_blocking_begin(&pool.shared);
        notify_blocking_end(&pool.shared);
        settle(&pool.shared);
        // No threads were added for blocking, so nothing may be taken away
        assert_eq!(pool.shared.counts.load(Ordering::Relaxed).goal, 6);
    }

    /// Memory pressure must stop compensation from growing the pool
    #[test]
    fn memory_budget_caps_compensation() {
        struct TightMemory;
        impl MemoryUsageSource for TightMemory {
            fn usage(&self) -> MemoryUsage {
                MemoryUsage {
                    current_bytes: 1_000_000,
                    high_watermark_bytes: 1_000_000,
                }
            }
        }
        let pool = ThreadPool::with_config(ThreadPoolConfig {
            min_threads: 1,
            max_threads: 16,
            memory_usage: Arc::new(TightMemory),
            ..Default::default()
        })
        .unwrap();
        for _ in 0..8 {
            notify_blocking_begin(&pool.shared);
        }
        settle(&pool.shared);
        // existing is 0 and the budget is exhausted: no growth possible
        assert_eq!(pool.shared.counts.load(Ordering::Relaxed).goal, 1);
    }
}
