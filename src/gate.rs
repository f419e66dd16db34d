//! Gate thread: starvation watchdog and periodic housekeeping
//!
//! One background thread per pool, lazily spawned on the first work request
//! and retired again after a few idle cycles. Each wake-up it applies any
//! pending blocking adjustment, and once per gate period it samples the
//! external CPU/memory signals and checks for starvation: work has been
//! requested but no dequeue has happened for longer than a utilization-scaled
//! threshold, in which case it force-raises the goal around the sizing
//! controller's smoothing.

use crate::{
    blocking::{self, PendingAdjustment},
    counts::ThreadCounts,
    hill_climbing::Transition,
    pool::PoolShared,
    worker,
};
use log::{trace, warn};
use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Condvar, Mutex,
    },
    time::{Duration, Instant},
};

/// Run-state encoding of "no gate thread alive"
const NOT_RUNNING: u32 = 0;

/// Run-state bit set while a gate thread is alive; the low byte counts the
/// idle cycles it still owes before retiring
const RUNNING_BIT: u32 = 0x100;

/// Encode a run state with `pending_runs` idle cycles left
fn running_state(pending_runs: u32) -> u32 {
    debug_assert!(pending_runs < RUNNING_BIT);
    RUNNING_BIT | pending_runs
}

/// Gate thread coordination state
#[derive(Debug)]
pub(crate) struct GateState {
    /// [`NOT_RUNNING`], or [`running_state()`] of the current gate thread
    ///
    /// Swapped to the maximum run count on every work request, which both
    /// detects the need to spawn (previous value was [`NOT_RUNNING`]) and
    /// resets the retirement countdown.
    run_state: AtomicU32,

    /// Wakes the gate thread ahead of its timed delay
    waker: GateWaker,
}
//
impl GateState {
    /// Set up the state with no gate thread alive
    pub(crate) fn new() -> Self {
        Self {
            run_state: AtomicU32::new(NOT_RUNNING),
            waker: GateWaker::default(),
        }
    }
}

/// Make sure a gate thread is alive and owes a full retirement countdown
pub(crate) fn ensure_running(shared: &Arc<PoolShared>) {
    if shared.shutdown.load(Ordering::Acquire) {
        return;
    }
    let full = running_state(shared.config.gate.max_runs);
    if shared.gate.run_state.load(Ordering::Acquire) == full {
        return;
    }
    if shared.gate.run_state.swap(full, Ordering::AcqRel) == NOT_RUNNING {
        spawn_gate_thread(shared);
    }
}

/// Wake the gate thread ahead of its timed delay
pub(crate) fn wake(shared: &PoolShared) {
    shared.gate.waker.wake();
}

/// [`wake()`] + [`ensure_running()`], for events that need prompt attention
pub(crate) fn wake_and_ensure_running(shared: &Arc<PoolShared>) {
    wake(shared);
    ensure_running(shared);
}

/// Start the gate OS thread
fn spawn_gate_thread(shared: &Arc<PoolShared>) {
    let thread_shared = shared.clone();
    match std::thread::Builder::new()
        .name("flywheel gate".to_owned())
        .spawn(move || gate_loop(thread_shared))
    {
        Ok(handle) => shared
            .threads
            .lock()
            .expect("a panic while holding the thread registry is a bug")
            .push(handle),
        Err(error) => {
            // Give the next work request another chance to spawn it
            warn!("failed to spawn the gate thread: {error}");
            shared.gate.run_state.store(NOT_RUNNING, Ordering::Release);
        }
    }
}

/// Gate thread body
fn gate_loop(shared: Arc<PoolShared>) {
    let config = shared.config.gate;
    let mut delays = DelayHelper::new(shared.tick_ms(), config.period_ms);
    loop {
        let delay_ms = delays.next_delay_ms(shared.tick_ms());
        let signaled = shared
            .gate
            .waker
            .wait(Duration::from_millis(u64::from(delay_ms)));
        if shared.shutdown.load(Ordering::Acquire) {
            return;
        }
        let now_ms = shared.tick_ms();

        // Apply a pending blocking adjustment, tracking its step delay
        if shared.pending_adjustment() != PendingAdjustment::None {
            let delay_elapsed = delays.blocking_delay_elapsed(now_ms, signaled);
            let next_delay_ms = blocking::perform_blocking_adjustment(&shared, delay_elapsed);
            if next_delay_ms == 0 {
                delays.clear_blocking_delay();
            } else {
                delays.set_blocking_delay(now_ms, next_delay_ms);
            }
        } else {
            delays.clear_blocking_delay();
        }

        // The rest runs once per gate period no matter how often we wake
        if !delays.gate_activities_due(now_ms) {
            continue;
        }
        delays.note_gate_activities(now_ms);

        // Housekeeping: refresh the cached external signals
        let cpu = shared
            .config
            .cpu_utilization
            .utilization_percent()
            .min(100);
        shared.cpu_utilization_percent.store(cpu, Ordering::Relaxed);
        let memory = shared.config.memory_usage.usage();
        shared
            .memory_usage_bytes
            .store(memory.current_bytes, Ordering::Relaxed);
        shared
            .memory_limit_bytes
            .store(memory.high_watermark_bytes, Ordering::Relaxed);
        trace!("gate housekeeping: cpu {cpu}%, memory {}B", memory.current_bytes);

        // Starvation: requested work exists but nothing has been dequeued
        // for a suspiciously long time
        if shared.pending_adjustment() == PendingAdjustment::None
            && shared.num_requested_workers.load(Ordering::Acquire) > 0
            && sufficient_delay_since_last_dequeue(&shared, now_ms, cpu)
        {
            resolve_starvation(&shared);
        }

        // With nothing requested and nothing pending, pay down the
        // retirement countdown and exit once it reaches zero
        if shared.num_requested_workers.load(Ordering::Acquire) == 0
            && shared.pending_adjustment() == PendingAdjustment::None
        {
            let remaining = shared.gate.run_state.fetch_sub(1, Ordering::AcqRel) - 1;
            if remaining == running_state(0)
                && shared
                    .gate
                    .run_state
                    .compare_exchange(
                        running_state(0),
                        NOT_RUNNING,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
            {
                trace!("gate thread retiring");
                return;
            }
        }
    }
}

/// Truth that the time since the last dequeue exceeds the starvation
/// threshold
///
/// On a mostly idle machine one gate period of silence is already damning;
/// on a busy one, slow progress is expected and the threshold scales with
/// the number of threads supposed to be working.
fn sufficient_delay_since_last_dequeue(shared: &PoolShared, now_ms: u64, cpu: u8) -> bool {
    let config = &shared.config.gate;
    let delay_ms = now_ms.saturating_sub(shared.last_dequeue_time_ms.load(Ordering::Relaxed));
    let minimum_ms = if cpu < config.cpu_utilization_low_percent {
        u64::from(config.period_ms)
    } else {
        u64::from(shared.counts.load(Ordering::Relaxed).goal)
            * u64::from(config.dequeue_delay_threshold_ms)
    };
    delay_ms > minimum_ms
}

/// Starvation override: force the goal one past the processing count,
/// bypassing the sizing controller's smoothing
fn resolve_starvation(shared: &Arc<PoolShared>) {
    let mut add_worker = false;
    {
        let mut adjustments = shared.adjustment.lock();
        let max_threads = shared.max_threads();
        let mut counts = shared.counts.load(Ordering::Acquire);
        while counts.processing >= counts.goal && counts.processing < max_threads {
            let new_goal = counts.processing + 1;
            let new = ThreadCounts {
                goal: new_goal,
                ..counts
            };
            match shared
                .counts
                .try_update(counts, new, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(()) => {
                    warn!("work item starvation detected, forcing thread count goal to {new_goal}");
                    adjustments
                        .hill
                        .force_change(new_goal, Transition::Starvation);
                    add_worker = true;
                    break;
                }
                Err(updated) => counts = updated,
            }
        }
    }
    if add_worker {
        worker::maybe_add_working_worker(shared);
    }
}

/// Merges the fixed gate period with the variable blocking-step deadline
#[derive(Debug)]
struct DelayHelper {
    /// Gate period, in milliseconds
    period_ms: u32,

    /// Pool tick of the last full housekeeping pass
    previous_gate_activities_ms: u64,

    /// Pool tick at which the current blocking step delay started
    blocking_delay_start_ms: u64,

    /// Current blocking step delay, 0 when none is pending
    blocking_delay_ms: u32,
}
//
impl DelayHelper {
    /// Set up with a fresh period starting now
    fn new(now_ms: u64, period_ms: u32) -> Self {
        Self {
            period_ms,
            previous_gate_activities_ms: now_ms,
            blocking_delay_start_ms: 0,
            blocking_delay_ms: 0,
        }
    }

    /// Time to sleep until the earlier of the two deadlines
    fn next_delay_ms(&self, now_ms: u64) -> u32 {
        let since_gate = now_ms.saturating_sub(self.previous_gate_activities_ms);
        let gate_delay = if since_gate < u64::from(self.period_ms) {
            self.period_ms - since_gate as u32
        } else {
            1
        };
        if self.blocking_delay_ms == 0 {
            return gate_delay;
        }
        let since_blocking = now_ms.saturating_sub(self.blocking_delay_start_ms);
        let blocking_delay = if since_blocking < u64::from(self.blocking_delay_ms) {
            self.blocking_delay_ms - since_blocking as u32
        } else {
            1
        };
        gate_delay.min(blocking_delay)
    }

    /// Truth that the current blocking step delay ran to completion
    ///
    /// An explicit wake does not count: it means new information arrived, not
    /// that the rate limit expired.
    fn blocking_delay_elapsed(&self, now_ms: u64, signaled: bool) -> bool {
        !signaled
            && self.blocking_delay_ms > 0
            && now_ms.saturating_sub(self.blocking_delay_start_ms)
                >= u64::from(self.blocking_delay_ms)
    }

    /// Start tracking a new blocking step delay
    fn set_blocking_delay(&mut self, now_ms: u64, delay_ms: u32) {
        self.blocking_delay_start_ms = now_ms;
        self.blocking_delay_ms = delay_ms;
    }

    /// Stop tracking the blocking step delay
    fn clear_blocking_delay(&mut self) {
        self.blocking_delay_ms = 0;
    }

    /// Truth that a full gate period has passed since the last housekeeping
    fn gate_activities_due(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.previous_gate_activities_ms) >= u64::from(self.period_ms)
    }

    /// Record that housekeeping ran
    fn note_gate_activities(&mut self, now_ms: u64) {
        self.previous_gate_activities_ms = now_ms;
    }
}

/// Wakes the gate thread out of its timed wait
#[derive(Debug, Default)]
struct GateWaker {
    /// Set when a wake is owed, cleared by the gate thread on wake-up
    signaled: Mutex<bool>,

    /// Signaled together with the flag
    wake: Condvar,
}
//
impl GateWaker {
    /// Post a wake-up
    fn wake(&self) {
        *self
            .signaled
            .lock()
            .expect("a panic while holding the gate waker lock is a bug") = true;
        self.wake.notify_one();
    }

    /// Wait for a wake-up or the timeout, whichever comes first
    ///
    /// Returns true when explicitly woken.
    fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut signaled = self
            .signaled
            .lock()
            .expect("a panic while holding the gate waker lock is a bug");
        while !*signaled {
            let Some(remaining) = deadline
                .checked_duration_since(Instant::now())
                .filter(|remaining| !remaining.is_zero())
            else {
                return false;
            };
            (signaled, _) = self
                .wake
                .wait_timeout(signaled, remaining)
                .expect("a panic while holding the gate waker lock is a bug");
        }
        *signaled = false;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_state_encoding() {
        assert_eq!(running_state(0) & !RUNNING_BIT, 0);
        assert_eq!(running_state(2) - 1, running_state(1));
        assert_ne!(running_state(0), NOT_RUNNING);
    }

    #[test]
    fn delay_helper_merges_deadlines() {
        let mut delays = DelayHelper::new(0, 500);
        assert_eq!(delays.next_delay_ms(0), 500);
        assert_eq!(delays.next_delay_ms(200), 300);
        delays.set_blocking_delay(200, 25);
        assert_eq!(delays.next_delay_ms(210), 15);
        assert!(!delays.blocking_delay_elapsed(210, false));
        assert!(delays.blocking_delay_elapsed(225, false));
        assert!(!delays.blocking_delay_elapsed(225, true));
        delays.clear_blocking_delay();
        assert_eq!(delays.next_delay_ms(210), 290);
        assert!(!delays.gate_activities_due(499));
        assert!(delays.gate_activities_due(500));
        delays.note_gate_activities(500);
        assert!(!delays.gate_activities_due(999));
    }

    #[test]
    fn waker_round_trip() {
        let waker = GateWaker::default();
        assert!(!waker.wait(Duration::from_millis(10)));
        waker.wake();
        assert!(waker.wait(Duration::from_millis(10)));
        assert!(!waker.wait(Duration::from_millis(10)));
    }
}
