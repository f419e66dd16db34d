//! Wait registration subsystem
//!
//! Callers register a callback against a [`WaitEvent`] with an optional
//! timeout; dedicated waiter threads multiplex the registrations, each
//! owning a bounded slot table, and re-inject satisfied or expired waits into
//! the pool as time-sensitive work items. Registration changes are applied
//! lazily at the start of the next multiplexing cycle, so registering and
//! unregistering never blocks on in-flight waits.

use crate::pool::{self, PoolShared};
use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Condvar, Mutex, Weak,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

/// Registrations one waiter thread can own
///
/// The slot table has 64 entries, with one reserved for the change signal
/// that interrupts the current multiplexing cycle.
const MAX_WAITS_PER_THREAD: usize = 63;

/// Callback invoked when a registered wait completes
///
/// The argument is true when the wait timed out, false when the event was
/// signaled.
pub(crate) type WaitCallback = Arc<dyn Fn(bool) + Send + Sync>;

/// Manual-reset waitable handle
///
/// Stays signaled from [`set()`](Self::set) until [`reset()`](Self::reset);
/// every registration observing the signaled state fires. Clones share the
/// same underlying event.
#[derive(Clone, Default)]
pub struct WaitEvent(Arc<EventInner>);
//
impl WaitEvent {
    /// Create an unsignaled event
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal the event, waking every waiter thread watching it
    pub fn set(&self) {
        let watchers = {
            let mut state = self.0.lock_state();
            state.signaled = true;
            // Snapshot so no waiter lock is ever taken under the event lock
            state.watchers.clone()
        };
        for watcher in watchers {
            if let Some(waiter) = watcher.waiter.upgrade() {
                waiter.notify();
            }
        }
    }

    /// Return the event to the unsignaled state
    pub fn reset(&self) {
        self.0.lock_state().signaled = false;
    }

    /// Truth that the event is currently signaled
    pub fn is_set(&self) -> bool {
        self.0.lock_state().signaled
    }

    /// Subscribe a waiter thread's registration to signals
    fn add_watcher(&self, waiter: &Arc<WaiterShared>, registration_id: u64) {
        self.0.lock_state().watchers.push(Watcher {
            waiter: Arc::downgrade(waiter),
            registration_id,
        });
    }

    /// Drop the subscription of one registration
    fn remove_watcher(&self, registration_id: u64) {
        self.0
            .lock_state()
            .watchers
            .retain(|watcher| watcher.registration_id != registration_id);
    }
}
//
impl fmt::Debug for WaitEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitEvent")
            .field("signaled", &self.is_set())
            .finish_non_exhaustive()
    }
}

/// Shared state of a [`WaitEvent`]
#[derive(Default)]
struct EventInner {
    /// Signal flag and subscribed waiter threads
    state: Mutex<EventState>,
}
//
impl EventInner {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, EventState> {
        self.state
            .lock()
            .expect("a panic while holding an event lock is a bug")
    }
}

/// Inside of [`EventInner::state`]
#[derive(Default)]
struct EventState {
    /// Truth that the event is signaled
    signaled: bool,

    /// Waiter threads to poke on signal
    watchers: Vec<Watcher>,
}

/// One registration's subscription to an event
#[derive(Clone)]
struct Watcher {
    /// Waiter thread owning the registration
    waiter: Weak<WaiterShared>,

    /// Registration the subscription belongs to
    registration_id: u64,
}

/// Proof of a registered wait; unregisters on drop
pub struct WaitRegistration {
    /// Waiter thread owning the registration
    waiter: Arc<WaiterShared>,

    /// Identity of the registration within the subsystem
    id: u64,

    /// Cleared once unregistration has been requested
    active: bool,
}
//
impl WaitRegistration {
    /// Remove the registration
    ///
    /// Applied lazily at the waiter thread's next multiplexing cycle; a
    /// completion already in flight may still run its callback.
    pub fn unregister(mut self) {
        self.request_removal();
    }

    /// Queue the removal exactly once
    fn request_removal(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        {
            let mut state = self.waiter.lock_state();
            state.pending_removals.push(self.id);
            state.dirty = true;
        }
        self.waiter.changed.notify_one();
    }
}
//
impl fmt::Debug for WaitRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitRegistration")
            .field("id", &self.id)
            .field("active", &self.active)
            .finish_non_exhaustive()
    }
}
//
impl Drop for WaitRegistration {
    fn drop(&mut self) {
        self.request_removal();
    }
}

/// The pool's collection of waiter threads
pub(crate) struct WaitSubsystem {
    /// Pool that completions are re-injected into
    pool: Arc<PoolShared>,

    /// Live waiter threads; the lock serializes registration changes
    waiters: Mutex<Vec<WaiterHandle>>,

    /// Registration id generator
    next_registration_id: AtomicU64,
}
//
impl WaitSubsystem {
    /// Set up the subsystem with no waiter threads
    pub(crate) fn new(pool: Arc<PoolShared>) -> Self {
        Self {
            pool,
            waiters: Mutex::new(Vec::new()),
            next_registration_id: AtomicU64::new(1),
        }
    }

    /// Register a callback to run when `event` signals or `timeout` elapses
    pub(crate) fn register(
        &self,
        event: &WaitEvent,
        timeout: Option<Duration>,
        repeating: bool,
        callback: WaitCallback,
    ) -> std::io::Result<WaitRegistration> {
        let id = self.next_registration_id.fetch_add(1, Ordering::Relaxed);
        let waiter = {
            let mut waiters = self
                .waiters
                .lock()
                .expect("a panic while holding the waiter registry is a bug");
            match waiters
                .iter()
                .find(|handle| handle.shared.active_estimate() < MAX_WAITS_PER_THREAD)
            {
                Some(handle) => handle.shared.clone(),
                None => {
                    let shared = Arc::new(WaiterShared::default());
                    let thread = {
                        let pool = self.pool.clone();
                        let shared = shared.clone();
                        std::thread::Builder::new()
                            .name(format!("flywheel waiter #{}", waiters.len()))
                            .spawn(move || waiter_main(pool, shared))?
                    };
                    waiters.push(WaiterHandle {
                        shared: shared.clone(),
                        thread: Some(thread),
                    });
                    shared
                }
            }
        };
        event.add_watcher(&waiter, id);
        {
            let mut state = waiter.lock_state();
            state.pending_additions.push(Registration {
                id,
                event: event.clone(),
                callback,
                timeout,
                repeating,
                deadline: None,
            });
            state.dirty = true;
        }
        waiter.changed.notify_one();
        Ok(WaitRegistration {
            waiter,
            id,
            active: true,
        })
    }

    /// Stop and join every waiter thread
    pub(crate) fn shutdown(&self) {
        let mut waiters = self
            .waiters
            .lock()
            .expect("a panic while holding the waiter registry is a bug");
        for handle in waiters.iter() {
            {
                let mut state = handle.shared.lock_state();
                state.stop = true;
                state.dirty = true;
            }
            handle.shared.changed.notify_one();
        }
        for handle in waiters.iter_mut() {
            if let Some(thread) = handle.thread.take() {
                let _ = thread.join();
            }
        }
    }
}
//
impl fmt::Debug for WaitSubsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitSubsystem").finish_non_exhaustive()
    }
}

/// A waiter thread and the shared state used to talk to it
struct WaiterHandle {
    /// State shared with the waiter thread
    shared: Arc<WaiterShared>,

    /// Join handle, taken at shutdown
    thread: Option<JoinHandle<()>>,
}

/// State shared between a waiter thread and its registrants
#[derive(Default)]
struct WaiterShared {
    /// Registration table and change queues
    state: Mutex<WaiterState>,

    /// Signaled on any state change the waiter thread should look at
    changed: Condvar,
}
//
impl WaiterShared {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, WaiterState> {
        self.state
            .lock()
            .expect("a panic while holding a waiter lock is a bug")
    }

    /// Interrupt the current multiplexing cycle
    fn notify(&self) {
        self.lock_state().dirty = true;
        self.changed.notify_one();
    }

    /// Slots in use, counting not-yet-applied additions
    fn active_estimate(&self) -> usize {
        let state = self.lock_state();
        state.registrations.len() + state.pending_additions.len()
    }
}

/// Inside of [`WaiterShared::state`]
#[derive(Default)]
struct WaiterState {
    /// Registrations the waiter is currently multiplexing
    registrations: Vec<Registration>,

    /// Registrations to adopt at the next cycle
    pending_additions: Vec<Registration>,

    /// Registration ids to drop at the next cycle
    pending_removals: Vec<u64>,

    /// Set on any change, cleared when the waiter has caught up
    dirty: bool,

    /// Set once at pool shutdown
    stop: bool,
}

/// One registered wait
struct Registration {
    /// Identity within the subsystem
    id: u64,

    /// Event being waited on
    event: WaitEvent,

    /// Callback to re-inject on completion
    callback: WaitCallback,

    /// Timeout re-armed on every cycle for repeating registrations
    timeout: Option<Duration>,

    /// Truth that the registration survives its first completion
    repeating: bool,

    /// When the current wait expires, if a timeout is configured
    deadline: Option<Instant>,
}

/// Waiter thread body
fn waiter_main(pool: Arc<PoolShared>, shared: Arc<WaiterShared>) {
    let mut guard = shared.lock_state();
    loop {
        // Apply registration changes, additions first so that a registration
        // added and removed within one cycle resolves cleanly
        let additions = std::mem::take(&mut guard.pending_additions);
        for mut registration in additions {
            registration.deadline = registration.timeout.map(|timeout| Instant::now() + timeout);
            guard.registrations.push(registration);
        }
        let removals = std::mem::take(&mut guard.pending_removals);
        for id in removals {
            if let Some(position) = guard
                .registrations
                .iter()
                .position(|registration| registration.id == id)
            {
                let registration = guard.registrations.swap_remove(position);
                registration.event.remove_watcher(id);
            }
        }
        if guard.stop {
            return;
        }
        guard.dirty = false;

        // Collect satisfied and expired waits
        let now = Instant::now();
        let mut completions = Vec::new();
        let mut index = 0;
        while index < guard.registrations.len() {
            let registration = &mut guard.registrations[index];
            let signaled = registration.event.is_set();
            let timed_out =
                !signaled && registration.deadline.is_some_and(|deadline| deadline <= now);
            if signaled || timed_out {
                completions.push((registration.callback.clone(), timed_out));
                if registration.repeating {
                    registration.deadline =
                        registration.timeout.map(|timeout| now + timeout);
                    index += 1;
                } else {
                    let registration = guard.registrations.swap_remove(index);
                    registration.event.remove_watcher(registration.id);
                }
            } else {
                index += 1;
            }
        }

        // Re-inject completions without holding the lock, then rescan
        if !completions.is_empty() {
            drop(guard);
            for (callback, timed_out) in completions {
                pool::submit_time_sensitive(&pool, Box::new(move || callback(timed_out)));
            }
            guard = shared.lock_state();
            continue;
        }

        // Sleep until the nearest deadline or the next change
        let nearest_deadline = guard
            .registrations
            .iter()
            .filter_map(|registration| registration.deadline)
            .min();
        if guard.dirty {
            continue;
        }
        guard = match nearest_deadline {
            Some(deadline) => {
                let Some(remaining) = deadline
                    .checked_duration_since(Instant::now())
                    .filter(|remaining| !remaining.is_zero())
                else {
                    continue;
                };
                shared
                    .changed
                    .wait_timeout(guard, remaining)
                    .expect("a panic while holding a waiter lock is a bug")
                    .0
            }
            None => shared
                .changed
                .wait(guard)
                .expect("a panic while holding a waiter lock is a bug"),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::ThreadPoolConfig, ThreadPool};
    use std::sync::atomic::AtomicUsize;

    fn pool() -> ThreadPool {
        ThreadPool::with_config(ThreadPoolConfig {
            min_threads: 1,
            max_threads: 4,
            ..Default::default()
        })
        .unwrap()
    }

    fn await_count(counter: &AtomicUsize, at_least: usize, what: &str) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while counter.load(Ordering::Relaxed) < at_least {
            assert!(Instant::now() < deadline, "{what}");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn signal_runs_the_callback() {
        let pool = pool();
        let event = WaitEvent::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let saw_timeout = Arc::new(AtomicUsize::new(0));
        let _registration = {
            let fired = fired.clone();
            let saw_timeout = saw_timeout.clone();
            pool.register_wait(&event, None, false, move |timed_out| {
                if timed_out {
                    saw_timeout.fetch_add(1, Ordering::Relaxed);
                }
                fired.fetch_add(1, Ordering::Relaxed);
            })
            .unwrap()
        };
        event.set();
        await_count(&fired, 1, "signaled wait never completed");
        assert_eq!(saw_timeout.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn timeout_runs_the_callback_with_the_flag() {
        let pool = pool();
        let event = WaitEvent::new();
        let timeouts = Arc::new(AtomicUsize::new(0));
        let _registration = {
            let timeouts = timeouts.clone();
            pool.register_wait(
                &event,
                Some(Duration::from_millis(20)),
                false,
                move |timed_out| {
                    assert!(timed_out);
                    timeouts.fetch_add(1, Ordering::Relaxed);
                },
            )
            .unwrap()
        };
        await_count(&timeouts, 1, "timed wait never expired");
    }

    #[test]
    fn repeating_registration_rearms() {
        let pool = pool();
        let event = WaitEvent::new();
        let timeouts = Arc::new(AtomicUsize::new(0));
        let registration = {
            let timeouts = timeouts.clone();
            pool.register_wait(
                &event,
                Some(Duration::from_millis(10)),
                true,
                move |_timed_out| drop(timeouts.fetch_add(1, Ordering::Relaxed)),
            )
            .unwrap()
        };
        await_count(&timeouts, 3, "repeating wait stopped re-arming");
        registration.unregister();
    }

    #[test]
    fn unregister_stops_future_completions() {
        let pool = pool();
        let event = WaitEvent::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let registration = {
            let fired = fired.clone();
            pool.register_wait(&event, None, false, move |_timed_out| {
                drop(fired.fetch_add(1, Ordering::Relaxed))
            })
            .unwrap()
        };
        registration.unregister();
        // Give the waiter thread time to apply the removal, then signal
        std::thread::sleep(Duration::from_millis(50));
        event.set();
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(fired.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn registrations_overflow_to_a_second_waiter_thread() {
        let pool = pool();
        let subsystem = WaitSubsystem::new(pool.shared.clone());
        let event = WaitEvent::new();
        let registrations = (0..MAX_WAITS_PER_THREAD + 1)
            .map(|_| {
                subsystem
                    .register(&event, None, false, Arc::new(|_timed_out| ()))
                    .unwrap()
            })
            .collect::<Vec<_>>();
        assert_eq!(subsystem.waiters.lock().unwrap().len(), 2);
        drop(registrations);
        subsystem.shutdown();
    }
}
