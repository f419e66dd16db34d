//! Thread pool-wide interfaces

use crate::{
    blocking::{self, BlockingState, PendingAdjustment},
    config::{processor_count, ConfigError, ThreadPoolConfig},
    counts::AtomicThreadCounts,
    gate::{self, GateState},
    hill_climbing::{HillClimbing, Transition},
    lock::LowLevelLock,
    queue::{LocalQueue, Stealer},
    semaphore::LifoSemaphore,
    wait::{WaitEvent, WaitRegistration, WaitSubsystem},
    worker, WorkItem,
};
use crossbeam::queue::SegQueue;
use rand::Rng;
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering},
        Arc, Mutex, OnceLock, RwLock,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

/// Base the per-instance sample-interval seed is derived from when the
/// configuration does not pin one
const DEFAULT_SEED_BASE: u64 = 0x9E37_79B9_7F4A_7C15;

/// Distinguishes pool instances, so worker-local submission cannot cross pools
static NEXT_POOL_ID: AtomicUsize = AtomicUsize::new(0);

/// Self-tuning pool of OS worker threads
///
/// Worker threads are spawned on demand up to the current thread-count goal
/// and retire after sitting idle for
/// [`WorkerConfig::idle_timeout_ms`](crate::WorkerConfig::idle_timeout_ms).
/// Dropping the pool shuts it down deterministically: all pool threads are
/// joined, and work items still queued at that point are dropped unexecuted.
#[derive(Debug)]
pub struct ThreadPool {
    /// State shared with the worker, gate and waiter threads
    pub(crate) shared: Arc<PoolShared>,

    /// Wait registration subsystem
    waits: WaitSubsystem,
}
//
impl ThreadPool {
    /// Create a pool with the default configuration
    pub fn new() -> Self {
        Self::with_config(ThreadPoolConfig::default())
            .expect("the default configuration is valid")
    }

    /// Create a pool with a custom configuration
    pub fn with_config(config: ThreadPoolConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);
        let initial_goal = config.min_threads as u16;
        let seed = config
            .hill_climbing
            .sample_interval_seed
            .unwrap_or(DEFAULT_SEED_BASE ^ id as u64);
        let hill = HillClimbing::new(config.hill_climbing, initial_goal, seed);
        let first_interval_ms = hill.current_sample_interval_ms();
        let initial_memory = config.memory_usage.usage();

        let shared = Arc::new(PoolShared {
            id,
            min_threads: AtomicU16::new(config.min_threads as u16),
            max_threads: AtomicU16::new(config.max_threads as u16),
            counts: AtomicThreadCounts::new(initial_goal),
            semaphore: LifoSemaphore::new(config.worker.semaphore_spin_count, processor_count()),
            queues: WorkQueues::new(),
            num_requested_workers: AtomicU32::new(0),
            request_cap: processor_count() as u32,
            last_dequeue_time_ms: AtomicU64::new(0),
            completion_count: AtomicU64::new(0),
            next_sample_due_ms: AtomicU64::new(u64::from(first_interval_ms)),
            pending_blocking_adjustment: AtomicU8::new(PendingAdjustment::None.to_raw()),
            cpu_utilization_percent: AtomicU8::new(0),
            memory_usage_bytes: AtomicU64::new(initial_memory.current_bytes),
            memory_limit_bytes: AtomicU64::new(initial_memory.high_watermark_bytes),
            adjustment: LowLevelLock::new(Adjustments {
                hill,
                blocking: BlockingState::default(),
                prior_completion_count: 0,
                current_sample_start_ms: 0,
            }),
            gate: GateState::new(),
            shutdown: AtomicBool::new(false),
            threads: Mutex::new(Vec::new()),
            next_worker_id: AtomicUsize::new(0),
            start: Instant::now(),
            config,
        });
        let waits = WaitSubsystem::new(shared.clone());
        Ok(Self { shared, waits })
    }

    /// The process-wide pool instance
    ///
    /// Lazily constructed with the default configuration on first use. Prefer
    /// passing an explicitly constructed pool around where practical; this
    /// accessor exists for code without an injection path.
    pub fn global() -> &'static ThreadPool {
        static GLOBAL: OnceLock<ThreadPool> = OnceLock::new();
        GLOBAL.get_or_init(Self::new)
    }

    /// Schedule a work item for one-time execution
    ///
    /// With `prefer_local` set and when called from one of this pool's worker
    /// threads, the item goes to that worker's local queue (LIFO, stealable);
    /// otherwise it goes to the shared FIFO. No ordering is promised across
    /// queues.
    pub fn submit(&self, work: impl FnOnce() + Send + 'static, prefer_local: bool) {
        submit_item(&self.shared, Box::new(work), prefer_local);
    }

    /// Lower bound on the thread-count goal
    pub fn min_threads(&self) -> usize {
        usize::from(self.shared.min_threads())
    }

    /// Upper bound on the thread-count goal
    pub fn max_threads(&self) -> usize {
        usize::from(self.shared.max_threads())
    }

    /// Change the lower bound on the thread-count goal
    ///
    /// Takes effect immediately for future sizing decisions; the goal is
    /// raised right away if it sits below the new minimum.
    pub fn set_min_threads(&self, min: usize) -> Result<(), ConfigError> {
        let mut add_worker = false;
        {
            let mut adjustments = self.shared.adjustment.lock();
            ThreadPoolConfig::validate_thread_range(min, usize::from(self.shared.max_threads()))?;
            self.shared.min_threads.store(min as u16, Ordering::Release);
            let counts = self.shared.counts.load(Ordering::Acquire);
            if counts.goal < min as u16 {
                self.shared.counts.set_goal(min as u16);
                adjustments
                    .hill
                    .force_change(min as u16, Transition::ConfigurationChange);
                add_worker = self.shared.num_requested_workers.load(Ordering::Acquire) > 0;
            }
        }
        if add_worker {
            worker::maybe_add_working_worker(&self.shared);
        }
        Ok(())
    }

    /// Change the upper bound on the thread-count goal
    ///
    /// Takes effect immediately for future sizing decisions; the goal is
    /// lowered right away if it sits above the new maximum.
    pub fn set_max_threads(&self, max: usize) -> Result<(), ConfigError> {
        let mut adjustments = self.shared.adjustment.lock();
        ThreadPoolConfig::validate_thread_range(usize::from(self.shared.min_threads()), max)?;
        self.shared.max_threads.store(max as u16, Ordering::Release);
        let counts = self.shared.counts.load(Ordering::Acquire);
        if counts.goal > max as u16 {
            self.shared.counts.set_goal(max as u16);
            adjustments
                .hill
                .force_change(max as u16, Transition::ConfigurationChange);
        }
        Ok(())
    }

    /// Approximate number of additional workers that could become active
    ///
    /// Not an atomic snapshot; use for monitoring only.
    pub fn available_worker_estimate(&self) -> usize {
        let counts = self.shared.counts.load(Ordering::Relaxed);
        usize::from(self.shared.max_threads()).saturating_sub(usize::from(counts.processing))
    }

    /// Approximate number of work items waiting in all queues combined
    ///
    /// Not an atomic snapshot; use for monitoring only.
    pub fn pending_work_item_count_estimate(&self) -> usize {
        self.shared.queues.pending_estimate()
    }

    /// Report that the calling pool worker is about to block
    ///
    /// The pool compensates by temporarily raising its thread-count goal, so
    /// throughput does not stall on callbacks that block. Must be balanced by
    /// [`notify_blocking_end()`](Self::notify_blocking_end).
    pub fn notify_blocking_begin(&self) {
        blocking::notify_blocking_begin(&self.shared);
    }

    /// Report that the calling pool worker stopped blocking
    pub fn notify_blocking_end(&self) {
        blocking::notify_blocking_end(&self.shared);
    }

    /// Run `callback` when `event` is signaled or `timeout` elapses
    ///
    /// The callback receives `true` when invoked for a timeout, `false` for a
    /// signal, and runs as a pool work item. A repeating registration re-arms
    /// after each invocation (note that a still-signaled event then fires it
    /// again immediately); a one-shot registration is dropped after its first
    /// invocation. The registration is removed on
    /// [`WaitRegistration::unregister()`] or drop.
    pub fn register_wait(
        &self,
        event: &WaitEvent,
        timeout: Option<Duration>,
        repeating: bool,
        callback: impl Fn(bool) + Send + Sync + 'static,
    ) -> std::io::Result<WaitRegistration> {
        self.waits
            .register(event, timeout, repeating, Arc::new(callback))
    }
}
//
impl Default for ThreadPool {
    fn default() -> Self {
        Self::new()
    }
}
//
impl Drop for ThreadPool {
    fn drop(&mut self) {
        // Tell every pool thread that no further work will be coming
        //
        // Release ordering makes previously submitted state visible to the
        // threads we are about to wake.
        self.shared.shutdown.store(true, Ordering::Release);
        self.waits.shutdown();

        // Wake everyone: parked workers via a semaphore release storm, the
        // gate thread via its waker
        self.shared.semaphore.release(u32::from(u16::MAX));
        gate::wake(&self.shared);

        // Join all pool threads; re-drain in case one was mid-spawn. Workers
        // that died propagating a work-item panic report it through join(),
        // which is not a pool error.
        loop {
            let drained = {
                let mut threads = self
                    .shared
                    .threads
                    .lock()
                    .expect("a panic while holding the thread registry is a bug");
                threads.drain(..).collect::<Vec<_>>()
            };
            if drained.is_empty() {
                break;
            }
            for thread in drained {
                let _ = thread.join();
            }
        }
    }
}

/// State shared between the pool handle and all of its threads
#[derive(Debug)]
pub(crate) struct PoolShared {
    /// Pool instance identity, for worker-local submission routing
    pub(crate) id: usize,

    /// Construction-time configuration (thread bounds live in the atomics
    /// below so they can change at runtime)
    pub(crate) config: ThreadPoolConfig,

    /// Current lower bound on the thread-count goal
    pub(crate) min_threads: AtomicU16,

    /// Current upper bound on the thread-count goal
    pub(crate) max_threads: AtomicU16,

    /// Packed processing/existing/goal counters
    pub(crate) counts: AtomicThreadCounts,

    /// Parks idle workers and dispenses processing slots
    pub(crate) semaphore: LifoSemaphore,

    /// Global FIFOs and the stealer registry
    pub(crate) queues: WorkQueues,

    /// Worker wake-ups requested but not yet taken
    pub(crate) num_requested_workers: AtomicU32,

    /// Bound on outstanding worker requests
    pub(crate) request_cap: u32,

    /// Pool tick of the last successful dequeue, watched by the gate
    /// thread's starvation check
    pub(crate) last_dequeue_time_ms: AtomicU64,

    /// Work items completed since pool creation
    pub(crate) completion_count: AtomicU64,

    /// Pool tick after which the next sizing-controller sample is due
    pub(crate) next_sample_due_ms: AtomicU64,

    /// Raw [`PendingAdjustment`]; written under the adjustment lock, read
    /// lock-free by the gate thread
    pub(crate) pending_blocking_adjustment: AtomicU8,

    /// CPU utilization sampled by the gate thread, in percent
    pub(crate) cpu_utilization_percent: AtomicU8,

    /// Memory usage sampled by the gate thread
    pub(crate) memory_usage_bytes: AtomicU64,

    /// Memory budget sampled by the gate thread, `0` meaning none
    pub(crate) memory_limit_bytes: AtomicU64,

    /// Multi-field adjustment state: sizing controller and blocking tracker
    pub(crate) adjustment: LowLevelLock<Adjustments>,

    /// Gate thread run state and waker
    pub(crate) gate: GateState,

    /// Set once on pool drop; pool threads exit when they observe it
    pub(crate) shutdown: AtomicBool,

    /// Join handles of every thread the pool spawned
    pub(crate) threads: Mutex<Vec<JoinHandle<()>>>,

    /// Worker name counter
    pub(crate) next_worker_id: AtomicUsize,

    /// Pool epoch that all tick values count from
    start: Instant,
}
//
impl PoolShared {
    /// Milliseconds since pool creation
    pub(crate) fn tick_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    /// Current lower bound on the thread-count goal
    pub(crate) fn min_threads(&self) -> u16 {
        self.min_threads.load(Ordering::Acquire)
    }

    /// Current upper bound on the thread-count goal
    pub(crate) fn max_threads(&self) -> u16 {
        self.max_threads.load(Ordering::Acquire)
    }

    /// Take one pending worker request, if any
    pub(crate) fn take_active_request(&self) -> bool {
        let mut count = self.num_requested_workers.load(Ordering::Acquire);
        while count > 0 {
            match self.num_requested_workers.compare_exchange_weak(
                count,
                count - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_count) => return true,
                Err(updated) => count = updated,
            }
        }
        false
    }
}

/// Multi-field state that single CAS words cannot express, guarded by the
/// adjustment lock
#[derive(Debug)]
pub(crate) struct Adjustments {
    /// Sizing controller; never invoked concurrently with itself thanks to
    /// the lock
    pub(crate) hill: HillClimbing,

    /// Cooperative-blocking tracker
    pub(crate) blocking: BlockingState,

    /// Completion counter value at the start of the current sample
    pub(crate) prior_completion_count: u64,

    /// Pool tick at the start of the current sample
    pub(crate) current_sample_start_ms: u64,
}

/// Work distribution: one stealable queue per worker plus shared FIFOs
#[derive(Debug)]
pub(crate) struct WorkQueues {
    /// Overflow and externally-submitted work, FIFO
    pub(crate) global: SegQueue<WorkItem>,

    /// Deadline-driven completions, FIFO, consulted last
    pub(crate) time_sensitive: SegQueue<WorkItem>,

    /// Thief-side handles to every live worker's local queue
    stealers: RwLock<Vec<(usize, Stealer<WorkItem>)>>,
}
//
impl WorkQueues {
    /// Set up empty queues
    fn new() -> Self {
        Self {
            global: SegQueue::new(),
            time_sensitive: SegQueue::new(),
            stealers: RwLock::new(Vec::new()),
        }
    }

    /// Make a worker's local queue available for stealing
    pub(crate) fn register(&self, worker_id: usize, stealer: Stealer<WorkItem>) {
        self.stealers
            .write()
            .expect("a panic while holding the stealer registry is a bug")
            .push((worker_id, stealer));
    }

    /// Remove a retiring worker's local queue from the steal sweep
    pub(crate) fn unregister(&self, worker_id: usize) {
        self.stealers
            .write()
            .expect("a panic while holding the stealer registry is a bug")
            .retain(|(id, _stealer)| *id != worker_id);
    }

    /// Find the next work item for a worker
    ///
    /// Tries the worker's own queue, then the global FIFO, then a randomized
    /// sweep of the other workers' queues, then the time-sensitive FIFO. The
    /// random sweep offset keeps simultaneous thieves from converging on the
    /// same victim. `missed_steal` is set if any queue was contended, in
    /// which case the caller should keep the wake-up pipeline going.
    pub(crate) fn dequeue(
        &self,
        local: &mut LocalQueue<WorkItem>,
        worker_id: usize,
        missed_steal: &mut bool,
    ) -> Option<WorkItem> {
        if let Some(item) = local.pop() {
            return Some(item);
        }
        if let Some(item) = self.global.pop() {
            return Some(item);
        }
        {
            let stealers = self
                .stealers
                .read()
                .expect("a panic while holding the stealer registry is a bug");
            if !stealers.is_empty() {
                let start = rand::thread_rng().gen_range(0..stealers.len());
                for offset in 0..stealers.len() {
                    let (id, stealer) = &stealers[(start + offset) % stealers.len()];
                    if *id == worker_id {
                        continue;
                    }
                    if let Some(item) = stealer.steal(missed_steal) {
                        return Some(item);
                    }
                }
            }
        }
        self.time_sensitive.pop()
    }

    /// Approximate total number of queued work items
    pub(crate) fn pending_estimate(&self) -> usize {
        let locals = self
            .stealers
            .read()
            .expect("a panic while holding the stealer registry is a bug")
            .iter()
            .map(|(_id, stealer)| stealer.len())
            .sum::<usize>();
        self.global.len() + self.time_sensitive.len() + locals
    }
}

/// Enqueue a work item and make sure a worker will come for it
pub(crate) fn submit_item(shared: &Arc<PoolShared>, item: WorkItem, prefer_local: bool) {
    let mut item = Some(item);
    if prefer_local {
        if let Err(returned) = worker::try_push_local(shared.id, item.take().expect("just set")) {
            item = Some(returned);
        }
    }
    if let Some(item) = item {
        shared.queues.global.push(item);
    }
    ensure_thread_requested(shared);
}

/// Enqueue a deadline-driven work item on the time-sensitive FIFO
pub(crate) fn submit_time_sensitive(shared: &Arc<PoolShared>, item: WorkItem) {
    shared.queues.time_sensitive.push(item);
    ensure_thread_requested(shared);
}

/// Request a worker wake-up, bounded by the outstanding-request cap
pub(crate) fn ensure_thread_requested(shared: &Arc<PoolShared>) {
    let mut count = shared.num_requested_workers.load(Ordering::Acquire);
    while count < shared.request_cap {
        match shared.num_requested_workers.compare_exchange_weak(
            count,
            count + 1,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_count) => {
                worker::maybe_add_working_worker(shared);
                gate::ensure_running(shared);
                return;
            }
            Err(updated) => count = updated,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GateConfig, WorkerConfig};
    use std::sync::atomic::AtomicUsize;

    /// Route `log` output to the test harness, once
    fn setup_logger() {
        static ONCE: std::sync::Once = std::sync::Once::new();
        ONCE.call_once(|| {
            let _ = env_logger::builder().is_test(true).try_init();
        });
    }

    fn small_pool(min: usize, max: usize) -> ThreadPool {
        setup_logger();
        ThreadPool::with_config(ThreadPoolConfig {
            min_threads: min,
            max_threads: max,
            gate: GateConfig {
                period_ms: 5,
                ..Default::default()
            },
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn lifecycle() {
        // Check that the pool initializes and shuts down correctly
        ThreadPool::new();
    }

    #[test]
    fn rejects_bad_configuration() {
        let config = ThreadPoolConfig {
            min_threads: 0,
            ..Default::default()
        };
        assert!(ThreadPool::with_config(config).is_err());
        let pool = small_pool(1, 4);
        assert_eq!(
            pool.set_min_threads(5),
            Err(ConfigError::InvalidThreadRange { min: 5, max: 4 })
        );
        assert_eq!(pool.min_threads(), 1);
    }

    #[test]
    fn runs_a_single_item() {
        let pool = small_pool(1, 4);
        let ran = Arc::new(AtomicUsize::new(0));
        {
            let ran = ran.clone();
            pool.submit(move || drop(ran.fetch_add(1, Ordering::Relaxed)), false);
        }
        let deadline = Instant::now() + Duration::from_secs(5);
        while ran.load(Ordering::Relaxed) == 0 {
            assert!(Instant::now() < deadline, "work item never ran");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// 1000 independent items on a 1-4 thread pool all execute exactly once,
    /// and the observed thread counts stay within bounds throughout.
    #[test]
    fn end_to_end_exactly_once_within_bounds() {
        const ITEMS: usize = 1_000;

        let pool = small_pool(1, 4);
        let executed = Arc::new(AtomicUsize::new(0));
        for _ in 0..ITEMS {
            let executed = executed.clone();
            pool.submit(move || drop(executed.fetch_add(1, Ordering::Relaxed)), false);
        }

        let deadline = Instant::now() + Duration::from_secs(10);
        while executed.load(Ordering::Relaxed) < ITEMS {
            let counts = pool.shared.counts.load(Ordering::Relaxed);
            assert!(
                counts.existing <= 4,
                "existing count {} exceeded max",
                counts.existing
            );
            assert!(
                (1..=4).contains(&counts.goal),
                "goal {} out of bounds",
                counts.goal
            );
            assert!(
                counts.existing >= 1 || pool.pending_work_item_count_estimate() == 0,
                "no worker existed while work was pending"
            );
            assert!(
                Instant::now() < deadline,
                "work items did not complete in time"
            );
            std::thread::sleep(Duration::from_millis(1));
        }
        // The counter can only reach ITEMS if no item was lost, and can only
        // stay there if none ran twice
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(executed.load(Ordering::Relaxed), ITEMS);
    }

    #[test]
    fn prefer_local_submission_from_worker_runs() {
        let pool = Arc::new(small_pool(1, 4));
        let ran = Arc::new(AtomicUsize::new(0));
        {
            let pool2 = pool.clone();
            let ran = ran.clone();
            pool.submit(
                move || {
                    let ran = ran.clone();
                    pool2.submit(move || drop(ran.fetch_add(1, Ordering::Relaxed)), true);
                },
                false,
            );
        }
        let deadline = Instant::now() + Duration::from_secs(5);
        while ran.load(Ordering::Relaxed) == 0 {
            assert!(Instant::now() < deadline, "locally-submitted item never ran");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn starvation_override_unblocks_queued_work() {
        let pool = small_pool(1, 4);
        let quick_done = Arc::new(AtomicUsize::new(0));
        // Occupy the single worker without cooperating
        pool.submit(|| std::thread::sleep(Duration::from_millis(800)), false);
        std::thread::sleep(Duration::from_millis(50));
        for _ in 0..10 {
            let quick_done = quick_done.clone();
            pool.submit(move || drop(quick_done.fetch_add(1, Ordering::Relaxed)), false);
        }
        // The gate thread must detect the stalled dequeues and raise the goal
        let deadline = Instant::now() + Duration::from_secs(5);
        while quick_done.load(Ordering::Relaxed) < 10 {
            assert!(
                Instant::now() < deadline,
                "gate thread never resolved the starvation"
            );
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn idle_workers_retire() {
        let pool = ThreadPool::with_config(ThreadPoolConfig {
            min_threads: 1,
            max_threads: 4,
            worker: WorkerConfig {
                idle_timeout_ms: 50,
                ..Default::default()
            },
            gate: GateConfig {
                period_ms: 5,
                ..Default::default()
            },
            ..Default::default()
        })
        .unwrap();
        pool.submit(|| (), false);
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let counts = pool.shared.counts.load(Ordering::Relaxed);
            if counts.existing == 0 {
                break;
            }
            assert!(Instant::now() < deadline, "idle worker never retired");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn estimates_are_sane() {
        let pool = small_pool(2, 8);
        assert!(pool.available_worker_estimate() <= 8);
        assert_eq!(pool.pending_work_item_count_estimate(), 0);
        assert_eq!(pool.min_threads(), 2);
        assert_eq!(pool.max_threads(), 8);
        pool.set_min_threads(4).unwrap();
        assert_eq!(pool.shared.counts.load(Ordering::Relaxed).goal, 4);
        pool.set_max_threads(4).unwrap();
        assert_eq!(pool.max_threads(), 4);
    }

    #[test]
    fn global_pool_is_a_singleton() {
        let first: *const ThreadPool = ThreadPool::global();
        let second: *const ThreadPool = ThreadPool::global();
        assert_eq!(first, second);
    }
}
