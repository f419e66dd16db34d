//! Single thread pool worker
//!
//! Worker threads are bodies; processing slots are souls. The packed counts
//! word tracks both: `maybe_add_working_worker()` claims a processing slot
//! and either wakes an existing body through the semaphore or creates a new
//! one, and whichever thread wins the resulting semaphore signal becomes the
//! slot's owner until it runs out of work. A body that sits idle past its
//! timeout retires, dragging the goal down to at most the remaining body
//! count.

use crate::{
    blocking::PendingAdjustment,
    counts::ThreadCounts,
    hill_climbing::Transition,
    pool::{self, PoolShared},
    queue::LocalQueue,
    WorkItem,
};
use log::{debug, warn};
use std::{
    cell::{Cell, RefCell},
    panic::{self, AssertUnwindSafe},
    rc::Rc,
    sync::{atomic::Ordering, Arc},
    time::Duration,
};

thread_local! {
    /// Identity of the pool worker running on this thread, if any
    static WORKER_TLS: RefCell<Option<WorkerTls>> = RefCell::new(None);
}

/// What a worker thread knows about itself
struct WorkerTls {
    /// Pool this worker belongs to
    pool_id: usize,

    /// The worker's own stealable queue
    local: Rc<RefCell<LocalQueue<WorkItem>>>,
}

/// Push a work item onto the calling worker's local queue, if the calling
/// thread is a worker of the pool identified by `pool_id`
pub(crate) fn try_push_local(pool_id: usize, item: WorkItem) -> Result<(), WorkItem> {
    WORKER_TLS.with(|tls| match &*tls.borrow() {
        Some(worker) if worker.pool_id == pool_id => {
            worker.local.borrow_mut().push(item);
            Ok(())
        }
        _ => Err(item),
    })
}

/// Raise `processing` toward the goal by one slot, waking or spawning a
/// worker to take it
///
/// On OS thread-creation failure the reserved counts are rolled back so no
/// partial state remains; the gate thread's starvation check retries later.
pub(crate) fn maybe_add_working_worker(shared: &Arc<PoolShared>) {
    if shared.shutdown.load(Ordering::Acquire) {
        return;
    }
    let mut counts = shared.counts.load(Ordering::Acquire);
    let created_thread = loop {
        if counts.processing >= counts.goal {
            return;
        }
        let new = ThreadCounts {
            processing: counts.processing + 1,
            existing: counts.existing.max(counts.processing + 1),
            goal: counts.goal,
        };
        match shared
            .counts
            .try_update(counts, new, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(()) => break new.existing > counts.existing,
            Err(updated) => counts = updated,
        }
    };
    if created_thread {
        match spawn_worker(shared) {
            // The new body parks on the semaphore like everyone else; release
            // the slot's signal only once it is certain a body exists for it
            Ok(()) => shared.semaphore.release(1),
            Err(error) => {
                warn!("failed to spawn a worker thread: {error}");
                shared.counts.rollback_thread(true);
            }
        }
    } else {
        shared.semaphore.release(1);
    }
}

/// Start a new worker OS thread
fn spawn_worker(shared: &Arc<PoolShared>) -> std::io::Result<()> {
    let worker_id = shared.next_worker_id.fetch_add(1, Ordering::Relaxed);
    let thread_shared = shared.clone();
    let handle = std::thread::Builder::new()
        .name(format!("flywheel worker #{worker_id}"))
        .spawn(move || worker_main(thread_shared, worker_id))?;
    shared
        .threads
        .lock()
        .expect("a panic while holding the thread registry is a bug")
        .push(handle);
    Ok(())
}

/// Worker thread body
fn worker_main(shared: Arc<PoolShared>, worker_id: usize) {
    let local = Rc::new(RefCell::new(LocalQueue::new(
        shared.config.worker.local_queue_capacity,
    )));
    shared.queues.register(worker_id, local.borrow().stealer());
    WORKER_TLS.with(|tls| {
        *tls.borrow_mut() = Some(WorkerTls {
            pool_id: shared.id,
            local: local.clone(),
        })
    });
    let guard = WorkerGuard {
        shared: shared.clone(),
        worker_id,
        local: local.clone(),
        holds_processing_slot: Cell::new(false),
        armed: Cell::new(true),
    };

    let idle_timeout = Duration::from_millis(shared.config.worker.idle_timeout_ms);
    'shutdown: loop {
        while shared.semaphore.wait(idle_timeout, true) {
            if shared.shutdown.load(Ordering::Acquire) {
                break 'shutdown;
            }
            guard.holds_processing_slot.set(true);
            let mut demoted = false;
            while shared.take_active_request() {
                shared
                    .last_dequeue_time_ms
                    .store(shared.tick_ms(), Ordering::Relaxed);
                if !dispatch(&shared, worker_id, &local) {
                    // The dispatch loop already gave the processing slot back
                    demoted = true;
                    break;
                }
                if shared.num_requested_workers.load(Ordering::Acquire) == 0 {
                    break;
                }
            }
            if !demoted {
                remove_working_worker(&shared);
            }
            guard.holds_processing_slot.set(false);
            if shared.shutdown.load(Ordering::Acquire) {
                break 'shutdown;
            }
        }
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }
        if try_retire(&shared) {
            debug!("worker #{worker_id} retiring after idle timeout");
            release_worker_state(&shared, worker_id, &local);
            guard.armed.set(false);
            return;
        }
    }

    // Pool shutdown: the counts no longer steer anything, just unhook
    release_worker_state(&shared, worker_id, &local);
    guard.armed.set(false);
}

/// Run work items until the queues stay empty, the dispatch quantum expires,
/// or the pool demotes this worker
///
/// Returns false if the processing slot was given back (goal shrank below the
/// number of processing workers); the caller must not release it again.
fn dispatch(
    shared: &Arc<PoolShared>,
    worker_id: usize,
    local: &Rc<RefCell<LocalQueue<WorkItem>>>,
) -> bool {
    let mut missed_steal = false;
    let first = shared
        .queues
        .dequeue(&mut local.borrow_mut(), worker_id, &mut missed_steal);
    let Some(mut work) = first else {
        if missed_steal {
            // Contended queues may still hold work; keep the pipeline going
            pool::ensure_thread_requested(shared);
        }
        return true;
    };

    // More work may be queued behind the item we just took
    pool::ensure_thread_requested(shared);

    let quantum_start_ms = shared.tick_ms();
    loop {
        execute_work_item(shared, work);
        if !notify_work_item_complete(shared) {
            transfer_local_work(shared, local);
            return false;
        }
        if shared.tick_ms() - quantum_start_ms >= shared.config.worker.dispatch_quantum_ms {
            // Let goal changes take effect before dispatching further
            return true;
        }
        let mut missed_steal = false;
        match shared
            .queues
            .dequeue(&mut local.borrow_mut(), worker_id, &mut missed_steal)
        {
            Some(next) => {
                shared
                    .last_dequeue_time_ms
                    .store(shared.tick_ms(), Ordering::Relaxed);
                work = next;
            }
            None => {
                if missed_steal {
                    pool::ensure_thread_requested(shared);
                }
                return true;
            }
        }
    }
}

/// Execute one work item, completing the completion bookkeeping even when the
/// item panics
///
/// A panicking item takes its worker thread down with it (the panic resumes
/// after the books are balanced); the worker guard then repairs the thread
/// counts during unwinding, so queue and count invariants survive.
fn execute_work_item(shared: &Arc<PoolShared>, work: WorkItem) {
    match panic::catch_unwind(AssertUnwindSafe(work)) {
        Ok(()) => {
            shared.completion_count.fetch_add(1, Ordering::Relaxed);
        }
        Err(payload) => {
            shared.completion_count.fetch_add(1, Ordering::Relaxed);
            panic::resume_unwind(payload);
        }
    }
}

/// Per-completion bookkeeping: demotion check, then a sizing-controller
/// sample if one is due
///
/// Returns false if this worker must stop processing because the goal shrank.
fn notify_work_item_complete(shared: &Arc<PoolShared>) -> bool {
    if should_stop_processing_work_now(shared) {
        return false;
    }
    let now_ms = shared.tick_ms();
    if should_adjust_max_workers_active(shared, now_ms) {
        adjust_max_workers_active(shared, now_ms);
    }
    true
}

/// Give back the processing slot if more workers are processing than the
/// goal allows
fn should_stop_processing_work_now(shared: &Arc<PoolShared>) -> bool {
    let mut counts = shared.counts.load(Ordering::Acquire);
    loop {
        if counts.processing <= counts.goal {
            return false;
        }
        let new = ThreadCounts {
            processing: counts.processing - 1,
            ..counts
        };
        match shared
            .counts
            .try_update(counts, new, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(()) => return true,
            Err(updated) => counts = updated,
        }
    }
}

/// Truth that a sizing-controller sample is due and permitted
fn should_adjust_max_workers_active(shared: &PoolShared, now_ms: u64) -> bool {
    if now_ms < shared.next_sample_due_ms.load(Ordering::Relaxed) {
        return false;
    }
    // While the goal is elevated for blocking compensation, throughput says
    // nothing about the unblocked optimum
    let counts = shared.counts.load(Ordering::Acquire);
    if counts.processing > counts.goal {
        return false;
    }
    shared.pending_adjustment() == PendingAdjustment::None
}

/// Close the current throughput sample and apply the sizing controller
fn adjust_max_workers_active(shared: &Arc<PoolShared>, now_ms: u64) {
    // Skipping the sample on contention is fine, another completion will come
    let Some(mut adjustments) = shared.adjustment.try_lock() else {
        return;
    };
    let total_completions = shared.completion_count.load(Ordering::Relaxed);
    let completions = total_completions - adjustments.prior_completion_count;
    let elapsed_seconds =
        (now_ms.saturating_sub(adjustments.current_sample_start_ms)) as f64 / 1_000.0;
    let interval_ms = adjustments.hill.current_sample_interval_ms();
    let mut add_worker = false;
    if elapsed_seconds * 1_000.0 >= f64::from(interval_ms) / 2.0 {
        let counts = shared.counts.load(Ordering::Acquire);
        let old_goal = counts.goal;
        let min_goal = shared.min_threads_goal(&adjustments.blocking);
        let max_threads = shared.max_threads();
        let cpu = shared.cpu_utilization_percent.load(Ordering::Relaxed);
        let (new_goal, next_interval_ms) = adjustments.hill.update(
            old_goal,
            elapsed_seconds,
            completions,
            min_goal,
            max_threads,
            cpu,
        );
        if new_goal != old_goal {
            shared.counts.set_goal(new_goal);
            add_worker = new_goal > old_goal;
        }
        adjustments.prior_completion_count = total_completions;
        adjustments.current_sample_start_ms = now_ms;
        shared
            .next_sample_due_ms
            .store(now_ms + u64::from(next_interval_ms), Ordering::Relaxed);
    }
    drop(adjustments);
    if add_worker {
        maybe_add_working_worker(shared);
    }
}

/// Release processing status once the queues stay empty
fn remove_working_worker(shared: &Arc<PoolShared>) {
    shared.counts.decrement_processing();
    // Work submitted while we were winding down still needs a worker
    if shared.num_requested_workers.load(Ordering::Acquire) > 0 {
        maybe_add_working_worker(shared);
    }
}

/// Try to retire this idle worker, clamping the goal to the remaining
/// thread count
fn try_retire(shared: &Arc<PoolShared>) -> bool {
    let mut adjustments = shared.adjustment.lock();
    let mut counts = shared.counts.load(Ordering::Acquire);
    loop {
        if counts.existing <= counts.processing {
            // Every live thread is processing; this wake-up was consumed by
            // the race, go back to waiting
            return false;
        }
        let new_existing = counts.existing - 1;
        let min_goal = shared.min_threads_goal(&adjustments.blocking);
        let new_goal = min_goal.max(new_existing.min(counts.goal));
        let new = ThreadCounts {
            processing: counts.processing,
            existing: new_existing,
            goal: new_goal,
        };
        match shared
            .counts
            .try_update(counts, new, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(()) => {
                adjustments
                    .hill
                    .force_change(new_goal, Transition::ThreadTimedOut);
                return true;
            }
            Err(updated) => counts = updated,
        }
    }
}

/// Hand leftover local work to the rest of the pool
fn transfer_local_work(shared: &Arc<PoolShared>, local: &Rc<RefCell<LocalQueue<WorkItem>>>) {
    let mut moved = false;
    {
        let mut queue = local.borrow_mut();
        while let Some(item) = queue.pop() {
            shared.queues.global.push(item);
            moved = true;
        }
    }
    if moved {
        pool::ensure_thread_requested(shared);
    }
}

/// Unhook a worker that is done for good
fn release_worker_state(
    shared: &Arc<PoolShared>,
    worker_id: usize,
    local: &Rc<RefCell<LocalQueue<WorkItem>>>,
) {
    transfer_local_work(shared, local);
    shared.queues.unregister(worker_id);
    WORKER_TLS.with(|tls| *tls.borrow_mut() = None);
}

/// Repairs pool state if a work-item panic unwinds through the worker
///
/// Disarmed on every orderly exit path; if it fires, the thread is dying with
/// its counts still registered, so give them back, hand off queued work and
/// wake a replacement.
struct WorkerGuard {
    shared: Arc<PoolShared>,
    worker_id: usize,
    local: Rc<RefCell<LocalQueue<WorkItem>>>,
    holds_processing_slot: Cell<bool>,
    armed: Cell<bool>,
}
//
impl Drop for WorkerGuard {
    fn drop(&mut self) {
        if !self.armed.get() {
            return;
        }
        self.shared
            .counts
            .rollback_thread(self.holds_processing_slot.get());
        release_worker_state(&self.shared, self.worker_id, &self.local);
        if self.shared.num_requested_workers.load(Ordering::Acquire) > 0 {
            maybe_add_working_worker(&self.shared);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::ThreadPoolConfig, ThreadPool};
    use std::{
        sync::atomic::AtomicUsize,
        time::{Duration, Instant},
    };

    /// A panicking work item must not corrupt counts or lose queued work
    #[test]
    fn work_item_panic_does_not_poison_the_pool() {
        let pool = ThreadPool::with_config(ThreadPoolConfig {
            min_threads: 1,
            max_threads: 2,
            ..Default::default()
        })
        .unwrap();
        pool.submit(|| panic!("work item panic"), false);
        let ran = Arc::new(AtomicUsize::new(0));
        {
            let ran = ran.clone();
            pool.submit(move || drop(ran.fetch_add(1, Ordering::Relaxed)), false);
        }
        let deadline = Instant::now() + Duration::from_secs(5);
        while ran.load(Ordering::Relaxed) == 0 {
            assert!(
                Instant::now() < deadline,
                "pool stopped executing after a work-item panic"
            );
            std::thread::sleep(Duration::from_millis(1));
        }
        let counts = pool.shared.counts.load(Ordering::Relaxed);
        assert!(counts.processing <= counts.existing);
    }
}
