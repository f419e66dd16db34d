//! Per-worker stealable work queue
//!
//! Each worker owns one resizable ring buffer that it pushes to and pops from
//! at the tail, lock-free in the common case. Other threads remove work from
//! the head, one at a time, under a try-lock: stealing is a slow path that
//! only sees traffic when the owner has fallen behind, so sacrificing
//! lock-freedom there buys a much simpler synchronization protocol than a
//! fully lock-free deque would need.
//!
//! The same lock serializes the rare owner operations that cannot be
//! expressed against a concurrent stealer: growing the buffer, removing an
//! element from the middle, and the boundary case where the owner and a thief
//! race for the last remaining element.
//!
//! Cursors are monotonically increasing 64-bit counts; a slot's position is
//! the cursor masked by the power-of-two buffer length, so growth re-indexes
//! the occupied range `[head, tail)` simply by re-masking under the larger
//! buffer. 64 bits do not wrap in any realistic execution, which removes the
//! need for periodic index normalization.

use crossbeam::utils::CachePadded;
#[cfg(test)]
use proptest::prelude::*;
use std::{
    cell::{Cell, UnsafeCell},
    fmt,
    marker::PhantomData,
    mem::MaybeUninit,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

/// Worker-side interface to the work queue
//
// --- Implementation notes ---
//
// PhantomData<Cell> is used to make this type !Sync as it's not meant to be
// used from multiple threads.
pub struct LocalQueue<T>(Arc<SharedQueue<T>>, PhantomData<Cell<u8>>);
//
impl<T> LocalQueue<T> {
    /// Set up a work queue
    ///
    /// The buffer length is `capacity` rounded up to a power of two; one slot
    /// always stays free so that a claimed head slot can never collide with
    /// an incoming tail write.
    pub fn new(capacity: usize) -> Self {
        Self(
            Arc::new(SharedQueue {
                buffer: UnsafeCell::new(Buffer::new(capacity.next_power_of_two().max(2))),
                head: CachePadded::new(AtomicU64::new(0)),
                tail: CachePadded::new(AtomicU64::new(0)),
                steal_lock: CachePadded::new(AtomicBool::new(false)),
            }),
            PhantomData,
        )
    }

    /// Set up a thief-side interface to this work queue
    pub fn stealer(&self) -> Stealer<T> {
        Stealer(self.0.clone())
    }

    /// Push work on the owner side of the queue
    ///
    /// If it is not stolen first, this work will be popped in LIFO order,
    /// which favors recently produced, cache-hot items. When the buffer is
    /// full it is grown under the steal lock, so pushing never fails.
    #[inline]
    pub fn push(&mut self, work: T) {
        loop {
            let shared = &*self.0;
            // Only the owner moves the tail, so a relaxed read is the owner
            // talking to itself. The head read may lag behind concurrent
            // steals, which only under-estimates the available room.
            let tail = shared.tail.load(Ordering::Relaxed);
            let head = shared.head.load(Ordering::Acquire);
            // SAFETY: Only the owner mutates the buffer, and never while a
            //         routine that could run concurrently with this one does.
            let buffer = unsafe { &*shared.buffer.get() };
            if tail.wrapping_sub(head) < buffer.capacity() {
                // SAFETY: The slot at `tail` lies outside the occupied range
                //         [head, tail), and the one-slot spacing enforced by
                //         `capacity()` keeps it out of reach of any stealer
                //         that has already claimed the slot before `head`.
                unsafe { buffer.write(tail, work) };

                // Release ordering makes the slot write visible to any thread
                // that observes the new tail
                shared.tail.store(tail + 1, Ordering::Release);
                return;
            }
            self.grow();
        }
    }

    /// Pop the next work item from the owner side of the queue, if any
    ///
    /// Pops in LIFO order with respect to [`push()`](Self::push). An empty
    /// result is a normal "no item" outcome, never an error.
    #[inline]
    pub fn pop(&mut self) -> Option<T> {
        let shared = &*self.0;
        let tail = shared.tail.load(Ordering::Relaxed);
        if shared.head.load(Ordering::Relaxed) >= tail {
            return None;
        }

        // Claim the slot before the tail by publishing the new tail, then
        // re-check the head. The swap is a full fence: it cannot reorder with
        // the head load that follows, and together with the same construction
        // on the steal side it guarantees that for the last remaining element
        // at most one of the two claims can survive the cross-check.
        let new_tail = tail - 1;
        shared.tail.swap(new_tail, Ordering::SeqCst);
        let head = shared.head.load(Ordering::SeqCst);
        if head <= new_tail {
            // SAFETY: The claim above fenced this slot off from stealers
            let buffer = unsafe { &*shared.buffer.get() };
            // SAFETY: Slot `new_tail` was inside the occupied range and is
            //         now claimed exclusively by the owner
            return Some(unsafe { buffer.read(new_tail) });
        }

        // A thief may have concurrently claimed this last element; settle the
        // race under the steal lock
        let _lock = shared.lock_steals();
        if shared.head.load(Ordering::Relaxed) <= new_tail {
            // SAFETY: As above, with the lock additionally excluding thieves
            let buffer = unsafe { &*shared.buffer.get() };
            // SAFETY: As above
            Some(unsafe { buffer.read(new_tail) })
        } else {
            // Lost the race: the thief took the element, restore the tail
            shared.tail.store(tail, Ordering::SeqCst);
            None
        }
    }

    /// Remove the newest queued item matching a predicate, wherever it sits
    ///
    /// Runs under the steal lock and compacts the buffer, preserving the
    /// relative order of the remaining items, so that the occupied range
    /// stays exactly `[head, tail)`.
    pub fn find_and_pop(&mut self, mut predicate: impl FnMut(&T) -> bool) -> Option<T> {
        let shared = &*self.0;
        let _lock = shared.lock_steals();
        let head = shared.head.load(Ordering::Relaxed);
        let tail = shared.tail.load(Ordering::Relaxed);
        // SAFETY: The steal lock excludes thieves and the owner (us) does
        //         nothing else concurrently
        let buffer = unsafe { &*shared.buffer.get() };
        let mut cursor = tail;
        while cursor > head {
            cursor -= 1;
            // SAFETY: `cursor` is inside the occupied range, which we have
            //         exclusive access to under the lock
            if predicate(unsafe { buffer.peek(cursor) }) {
                // SAFETY: As above; the shift below removes the vacated slot
                //         from the occupied range before anyone else looks
                let result = unsafe { buffer.read(cursor) };
                for idx in cursor..tail - 1 {
                    // SAFETY: Moves within the exclusively-owned range
                    unsafe { buffer.write(idx, buffer.read(idx + 1)) };
                }
                shared.tail.store(tail - 1, Ordering::SeqCst);
                return Some(result);
            }
        }
        None
    }

    /// Current number of enqueued items
    ///
    /// Should be considered immediately stale if stealers have access.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Truth that the queue currently holds no items
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Double the buffer, re-indexing the occupied range under the new mask
    #[cold]
    fn grow(&mut self) {
        let shared = &*self.0;
        let _lock = shared.lock_steals();
        let head = shared.head.load(Ordering::Relaxed);
        let tail = shared.tail.load(Ordering::Relaxed);
        // SAFETY: The steal lock excludes thieves, and only the owner (us)
        //         ever replaces the buffer
        let buffer = unsafe { &mut *shared.buffer.get() };
        let new = Buffer::new(buffer.len() * 2);
        for idx in head..tail {
            // SAFETY: Reading the occupied range of the old buffer exactly
            //         once, writing disjoint fresh slots of the new one
            unsafe { new.write(idx, buffer.read(idx)) };
        }
        *buffer = new;
    }
}
//
// The queued items need not be Debug, so the derived impl would be too narrow
impl<T> fmt::Debug for LocalQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalQueue")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}
//
// SAFETY: Moving the owner end to another thread is fine, it is concurrent
//         use from several threads at once that the protocol forbids (and
//         PhantomData<Cell> rules out by making the type !Sync)
unsafe impl<T: Send> Send for LocalQueue<T> {}

/// Thief-side interface to a work queue
pub struct Stealer<T>(Arc<SharedQueue<T>>);
//
impl<T> Stealer<T> {
    /// Try to steal the oldest item from the queue
    ///
    /// Never blocks: if the steal lock is busy or the owner wins the race for
    /// the last element, this returns `None` and sets `missed_steal` so the
    /// caller knows the queue may still hold work worth retrying for.
    pub fn steal(&self, missed_steal: &mut bool) -> Option<T> {
        let shared = &*self.0;

        // Cheap emptiness probe before touching the lock
        let head = shared.head.load(Ordering::Acquire);
        if head >= shared.tail.load(Ordering::Acquire) {
            return None;
        }

        let Some(_lock) = shared.try_lock_steals() else {
            *missed_steal = true;
            return None;
        };

        // Claim the head slot by publishing the new head, then re-check the
        // tail; see `LocalQueue::pop()` for how the two fences interlock
        let head = shared.head.load(Ordering::Relaxed);
        shared.head.swap(head + 1, Ordering::SeqCst);
        let tail = shared.tail.load(Ordering::SeqCst);
        if head < tail {
            // SAFETY: The claim above fenced this slot off from the owner,
            //         and the lock excludes other thieves
            let buffer = unsafe { &*shared.buffer.get() };
            // SAFETY: Slot `head` was inside the occupied range and is now
            //         exclusively ours
            Some(unsafe { buffer.read(head) })
        } else {
            // The owner popped the last element first; undo the claim
            shared.head.store(head, Ordering::SeqCst);
            *missed_steal = true;
            None
        }
    }

    /// Estimate of the number of enqueued items
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Truth that the queue looks empty right now
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hold the steal lock, for tests that need a deterministically
    /// contended queue
    #[cfg(test)]
    fn hold_lock_for_test(&self) -> StealLock<'_, T> {
        self.0.lock_steals()
    }
}
//
impl<T> Clone for Stealer<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}
//
impl<T> fmt::Debug for Stealer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stealer")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

/// State shared between the owner and the thieves
struct SharedQueue<T> {
    /// Ring storage, replaced by the owner on growth (under the steal lock)
    buffer: UnsafeCell<Buffer<T>>,

    /// Cursor before the oldest element; moved forward by thieves
    head: CachePadded<AtomicU64>,

    /// Cursor after the newest element; moved by the owner only
    tail: CachePadded<AtomicU64>,

    /// Serializes thieves against each other and against the owner's
    /// growth/compaction/boundary paths
    steal_lock: CachePadded<AtomicBool>,
}
//
impl<T> SharedQueue<T> {
    /// Estimate of the number of enqueued items
    fn len(&self) -> usize {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Relaxed);
        tail.saturating_sub(head) as usize
    }

    /// Attempt to acquire the steal lock without blocking
    fn try_lock_steals(&self) -> Option<StealLock<'_, T>> {
        (!self.steal_lock.swap(true, Ordering::Acquire)).then_some(StealLock(self))
    }

    /// Acquire the steal lock, spinning until it is available
    ///
    /// Only the owner uses this; steals hold the lock for the duration of an
    /// element move, so the wait is short.
    fn lock_steals(&self) -> StealLock<'_, T> {
        loop {
            if let Some(lock) = self.try_lock_steals() {
                return lock;
            }
            std::hint::spin_loop();
        }
    }
}
//
// SAFETY: All cross-thread access is synchronized by the cursor/lock
//         protocol, so the shared state can travel with its owning handles
unsafe impl<T: Send> Send for SharedQueue<T> {}
unsafe impl<T: Send> Sync for SharedQueue<T> {}
//
impl<T> Drop for SharedQueue<T> {
    fn drop(&mut self) {
        let head = *self.head.get_mut();
        let tail = *self.tail.get_mut();
        let buffer = self.buffer.get_mut();
        for idx in head..tail {
            // SAFETY: `&mut self` means no handle is left; the occupied range
            //         holds initialized elements that were never read out
            unsafe { drop(buffer.read(idx)) };
        }
    }
}

/// Proof of steal-lock ownership, releasing the lock on `Drop`
struct StealLock<'queue, T>(&'queue SharedQueue<T>);
//
impl<T> Drop for StealLock<'_, T> {
    fn drop(&mut self) {
        self.0.steal_lock.store(false, Ordering::Release);
    }
}

/// Ring buffer of maybe-occupied slots
#[derive(Debug)]
struct Buffer<T> {
    /// Power-of-two slot storage
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
}
//
impl<T> Buffer<T> {
    /// Allocate a buffer of `len` slots (must be a power of two)
    fn new(len: usize) -> Self {
        debug_assert!(len.is_power_of_two());
        Self {
            slots: std::iter::repeat_with(|| UnsafeCell::new(MaybeUninit::uninit()))
                .take(len)
                .collect(),
        }
    }

    /// Number of slots
    fn len(&self) -> usize {
        self.slots.len()
    }

    /// Usable capacity, leaving the one-slot safety gap
    fn capacity(&self) -> u64 {
        (self.slots.len() - 1) as u64
    }

    /// Slot position of a cursor
    fn slot(&self, cursor: u64) -> &UnsafeCell<MaybeUninit<T>> {
        &self.slots[(cursor & (self.slots.len() as u64 - 1)) as usize]
    }

    /// Write a value into the slot at `cursor`
    ///
    /// # Safety
    ///
    /// The caller must have exclusive access to this slot, and the slot must
    /// not hold an unread initialized value.
    unsafe fn write(&self, cursor: u64, value: T) {
        // SAFETY: Per function precondition
        unsafe { (*self.slot(cursor).get()).write(value) };
    }

    /// Move the value out of the slot at `cursor`
    ///
    /// # Safety
    ///
    /// The caller must have exclusive access to this slot, and the slot must
    /// hold an initialized value that no one else will read again.
    unsafe fn read(&self, cursor: u64) -> T {
        // SAFETY: Per function precondition
        unsafe { (*self.slot(cursor).get()).assume_init_read() }
    }

    /// Borrow the value in the slot at `cursor`
    ///
    /// # Safety
    ///
    /// The caller must have exclusive access to this slot, and the slot must
    /// hold an initialized value.
    unsafe fn peek(&self, cursor: u64) -> &T {
        // SAFETY: Per function precondition
        unsafe { (*self.slot(cursor).get()).assume_init_ref() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        collections::HashSet,
        sync::atomic::{AtomicBool, AtomicUsize},
        time::Duration,
    };

    #[test]
    fn lifo_pop_order() {
        let mut queue = LocalQueue::new(8);
        for value in 0..5 {
            queue.push(value);
        }
        assert_eq!(queue.len(), 5);
        for value in (0..5).rev() {
            assert_eq!(queue.pop(), Some(value));
        }
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn fifo_steal_order() {
        let mut queue = LocalQueue::new(8);
        let stealer = queue.stealer();
        for value in 0..5 {
            queue.push(value);
        }
        let mut missed = false;
        for value in 0..5 {
            assert_eq!(stealer.steal(&mut missed), Some(value));
        }
        assert_eq!(stealer.steal(&mut missed), None);
        assert!(!missed);
    }

    #[test]
    fn growth_preserves_contents() {
        let mut queue = LocalQueue::new(2);
        for value in 0..100 {
            queue.push(value);
        }
        assert_eq!(queue.len(), 100);
        for value in (0..100).rev() {
            assert_eq!(queue.pop(), Some(value));
        }
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn find_and_pop_compacts() {
        let mut queue = LocalQueue::new(8);
        for value in 0..6 {
            queue.push(value);
        }
        assert_eq!(queue.find_and_pop(|&v| v == 3), Some(3));
        assert_eq!(queue.find_and_pop(|&v| v == 3), None);
        assert_eq!(queue.len(), 5);
        for value in [5, 4, 2, 1, 0] {
            assert_eq!(queue.pop(), Some(value));
        }
    }

    #[test]
    fn find_and_pop_takes_newest_match() {
        let mut queue = LocalQueue::new(8);
        queue.push((0, 'a'));
        queue.push((1, 'b'));
        queue.push((2, 'a'));
        assert_eq!(queue.find_and_pop(|&(_, tag)| tag == 'a'), Some((2, 'a')));
        assert_eq!(queue.find_and_pop(|&(_, tag)| tag == 'a'), Some((0, 'a')));
        assert_eq!(queue.pop(), Some((1, 'b')));
    }

    #[test]
    fn locked_queue_reports_missed_steal() {
        let mut queue = LocalQueue::new(8);
        queue.push(42);
        let stealer = queue.stealer();
        let contender = queue.stealer();
        let _lock = stealer.hold_lock_for_test();
        let mut missed = false;
        assert_eq!(contender.steal(&mut missed), None);
        assert!(missed);
    }

    #[test]
    fn drops_unconsumed_items() {
        let payload = Arc::new(());
        let mut queue = LocalQueue::new(4);
        for _ in 0..10 {
            queue.push(payload.clone());
        }
        assert!(queue.pop().is_some());
        assert_eq!(Arc::strong_count(&payload), 10);
        drop(queue);
        assert_eq!(Arc::strong_count(&payload), 1);
    }

    proptest! {
        /// Single-threaded transactions behave like a double-ended list
        #[test]
        fn model(ops in prop::collection::vec(0u8..4, 1..100)) {
            let mut queue = LocalQueue::new(2);
            let stealer = queue.stealer();
            let mut model = std::collections::VecDeque::new();
            let mut next_value = 0u32;
            let mut missed = false;
            for op in ops {
                match op {
                    0 | 1 => {
                        queue.push(next_value);
                        model.push_back(next_value);
                        next_value += 1;
                    }
                    2 => prop_assert_eq!(queue.pop(), model.pop_back()),
                    _ => prop_assert_eq!(stealer.steal(&mut missed), model.pop_front()),
                }
                prop_assert_eq!(queue.len(), model.len());
            }
        }
    }

    /// Concurrent owner + thieves: every pushed item is consumed exactly once
    #[test]
    fn steals_are_exclusive_and_lossless() {
        const ITEMS: usize = 100_000;
        const THIEVES: usize = 4;

        let mut queue = LocalQueue::new(4);
        let done = Arc::new(AtomicBool::new(false));
        let stolen_total = Arc::new(AtomicUsize::new(0));

        let thieves = (0..THIEVES)
            .map(|_| {
                let stealer = queue.stealer();
                let done = done.clone();
                let stolen_total = stolen_total.clone();
                std::thread::spawn(move || {
                    let mut stolen = Vec::new();
                    loop {
                        let mut missed = false;
                        if let Some(value) = stealer.steal(&mut missed) {
                            stolen.push(value);
                            stolen_total.fetch_add(1, Ordering::Relaxed);
                        } else if !missed && done.load(Ordering::Acquire) {
                            break;
                        } else {
                            std::thread::sleep(Duration::from_nanos(1));
                        }
                    }
                    stolen
                })
            })
            .collect::<Vec<_>>();

        let popped = std::thread::spawn(move || {
            let mut popped = Vec::new();
            for value in 0..ITEMS {
                queue.push(value);
                if value % 3 == 0 {
                    popped.extend(queue.pop());
                }
            }
            while let Some(value) = queue.pop() {
                popped.push(value);
            }
            popped
        })
        .join()
        .unwrap();
        done.store(true, Ordering::Release);

        let mut seen = HashSet::new();
        let mut insert_all = |values: Vec<usize>| {
            for value in values {
                assert!(seen.insert(value), "item {value} was consumed twice");
            }
        };
        insert_all(popped);
        for thief in thieves {
            insert_all(thief.join().unwrap());
        }
        assert_eq!(seen.len(), ITEMS, "some items were lost");
    }
}
