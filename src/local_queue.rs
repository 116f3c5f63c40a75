//! Worker-local work-stealing queue.
//!
//! Each worker owns one `LocalQueue`. The owner pushes and pops at the tail
//! end (LIFO); every other worker steals from the head end (FIFO). The
//! owner's push and pop fast paths are lock-free; growth, index overflow,
//! the contended pop, find-and-remove, and every steal serialize on one
//! short-held mutex, so at most one contended critical section exists per
//! queue.
//!
//! `head` and `tail` are monotonically increasing 32-bit logical indices
//! masked into a power-of-two slot array. Slots hold epoch-managed item
//! pointers; a null slot inside `[head, tail)` marks an item that was
//! removed in place or raced away, and both pop and steal skip over it.

use crossbeam::epoch::{self, Atomic, Owned, Shared};
use std::cell::UnsafeCell;
use std::sync::atomic::{fence, AtomicI32, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use crate::shared_queue::SharedQueue;
use crate::work_item::WorkItem;

/// Initial slot count. Power of two.
const INITIAL_CAPACITY: usize = 32;

/// Logical index value at which both indices are masked back down. All ones
/// in the low bits, so masking preserves both the ordering of the indices
/// and their distance modulo the capacity.
const INDEX_LIMIT: i32 = i32::MAX;

pub struct LocalQueue {
    /// Slot array, replaced on growth by the owner under the foreign lock.
    slots: UnsafeCell<Box<[Atomic<WorkItem>]>>,
    /// Capacity minus one; rewritten only on growth under the foreign lock.
    mask: AtomicUsize,
    /// Thief end. Written by thieves and by the owner's slow paths.
    head: AtomicI32,
    /// Owner end. Written only by the owner.
    tail: AtomicI32,
    /// Serializes growth, overflow masking, contended pops, slow
    /// find-and-remove, steals, and diagnostic scans.
    foreign_lock: Mutex<()>,
}

// Slot accesses are atomic pointers; the array itself is only replaced by
// the owner while holding the foreign lock, which every other-thread reader
// also holds.
unsafe impl Send for LocalQueue {}
unsafe impl Sync for LocalQueue {}

impl LocalQueue {
    pub fn new() -> Self {
        let slots: Vec<Atomic<WorkItem>> = (0..INITIAL_CAPACITY).map(|_| Atomic::null()).collect();
        LocalQueue {
            slots: UnsafeCell::new(slots.into_boxed_slice()),
            mask: AtomicUsize::new(INITIAL_CAPACITY - 1),
            head: AtomicI32::new(0),
            tail: AtomicI32::new(0),
            foreign_lock: Mutex::new(()),
        }
    }

    fn slots(&self) -> &[Atomic<WorkItem>] {
        unsafe { &*self.slots.get() }
    }

    fn slot(&self, index: i32, mask: usize) -> &Atomic<WorkItem> {
        &self.slots()[index as usize & mask]
    }

    fn lock_foreign(&self) -> std::sync::MutexGuard<'_, ()> {
        // The lock guards no data of its own; a panicked holder leaves
        // nothing to repair.
        self.foreign_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends an item at the tail. Owner only.
    pub fn push(&self, item: WorkItem) {
        let mut tail = self.tail.load(Ordering::Relaxed);
        if tail == INDEX_LIMIT {
            tail = self.mask_indices_down();
        }

        let head = self.head.load(Ordering::Acquire);
        let mask = self.mask.load(Ordering::Relaxed);

        if (tail as i64) < head as i64 + mask as i64 {
            // At least two slots free: no in-flight thief can land on this
            // slot, so the item publishes without the lock. The release on
            // the tail store pairs with the acquire on the thief's tail
            // read, ordering the slot write before the index becomes
            // visible.
            self.slot(tail, mask).store(Owned::new(item), Ordering::Release);
            self.tail.store(tail + 1, Ordering::Release);
        } else {
            let _lock = self.lock_foreign();
            let head = self.head.load(Ordering::Relaxed);
            let count = tail - head;
            let mut mask = mask;
            if count >= mask as i32 {
                mask = self.grow(head, tail);
                tail = count;
            }
            self.slot(tail, mask).store(Owned::new(item), Ordering::Release);
            self.tail.store(tail + 1, Ordering::Release);
        }
    }

    /// Masks both indices back into the array range. Taken when `tail`
    /// reaches the largest representable index.
    #[cold]
    fn mask_indices_down(&self) -> i32 {
        let _lock = self.lock_foreign();
        let tail = self.tail.load(Ordering::Relaxed);
        if tail == INDEX_LIMIT {
            let mask = self.mask.load(Ordering::Relaxed) as i32;
            self.head
                .store(self.head.load(Ordering::Relaxed) & mask, Ordering::Relaxed);
            self.tail.store(tail & mask, Ordering::Relaxed);
        }
        self.tail.load(Ordering::Relaxed)
    }

    /// Removes the most recently pushed item. Owner only.
    pub fn pop(&self) -> Option<WorkItem> {
        let guard = &epoch::pin();

        loop {
            let tail = self.tail.load(Ordering::Relaxed);
            if self.head.load(Ordering::Relaxed) >= tail {
                return None;
            }
            let tail = tail - 1;

            // The swap and fence keep the head read below from moving
            // ahead of the tail decrement; paired with the mirror-image
            // sequence in `steal`, at most one side can claim the last
            // item.
            self.tail.swap(tail, Ordering::SeqCst);
            fence(Ordering::SeqCst);

            if self.head.load(Ordering::Relaxed) <= tail {
                let mask = self.mask.load(Ordering::Relaxed);
                let taken = self.slot(tail, mask).swap(Shared::null(), Ordering::AcqRel, guard);
                match unsafe { taken.as_ref() } {
                    // Removed in place earlier; keep walking down.
                    None => continue,
                    Some(item) => {
                        let item = item.clone();
                        unsafe { guard.defer_destroy(taken) };
                        return Some(item);
                    }
                }
            } else {
                // Zero or one item left: interlock with thieves.
                let lock = self.lock_foreign();
                if self.head.load(Ordering::Relaxed) <= tail {
                    let mask = self.mask.load(Ordering::Relaxed);
                    let taken = self.slot(tail, mask).swap(Shared::null(), Ordering::AcqRel, guard);
                    match unsafe { taken.as_ref() } {
                        None => {
                            drop(lock);
                            continue;
                        }
                        Some(item) => {
                            let item = item.clone();
                            unsafe { guard.defer_destroy(taken) };
                            return Some(item);
                        }
                    }
                } else {
                    // A thief won the race for the last item.
                    self.tail.store(tail + 1, Ordering::Relaxed);
                    return None;
                }
            }
        }
    }

    /// Attempts to take the oldest item. Any thread but the owner.
    ///
    /// A contended foreign lock is not retried here; it sets `missed_steal`
    /// so the dispatcher can request another worker for the load the owner
    /// is sitting on.
    pub fn steal(&self, missed_steal: &mut bool) -> Option<WorkItem> {
        let guard = &epoch::pin();

        loop {
            if !self.can_steal() {
                return None;
            }
            let lock = match self.foreign_lock.try_lock() {
                Ok(lock) => lock,
                Err(_) => {
                    *missed_steal = true;
                    return None;
                }
            };

            let head = self.head.load(Ordering::Relaxed);
            self.head.swap(head + 1, Ordering::SeqCst);
            fence(Ordering::SeqCst);

            if head < self.tail.load(Ordering::Acquire) {
                let mask = self.mask.load(Ordering::Relaxed);
                let taken = self.slot(head, mask).swap(Shared::null(), Ordering::AcqRel, guard);
                match unsafe { taken.as_ref() } {
                    // Removed in place; release the lock and try the next
                    // index.
                    None => {
                        drop(lock);
                        continue;
                    }
                    Some(item) => {
                        let item = item.clone();
                        unsafe { guard.defer_destroy(taken) };
                        return Some(item);
                    }
                }
            } else {
                // The owner drained the queue under us; put the head back.
                self.head.store(head, Ordering::Relaxed);
                return None;
            }
        }
    }

    /// Whether a steal attempt looks worthwhile.
    pub fn can_steal(&self) -> bool {
        self.head.load(Ordering::Acquire) < self.tail.load(Ordering::Acquire)
    }

    /// Removes a specific pending item. Owner only.
    ///
    /// Returns true when the item was found and removed before any worker
    /// dispatched it.
    pub fn find_and_remove(&self, item: &WorkItem) -> bool {
        let guard = &epoch::pin();
        let tail = self.tail.load(Ordering::Relaxed);
        if self.head.load(Ordering::Relaxed) >= tail {
            return false;
        }
        let mask = self.mask.load(Ordering::Relaxed);

        // Fast path: the item sits where pop will look first.
        let top = self.slot(tail - 1, mask).load(Ordering::Acquire, guard);
        if unsafe { top.as_ref() }.is_some_and(|top| top.same_item(item)) {
            let popped = self.pop();
            debug_assert!(popped.as_ref().map_or(true, |p| p.same_item(item)));
            return popped.is_some();
        }

        // Slow path: scan from below the tail toward the head.
        let mut index = tail - 2;
        while index >= self.head.load(Ordering::Relaxed) {
            let candidate = self.slot(index, mask).load(Ordering::Acquire, guard);
            if unsafe { candidate.as_ref() }.is_some_and(|c| c.same_item(item)) {
                let _lock = self.lock_foreign();
                let current = self.slot(index, mask).load(Ordering::Relaxed, guard);
                match unsafe { current.as_ref() } {
                    Some(cur) if cur.same_item(item) => {
                        self.slot(index, mask).store(Shared::null(), Ordering::Release);
                        unsafe { guard.defer_destroy(current) };
                        // A hole at either end can be closed immediately;
                        // anywhere else it stays for pop and steal to skip.
                        if index + 1 == self.tail.load(Ordering::Relaxed) {
                            self.tail.store(index, Ordering::Relaxed);
                        } else if index == self.head.load(Ordering::Relaxed) {
                            self.head.store(index + 1, Ordering::Relaxed);
                        }
                        return true;
                    }
                    // A thief got there first.
                    _ => return false,
                }
            }
            index -= 1;
        }
        false
    }

    /// Approximate number of pending items.
    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        (tail - head).max(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pops every remaining item into `target`, returning how many moved.
    /// Owner only; used when a worker leaves the dispatcher.
    pub fn drain_to(&self, target: &SharedQueue<WorkItem>) -> usize {
        let mut moved = 0;
        while let Some(item) = self.pop() {
            target.push(item);
            moved += 1;
        }
        moved
    }

    /// Best-effort copy of the pending items for diagnostics.
    ///
    /// Holds the foreign lock to keep growth and thieves out; the owner's
    /// lock-free pops may still race the walk, so an item being dispatched
    /// can appear in the copy.
    pub fn snapshot(&self) -> Vec<WorkItem> {
        let guard = &epoch::pin();
        let _lock = self.lock_foreign();

        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Relaxed);
        let mask = self.mask.load(Ordering::Relaxed);

        let mut items = Vec::new();
        let mut index = head;
        while index < tail {
            let slot = self.slot(index, mask).load(Ordering::Acquire, guard);
            if let Some(item) = unsafe { slot.as_ref() } {
                items.push(item.clone());
            }
            index += 1;
        }
        items
    }

    /// Doubles the slot array and rebases the indices so `head` is zero.
    /// Caller holds the foreign lock and is the owner.
    fn grow(&self, head: i32, tail: i32) -> usize {
        let guard = &epoch::pin();
        let old_mask = self.mask.load(Ordering::Relaxed);
        let new_capacity = (old_mask + 1) * 2;
        let count = (tail - head) as usize;

        let new_slots: Vec<Atomic<WorkItem>> = (0..new_capacity).map(|_| Atomic::null()).collect();
        let new_slots = new_slots.into_boxed_slice();
        for offset in 0..count {
            let taken = self
                .slot(head + offset as i32, old_mask)
                .swap(Shared::null(), Ordering::Relaxed, guard);
            new_slots[offset].store(taken, Ordering::Relaxed);
        }

        unsafe { *self.slots.get() = new_slots };
        self.mask.store(new_capacity - 1, Ordering::Relaxed);
        self.head.store(0, Ordering::Relaxed);
        self.tail.store(count as i32, Ordering::Relaxed);
        new_capacity - 1
    }

    #[cfg(test)]
    pub(crate) fn hold_foreign_lock(&self) -> std::sync::MutexGuard<'_, ()> {
        self.lock_foreign()
    }

    #[cfg(test)]
    fn seed_indices(&self, head: i32, tail: i32) {
        assert_eq!(head, tail, "index seeding requires an empty queue");
        self.head.store(head, Ordering::Relaxed);
        self.tail.store(tail, Ordering::Relaxed);
    }
}

impl Default for LocalQueue {
    fn default() -> Self {
        LocalQueue::new()
    }
}

impl Drop for LocalQueue {
    fn drop(&mut self) {
        // Exclusive access: free whatever is still queued.
        unsafe {
            let guard = epoch::unprotected();
            let head = self.head.load(Ordering::Relaxed);
            let tail = self.tail.load(Ordering::Relaxed);
            let mask = self.mask.load(Ordering::Relaxed);
            for index in head..tail {
                let slot = &self.slots()[index as usize & mask];
                let taken = slot.swap(Shared::null(), Ordering::Relaxed, guard);
                if !taken.is_null() {
                    drop(taken.into_owned());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;

    fn tagged(tag: usize, log: &Arc<std::sync::Mutex<Vec<usize>>>) -> WorkItem {
        let log = log.clone();
        WorkItem::from_fn(move || log.lock().unwrap().push(tag))
    }

    fn marker() -> WorkItem {
        WorkItem::from_fn(|| {})
    }

    #[test]
    fn test_owner_lifo_order() {
        let queue = LocalQueue::new();
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));

        for tag in [1, 2, 3] {
            queue.push(tagged(tag, &log));
        }
        while let Some(item) = queue.pop() {
            item.execute();
        }

        assert_eq!(*log.lock().unwrap(), vec![3, 2, 1]);
    }

    #[test]
    fn test_thief_fifo_order() {
        let queue = LocalQueue::new();
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));

        for tag in [1, 2, 3] {
            queue.push(tagged(tag, &log));
        }

        let mut missed = false;
        while let Some(item) = queue.steal(&mut missed) {
            item.execute();
        }

        assert!(!missed);
        assert_eq!(*log.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_growth_preserves_all_items() {
        let queue = LocalQueue::new();
        let executed = Arc::new(AtomicUsize::new(0));

        for _ in 0..100 {
            let executed = executed.clone();
            queue.push(WorkItem::from_fn(move || {
                executed.fetch_add(1, Ordering::SeqCst);
            }));
        }
        assert_eq!(queue.len(), 100);

        while let Some(item) = queue.pop() {
            item.execute();
        }
        assert_eq!(executed.load(Ordering::SeqCst), 100);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_index_overflow_masks_down() {
        let queue = LocalQueue::new();
        queue.seed_indices(INDEX_LIMIT, INDEX_LIMIT);

        let executed = Arc::new(AtomicUsize::new(0));
        let executed_clone = executed.clone();
        queue.push(WorkItem::from_fn(move || {
            executed_clone.fetch_add(1, Ordering::SeqCst);
        }));

        // Both indices came back into the array range.
        assert!(queue.tail.load(Ordering::Relaxed) < INITIAL_CAPACITY as i32 + 1);
        assert!(queue.head.load(Ordering::Relaxed) <= queue.tail.load(Ordering::Relaxed));

        let item = queue.pop().expect("pushed item survives the masking");
        item.execute();
        assert_eq!(executed.load(Ordering::SeqCst), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_find_and_remove_tail_fast_path() {
        let queue = LocalQueue::new();
        let target = marker();
        queue.push(marker());
        queue.push(target.clone());

        assert!(queue.find_and_remove(&target));
        assert!(!queue.find_and_remove(&target));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_find_and_remove_interior_leaves_hole() {
        let queue = LocalQueue::new();
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));

        queue.push(tagged(1, &log));
        let target = marker();
        queue.push(target.clone());
        queue.push(tagged(3, &log));

        assert!(queue.find_and_remove(&target));

        // The hole where the removed item sat is skipped by pop.
        while let Some(item) = queue.pop() {
            item.execute();
        }
        assert_eq!(*log.lock().unwrap(), vec![3, 1]);
    }

    #[test]
    fn test_find_and_remove_missing_item() {
        let queue = LocalQueue::new();
        queue.push(marker());
        let never_queued = marker();

        assert!(!queue.find_and_remove(&never_queued));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_last_item_claimed_once() {
        // Owner pop and a thief race for a single item each round. A round
        // may end with neither side winning (both back off and the item
        // stays queued), but an item must never be claimed twice.
        let queue = Arc::new(LocalQueue::new());
        let rounds = 2000;
        let claims = Arc::new(AtomicUsize::new(0));

        let start = Arc::new(std::sync::Barrier::new(2));
        let round_sync = Arc::new(std::sync::Barrier::new(2));

        let thief = {
            let queue = queue.clone();
            let claims = claims.clone();
            let start = start.clone();
            let round_sync = round_sync.clone();
            thread::spawn(move || {
                start.wait();
                for _ in 0..rounds {
                    let mut missed = false;
                    if queue.steal(&mut missed).is_some() {
                        claims.fetch_add(1, Ordering::SeqCst);
                    }
                    round_sync.wait();
                }
            })
        };

        start.wait();
        for _ in 0..rounds {
            queue.push(marker());
            if queue.pop().is_some() {
                claims.fetch_add(1, Ordering::SeqCst);
            }
            round_sync.wait();
        }
        thief.join().unwrap();

        // Rounds where both sides backed off leave their item queued.
        let mut leftover = 0;
        let mut missed = false;
        while queue.steal(&mut missed).is_some() {
            leftover += 1;
        }
        assert_eq!(claims.load(Ordering::SeqCst) + leftover, rounds);
    }

    #[test]
    fn test_concurrent_steal_delivers_each_item_once() {
        let queue = Arc::new(LocalQueue::new());
        let total = 10_000;
        let stolen = Arc::new(AtomicUsize::new(0));
        let popped = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let executed = Arc::new(AtomicUsize::new(0));

        let thieves: Vec<_> = (0..3)
            .map(|_| {
                let queue = queue.clone();
                let stolen = stolen.clone();
                let done = done.clone();
                thread::spawn(move || {
                    let mut missed = false;
                    while !done.load(Ordering::Acquire) || queue.can_steal() {
                        if let Some(item) = queue.steal(&mut missed) {
                            item.execute();
                            stolen.fetch_add(1, Ordering::SeqCst);
                        }
                        missed = false;
                    }
                })
            })
            .collect();

        for _ in 0..total {
            let executed = executed.clone();
            queue.push(WorkItem::from_fn(move || {
                executed.fetch_add(1, Ordering::SeqCst);
            }));
            if let Some(item) = queue.pop() {
                item.execute();
                popped.fetch_add(1, Ordering::SeqCst);
            }
        }
        while let Some(item) = queue.pop() {
            item.execute();
            popped.fetch_add(1, Ordering::SeqCst);
        }
        done.store(true, Ordering::Release);

        for thief in thieves {
            thief.join().unwrap();
        }

        assert_eq!(executed.load(Ordering::SeqCst), total);
        assert_eq!(
            stolen.load(Ordering::SeqCst) + popped.load(Ordering::SeqCst),
            total
        );
    }

    #[test]
    fn test_drain_to_global() {
        let queue = LocalQueue::new();
        let global = SharedQueue::new();
        for _ in 0..5 {
            queue.push(marker());
        }

        assert_eq!(queue.drain_to(&global), 5);
        assert!(queue.is_empty());
        assert_eq!(global.len(), 5);
    }

    #[test]
    fn test_snapshot_skips_holes() {
        let queue = LocalQueue::new();
        queue.push(marker());
        let target = marker();
        queue.push(target.clone());
        queue.push(marker());

        queue.find_and_remove(&target);
        let items = queue.snapshot();
        assert_eq!(items.len(), 2);
        assert!(items.iter().all(|item| !item.same_item(&target)));
    }
}
