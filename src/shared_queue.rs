//! Shared multi-producer multi-consumer FIFO.
//!
//! Michael-Scott linked queue on top of crossbeam's epoch reclamation.
//! Producers append behind the tail, consumers advance the head sentinel.
//! `try_pop` never blocks and nodes retire through the epoch collector, so
//! diagnostic walks over the live list stay safe against concurrent pops.
//!
//! One queue instance serves as the main global queue, one as the
//! high-priority queue, and a small array of them as the assignable queues
//! on large machines.

use crossbeam::epoch::{self, Atomic, Owned, Shared};
use crossbeam::utils::CachePadded;
use std::sync::atomic::{AtomicIsize, Ordering};

struct Node<T> {
    /// `None` only for the head sentinel allocated at construction.
    item: Option<T>,
    next: Atomic<Node<T>>,
}

/// Unbounded lock-free FIFO queue.
///
/// Per-producer enqueue order is preserved; no ordering holds across
/// producers. Consumers receive each item at most once. `try_pop` hands out
/// a clone of the payload and retires the node, so `T` should be a cheap
/// handle type.
pub struct SharedQueue<T> {
    head: CachePadded<Atomic<Node<T>>>,
    tail: CachePadded<Atomic<Node<T>>>,
    /// Signed so a pop racing ahead of a producer's increment only dips
    /// below zero transiently instead of wrapping.
    len: AtomicIsize,
}

impl<T: Clone> SharedQueue<T> {
    /// Creates an empty queue.
    pub fn new() -> Self {
        let queue = SharedQueue {
            head: CachePadded::new(Atomic::null()),
            tail: CachePadded::new(Atomic::null()),
            len: AtomicIsize::new(0),
        };

        let sentinel = Owned::new(Node {
            item: None,
            next: Atomic::null(),
        });

        // No other thread can observe the queue yet.
        unsafe {
            let guard = epoch::unprotected();
            let sentinel = sentinel.into_shared(guard);
            queue.head.store(sentinel, Ordering::Relaxed);
            queue.tail.store(sentinel, Ordering::Relaxed);
        }

        queue
    }

    /// Appends an item at the tail. Never blocks.
    pub fn push(&self, item: T) {
        let guard = &epoch::pin();
        let new = Owned::new(Node {
            item: Some(item),
            next: Atomic::null(),
        })
        .into_shared(guard);

        loop {
            let tail = self.tail.load(Ordering::Acquire, guard);
            let tail_ref = unsafe { tail.deref() };
            let next = tail_ref.next.load(Ordering::Acquire, guard);

            if !next.is_null() {
                // Tail is lagging behind an in-flight push; help it along.
                let _ = self.tail.compare_exchange(
                    tail,
                    next,
                    Ordering::Release,
                    Ordering::Relaxed,
                    guard,
                );
                continue;
            }

            if tail_ref
                .next
                .compare_exchange(
                    Shared::null(),
                    new,
                    Ordering::Release,
                    Ordering::Relaxed,
                    guard,
                )
                .is_ok()
            {
                let _ = self.tail.compare_exchange(
                    tail,
                    new,
                    Ordering::Release,
                    Ordering::Relaxed,
                    guard,
                );
                self.len.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
    }

    /// Removes and returns the item at the head, or `None` when the queue
    /// appears empty. Never blocks.
    pub fn try_pop(&self) -> Option<T> {
        let guard = &epoch::pin();

        loop {
            let head = self.head.load(Ordering::Acquire, guard);
            let head_ref = unsafe { head.deref() };
            let next = head_ref.next.load(Ordering::Acquire, guard);

            let next_ref = match unsafe { next.as_ref() } {
                Some(next_ref) => next_ref,
                None => return None,
            };

            // Keep the tail off the node we are about to retire.
            let tail = self.tail.load(Ordering::Acquire, guard);
            if head == tail {
                let _ = self.tail.compare_exchange(
                    tail,
                    next,
                    Ordering::Release,
                    Ordering::Relaxed,
                    guard,
                );
            }

            if self
                .head
                .compare_exchange(head, next, Ordering::Release, Ordering::Relaxed, guard)
                .is_ok()
            {
                let item = next_ref.item.clone();
                debug_assert!(item.is_some(), "interior queue node lost its payload");
                unsafe { guard.defer_destroy(head) };
                self.len.fetch_sub(1, Ordering::Relaxed);
                return item;
            }
        }
    }

    /// Approximate number of queued items.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed).max(0) as usize
    }

    /// Whether the queue appears empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Best-effort copy of the queued items, oldest first.
    ///
    /// The walk races with concurrent pushes and pops: an item popped during
    /// the walk may still appear, and the walk stops after the length
    /// estimate taken at entry. Diagnostic use only.
    pub fn snapshot(&self) -> Vec<T> {
        let guard = &epoch::pin();
        let limit = self.len();
        let mut items = Vec::with_capacity(limit);

        let mut node = self.head.load(Ordering::Acquire, guard);
        while items.len() < limit {
            let node_ref = match unsafe { node.as_ref() } {
                Some(node_ref) => node_ref,
                None => break,
            };
            let next = node_ref.next.load(Ordering::Acquire, guard);
            match unsafe { next.as_ref() } {
                Some(next_ref) => {
                    if let Some(item) = next_ref.item.as_ref() {
                        items.push(item.clone());
                    }
                }
                None => break,
            }
            node = next;
        }

        items
    }

    /// Moves every item currently in this queue into `target`, returning the
    /// number of items moved.
    pub fn drain_into(&self, target: &SharedQueue<T>) -> usize {
        let mut moved = 0;
        while let Some(item) = self.try_pop() {
            target.push(item);
            moved += 1;
        }
        moved
    }
}

impl<T: Clone> Default for SharedQueue<T> {
    fn default() -> Self {
        SharedQueue::new()
    }
}

impl<T> Drop for SharedQueue<T> {
    fn drop(&mut self) {
        // Exclusive access: free the whole list inline.
        unsafe {
            let guard = epoch::unprotected();
            let mut node = self.head.load(Ordering::Relaxed, guard);
            while !node.is_null() {
                let next = node.deref().next.load(Ordering::Relaxed, guard);
                drop(node.into_owned());
                node = next;
            }
        }
    }
}
