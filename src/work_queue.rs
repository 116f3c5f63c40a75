//! Process-wide work queue aggregate.
//!
//! One `WorkQueue` owns the three tiers of shared FIFOs (main global,
//! high-priority, and the assignable partition used on large machines),
//! the assignment table binding workers to partitions, the registry of
//! local queues, and the thread-request latch that coalesces wake-ups.
//! The dequeue policy that workers run lives here; the dispatch loop
//! itself is in the dispatcher module.

use std::sync::atomic::{fence, AtomicBool, Ordering};
use std::sync::Arc;

use crate::assignment::AssignmentTable;
use crate::controller::Controller;
use crate::dispatcher::{self, WorkerState};
use crate::local_queue::LocalQueue;
#[cfg(feature = "metrics")]
use crate::metrics::SchedulerMetrics;
use crate::registry::QueueRegistry;
use crate::shared_queue::SharedQueue;
use crate::topology;
use crate::work_item::WorkItem;

pub struct WorkQueue {
    /// Fallback FIFO shared by every producer and worker.
    pub(crate) global: SharedQueue<WorkItem>,
    /// Drained ahead of normal work under the gating discipline below.
    pub(crate) high_priority: SharedQueue<WorkItem>,
    /// Partitioned global queues; empty on machines with 32 cores or
    /// fewer.
    pub(crate) assignable: Box<[SharedQueue<WorkItem>]>,
    pub(crate) assignment: AssignmentTable,
    pub(crate) registry: QueueRegistry,
    /// Raised by high-priority enqueues; a worker enters high-priority
    /// mode only by winning the flip back to false.
    pub(crate) may_have_high_priority_work: AtomicBool,
    /// Alternation bit: toggled per dispatcher entry so floods on one
    /// tier cannot starve the other.
    pub(crate) dispatch_normal_first: AtomicBool,
    /// At most one wake request is in flight while this is true.
    pub(crate) thread_request_latch: AtomicBool,
    pub(crate) controller: Arc<dyn Controller>,
    #[cfg(feature = "metrics")]
    pub metrics: SchedulerMetrics,
}

impl WorkQueue {
    /// Creates a work queue sized from the controller's processor count.
    pub fn new(controller: Arc<dyn Controller>) -> Arc<WorkQueue> {
        let processors = controller.processor_count();
        Self::with_assignable_count(topology::assignable_queue_count(processors), controller)
    }

    /// Creates a work queue with an explicit assignable-queue count.
    ///
    /// Production callers want `new`; this constructor lets tests exercise
    /// the partitioned configuration on small machines.
    pub fn with_assignable_count(count: usize, controller: Arc<dyn Controller>) -> Arc<WorkQueue> {
        let assignable: Vec<SharedQueue<WorkItem>> =
            (0..count).map(|_| SharedQueue::new()).collect();

        Arc::new(WorkQueue {
            global: SharedQueue::new(),
            high_priority: SharedQueue::new(),
            assignable: assignable.into_boxed_slice(),
            assignment: AssignmentTable::new(count),
            registry: QueueRegistry::new(),
            may_have_high_priority_work: AtomicBool::new(false),
            dispatch_normal_first: AtomicBool::new(false),
            thread_request_latch: AtomicBool::new(false),
            controller,
            #[cfg(feature = "metrics")]
            metrics: SchedulerMetrics::new(),
        })
    }

    /// Number of assignable partitions, zero on small machines.
    pub fn assignable_count(&self) -> usize {
        self.assignable.len()
    }

    /// Submits a work item. Never blocks, never fails.
    ///
    /// With `prefer_local` set and a worker thread as the caller, the item
    /// lands on the caller's own local queue. Every other path targets the
    /// caller's assigned global queue, or the main global queue when the
    /// caller is not a worker of this work queue.
    pub fn enqueue(&self, item: WorkItem, prefer_local: bool) {
        let item = if prefer_local {
            match dispatcher::try_push_local(self, item) {
                Ok(()) => {
                    #[cfg(feature = "metrics")]
                    self.metrics.local_pushes.fetch_add(1, Ordering::Relaxed);
                    self.ensure_thread_request();
                    return;
                }
                Err(item) => item,
            }
        } else {
            item
        };

        match dispatcher::current_assigned_index(self) {
            Some(index) => self.assignable[index].push(item),
            None => self.global.push(item),
        }
        #[cfg(feature = "metrics")]
        self.metrics.global_pushes.fetch_add(1, Ordering::Relaxed);
        self.ensure_thread_request();
    }

    /// Submits an item ahead of normal work. Never blocks.
    pub fn enqueue_high_priority(&self, item: WorkItem) {
        self.high_priority.push(item);
        // The flag publishes after the item so a worker that wins the flag
        // also finds the item.
        self.may_have_high_priority_work
            .store(true, Ordering::Release);
        self.ensure_thread_request();
    }

    /// Removes a pending item from the calling worker's local queue.
    ///
    /// Returns false when the caller is not a worker of this work queue or
    /// the item is no longer pending there.
    pub fn local_find_and_pop(&self, item: &WorkItem) -> bool {
        dispatcher::with_current_local(self, |local| local.find_and_remove(item)).unwrap_or(false)
    }

    /// Approximate number of items pending across every queue and deque.
    pub fn pending_count(&self) -> usize {
        let mut count = self.global.len() + self.high_priority.len();
        for queue in self.assignable.iter() {
            count += queue.len();
        }
        for local in self.registry.snapshot().iter() {
            count += local.len();
        }
        count
    }

    /// Best-effort walk over every pending item, for diagnostics.
    ///
    /// Yields high-priority items first, then the assignable partitions,
    /// then the main global queue, then each worker's local queue. The
    /// walk races with dispatch, so items may be missing or already
    /// executing by the time the caller sees them.
    pub fn enumerate_items(&self) -> impl Iterator<Item = WorkItem> + '_ {
        let high = std::iter::once(()).flat_map(move |_| self.high_priority.snapshot());
        let assignable = (0..self.assignable.len()).flat_map(move |i| self.assignable[i].snapshot());
        let global = std::iter::once(()).flat_map(move |_| self.global.snapshot());
        let locals = std::iter::once(()).flat_map(move |_| {
            let mut items = Vec::new();
            for local in self.registry.snapshot().iter() {
                items.extend(local.snapshot());
            }
            items
        });
        high.chain(assignable).chain(global).chain(locals)
    }

    /// Arms the thread-request latch. Only the arming transition asks the
    /// controller for a worker, so any number of concurrent submitters
    /// produce at most one wake request per release.
    pub(crate) fn ensure_thread_request(&self) {
        // Pairs with the fence in `release_thread_request`: a submitter
        // that reads the latch as still armed is guaranteed its enqueue is
        // visible to the worker that is about to release and dequeue.
        fence(Ordering::SeqCst);
        if self
            .thread_request_latch
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            #[cfg(feature = "metrics")]
            self.metrics.wake_requests.fetch_add(1, Ordering::Relaxed);
            self.controller.request_worker();
        }
    }

    /// Releases the latch. Called exactly once per dispatcher entry, after
    /// the worker has committed to draining and before its first dequeue.
    pub(crate) fn release_thread_request(&self) {
        self.thread_request_latch.store(false, Ordering::SeqCst);
        fence(Ordering::SeqCst);
    }

    /// One pass of the dequeue priority order. `missed_steal` is raised
    /// when a theft attempt lost the try-lock on a victim's queue.
    ///
    /// `normal_first` is the alternation probe: it moves the assigned and
    /// global queues ahead of the high-priority check for this one pass.
    /// The worker's own local queue is first either way.
    pub(crate) fn dequeue(
        &self,
        state: &mut WorkerState,
        missed_steal: &mut bool,
        normal_first: bool,
    ) -> Option<WorkItem> {
        // Own local queue first, unconditionally.
        if let Some(item) = state.local().pop() {
            #[cfg(feature = "metrics")]
            self.metrics.local_pops.fetch_add(1, Ordering::Relaxed);
            return Some(item);
        }

        if normal_first {
            if let Some(item) = self.pop_assigned_or_global(state) {
                return Some(item);
            }
        }

        // High-priority work, gated so that only workers that won the flag
        // pile onto the queue.
        if state.high_priority_mode {
            if let Some(item) = self.high_priority.try_pop() {
                return Some(item);
            }
            state.high_priority_mode = false;
        } else if self.may_have_high_priority_work.load(Ordering::Relaxed)
            && self
                .may_have_high_priority_work
                .compare_exchange(true, false, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
        {
            match self.high_priority.try_pop() {
                Some(item) => {
                    #[cfg(feature = "metrics")]
                    self.metrics
                        .high_priority_entries
                        .fetch_add(1, Ordering::Relaxed);
                    state.high_priority_mode = true;
                    return Some(item);
                }
                // Raced with the drain; put the hint back for the next
                // enqueue's worker.
                None => self
                    .may_have_high_priority_work
                    .store(true, Ordering::Release),
            }
        }

        // Assigned partition, then the main global queue. Checked again on
        // an alternation pass; work may have arrived since the probe.
        if let Some(item) = self.pop_assigned_or_global(state) {
            return Some(item);
        }

        // Other partitions, starting at a random rotation.
        let partitions = self.assignable.len();
        if partitions > 0 {
            let offset = state.random_below(partitions);
            for step in 0..partitions {
                let index = (offset + step) % partitions;
                if Some(index) == state.assigned_index() {
                    continue;
                }
                if let Some(item) = self.assignable[index].try_pop() {
                    return Some(item);
                }
            }
        }

        // Theft from other workers, starting at a random victim.
        let victims = self.registry.snapshot();
        if !victims.is_empty() {
            let offset = state.random_below(victims.len());
            for step in 0..victims.len() {
                let victim = &victims[(offset + step) % victims.len()];
                if Arc::ptr_eq(victim, state.local()) {
                    continue;
                }
                if let Some(item) = victim.steal(missed_steal) {
                    #[cfg(feature = "metrics")]
                    self.metrics.steals.fetch_add(1, Ordering::Relaxed);
                    return Some(item);
                }
            }
            #[cfg(feature = "metrics")]
            if *missed_steal {
                self.metrics.missed_steals.fetch_add(1, Ordering::Relaxed);
            }
        }

        None
    }

    /// Pops from the worker's assigned partition when it has one, falling
    /// back to the main global queue. Also the "normal first" probe used
    /// by the alternation discipline.
    pub(crate) fn pop_assigned_or_global(&self, state: &mut WorkerState) -> Option<WorkItem> {
        if let Some(index) = state.assigned_index() {
            if let Some(item) = self.assignable[index].try_pop() {
                return Some(item);
            }
        }
        let item = self.global.try_pop();
        #[cfg(feature = "metrics")]
        if item.is_some() {
            self.metrics.global_pops.fetch_add(1, Ordering::Relaxed);
        }
        item
    }

    /// Binds an arriving worker to an assignable partition.
    pub(crate) fn bind_worker(&self, state: &mut WorkerState) {
        if self.assignable.is_empty() {
            return;
        }
        let index = self.assignment.assign();
        state.set_assigned_index(Some(index));
    }

    /// Quantum-boundary rebalance: move toward earlier partitions as they
    /// free up, so retiring workers do not strand the leftmost queues.
    pub(crate) fn rebalance_worker(&self, state: &mut WorkerState) {
        if let Some(current) = state.assigned_index() {
            if let Some(new_index) = self.assignment.try_rebind(current) {
                state.set_assigned_index(Some(new_index));
            }
        }
    }

    /// Releases a departing worker's binding, draining its partition into
    /// the main global queue when it was the last consumer.
    pub(crate) fn unbind_worker(&self, state: &mut WorkerState) {
        if let Some(index) = state.assigned_index() {
            state.set_assigned_index(None);
            if self.assignment.unassign(index) {
                let moved = self.assignable[index].drain_into(&self.global);
                if moved > 0 {
                    // Stranded items need a worker that is not leaving.
                    self.ensure_thread_request();
                }
            }
        }
    }

    /// Moves everything left on a departing worker's local queue to the
    /// main global queue.
    pub(crate) fn transfer_local_work(&self, local: &LocalQueue) {
        let moved = local.drain_to(&self.global);
        if moved > 0 {
            self.ensure_thread_request();
        }
    }
}
