//! The per-worker dispatch loop.
//!
//! A worker thread enters the dispatcher with a `WorkerState`, which owns
//! its local queue, its partition binding, and its completion tally. The
//! state registers itself in a thread-local slot for the duration of the
//! worker's stay so submission paths can detect a worker caller; everything
//! else threads through explicit parameters. Leaving the dispatcher, on any
//! path including a panicking work item, transfers remaining local work to
//! the main global queue and unregisters the queue.

use lazy_static::lazy_static;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::cell::RefCell;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::counter::CompletionCounter;
use crate::local_queue::LocalQueue;
use crate::tracing::{self, SpanKind, TraceGuard};
use crate::work_item::WorkItem;
use crate::work_queue::WorkQueue;

/// Milliseconds a worker dispatches before revisiting bookkeeping.
pub const DISPATCH_QUANTUM_MS: u64 = 30;

const UNASSIGNED: usize = usize::MAX;

lazy_static! {
    static ref PROCESS_START: Instant = Instant::now();
}

/// Milliseconds since the scheduler first ran, passed to the controller on
/// every completion.
pub fn tick_ms() -> u64 {
    PROCESS_START.elapsed().as_millis() as u64
}

/// Result of one dispatcher pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The queues ran dry or a quantum ended with the host asking for the
    /// thread back. The worker may call again.
    CompletedQuantum,
    /// The controller retired this worker; its pending local work has been
    /// transferred to the main global queue.
    Retired,
}

/// The part of a worker's state that submission paths on the same thread
/// need to see.
pub(crate) struct WorkerHandle {
    /// Address of the owning `WorkQueue`, to keep thread-locals from one
    /// pool out of another pool's submissions.
    owner: usize,
    pub(crate) local: Arc<LocalQueue>,
    /// Index of the bound assignable partition, `UNASSIGNED` outside the
    /// dispatcher.
    queue_index: std::sync::atomic::AtomicUsize,
}

thread_local! {
    static CURRENT_WORKER: RefCell<Option<Arc<WorkerHandle>>> = const { RefCell::new(None) };
}

/// Pushes onto the calling worker's local queue, or hands the item back
/// when the caller is not a worker of `queue`.
pub(crate) fn try_push_local(queue: &WorkQueue, item: WorkItem) -> Result<(), WorkItem> {
    CURRENT_WORKER.with(|cell| match cell.borrow().as_ref() {
        Some(handle) if handle.owner == queue as *const WorkQueue as usize => {
            handle.local.push(item);
            Ok(())
        }
        _ => Err(item),
    })
}

/// The calling worker's assigned partition index, when it has one.
pub(crate) fn current_assigned_index(queue: &WorkQueue) -> Option<usize> {
    if queue.assignable_count() == 0 {
        return None;
    }
    CURRENT_WORKER.with(|cell| {
        cell.borrow().as_ref().and_then(|handle| {
            if handle.owner != queue as *const WorkQueue as usize {
                return None;
            }
            let index = handle.queue_index.load(std::sync::atomic::Ordering::Relaxed);
            (index != UNASSIGNED).then_some(index)
        })
    })
}

/// Runs `f` against the calling worker's local queue.
pub(crate) fn with_current_local<R>(
    queue: &WorkQueue,
    f: impl FnOnce(&LocalQueue) -> R,
) -> Option<R> {
    CURRENT_WORKER.with(|cell| match cell.borrow().as_ref() {
        Some(handle) if handle.owner == queue as *const WorkQueue as usize => {
            Some(f(&handle.local))
        }
        _ => None,
    })
}

/// Per-worker dispatcher state.
///
/// Creating one registers the worker's local queue for theft; dropping it
/// deterministically transfers leftover work and unregisters, whether the
/// worker leaves normally or unwinds.
pub struct WorkerState {
    queue: Arc<WorkQueue>,
    handle: Arc<WorkerHandle>,
    completions: CompletionCounter,
    rng: SmallRng,
    pub(crate) high_priority_mode: bool,
    id: usize,
}

impl WorkerState {
    /// Brings a thread into the worker population of `queue`.
    pub fn enter(queue: &Arc<WorkQueue>, id: usize) -> WorkerState {
        let local = Arc::new(LocalQueue::new());
        queue.registry.register(local.clone());

        let handle = Arc::new(WorkerHandle {
            owner: Arc::as_ptr(queue) as usize,
            local,
            queue_index: std::sync::atomic::AtomicUsize::new(UNASSIGNED),
        });
        CURRENT_WORKER.with(|cell| {
            let mut slot = cell.borrow_mut();
            debug_assert!(slot.is_none(), "thread is already a worker");
            *slot = Some(handle.clone());
        });

        WorkerState {
            queue: queue.clone(),
            handle,
            completions: CompletionCounter::new(),
            rng: SmallRng::from_entropy(),
            high_priority_mode: false,
            id,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// This worker's completion tally, as shown to the controller.
    pub fn completions(&self) -> &CompletionCounter {
        &self.completions
    }

    pub(crate) fn local(&self) -> &Arc<LocalQueue> {
        &self.handle.local
    }

    pub(crate) fn assigned_index(&self) -> Option<usize> {
        let index = self
            .handle
            .queue_index
            .load(std::sync::atomic::Ordering::Relaxed);
        (index != UNASSIGNED).then_some(index)
    }

    pub(crate) fn set_assigned_index(&self, index: Option<usize>) {
        self.handle
            .queue_index
            .store(index.unwrap_or(UNASSIGNED), std::sync::atomic::Ordering::Relaxed);
    }

    /// Uniform index below `bound`, for rotation starts.
    pub(crate) fn random_below(&mut self, bound: usize) -> usize {
        self.rng.gen_range(0..bound)
    }

    /// Leaves the dispatcher on the controller's verdict: local work moves
    /// to the main global queue and the partition binding is released. The
    /// local queue stays registered in case the thread dispatches again.
    fn retire(&mut self) {
        self.high_priority_mode = false;
        let queue = self.queue.clone();
        if queue.controller.logging_enabled() {
            let _span = TraceGuard::new(SpanKind::Drain, self.id);
            queue.transfer_local_work(&self.handle.local);
        } else {
            queue.transfer_local_work(&self.handle.local);
        }
        queue.unbind_worker(self);
    }
}

impl Drop for WorkerState {
    fn drop(&mut self) {
        // Runs on every exit path. After a retire these are no-ops apart
        // from the unregistration.
        self.retire();
        self.queue.registry.unregister(&self.handle.local);
        CURRENT_WORKER.with(|cell| {
            *cell.borrow_mut() = None;
        });
    }
}

impl WorkQueue {
    /// Runs the dispatch loop until the queues run dry, the host asks for
    /// the thread at a quantum boundary, or the controller retires the
    /// worker.
    pub fn dispatch_once(&self, state: &mut WorkerState) -> DispatchOutcome {
        // Bind to a partition before the latch release so enqueues routed
        // by partition can already land where this worker drains.
        if self.assignable_count() > 0 && state.assigned_index().is_none() {
            self.bind_worker(state);
        }

        // The wake request that brought us here is satisfied now, before
        // the first dequeue; any enqueue from here on can arm a fresh one.
        self.release_thread_request();

        let mut quantum_start = Instant::now();
        let quantum = Duration::from_millis(DISPATCH_QUANTUM_MS);
        let mut logging = self.controller.logging_enabled();
        let tracking = self.controller.worker_tracking_enabled();

        // Alternation: every other dispatcher entry lets the assigned and
        // global queues go before high-priority work on the first dequeue.
        // The worker's own queue stays first regardless.
        let normal_first = self.dispatch_normal_first.load(std::sync::atomic::Ordering::Relaxed);
        self.dispatch_normal_first
            .store(!normal_first, std::sync::atomic::Ordering::Relaxed);
        let mut first_dequeue = true;

        loop {
            let mut missed_steal = false;
            let scan_start = if logging { Some(Instant::now()) } else { None };
            let probe_normal_first = first_dequeue && normal_first;
            first_dequeue = false;

            let item = match self.dequeue(state, &mut missed_steal, probe_normal_first) {
                Some(item) => item,
                None => {
                    if let Some(start) = scan_start {
                        tracing::record_span(SpanKind::EmptyScan, state.id, start, start.elapsed());
                    }
                    // A failed try-lock means a victim still holds work;
                    // make sure another worker comes for it.
                    if missed_steal {
                        self.ensure_thread_request();
                    }
                    return DispatchOutcome::CompletedQuantum;
                }
            };

            // More work may sit behind the item we just took.
            self.ensure_thread_request();

            if logging {
                let _span = TraceGuard::new(SpanKind::Execute, if tracking { state.id } else { 0 });
                item.execute();
            } else {
                item.execute();
            }
            state.completions.increment();
            #[cfg(feature = "metrics")]
            self.metrics
                .items_completed
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

            if !self
                .controller
                .notify_completion(&state.completions, tick_ms())
            {
                state.retire();
                return DispatchOutcome::Retired;
            }

            if quantum_start.elapsed() >= quantum {
                if self.controller.should_yield() {
                    return DispatchOutcome::CompletedQuantum;
                }
                self.rebalance_worker(state);
                logging = self.controller.logging_enabled();
                quantum_start = Instant::now();
            }
        }
    }
}
