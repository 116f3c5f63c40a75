//! Worker thread implementation.
//!
//! Worker threads run the dispatch loop against a shared `WorkQueue` and
//! park between bursts of work. The pool's built-in controller wakes one
//! parked worker per thread request and retires workers on shutdown; any
//! richer thread-count policy plugs in through the `Controller` trait
//! instead.

use core_affinity::CoreId;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use crate::controller::Controller;
use crate::counter::CompletionCounter;
use crate::dispatcher::{DispatchOutcome, WorkerState};
use crate::topology;
use crate::tracing::CollectorGuard;
use crate::work_item::WorkItem;
use crate::work_queue::WorkQueue;

/// How worker threads map onto cores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinningStrategy {
    /// Let the OS place workers.
    None,
    /// Pin worker i to core i, wrapping over the available cores.
    Linear,
}

/// Pool construction parameters.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of worker threads.
    pub threads: usize,
    pub pinning: PinningStrategy,
    /// Start with trace span recording on.
    pub logging: bool,
    /// Tag trace spans with worker identity.
    pub worker_tracking: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            threads: topology::processor_count(),
            pinning: PinningStrategy::None,
            logging: false,
            worker_tracking: false,
        }
    }
}

struct WakeState {
    pending_requests: usize,
    shutdown: bool,
}

/// The pool's thread-count authority: a counting wake semaphore plus a
/// shutdown flag. One wake request releases one parked worker.
struct PoolController {
    wake: Mutex<WakeState>,
    cvar: Condvar,
    shutting_down: AtomicBool,
    logging: AtomicBool,
    worker_tracking: bool,
    processors: usize,
}

impl PoolController {
    fn new(config: &PoolConfig, processors: usize) -> Self {
        PoolController {
            wake: Mutex::new(WakeState {
                pending_requests: 0,
                shutdown: false,
            }),
            cvar: Condvar::new(),
            shutting_down: AtomicBool::new(false),
            logging: AtomicBool::new(config.logging),
            worker_tracking: config.worker_tracking,
            processors,
        }
    }

    fn lock_wake(&self) -> std::sync::MutexGuard<'_, WakeState> {
        self.wake.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks until a wake request arrives, consuming it. Returns false on
    /// shutdown.
    fn wait_for_request(&self) -> bool {
        let mut state = self.lock_wake();
        loop {
            if state.shutdown {
                return false;
            }
            if state.pending_requests > 0 {
                state.pending_requests -= 1;
                return true;
            }
            state = self
                .cvar
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.lock_wake().shutdown = true;
        self.cvar.notify_all();
    }
}

impl Controller for PoolController {
    fn request_worker(&self) {
        let mut state = self.lock_wake();
        state.pending_requests += 1;
        drop(state);
        self.cvar.notify_one();
    }

    fn notify_completion(&self, _completions: &CompletionCounter, _tick_ms: u64) -> bool {
        !self.shutting_down.load(Ordering::Relaxed)
    }

    fn logging_enabled(&self) -> bool {
        self.logging.load(Ordering::Relaxed)
    }

    fn worker_tracking_enabled(&self) -> bool {
        self.worker_tracking
    }

    fn processor_count(&self) -> usize {
        self.processors
    }
}

/// A worker thread running the dispatch loop.
pub struct Worker {
    id: usize,
    handle: Option<JoinHandle<()>>,
}

struct WorkerParams {
    id: usize,
    queue: Arc<WorkQueue>,
    controller: Arc<PoolController>,
    core_id: Option<CoreId>,
}

impl Worker {
    fn new(params: WorkerParams) -> Self {
        let id = params.id;
        let handle = thread::spawn(move || {
            // Pin to a core for cache locality when the strategy asks.
            if let Some(core_id) = params.core_id {
                core_affinity::set_for_current(core_id);
            }
            Worker::run_loop(params);
        });

        Worker {
            id,
            handle: Some(handle),
        }
    }

    fn run_loop(params: WorkerParams) {
        let WorkerParams {
            id,
            queue,
            controller,
            ..
        } = params;

        // Flushes this thread's trace buffer on the way out.
        let _collector = CollectorGuard;
        let mut state = WorkerState::enter(&queue, id);

        loop {
            let outcome = catch_unwind(AssertUnwindSafe(|| queue.dispatch_once(&mut state)));

            match outcome {
                Ok(DispatchOutcome::CompletedQuantum) => {
                    if queue.pending_count() > 0 {
                        continue;
                    }
                    if !controller.wait_for_request() {
                        break;
                    }
                }
                Ok(DispatchOutcome::Retired) => {
                    if !controller.wait_for_request() {
                        break;
                    }
                }
                Err(payload) => {
                    let msg = if let Some(s) = payload.downcast_ref::<&str>() {
                        *s
                    } else if let Some(s) = payload.downcast_ref::<String>() {
                        s.as_str()
                    } else {
                        "unknown panic payload"
                    };
                    eprintln!("work item panicked: {}", msg);
                }
            }
        }
    }

    /// Returns the worker's ID.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Waits for the worker thread to finish.
    pub fn join(mut self) -> thread::Result<()> {
        if let Some(handle) = self.handle.take() {
            handle.join()
        } else {
            Ok(())
        }
    }
}

/// A pool of worker threads draining one shared work queue.
pub struct WorkerPool {
    queue: Arc<WorkQueue>,
    controller: Arc<PoolController>,
    workers: Vec<Worker>,
}

impl WorkerPool {
    /// Creates a pool with the given number of worker threads.
    pub fn new(threads: usize) -> Self {
        WorkerPool::with_config(PoolConfig {
            threads,
            ..PoolConfig::default()
        })
    }

    /// Creates a pool from explicit configuration.
    pub fn with_config(config: PoolConfig) -> Self {
        let processors = topology::processor_count();
        let controller = Arc::new(PoolController::new(&config, processors));
        let queue = WorkQueue::new(controller.clone() as Arc<dyn Controller>);

        let core_ids = core_affinity::get_core_ids().unwrap_or_default();
        let mut workers = Vec::with_capacity(config.threads);
        for id in 0..config.threads {
            let core_id = match config.pinning {
                PinningStrategy::None => None,
                PinningStrategy::Linear => core_ids.get(id % core_ids.len().max(1)).copied(),
            };
            workers.push(Worker::new(WorkerParams {
                id,
                queue: queue.clone(),
                controller: controller.clone(),
                core_id,
            }));
        }

        WorkerPool {
            queue,
            controller,
            workers,
        }
    }

    /// The shared work queue, for direct `enqueue` calls.
    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    /// Submits a closure at normal priority.
    pub fn submit<F>(&self, work: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.queue.enqueue(WorkItem::from_fn(work), false);
    }

    /// Submits a closure ahead of normal work.
    pub fn submit_high_priority<F>(&self, work: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.queue.enqueue_high_priority(WorkItem::from_fn(work));
    }

    /// Number of worker threads in the pool.
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Approximate number of items waiting across all queues.
    pub fn pending(&self) -> usize {
        self.queue.pending_count()
    }

    /// Toggles trace span recording; workers notice at their next quantum
    /// boundary.
    pub fn set_logging(&self, enabled: bool) {
        self.controller.logging.store(enabled, Ordering::Relaxed);
    }

    /// Drains outstanding work, stops every worker, and joins the threads.
    ///
    /// Returns Err with the number of worker threads that died to panics
    /// that escaped a work item's unwind handling.
    pub fn shutdown(self) -> Result<(), usize> {
        while self.queue.pending_count() > 0 {
            thread::sleep(std::time::Duration::from_millis(1));
        }
        thread::sleep(std::time::Duration::from_millis(10));
        self.controller.begin_shutdown();

        let mut failed_count = 0;
        for worker in self.workers {
            let worker_id = worker.id();
            if worker.join().is_err() {
                failed_count += 1;
                eprintln!("worker {} panicked during execution", worker_id);
            }
        }

        if failed_count > 0 {
            Err(failed_count)
        } else {
            Ok(())
        }
    }
}
