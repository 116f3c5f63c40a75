//! # Threadmill - Work-Stealing Dispatch Engine
//!
//! The work-distribution core of a worker thread pool: per-worker
//! work-stealing queues, tiered shared FIFOs, and the dispatch loop that
//! feeds a dynamic set of worker threads with low overhead up to hundreds
//! of hardware threads.
//!
//! ## Architecture
//!
//! Work flows through three tiers:
//!
//! - **Local queues**: each worker owns a deque with lock-free LIFO access
//!   for itself and locked FIFO theft for everyone else
//! - **Shared queues**: a main global FIFO, a gated high-priority FIFO,
//!   and, on machines with more than 32 cores, an array of assignable
//!   partitions that workers bind to in groups of at most 16
//! - **Dispatch loop**: each worker drains the tiers in priority order,
//!   reports every completion to a pluggable thread-count controller, and
//!   revisits its bookkeeping every 30 ms
//!
//! A single-slot thread-request latch coalesces any number of concurrent
//! submissions into at most one wake request at a time.
//!
//! ## Example
//!
//! ```no_run
//! use threadmill::WorkerPool;
//!
//! let pool = WorkerPool::new(4); // 4 worker threads
//!
//! pool.submit(|| {
//!     println!("Hello from a worker!");
//! });
//!
//! pool.shutdown().expect("workers failed");
//! ```

pub mod assignment;
pub mod controller;
pub mod counter;
pub mod dispatcher;
pub mod local_queue;
pub mod metrics;
pub mod registry;
pub mod shared_queue;
pub mod topology;
pub mod tracing;
pub mod work_item;
pub mod work_queue;
pub mod worker;

pub use controller::Controller;
pub use counter::CompletionCounter;
pub use dispatcher::{DispatchOutcome, WorkerState, DISPATCH_QUANTUM_MS};
pub use local_queue::LocalQueue;
pub use work_item::{Execute, WorkItem};
pub use work_queue::WorkQueue;
pub use worker::{PinningStrategy, PoolConfig, WorkerPool};

#[cfg(test)]
mod tests;
