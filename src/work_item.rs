//! Work item definitions.
//!
//! A work item is an opaque unit of computation that some worker executes
//! once. The queues never look inside an item; they move handles around and
//! eventually call `execute`.

use std::sync::{Arc, Mutex};

/// Execution interface for queued work.
///
/// The scheduler delivers each enqueued handle to exactly one worker, which
/// calls `execute` once. Cloning a handle and enqueuing both clones results
/// in two deliveries.
pub trait Execute: Send + Sync {
    fn execute(&self);
}

/// An opaque handle to a unit of work.
///
/// Two shapes exist: a bare function pointer for state-less callbacks, and a
/// virtually dispatched handle for everything else. `from_fn` adapts any
/// `FnOnce` closure into the latter.
#[derive(Clone)]
pub enum WorkItem {
    /// Plain function pointer, no captured state, no allocation.
    Callback(fn()),
    /// Payload dispatched through `Execute::execute`.
    Handle(Arc<dyn Execute>),
}

impl WorkItem {
    /// Wraps a closure into a work item.
    pub fn from_fn<F>(work: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        WorkItem::Handle(Arc::new(OnceClosure::new(work)))
    }

    /// Runs the item.
    pub fn execute(&self) {
        match self {
            WorkItem::Callback(func) => func(),
            WorkItem::Handle(handle) => handle.execute(),
        }
    }

    /// Identity comparison used by local find-and-remove.
    ///
    /// Callbacks compare by function pointer, handles by allocation. Two
    /// clones of the same handle are the same item.
    pub fn same_item(&self, other: &WorkItem) -> bool {
        match (self, other) {
            (WorkItem::Callback(a), WorkItem::Callback(b)) => *a == *b,
            (WorkItem::Handle(a), WorkItem::Handle(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl std::fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkItem::Callback(func) => write!(f, "WorkItem::Callback({:p})", *func),
            WorkItem::Handle(handle) => write!(f, "WorkItem::Handle({:p})", Arc::as_ptr(handle)),
        }
    }
}

/// One-shot adapter that lets a `FnOnce` closure ride through `Execute`.
///
/// The closure slot is taken on first execution. A second execution of the
/// same handle is a no-op, which only matters if a caller clones the handle
/// and enqueues it twice.
struct OnceClosure {
    work: Mutex<Option<Box<dyn FnOnce() + Send + 'static>>>,
}

impl OnceClosure {
    fn new<F>(work: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        OnceClosure {
            work: Mutex::new(Some(Box::new(work))),
        }
    }
}

impl Execute for OnceClosure {
    fn execute(&self) {
        let work = self.work.lock().unwrap().take();
        if let Some(work) = work {
            work();
        }
    }
}
