//! Thread-count controller interface.
//!
//! The dispatch engine does not decide how many workers exist. That
//! authority lives behind the `Controller` trait: the engine asks it for
//! workers when work arrives, reports every completion to it, and honors
//! its verdict when it wants a worker back.

use crate::counter::CompletionCounter;
use crate::topology;

pub trait Controller: Send + Sync + 'static {
    /// Asks for a ready worker. Called at most once per armed
    /// thread-request latch, so implementations need no coalescing of
    /// their own.
    fn request_worker(&self);

    /// Reports one completed item along with the worker's completion tally
    /// and the current millisecond tick. Returning false tells the worker
    /// to leave the dispatcher now.
    fn notify_completion(&self, completions: &CompletionCounter, tick_ms: u64) -> bool;

    /// Whether the dispatcher should return to its caller at the end of a
    /// quantum instead of starting the next one.
    fn should_yield(&self) -> bool {
        false
    }

    /// Whether per-item execution spans are recorded for the trace
    /// collector. Re-read at quantum boundaries.
    fn logging_enabled(&self) -> bool {
        false
    }

    /// Whether workers tag their trace spans with their identity.
    fn worker_tracking_enabled(&self) -> bool {
        false
    }

    /// Processor count used at construction to size the assignable-queue
    /// array.
    fn processor_count(&self) -> usize {
        topology::processor_count()
    }
}
