//! Completion counters.
//!
//! Each worker carries a `CompletionCounter` handle that it bumps once per
//! executed item. The handle is passed to the thread-count controller on
//! every completion so external policy can observe per-worker throughput.
//! Callers can also use a counter to wait for a batch of submitted items.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

/// A monotone, thread-safe completion tally.
///
/// Cloning the counter clones the handle; all clones observe the same value.
#[derive(Clone)]
pub struct CompletionCounter {
    inner: Arc<AtomicU64>,
}

impl CompletionCounter {
    /// Creates a new counter starting at zero.
    pub fn new() -> Self {
        CompletionCounter {
            inner: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Records one completion.
    pub fn increment(&self) {
        self.inner.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the number of completions recorded so far.
    pub fn value(&self) -> u64 {
        self.inner.load(Ordering::Relaxed)
    }

    /// Blocks until at least `target` completions have been recorded.
    ///
    /// Polls with exponential backoff, capped at 1 ms per sleep.
    pub fn wait_until(&self, target: u64) {
        const MAX_BACKOFF_US: u64 = 1000;
        let mut backoff_us = 1;

        while self.value() < target {
            thread::sleep(Duration::from_micros(backoff_us));
            backoff_us = (backoff_us * 2).min(MAX_BACKOFF_US);
        }
    }
}

impl Default for CompletionCounter {
    fn default() -> Self {
        CompletionCounter::new()
    }
}
