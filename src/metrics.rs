#[cfg(feature = "metrics")]
use std::sync::atomic::{AtomicU64, Ordering};
#[cfg(feature = "metrics")]
use std::time::Instant;

/// Optional performance counters for the dispatch engine.
#[cfg(feature = "metrics")]
#[derive(Debug)]
pub struct SchedulerMetrics {
    /// Total items executed across all workers.
    pub items_completed: AtomicU64,
    /// Pushes onto worker-local queues.
    pub local_pushes: AtomicU64,
    /// Owner pops from worker-local queues.
    pub local_pops: AtomicU64,
    /// Pushes onto the global and assignable queues.
    pub global_pushes: AtomicU64,
    /// Pops from the main global queue.
    pub global_pops: AtomicU64,
    /// Successful thefts from another worker's queue.
    pub steals: AtomicU64,
    /// Dequeue passes that lost a try-lock on some victim.
    pub missed_steals: AtomicU64,
    /// Times a worker won the high-priority flag and entered the mode.
    pub high_priority_entries: AtomicU64,
    /// Wake requests actually forwarded to the controller.
    pub wake_requests: AtomicU64,
    /// When collection started.
    pub start_time: Instant,
}

#[cfg(feature = "metrics")]
impl SchedulerMetrics {
    pub fn new() -> Self {
        Self {
            items_completed: AtomicU64::new(0),
            local_pushes: AtomicU64::new(0),
            local_pops: AtomicU64::new(0),
            global_pushes: AtomicU64::new(0),
            global_pops: AtomicU64::new(0),
            steals: AtomicU64::new(0),
            missed_steals: AtomicU64::new(0),
            high_priority_entries: AtomicU64::new(0),
            wake_requests: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Returns a point-in-time copy of the counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            items_completed: self.items_completed.load(Ordering::Relaxed),
            local_pushes: self.local_pushes.load(Ordering::Relaxed),
            local_pops: self.local_pops.load(Ordering::Relaxed),
            global_pushes: self.global_pushes.load(Ordering::Relaxed),
            global_pops: self.global_pops.load(Ordering::Relaxed),
            steals: self.steals.load(Ordering::Relaxed),
            missed_steals: self.missed_steals.load(Ordering::Relaxed),
            high_priority_entries: self.high_priority_entries.load(Ordering::Relaxed),
            wake_requests: self.wake_requests.load(Ordering::Relaxed),
            elapsed_seconds: self.start_time.elapsed().as_secs_f64(),
        }
    }
}

#[cfg(feature = "metrics")]
impl Default for SchedulerMetrics {
    fn default() -> Self {
        SchedulerMetrics::new()
    }
}

/// Snapshot of metrics at a point in time.
#[cfg(feature = "metrics")]
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub items_completed: u64,
    pub local_pushes: u64,
    pub local_pops: u64,
    pub global_pushes: u64,
    pub global_pops: u64,
    pub steals: u64,
    pub missed_steals: u64,
    pub high_priority_entries: u64,
    pub wake_requests: u64,
    pub elapsed_seconds: f64,
}

#[cfg(feature = "metrics")]
impl MetricsSnapshot {
    /// Items executed per second since collection started.
    pub fn items_per_second(&self) -> f64 {
        if self.elapsed_seconds > 0.0 {
            self.items_completed as f64 / self.elapsed_seconds
        } else {
            0.0
        }
    }

    /// Fraction of executed items that arrived by theft.
    pub fn steal_ratio(&self) -> f64 {
        if self.items_completed > 0 {
            self.steals as f64 / self.items_completed as f64
        } else {
            0.0
        }
    }
}
