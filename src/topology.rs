//! Processor topology probe.
//!
//! Sizing decisions happen once at startup: the processor count determines
//! whether the global queue is partitioned into assignable queues at all,
//! and into how many.

use sysinfo::{CpuRefreshKind, System};

/// Core count above which the global queue is partitioned.
const PARTITION_THRESHOLD: usize = 32;

/// Workers funneled onto one assignable queue by the sizing rule.
const WORKERS_PER_PARTITION: usize = 16;

/// Number of logical processors.
///
/// Prefers the sysinfo probe; falls back to the standard library when the
/// probe reports nothing useful.
pub fn processor_count() -> usize {
    let mut system = System::new();
    system.refresh_cpu_specifics(CpuRefreshKind::everything());

    let probed = system.cpus().len();
    if probed > 0 {
        return probed;
    }

    std::thread::available_parallelism()
        .map(|count| count.get())
        .unwrap_or(1)
}

/// Number of assignable global queues for a machine with `processors`
/// logical cores. Zero on small machines, where the single global queue is
/// cheap enough to share.
pub fn assignable_queue_count(processors: usize) -> usize {
    if processors > PARTITION_THRESHOLD {
        (processors + WORKERS_PER_PARTITION - 1) / WORKERS_PER_PARTITION
    } else {
        0
    }
}
