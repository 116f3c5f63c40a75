//! Dispatch span tracing.
//!
//! When the controller turns `logging_enabled` on, workers time what they
//! do and record it here: item executions, dequeue passes that walked every
//! tier and found nothing, and retirement drains. Spans land in a
//! thread-local buffer and migrate to the process-wide collector in batches,
//! so recording costs the hot path no shared-memory traffic. The collected
//! timeline exports in the Chrome Tracing JSON format, one track per
//! worker, readable by chrome://tracing or ui.perfetto.dev.

use std::cell::RefCell;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// What a span covered on a worker's timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanKind {
    /// A work item running to completion.
    Execute,
    /// A full dequeue pass over every tier that came up empty.
    EmptyScan,
    /// A retiring worker moving its local queue to the global queue.
    Drain,
}

impl SpanKind {
    fn label(self) -> &'static str {
        match self {
            SpanKind::Execute => "execute",
            SpanKind::EmptyScan => "empty-scan",
            SpanKind::Drain => "drain",
        }
    }
}

/// One closed span.
#[derive(Debug, Clone)]
struct Span {
    kind: SpanKind,
    worker: usize,
    start_us: u64,
    duration_us: u64,
}

/// Spans migrate out of the thread-local buffer once it holds this many,
/// and again when the owning worker leaves.
const FLUSH_THRESHOLD: usize = 4096;

thread_local! {
    static LOCAL_SPANS: RefCell<Vec<Span>> = const { RefCell::new(Vec::new()) };
}

lazy_static::lazy_static! {
    static ref CLOCK: SpanClock = SpanClock::start();
    static ref COLLECTED: Mutex<Vec<Span>> = Mutex::new(Vec::new());
}

/// Maps monotonic instants onto wall-clock microseconds, the time base the
/// trace viewers expect.
struct SpanClock {
    base: Instant,
    base_epoch_us: u64,
}

impl SpanClock {
    fn start() -> Self {
        SpanClock {
            base: Instant::now(),
            base_epoch_us: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|elapsed| elapsed.as_micros() as u64)
                .unwrap_or(0),
        }
    }

    fn timestamp_us(&self, instant: Instant) -> u64 {
        self.base_epoch_us + instant.duration_since(self.base).as_micros() as u64
    }
}

/// Records one closed span for `worker`.
pub fn record_span(kind: SpanKind, worker: usize, start: Instant, duration: Duration) {
    let span = Span {
        kind,
        worker,
        start_us: CLOCK.timestamp_us(start),
        duration_us: duration.as_micros() as u64,
    };
    LOCAL_SPANS.with(|buffer| {
        let mut buffer = buffer.borrow_mut();
        buffer.push(span);
        if buffer.len() >= FLUSH_THRESHOLD {
            flush(&mut buffer);
        }
    });
}

fn flush(buffer: &mut Vec<Span>) {
    if buffer.is_empty() {
        return;
    }
    COLLECTED
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .append(buffer);
}

/// Migrates the calling thread's buffered spans into the collector.
pub fn flush_local_spans() {
    LOCAL_SPANS.with(|buffer| flush(&mut buffer.borrow_mut()));
}

/// Writes every collected span to `path` as a Chrome Tracing JSON array.
/// Worker id becomes the track id, so each worker renders as its own row.
pub fn export_to_file(path: &str) -> std::io::Result<()> {
    let collected = COLLECTED.lock().unwrap_or_else(PoisonError::into_inner);
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);

    writer.write_all(b"[")?;
    for (index, span) in collected.iter().enumerate() {
        if index > 0 {
            writer.write_all(b",")?;
        }
        write!(
            writer,
            "\n{{\"name\":\"{}\",\"cat\":\"dispatch\",\"ph\":\"X\",\"ts\":{},\"dur\":{},\"pid\":1,\"tid\":{}}}",
            span.kind.label(),
            span.start_us,
            span.duration_us,
            span.worker
        )?;
    }
    writer.write_all(b"\n]\n")?;
    writer.flush()
}

/// RAII recorder: times its own lifetime and records it as one span.
pub struct TraceGuard {
    kind: SpanKind,
    worker: usize,
    start: Instant,
}

impl TraceGuard {
    pub fn new(kind: SpanKind, worker: usize) -> Self {
        TraceGuard {
            kind,
            worker,
            start: Instant::now(),
        }
    }
}

impl Drop for TraceGuard {
    fn drop(&mut self) {
        record_span(self.kind, self.worker, self.start, self.start.elapsed());
    }
}

/// RAII guard a worker holds for its lifetime; flushes the thread's last
/// spans on the way out.
pub struct CollectorGuard;

impl Drop for CollectorGuard {
    fn drop(&mut self) {
        flush_local_spans();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_records_into_local_buffer() {
        {
            let _span = TraceGuard::new(SpanKind::Execute, 7);
        }
        let recorded = LOCAL_SPANS.with(|buffer| {
            buffer
                .borrow()
                .iter()
                .any(|span| span.kind == SpanKind::Execute && span.worker == 7)
        });
        assert!(recorded);
    }

    #[test]
    fn test_buffer_flushes_at_threshold() {
        // A dedicated thread keeps this test's buffer away from the others.
        let leftover = std::thread::spawn(|| {
            let start = Instant::now();
            for _ in 0..FLUSH_THRESHOLD {
                record_span(SpanKind::EmptyScan, 3, start, Duration::ZERO);
            }
            LOCAL_SPANS.with(|buffer| buffer.borrow().len())
        })
        .join()
        .unwrap();

        // The push that reached the threshold emptied the buffer.
        assert_eq!(leftover, 0);
    }

    #[test]
    fn test_export_writes_json_array() {
        {
            let _span = TraceGuard::new(SpanKind::Drain, 1);
        }
        flush_local_spans();

        let path = std::env::temp_dir().join("threadmill_trace_test.json");
        let path = path.to_str().unwrap();
        export_to_file(path).unwrap();

        let contents = std::fs::read_to_string(path).unwrap();
        assert!(contents.trim_start().starts_with('['));
        assert!(contents.trim_end().ends_with(']'));
        assert!(contents.contains("\"cat\":\"dispatch\""));
    }
}
