//! Work-stealing stress benchmark using criterion.
//!
//! A single root item floods its own local queue with imbalanced work;
//! every other worker has to steal to stay busy.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use threadmill::{CompletionCounter, WorkItem, WorkerPool};

fn fibonacci(n: u64) -> u64 {
    if n <= 1 {
        return n;
    }
    let mut a = 0u64;
    let mut b = 1u64;
    for _ in 2..=n {
        let temp = a.wrapping_add(b);
        a = b;
        b = temp;
    }
    b
}

fn bench_work_stealing_stress(c: &mut Criterion) {
    let num_threads = num_cpus::get();
    let pool = WorkerPool::new(num_threads);

    // Warmup
    {
        let completions = CompletionCounter::new();
        for _ in 0..num_threads * 100 {
            let completions = completions.clone();
            pool.submit(move || {
                std::hint::black_box(());
                completions.increment();
            });
        }
        completions.wait_until((num_threads * 100) as u64);
    }

    let mut group = c.benchmark_group("work_stealing");
    group.sample_size(10);

    // Imbalanced workload: some items are heavy, some are light
    for total_items in [1_000, 10_000, 100_000] {
        group.throughput(Throughput::Elements(total_items as u64));

        group.bench_function(BenchmarkId::new("imbalanced", total_items), |b| {
            b.iter(|| {
                let completions = CompletionCounter::new();
                let queue = pool.queue().clone();
                let batch = completions.clone();

                // The root item pushes everything onto its own local queue;
                // distribution happens entirely through theft.
                pool.submit(move || {
                    for i in 0..total_items {
                        let completions = batch.clone();
                        queue.enqueue(
                            WorkItem::from_fn(move || {
                                let work = if i % 10 == 0 { 1000 } else { 10 };
                                std::hint::black_box(fibonacci(work));
                                completions.increment();
                            }),
                            true,
                        );
                    }
                });

                completions.wait_until(total_items as u64);
            })
        });
    }

    group.finish();
    pool.shutdown().expect("shutdown failed");
}

criterion_group!(benches, bench_work_stealing_stress);
criterion_main!(benches);
