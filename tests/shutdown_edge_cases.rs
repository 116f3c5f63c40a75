use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use threadmill::WorkerPool;

#[test]
fn test_shutdown_during_item_execution() {
    let pool = WorkerPool::new(2);
    let executed = Arc::new(AtomicUsize::new(0));

    for _ in 0..10 {
        let executed = executed.clone();
        pool.submit(move || {
            std::thread::sleep(Duration::from_millis(10));
            executed.fetch_add(1, Ordering::SeqCst);
        });
    }

    // Shutdown drains outstanding work before stopping the workers.
    pool.shutdown().expect("shutdown should succeed after items drain");
    assert_eq!(executed.load(Ordering::SeqCst), 10);
}

#[test]
fn test_shutdown_idle_pool() {
    let pool = WorkerPool::new(4);
    pool.shutdown().expect("idle shutdown failed");
}

#[test]
fn test_shutdown_with_pending_high_priority_work() {
    let pool = WorkerPool::new(1);
    let executed = Arc::new(AtomicUsize::new(0));

    for _ in 0..5 {
        let executed = executed.clone();
        pool.submit_high_priority(move || {
            executed.fetch_add(1, Ordering::SeqCst);
        });
    }

    pool.shutdown().expect("shutdown failed");
    assert_eq!(executed.load(Ordering::SeqCst), 5);
}

#[test]
fn test_single_worker_pool_drains_everything() {
    let pool = WorkerPool::new(1);
    let executed = Arc::new(AtomicUsize::new(0));

    for _ in 0..100 {
        let executed = executed.clone();
        pool.submit(move || {
            executed.fetch_add(1, Ordering::SeqCst);
        });
    }

    pool.shutdown().expect("shutdown failed");
    assert_eq!(executed.load(Ordering::SeqCst), 100);
}
