//! Integration tests for the dispatch engine.

use crate::controller::test_support::ManualController;
use crate::dispatcher::WorkerState;
use crate::work_item::WorkItem;
use crate::work_queue::WorkQueue;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

fn marker() -> WorkItem {
    WorkItem::from_fn(|| {})
}

fn tagged(tag: &'static str, log: &Arc<Mutex<Vec<&'static str>>>) -> WorkItem {
    let log = log.clone();
    WorkItem::from_fn(move || log.lock().unwrap().push(tag))
}

#[test]
fn test_concurrent_enqueues_request_one_worker() {
    let controller = Arc::new(ManualController::new(4));
    let queue = WorkQueue::new(controller.clone());

    for _ in 0..5 {
        queue.enqueue(marker(), false);
    }

    // The latch coalesces every request into the first one.
    assert_eq!(controller.requests.load(Ordering::SeqCst), 1);
}

#[test]
fn test_enqueue_after_release_rearms_latch() {
    let controller = Arc::new(ManualController::new(4));
    let queue = WorkQueue::new(controller.clone());

    queue.enqueue(marker(), false);
    assert_eq!(controller.requests.load(Ordering::SeqCst), 1);

    // A worker entering the dispatcher releases the latch; the next
    // enqueue must produce a fresh request.
    queue.release_thread_request();
    queue.enqueue(marker(), false);
    assert_eq!(controller.requests.load(Ordering::SeqCst), 2);
}

#[test]
fn test_high_priority_dispatched_before_normal() {
    let controller = Arc::new(ManualController::new(4));
    let queue = WorkQueue::new(controller);
    let mut state = WorkerState::enter(&queue, 0);
    let log = Arc::new(Mutex::new(Vec::new()));

    queue.enqueue(tagged("normal", &log), false);
    queue.enqueue_high_priority(tagged("high", &log));

    // First dispatcher entry runs high-priority first.
    queue.dispatch_once(&mut state);
    assert_eq!(*log.lock().unwrap(), vec!["high", "normal"]);

    // The alternation bit flipped: the next entry probes the normal queue
    // once before high-priority work.
    log.lock().unwrap().clear();
    queue.enqueue(tagged("normal", &log), false);
    queue.enqueue_high_priority(tagged("high", &log));
    queue.dispatch_once(&mut state);
    assert_eq!(*log.lock().unwrap(), vec!["normal", "high"]);
}

#[test]
fn test_own_queue_beats_alternation_probe() {
    let controller = Arc::new(ManualController::new(4));
    let queue = WorkQueue::new(controller);
    let mut state = WorkerState::enter(&queue, 0);
    let log = Arc::new(Mutex::new(Vec::new()));

    // Burn the high-priority-first cycle so the next entry is a
    // normal-first one.
    queue.dispatch_once(&mut state);

    queue.enqueue(tagged("global", &log), false);
    queue.enqueue(tagged("local", &log), true);

    // Even on the cycle that probes the normal queues ahead of
    // high-priority work, the worker's own queue drains first.
    queue.dispatch_once(&mut state);
    assert_eq!(*log.lock().unwrap(), vec!["local", "global"]);
}

#[test]
fn test_high_priority_flag_consumed_only_by_real_work() {
    let controller = Arc::new(ManualController::new(4));
    let queue = WorkQueue::new(controller);
    let mut state = WorkerState::enter(&queue, 0);

    // Normal-only traffic never raises the high-priority hint.
    queue.enqueue(marker(), false);
    queue.dispatch_once(&mut state);
    assert!(!queue.may_have_high_priority_work.load(Ordering::SeqCst));
    assert!(!state.high_priority_mode);

    // High-priority traffic raises it, and draining consumes it.
    queue.enqueue_high_priority(marker());
    assert!(queue.may_have_high_priority_work.load(Ordering::SeqCst));
    queue.dispatch_once(&mut state);
    assert!(!queue.may_have_high_priority_work.load(Ordering::SeqCst));
    assert!(!state.high_priority_mode);
    assert_eq!(queue.pending_count(), 0);
}

#[test]
fn test_assigned_partition_drains_on_retire() {
    let controller = Arc::new(ManualController::new(64));
    let queue = WorkQueue::with_assignable_count(2, controller.clone());
    let mut state = WorkerState::enter(&queue, 0);

    // First entry binds the worker to partition zero.
    queue.dispatch_once(&mut state);
    assert_eq!(state.assigned_index(), Some(0));
    assert_eq!(queue.assignment.bound_workers(), 1);

    for _ in 0..3 {
        queue.assignable[0].push(marker());
    }

    controller.retire_all.store(true, Ordering::SeqCst);
    let outcome = queue.dispatch_once(&mut state);
    assert_eq!(outcome, crate::dispatcher::DispatchOutcome::Retired);

    // One item executed before the verdict; the leftover partition
    // contents moved to the main global queue where any worker can reach
    // them, and the binding is gone.
    assert_eq!(state.assigned_index(), None);
    assert_eq!(queue.assignment.bound_workers(), 0);
    assert_eq!(queue.assignable[0].len(), 0);
    assert_eq!(queue.global.len(), 2);
    assert!(controller.requests.load(Ordering::SeqCst) >= 1);
}

#[test]
fn test_worker_enqueue_routes_to_assigned_partition() {
    let controller = Arc::new(ManualController::new(64));
    let queue = WorkQueue::with_assignable_count(2, controller);
    let mut state = WorkerState::enter(&queue, 0);
    queue.dispatch_once(&mut state);
    assert_eq!(state.assigned_index(), Some(0));

    // A worker's normal-priority submissions land on its own partition.
    queue.enqueue(marker(), false);
    assert_eq!(queue.assignable[0].len(), 1);
    assert_eq!(queue.global.len(), 0);
}

#[test]
fn test_non_worker_enqueue_routes_to_global() {
    let controller = Arc::new(ManualController::new(64));
    let queue = WorkQueue::with_assignable_count(2, controller);

    // prefer_local from a non-worker thread falls through to the main
    // global queue.
    queue.enqueue(marker(), true);
    assert_eq!(queue.global.len(), 1);
    for partition in queue.assignable.iter() {
        assert_eq!(partition.len(), 0);
    }
}

#[test]
fn test_enumerate_walks_tiers_in_order() {
    let controller = Arc::new(ManualController::new(4));
    let queue = WorkQueue::new(controller);
    let _state = WorkerState::enter(&queue, 0);

    let high = marker();
    let global = marker();
    let local = marker();

    queue.enqueue(global.clone(), false);
    queue.enqueue(local.clone(), true);
    queue.enqueue_high_priority(high.clone());

    let items: Vec<WorkItem> = queue.enumerate_items().collect();
    assert_eq!(items.len(), 3);
    assert!(items[0].same_item(&high));
    assert!(items[1].same_item(&global));
    assert!(items[2].same_item(&local));
}

#[test]
fn test_pending_count_spans_all_tiers() {
    let controller = Arc::new(ManualController::new(64));
    let queue = WorkQueue::with_assignable_count(2, controller);
    let _state = WorkerState::enter(&queue, 0);

    queue.enqueue(marker(), true); // local
    queue.enqueue(marker(), false); // global (unbound worker)
    queue.enqueue_high_priority(marker());
    queue.assignable[1].push(marker());

    assert_eq!(queue.pending_count(), 4);
}

#[test]
fn test_local_find_and_pop() {
    let controller = Arc::new(ManualController::new(4));
    let queue = WorkQueue::new(controller);
    let _state = WorkerState::enter(&queue, 0);

    let item = marker();
    queue.enqueue(item.clone(), true);
    assert!(queue.local_find_and_pop(&item));
    assert!(!queue.local_find_and_pop(&item));
    assert_eq!(queue.pending_count(), 0);
}

#[test]
fn test_local_find_and_pop_requires_worker_context() {
    let controller = Arc::new(ManualController::new(4));
    let queue = WorkQueue::new(controller);

    let item = marker();
    queue.enqueue(item.clone(), false);
    assert!(!queue.local_find_and_pop(&item));
    assert_eq!(queue.pending_count(), 1);
}

#[test]
fn test_missed_steal_requests_backup_worker() {
    let controller = Arc::new(ManualController::new(4));
    let queue = WorkQueue::new(controller.clone());

    // A second worker's queue holds work behind a held foreign lock.
    let victim = Arc::new(crate::local_queue::LocalQueue::new());
    queue.registry.register(victim.clone());
    victim.push(marker());

    let locked = Arc::new(std::sync::Barrier::new(2));
    let release = Arc::new(std::sync::Barrier::new(2));
    let holder = {
        let victim = victim.clone();
        let locked = locked.clone();
        let release = release.clone();
        std::thread::spawn(move || {
            let _lock = victim.hold_foreign_lock();
            locked.wait();
            release.wait();
        })
    };
    locked.wait();

    // The dispatching worker loses the try-lock on the victim, comes up
    // empty, and must arm the latch so another worker returns for the
    // stranded item.
    let mut state = WorkerState::enter(&queue, 0);
    let baseline = controller.requests.load(Ordering::SeqCst);
    queue.dispatch_once(&mut state);

    assert_eq!(queue.pending_count(), 1);
    assert_eq!(controller.requests.load(Ordering::SeqCst), baseline + 1);

    release.wait();
    holder.join().unwrap();
}
