//! Scenario tests for the fiber-based job scheduler.

use crate::{JobDescriptor, JobManager, JobManagerConfig};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

fn wait_until_idle(manager: &JobManager) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while manager.idle_fibers() != manager.fiber_pool_size() {
        assert!(Instant::now() < deadline, "fibers never returned to the pool");
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn test_basic_job_execution() {
    let manager = JobManager::initialize(2).unwrap();
    let value = Arc::new(AtomicUsize::new(0));
    let value_clone = value.clone();

    let counter = manager.run(move || {
        value_clone.store(42, Ordering::SeqCst);
    });

    manager.wait_for_counter(counter);
    assert_eq!(value.load(Ordering::SeqCst), 42);
    manager.terminate().expect("Shutdown failed");
}

#[test]
fn test_hundred_jobs_scenario() {
    let manager = JobManager::initialize(4).unwrap();
    let total = Arc::new(AtomicUsize::new(0));
    let slots = Arc::new((0..100).map(|_| AtomicUsize::new(usize::MAX)).collect::<Vec<_>>());
    let writes = Arc::new((0..100).map(|_| AtomicUsize::new(0)).collect::<Vec<_>>());

    let counter = manager.run_jobs((0..100).map(|i| {
        let total = total.clone();
        let slots = slots.clone();
        let writes = writes.clone();
        JobDescriptor::new(move || {
            total.fetch_add(1, Ordering::SeqCst);
            slots[i].store(i, Ordering::SeqCst);
            writes[i].fetch_add(1, Ordering::SeqCst);
        })
    }));
    manager.wait_for_counter_and_free(counter, 0);

    assert_eq!(total.load(Ordering::SeqCst), 100);
    for i in 0..100 {
        assert_eq!(slots[i].load(Ordering::SeqCst), i);
        assert_eq!(writes[i].load(Ordering::SeqCst), 1, "slot {i} written more than once");
    }
    assert_eq!(manager.live_counters(), 0);
    assert_eq!(manager.queued_jobs(), 0);
    wait_until_idle(&manager);

    let report = manager.terminate().unwrap();
    assert_eq!(report.dropped_jobs, 0);
    assert_eq!(report.freed_counters, 0);
    assert_eq!(report.busy_fibers, 0);
}

#[test]
fn test_independent_batches() {
    let manager = JobManager::initialize(4).unwrap();
    let first_hits = Arc::new(AtomicUsize::new(0));
    let second_hits = Arc::new(AtomicUsize::new(0));

    let batch = |hits: &Arc<AtomicUsize>, n: usize| {
        let hits = hits.clone();
        manager.run_jobs((0..n).map(move |_| {
            let hits = hits.clone();
            JobDescriptor::new(move || {
                hits.fetch_add(1, Ordering::SeqCst);
            })
        }))
    };

    let first = batch(&first_hits, 50);
    let second = batch(&second_hits, 30);
    assert_ne!(first, second);

    manager.wait_for_counter(second);
    assert_eq!(second_hits.load(Ordering::SeqCst), 30);
    manager.wait_for_counter(first);
    assert_eq!(first_hits.load(Ordering::SeqCst), 50);
    manager.terminate().unwrap();
}

#[test]
fn test_more_jobs_than_fibers_and_queue_slots() {
    let config = JobManagerConfig {
        fiber_pool_size: 4,
        fiber_stack_size: 64 * 1024,
        queue_capacity_log2: 3,
        ..Default::default()
    };
    let manager = JobManager::with_config(2, config).unwrap();
    let hits = Arc::new(AtomicUsize::new(0));

    let counter = manager.run_jobs((0..500).map(|_| {
        let hits = hits.clone();
        JobDescriptor::new(move || {
            hits.fetch_add(1, Ordering::SeqCst);
        })
    }));
    manager.wait_for_counter(counter);

    assert_eq!(hits.load(Ordering::SeqCst), 500);
    manager.terminate().unwrap();
}

#[test]
fn test_nested_wait_inside_job() {
    let manager = JobManager::initialize(2).unwrap();
    let ctx = manager.context();
    let order = Arc::new(AtomicUsize::new(0));
    let order_clone = order.clone();

    let outer = manager.run(move || {
        let leaves = order_clone.clone();
        let inner = ctx.run_jobs((0..10).map(|_| {
            let leaves = leaves.clone();
            JobDescriptor::new(move || {
                leaves.fetch_add(1, Ordering::SeqCst);
            })
        }));
        ctx.wait_for_counter(inner);
        // All ten leaves finished before the wait returned.
        assert_eq!(order_clone.load(Ordering::SeqCst), 10);
        order_clone.fetch_add(1, Ordering::SeqCst);
    });

    manager.wait_for_counter(outer);
    assert_eq!(order.load(Ordering::SeqCst), 11);
    manager.terminate().unwrap();
}

#[test]
fn test_initialize_from_job_is_rejected() {
    let manager = JobManager::initialize(1).unwrap();
    let rejected = Arc::new(AtomicUsize::new(0));
    let rejected_clone = rejected.clone();

    let counter = manager.run(move || {
        if let Err(crate::JobError::NestedInitialize) = JobManager::initialize(1) {
            rejected_clone.store(1, Ordering::SeqCst);
        }
    });
    manager.wait_for_counter(counter);

    assert_eq!(rejected.load(Ordering::SeqCst), 1);
    manager.terminate().unwrap();
}

#[test]
fn test_two_managers_side_by_side() {
    let first = JobManager::initialize(2).unwrap();
    let second = JobManager::initialize(2).unwrap();
    let hits = Arc::new(AtomicUsize::new(0));

    let a = {
        let hits = hits.clone();
        first.run(move || {
            hits.fetch_add(1, Ordering::SeqCst);
        })
    };
    let b = {
        let hits = hits.clone();
        second.run(move || {
            hits.fetch_add(10, Ordering::SeqCst);
        })
    };

    first.wait_for_counter(a);
    second.wait_for_counter(b);
    assert_eq!(hits.load(Ordering::SeqCst), 11);
    first.terminate().unwrap();
    second.terminate().unwrap();
}
