use fiberjobs::{JobDescriptor, JobManager, JobManagerConfig};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

fn small_pool(fibers: usize) -> JobManagerConfig {
    JobManagerConfig {
        fiber_pool_size: fibers,
        fiber_stack_size: 64 * 1024,
        ..Default::default()
    }
}

fn wait_until_idle(manager: &JobManager) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while manager.idle_fibers() != manager.fiber_pool_size() {
        assert!(Instant::now() < deadline, "fibers never returned to the pool");
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn test_pool_size_follows_config() {
    let manager = JobManager::with_config(2, small_pool(8)).unwrap();
    assert_eq!(manager.fiber_pool_size(), 8);
    assert_eq!(manager.idle_fibers(), 8);
    manager.terminate().unwrap();
}

#[test]
fn test_default_pool_size() {
    let manager = JobManager::initialize(1).unwrap();
    assert_eq!(manager.fiber_pool_size(), 128);
    manager.terminate().unwrap();
}

#[test]
fn test_fibers_are_reused_across_many_jobs() {
    let manager = JobManager::with_config(2, small_pool(4)).unwrap();
    let hits = Arc::new(AtomicUsize::new(0));

    let counter = manager.run_jobs((0..1000).map(|_| {
        let hits = hits.clone();
        JobDescriptor::new(move || {
            hits.fetch_add(1, Ordering::SeqCst);
        })
    }));
    manager.wait_for_counter(counter);

    assert_eq!(hits.load(Ordering::SeqCst), 1000);
    wait_until_idle(&manager);
    manager.terminate().unwrap();
}

#[test]
fn test_pool_sized_batches_back_to_back() {
    let manager = JobManager::with_config(2, small_pool(8)).unwrap();
    let hits = Arc::new(AtomicUsize::new(0));

    for round in 1..=3 {
        let counter = manager.run_jobs((0..manager.fiber_pool_size()).map(|_| {
            let hits = hits.clone();
            JobDescriptor::new(move || {
                hits.fetch_add(1, Ordering::SeqCst);
            })
        }));
        manager.wait_for_counter(counter);
        wait_until_idle(&manager);
        assert_eq!(hits.load(Ordering::SeqCst), round * 8);
        assert_eq!(manager.fiber_pool_size(), 8);
    }
    manager.terminate().unwrap();
}

#[test]
fn test_single_fiber_pool_runs_everything() {
    let manager = JobManager::with_config(4, small_pool(1)).unwrap();
    let hits = Arc::new(AtomicUsize::new(0));

    let counter = manager.run_jobs((0..100).map(|_| {
        let hits = hits.clone();
        JobDescriptor::new(move || {
            hits.fetch_add(1, Ordering::SeqCst);
        })
    }));
    manager.wait_for_counter(counter);

    assert_eq!(hits.load(Ordering::SeqCst), 100);
    manager.terminate().unwrap();
}

#[test]
fn test_waiting_fibers_are_held_not_returned() {
    let manager = JobManager::with_config(1, small_pool(4)).unwrap();
    let ctx = manager.context();
    let gate = Arc::new(AtomicUsize::new(0));
    let gate_clone = gate.clone();

    let parent = manager.run(move || {
        let gate = gate_clone.clone();
        let child = ctx.run(move || {
            while gate.load(Ordering::SeqCst) == 0 {
                fiberjobs::yield_now();
            }
        });
        ctx.wait_for_counter(child);
    });

    let deadline = Instant::now() + Duration::from_secs(5);
    while manager.idle_fibers() != 2 {
        assert!(Instant::now() < deadline, "parent and child never both started");
        thread::sleep(Duration::from_millis(1));
    }

    gate.store(1, Ordering::SeqCst);
    manager.wait_for_counter(parent);
    wait_until_idle(&manager);
    manager.terminate().unwrap();
}
