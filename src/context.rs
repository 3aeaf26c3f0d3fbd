//! Context type for access to job manager capabilities from within jobs.

use crate::counter::CounterHandle;
use crate::fiber::{Fiber, FiberYield};
use crate::job::JobDescriptor;
use crate::job_manager::{self, ManagerShared};
use std::sync::{Arc, Weak};

/// Handle to a running [`JobManager`](crate::JobManager) that jobs can
/// capture.
///
/// It does not keep the manager alive: using a context after the manager was
/// terminated panics.
#[derive(Clone)]
pub struct Context {
    shared: Weak<ManagerShared>,
}

impl Context {
    pub(crate) fn new(shared: Weak<ManagerShared>) -> Self {
        Context { shared }
    }

    fn manager(&self) -> Arc<ManagerShared> {
        self.shared
            .upgrade()
            .expect("job manager used after terminate")
    }

    /// Enqueues a batch of jobs. See [`JobManager::run_jobs`](crate::JobManager::run_jobs).
    ///
    /// No strong reference to the manager is held while a full queue makes
    /// the calling fiber yield.
    pub fn run_jobs<I>(&self, jobs: I) -> CounterHandle
    where
        I: IntoIterator<Item = JobDescriptor>,
    {
        job_manager::submit_batch(|| self.manager(), jobs)
    }

    pub fn run<F>(&self, work: F) -> CounterHandle
    where
        F: FnOnce() + Send + 'static,
    {
        self.run_jobs([JobDescriptor::new(work)])
    }

    /// Waits until the counter reaches `target`, then frees it.
    ///
    /// Inside a job this suspends the calling fiber; the worker keeps running
    /// other jobs meanwhile.
    pub fn wait_for_counter_and_free(&self, handle: CounterHandle, target: u32) {
        // No strong reference may be held across the suspension, or a
        // fiber left suspended at shutdown would keep the manager alive.
        let (counter, on_own_fiber, backoff) = {
            let manager = self.manager();
            (
                manager.begin_wait(handle),
                manager.on_own_fiber(),
                manager.config.idle_backoff,
            )
        };

        job_manager::block_on_counter(&counter, target, on_own_fiber, backoff);

        self.manager().finish_wait(handle, &counter, target);
    }

    pub fn wait_for_counter(&self, handle: CounterHandle) {
        self.wait_for_counter_and_free(handle, 0);
    }

    /// Yields execution to allow other work to run.
    pub fn yield_now(&self) {
        yield_now();
    }

    /// Index of the worker the calling job runs on.
    pub fn current_worker_id(&self) -> Option<usize> {
        self.shared.upgrade()?.current_worker_id()
    }
}

/// Yields execution to allow other work to run.
///
/// If called from within a fiber, suspends the fiber; its worker resumes it
/// once no new job can be started. If called from a thread, yields the
/// thread.
pub fn yield_now() {
    if Fiber::in_fiber() {
        Fiber::suspend(FiberYield::Yield);
    } else {
        std::thread::yield_now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::JobManager;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_yield_outside_fiber_is_thread_yield() {
        yield_now();
    }

    #[test]
    fn test_context_submits_nested_batch() {
        let manager = JobManager::initialize(2).unwrap();
        let ctx = manager.context();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();

        let outer = manager.run(move || {
            let inner_hits = hits_clone.clone();
            let inner = ctx.run_jobs((0..8).map(|_| {
                let hits = inner_hits.clone();
                JobDescriptor::new(move || {
                    hits.fetch_add(1, Ordering::SeqCst);
                })
            }));
            ctx.wait_for_counter(inner);
            assert!(ctx.current_worker_id().is_some());
            hits_clone.fetch_add(100, Ordering::SeqCst);
        });

        manager.wait_for_counter(outer);
        assert_eq!(hits.load(Ordering::SeqCst), 108);
        assert_eq!(manager.live_counters(), 0);
        manager.terminate().unwrap();
    }

    #[test]
    #[should_panic(expected = "used after terminate")]
    fn test_context_after_terminate_panics() {
        let manager = JobManager::initialize(1).unwrap();
        let ctx = manager.context();
        manager.terminate().unwrap();
        ctx.run(|| {});
    }
}
