//! High-level job manager interface.
//!
//! The `JobManager` is the primary entry point for scheduling and managing
//! parallel work. It owns the fiber pool, the job queue, the counter registry
//! and the worker threads; jobs reach it through a [`Context`].

use crate::config::{JobManagerConfig, MAX_WORKER_THREAD_COUNT};
use crate::context::{self, Context};
use crate::counter::{Counter, CounterHandle, CounterRegistry};
use crate::error::JobError;
use crate::fiber::Fiber;
use crate::fiber_pool::FiberPool;
use crate::job::{JobDescriptor, JobRecord};
#[cfg(feature = "metrics")]
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::ring_buffer::RingBuffer;
use crate::worker::{self, WorkerPool};
use crossbeam::utils::Backoff;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

static NEXT_MANAGER_ID: AtomicU64 = AtomicU64::new(1);

/// State shared between the manager, its workers and job contexts.
pub(crate) struct ManagerShared {
    pub(crate) id: u64,
    pub(crate) config: JobManagerConfig,
    pub(crate) fibers: FiberPool,
    pub(crate) queue: RingBuffer<JobRecord>,
    pub(crate) counters: CounterRegistry,
    terminated: AtomicBool,
    #[cfg(feature = "metrics")]
    pub(crate) metrics: Metrics,
}

impl ManagerShared {
    fn allocate_batch(&self, count: u32) -> (CounterHandle, Arc<Counter>) {
        assert!(
            !self.terminated.load(Ordering::Acquire),
            "job manager used after terminate"
        );
        self.counters.allocate(count)
    }

    fn try_submit(&self, record: Box<JobRecord>) -> Result<(), Box<JobRecord>> {
        let result = self.queue.try_push(record);
        #[cfg(feature = "metrics")]
        {
            if result.is_err() {
                self.metrics
                    .queue_full_retries
                    .fetch_add(1, Ordering::Relaxed);
            }
        }
        result
    }

    /// Whether the caller is a job running on one of this manager's fibers.
    pub(crate) fn on_own_fiber(&self) -> bool {
        worker::current_worker().is_some_and(|w| w.manager_id == self.id) && Fiber::in_fiber()
    }

    pub(crate) fn current_worker_id(&self) -> Option<usize> {
        worker::current_worker()
            .filter(|w| w.manager_id == self.id)
            .map(|w| w.index)
    }

    /// Resolves a handle for waiting.
    ///
    /// # Panics
    ///
    /// Panics if the handle was already waited on and freed.
    pub(crate) fn begin_wait(&self, handle: CounterHandle) -> Arc<Counter> {
        self.counters
            .get(handle)
            .unwrap_or_else(|| panic!("wait on a stale counter handle {handle:?}"))
    }

    /// Frees a counter whose wait is over.
    pub(crate) fn finish_wait(&self, handle: CounterHandle, counter: &Counter, target: u32) {
        assert!(
            counter.reached(target),
            "wait returned before the counter reached its target"
        );
        if self.counters.free(handle).is_none() {
            panic!("counter handle {handle:?} freed twice");
        }
    }

    pub(crate) fn wait_for_counter_and_free(&self, handle: CounterHandle, target: u32) {
        let counter = self.begin_wait(handle);
        block_on_counter(&counter, target, self.on_own_fiber(), self.config.idle_backoff);
        self.finish_wait(handle, &counter, target);
    }
}

/// Enqueues a batch and returns its counter handle.
///
/// `shared` is called afresh for every step, so a caller that only holds a
/// weak reference keeps no strong one while the queue is full. A job
/// submitting from one of the manager's own fibers yields between retries,
/// so its worker keeps draining the queue; anyone else spins.
pub(crate) fn submit_batch<I, S, R>(shared: S, jobs: I) -> CounterHandle
where
    I: IntoIterator<Item = JobDescriptor>,
    S: Fn() -> R,
    R: Deref<Target = ManagerShared>,
{
    let jobs: Vec<_> = jobs.into_iter().collect();
    let count = u32::try_from(jobs.len()).expect("batch larger than u32::MAX jobs");
    let (handle, counter, on_own_fiber) = {
        let manager = shared();
        let (handle, counter) = manager.allocate_batch(count);
        (handle, counter, manager.on_own_fiber())
    };

    let backoff = Backoff::new();
    for job in jobs {
        let mut record = Box::new(JobRecord::new(job, Arc::clone(&counter)));
        loop {
            let pushed = shared().try_submit(record);
            match pushed {
                Ok(()) => break,
                Err(rejected) => {
                    record = rejected;
                    if on_own_fiber {
                        context::yield_now();
                    } else {
                        backoff.snooze();
                    }
                }
            }
        }
    }

    #[cfg(feature = "metrics")]
    shared()
        .metrics
        .jobs_submitted
        .fetch_add(u64::from(count), Ordering::Relaxed);
    tracing::trace!(jobs = count, ?handle, "batch submitted");
    handle
}

/// Blocks until `counter` reaches `target`.
///
/// On one of the manager's own fibers this suspends the fiber and hands its
/// worker back to the dispatcher, which resumes the fiber on the same worker
/// once the counter is satisfied. Anywhere else it polls with a short sleep.
pub(crate) fn block_on_counter(counter: &Arc<Counter>, target: u32, on_own_fiber: bool, backoff: Duration) {
    if counter.reached(target) {
        return;
    }

    if on_own_fiber {
        Fiber::await_counter(Arc::clone(counter), target);
    } else {
        while !counter.reached(target) {
            thread::sleep(backoff);
        }
    }
}

/// What `terminate` found and released.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Queued jobs that never ran and were dropped.
    pub dropped_jobs: usize,
    /// Counters that were never waited on and were freed.
    pub freed_counters: usize,
    /// Fibers still suspended mid-job when the workers stopped.
    pub busy_fibers: usize,
}

/// The main job manager owning worker threads, fibers and the job queue.
///
/// # Example
///
/// ```no_run
/// use fiberjobs::{JobDescriptor, JobManager};
///
/// let manager = JobManager::initialize(4).unwrap();
/// let counter = manager.run_jobs((0..8).map(|i| {
///     JobDescriptor::new(move || println!("job {i}"))
/// }));
/// manager.wait_for_counter_and_free(counter, 0);
/// manager.terminate().unwrap();
/// ```
pub struct JobManager {
    shared: Arc<ManagerShared>,
    workers: WorkerPool,
}

impl JobManager {
    /// Starts `thread_count` worker threads with the default configuration.
    pub fn initialize(thread_count: usize) -> Result<Self, JobError> {
        Self::with_config(thread_count, JobManagerConfig::default())
    }

    /// Starts `thread_count` worker threads, allocates the fiber pool and the
    /// job queue described by `config`.
    pub fn with_config(thread_count: usize, config: JobManagerConfig) -> Result<Self, JobError> {
        if worker::current_worker().is_some() {
            return Err(JobError::NestedInitialize);
        }
        if thread_count == 0 || thread_count > MAX_WORKER_THREAD_COUNT {
            return Err(JobError::InvalidThreadCount {
                requested: thread_count,
            });
        }
        config.validate()?;

        let fibers = FiberPool::new(config.fiber_pool_size, config.fiber_stack_size)?;
        let queue = RingBuffer::with_capacity_log2(config.queue_capacity_log2);
        let pinning = config.pinning;

        let shared = Arc::new(ManagerShared {
            id: NEXT_MANAGER_ID.fetch_add(1, Ordering::Relaxed),
            config,
            fibers,
            queue,
            counters: CounterRegistry::new(),
            terminated: AtomicBool::new(false),
            #[cfg(feature = "metrics")]
            metrics: Metrics::new(),
        });

        let workers = WorkerPool::start(thread_count, &shared, pinning)?;

        tracing::debug!(
            manager = shared.id,
            threads = thread_count,
            fibers = shared.fibers.len(),
            queue_capacity = shared.queue.capacity(),
            "job manager initialized"
        );

        Ok(JobManager { shared, workers })
    }

    /// Stops and joins all workers, drops queued jobs that never ran and
    /// frees leftover counters. The fibers are freed once the last reference
    /// to the manager's state is gone.
    pub fn terminate(mut self) -> Result<ShutdownReport, JobError> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<ShutdownReport, JobError> {
        if self.shared.terminated.swap(true, Ordering::AcqRel) {
            return Ok(ShutdownReport::default());
        }

        let joined = self.workers.shutdown();

        let mut report = ShutdownReport::default();
        while self.shared.queue.try_pop().is_some() {
            report.dropped_jobs += 1;
        }
        report.freed_counters = self.shared.counters.clear();
        report.busy_fibers = self.shared.fibers.len() - self.shared.fibers.idle_count();

        tracing::debug!(
            manager = self.shared.id,
            dropped_jobs = report.dropped_jobs,
            freed_counters = report.freed_counters,
            busy_fibers = report.busy_fibers,
            "job manager terminated"
        );

        joined.map(|()| report)
    }

    /// Returns a handle jobs can capture to submit and wait on work.
    pub fn context(&self) -> Context {
        Context::new(Arc::downgrade(&self.shared))
    }

    /// Enqueues a batch of jobs and returns a handle to its completion
    /// counter, initialised to the number of jobs.
    ///
    /// Blocks while the job queue is full.
    pub fn run_jobs<I>(&self, jobs: I) -> CounterHandle
    where
        I: IntoIterator<Item = JobDescriptor>,
    {
        submit_batch(|| self.shared.as_ref(), jobs)
    }

    /// Enqueues a single job.
    pub fn run<F>(&self, work: F) -> CounterHandle
    where
        F: FnOnce() + Send + 'static,
    {
        self.run_jobs([JobDescriptor::new(work)])
    }

    /// Blocks until the counter reaches `target`, then frees it.
    ///
    /// From inside a job this suspends the job's fiber instead of blocking
    /// its worker thread.
    ///
    /// # Panics
    ///
    /// Panics if the handle was already waited on.
    pub fn wait_for_counter_and_free(&self, handle: CounterHandle, target: u32) {
        self.shared.wait_for_counter_and_free(handle, target);
    }

    /// Waits for every job of the batch, then frees its counter.
    pub fn wait_for_counter(&self, handle: CounterHandle) {
        self.wait_for_counter_and_free(handle, 0);
    }

    /// Cooperatively gives up the current job's timeslice.
    pub fn yield_now(&self) {
        context::yield_now();
    }

    /// Index of the worker thread the caller runs on, if it is one of ours.
    pub fn current_worker_id(&self) -> Option<usize> {
        self.shared.current_worker_id()
    }

    /// Returns the number of worker threads in the system.
    pub fn num_workers(&self) -> usize {
        self.workers.size()
    }

    pub fn fiber_pool_size(&self) -> usize {
        self.shared.fibers.len()
    }

    /// Fibers not currently owned by any worker.
    pub fn idle_fibers(&self) -> usize {
        self.shared.fibers.idle_count()
    }

    /// Counters submitted but not yet waited on and freed.
    pub fn live_counters(&self) -> usize {
        self.shared.counters.live()
    }

    /// Jobs sitting in the queue, not yet loaded into a fiber.
    pub fn queued_jobs(&self) -> usize {
        self.shared.queue.len()
    }

    pub fn config(&self) -> &JobManagerConfig {
        &self.shared.config
    }

    #[cfg(feature = "metrics")]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }
}

impl Drop for JobManager {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}
