//! Worker thread implementation.
//!
//! Each worker thread runs a dispatch loop that pairs idle fibers with queued
//! jobs, switches into them from its own host context, and reclaims them once
//! their job returns. Fibers that suspend mid-job stay with the worker they
//! ran on: awaiting fibers go to its wait list until their counter is
//! satisfied, yielding fibers to its yielded list until no new job can start.

use crate::config::PinningStrategy;
use crate::error::JobError;
use crate::fiber::{Fiber, FiberStatus, FiberYield};
use crate::job_manager::ManagerShared;
use std::cell::Cell;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

/// Identity of the worker thread the calling code runs on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct WorkerIdentity {
    pub manager_id: u64,
    pub index: usize,
}

thread_local! {
    static CURRENT_WORKER: Cell<Option<WorkerIdentity>> = const { Cell::new(None) };
}

/// Returns the identity of the current worker thread, if this is one.
pub(crate) fn current_worker() -> Option<WorkerIdentity> {
    CURRENT_WORKER.get()
}

/// Per-thread dispatch state. Lives on the worker thread's native stack,
/// which doubles as the host context fibers switch back to.
struct Dispatcher<'a> {
    shared: &'a ManagerShared,
    index: usize,
    /// The fiber this worker is currently driving.
    guest: Option<&'a Fiber>,
    /// Fibers suspended on an await counter.
    wait_list: Vec<&'a Fiber>,
    /// Fibers whose await counter was satisfied, in wake-up order.
    ready_list: VecDeque<&'a Fiber>,
    /// Fibers suspended by a plain yield.
    yielded: VecDeque<&'a Fiber>,
}

impl<'a> Dispatcher<'a> {
    fn new(shared: &'a ManagerShared, index: usize) -> Self {
        Dispatcher {
            shared,
            index,
            guest: None,
            wait_list: Vec::new(),
            ready_list: VecDeque::new(),
            yielded: VecDeque::new(),
        }
    }

    /// One pass of the dispatch loop.
    fn dispatch(&mut self) {
        let mut i = 0;
        while i < self.wait_list.len() {
            if self.wait_list[i].is_runnable() {
                let fiber = self.wait_list.remove(i);
                self.ready_list.push_back(fiber);
            } else {
                i += 1;
            }
        }

        if self.guest.is_none() {
            self.guest = self.ready_list.pop_front();
        }

        if self.guest.is_none() {
            let Some(fiber) = self.shared.fibers.try_claim() else {
                #[cfg(feature = "metrics")]
                self.shared
                    .metrics
                    .fiber_claim_misses
                    .fetch_add(1, Ordering::Relaxed);
                // Pool exhausted: the only work this worker can do is its own
                // yielded fibers.
                self.guest = self.yielded.pop_front();
                self.switch_to_guest();
                return;
            };

            match self.shared.queue.try_pop() {
                Some(record) => {
                    #[cfg(feature = "metrics")]
                    self.shared
                        .metrics
                        .fiber_claims
                        .fetch_add(1, Ordering::Relaxed);
                    fiber.load_job(*record);
                    self.guest = Some(fiber);
                }
                None => {
                    fiber.release();
                    self.guest = self.yielded.pop_front();
                    if self.guest.is_none() {
                        thread::sleep(self.shared.config.idle_backoff);
                        return;
                    }
                }
            }
        }

        self.switch_to_guest();
    }

    fn switch_to_guest(&mut self) {
        let Some(fiber) = self.guest else {
            return;
        };

        if !fiber.is_runnable() {
            // Its dependency has not resolved yet; do not switch into it.
            self.guest = None;
            self.wait_list.push(fiber);
            return;
        }

        fiber.set_owned_status(FiberStatus::Running);
        let reason = fiber.resume();
        self.guest = None;

        if fiber.is_job_complete() {
            tracing::trace!(worker = self.index, "job complete");
            #[cfg(feature = "metrics")]
            self.shared
                .metrics
                .jobs_completed
                .fetch_add(1, Ordering::Relaxed);
            // Last access: from here on another worker may own the fiber.
            fiber.release();
            return;
        }

        fiber.set_owned_status(FiberStatus::Waiting);
        match reason {
            FiberYield::Await => {
                #[cfg(feature = "metrics")]
                self.shared.metrics.awaits.fetch_add(1, Ordering::Relaxed);
                self.wait_list.push(fiber);
            }
            FiberYield::Yield => {
                #[cfg(feature = "metrics")]
                self.shared.metrics.yields.fetch_add(1, Ordering::Relaxed);
                self.yielded.push_back(fiber);
            }
            FiberYield::Complete => unreachable!("completed fiber without completion flag"),
        }
    }

    fn suspended_count(&self) -> usize {
        self.wait_list.len() + self.ready_list.len() + self.yielded.len()
    }
}

/// A worker thread that drives fibers from the shared pool.
pub struct Worker {
    index: usize,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Creates and starts a new worker thread.
    pub(crate) fn spawn(
        index: usize,
        shared: Arc<ManagerShared>,
        pinning: PinningStrategy,
    ) -> Result<Self, JobError> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();

        let handle = thread::Builder::new()
            .name(format!("fiberjobs-worker-{index}"))
            .spawn(move || {
                if let Some(core) = pinning.core_for(index) {
                    pin_current_thread(index, core);
                }
                CURRENT_WORKER.set(Some(WorkerIdentity {
                    manager_id: shared.id,
                    index,
                }));

                Worker::run_loop(index, &shared, &stop_flag);

                CURRENT_WORKER.set(None);
            })
            .map_err(|source| JobError::ThreadSpawn { index, source })?;

        Ok(Worker {
            index,
            stop,
            handle: Some(handle),
        })
    }

    /// Main dispatch loop for the worker thread.
    fn run_loop(index: usize, shared: &ManagerShared, stop: &AtomicBool) {
        tracing::debug!(worker = index, "worker started");
        let mut dispatcher = Dispatcher::new(shared, index);

        while !stop.load(Ordering::Acquire) {
            dispatcher.dispatch();
        }

        let abandoned = dispatcher.suspended_count();
        if abandoned > 0 {
            tracing::debug!(worker = index, abandoned, "worker stopped with suspended fibers");
        } else {
            tracing::debug!(worker = index, "worker stopped");
        }
    }

    /// Returns the worker's index.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Asks the worker to leave its dispatch loop after the current pass.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Waits for the worker thread to finish.
    pub fn join(mut self) -> thread::Result<()> {
        match self.handle.take() {
            Some(handle) => handle.join(),
            None => Ok(()),
        }
    }
}

fn pin_current_thread(index: usize, core: usize) {
    let pinned = core_affinity::get_core_ids()
        .and_then(|ids| ids.into_iter().find(|id| id.id == core))
        .is_some_and(core_affinity::set_for_current);
    if pinned {
        tracing::debug!(worker = index, core, "worker pinned");
    } else {
        tracing::warn!(worker = index, core, "could not pin worker to core");
    }
}

/// The fixed set of worker threads of one manager.
pub struct WorkerPool {
    workers: Vec<Worker>,
}

impl WorkerPool {
    /// Starts `num_threads` workers. If any thread fails to start, the ones
    /// already running are stopped and joined before the error is returned.
    pub(crate) fn start(
        num_threads: usize,
        shared: &Arc<ManagerShared>,
        pinning: PinningStrategy,
    ) -> Result<Self, JobError> {
        let mut pool = WorkerPool {
            workers: Vec::with_capacity(num_threads),
        };
        for index in 0..num_threads {
            let worker = Worker::spawn(index, Arc::clone(shared), pinning)?;
            pool.workers.push(worker);
        }
        Ok(pool)
    }

    /// Returns the number of worker threads in the pool.
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Signals every worker to stop, then joins them all.
    ///
    /// Returns `Err` with the number of workers that panicked.
    pub fn shutdown(&mut self) -> Result<(), JobError> {
        for worker in &self.workers {
            worker.request_stop();
        }

        let mut failed_count = 0;
        for worker in self.workers.drain(..) {
            let index = worker.index();
            if worker.join().is_err() {
                failed_count += 1;
                tracing::error!(worker = index, "worker panicked during execution");
            }
        }

        if failed_count > 0 {
            Err(JobError::WorkerPanicked(failed_count))
        } else {
            Ok(())
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            let _ = self.shutdown();
        }
    }
}
