//! # fiberjobs - Fiber-Based Job Scheduler
//!
//! A job scheduler that multiplexes many short jobs over a fixed set of
//! worker threads. Each job runs on a pooled stackful fiber, so a job can
//! wait for other jobs mid-execution without blocking its worker thread: the
//! fiber is suspended and the worker picks up other work until the awaited
//! jobs are done.
//!
//! ## Architecture
//!
//! - **Fibers**: reusable execution contexts with their own stacks, allocated
//!   once into a fixed pool
//! - **Job Queue**: bounded lock-free multi-producer multi-consumer ring buffer
//! - **Counters**: per-batch completion counters that jobs and threads join on
//! - **Worker Threads**: one dispatch loop per thread that pairs idle fibers
//!   with queued jobs and resumes suspended fibers once they can continue
//!
//! ## Example
//!
//! ```no_run
//! use fiberjobs::{JobDescriptor, JobManager};
//!
//! let manager = JobManager::initialize(4).unwrap();
//! let ctx = manager.context();
//!
//! let counter = manager.run(move || {
//!     let inner = ctx.run_jobs((0..4).map(|i| {
//!         JobDescriptor::new(move || println!("inner job {i}"))
//!     }));
//!     // Suspends this fiber, not the worker thread.
//!     ctx.wait_for_counter(inner);
//! });
//!
//! manager.wait_for_counter_and_free(counter, 0);
//! manager.terminate().unwrap();
//! ```

pub mod c_api;
pub mod config;
pub mod context;
pub mod counter;
pub mod error;
pub mod fiber;
pub mod fiber_pool;
pub mod job;
pub mod job_manager;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod ring_buffer;
pub mod worker;

pub use config::{JobManagerConfig, PinningStrategy};
pub use context::{Context, yield_now};
pub use counter::CounterHandle;
pub use error::JobError;
pub use job::JobDescriptor;
pub use job_manager::{JobManager, ShutdownReport};

#[cfg(test)]
mod tests;
