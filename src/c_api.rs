//! C ABI over [`JobManager`].
//!
//! Managers cross the boundary as opaque `*mut JobManager` pointers owned by
//! the caller; counter handles cross it packed into a `u64`.

use crate::context;
use crate::counter::CounterHandle;
use crate::job::{JobDescriptor, RawJobFn};
use crate::job_manager::JobManager;
use crate::worker;
use std::ffi::c_void;

/// A job as seen from C: `fun_ptr(fun_param)`.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct FiberJobsJob {
    pub fun_ptr: Option<RawJobFn>,
    pub fun_param: *mut c_void,
}

/// Starts a job manager with `num_threads` workers and default settings.
///
/// Returns null if the manager could not be started.
#[unsafe(no_mangle)]
pub extern "C" fn fiberjobs_manager_create(num_threads: usize) -> *mut JobManager {
    match JobManager::initialize(num_threads) {
        Ok(manager) => Box::into_raw(Box::new(manager)),
        Err(err) => {
            tracing::error!(%err, "fiberjobs_manager_create failed");
            std::ptr::null_mut()
        }
    }
}

/// Terminates and frees a manager.
///
/// # Safety
/// `handle` must be null or a pointer returned by `fiberjobs_manager_create`
/// that was not destroyed yet. It must not be used after this call.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fiberjobs_manager_destroy(handle: *mut JobManager) {
    if handle.is_null() {
        return;
    }
    let manager = unsafe { Box::from_raw(handle) };
    if let Err(err) = manager.terminate() {
        tracing::error!(%err, "fiberjobs_manager_destroy failed");
    }
}

/// Enqueues `count` jobs and returns their packed counter handle.
///
/// # Safety
/// `handle` must be a live manager and `jobs` must point to `count` jobs.
/// Every `fun_param` must stay valid until its job has run. A job with a
/// null `fun_ptr` is a no-op that still counts towards the batch.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fiberjobs_run_jobs(
    handle: *mut JobManager,
    jobs: *const FiberJobsJob,
    count: u32,
) -> u64 {
    let manager = unsafe { &*handle };
    let jobs: &[FiberJobsJob] = if count == 0 {
        &[]
    } else {
        unsafe { std::slice::from_raw_parts(jobs, count as usize) }
    };

    let descriptors = jobs.iter().map(|job| match job.fun_ptr {
        Some(fun) => unsafe { JobDescriptor::from_raw(fun, job.fun_param) },
        None => JobDescriptor::new(|| {}),
    });
    manager.run_jobs(descriptors).to_bits()
}

/// Waits until the counter reaches `target`, then frees it.
///
/// # Safety
/// `handle` must be a live manager and `counter` a value returned by
/// `fiberjobs_run_jobs` on it that was not waited on yet.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fiberjobs_wait_for_counter_and_free(
    handle: *mut JobManager,
    counter: u64,
    target: u32,
) {
    let manager = unsafe { &*handle };
    manager.wait_for_counter_and_free(CounterHandle::from_bits(counter), target);
}

/// Yields the calling job's fiber, or the calling thread outside a job.
#[unsafe(no_mangle)]
pub extern "C" fn fiberjobs_yield() {
    context::yield_now();
}

/// Index of the calling worker thread, or -1 when not called from a worker.
#[unsafe(no_mangle)]
pub extern "C" fn fiberjobs_current_worker_id() -> i32 {
    worker::current_worker().map_or(-1, |w| w.index as i32)
}
