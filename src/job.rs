//! Job definitions.
//!
//! A [`JobDescriptor`] is what callers submit: either a Rust closure or a raw
//! `{function pointer, parameter}` pair as used by the C ABI. The manager
//! wraps each descriptor into a [`JobRecord`] that also carries the batch's
//! completion counter; the record lives in the job queue until a worker
//! loads it into a fiber.

use crate::counter::Counter;
use std::ffi::c_void;
use std::fmt;
use std::sync::Arc;

/// Signature of a raw job function.
pub type RawJobFn = extern "C" fn(*mut c_void);

/// Raw pointer wrapper that may cross threads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SendPtr(pub *mut c_void);

unsafe impl Send for SendPtr {}
unsafe impl Sync for SendPtr {}

enum Work {
    Closure(Box<dyn FnOnce() + Send + 'static>),
    Raw { fun: RawJobFn, param: SendPtr },
}

/// A unit of work to be executed by the job manager.
pub struct JobDescriptor {
    work: Work,
}

impl JobDescriptor {
    /// Creates a job from a closure.
    pub fn new<F>(work: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        JobDescriptor {
            work: Work::Closure(Box::new(work)),
        }
    }

    /// Creates a job that calls `fun(param)`.
    ///
    /// # Safety
    ///
    /// `param` must stay valid until the job has run, and `fun` must be safe
    /// to call with it from any worker thread.
    pub unsafe fn from_raw(fun: RawJobFn, param: *mut c_void) -> Self {
        JobDescriptor {
            work: Work::Raw {
                fun,
                param: SendPtr(param),
            },
        }
    }

    /// Runs the job's function on the calling stack.
    pub fn run(self) {
        match self.work {
            Work::Closure(work) => work(),
            Work::Raw { fun, param } => fun(param.0),
        }
    }
}

impl fmt::Debug for JobDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.work {
            Work::Closure(_) => f.write_str("JobDescriptor::Closure"),
            Work::Raw { fun, param } => f
                .debug_struct("JobDescriptor::Raw")
                .field("fun", &(*fun as *const c_void))
                .field("param", &param.0)
                .finish(),
        }
    }
}

/// A queued job: the descriptor plus the counter of the batch it belongs to.
pub struct JobRecord {
    descriptor: JobDescriptor,
    counter: Arc<Counter>,
}

impl JobRecord {
    pub fn new(descriptor: JobDescriptor, counter: Arc<Counter>) -> Self {
        JobRecord {
            descriptor,
            counter,
        }
    }

    /// The batch counter this job decrements on completion.
    pub fn counter(&self) -> &Arc<Counter> {
        &self.counter
    }

    /// Splits the record into the job and its batch counter.
    pub fn into_parts(self) -> (JobDescriptor, Arc<Counter>) {
        (self.descriptor, self.counter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[test]
    fn test_job_execution() {
        let executed = Arc::new(AtomicBool::new(false));
        let executed_clone = executed.clone();

        let job = JobDescriptor::new(move || {
            executed_clone.store(true, Ordering::SeqCst);
        });

        job.run();
        assert!(executed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_job_record_shares_batch_counter() {
        let counter = Arc::new(Counter::new(2));
        let first = JobRecord::new(JobDescriptor::new(|| {}), counter.clone());
        let second = JobRecord::new(JobDescriptor::new(|| {}), counter.clone());
        assert!(Arc::ptr_eq(first.counter(), second.counter()));

        let (job, batch) = first.into_parts();
        job.run();
        batch.decrement();
        assert_eq!(counter.value(), 1);
    }

    extern "C" fn bump(param: *mut c_void) {
        let hits = unsafe { &*(param as *const AtomicUsize) };
        hits.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn test_raw_job_receives_param() {
        let hits = AtomicUsize::new(0);
        let job = unsafe { JobDescriptor::from_raw(bump, &hits as *const _ as *mut c_void) };
        job.run();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
