//! Fiber management and execution context.
//!
//! A fiber is a stackful execution context a job runs in. It can suspend in
//! the middle of the job (yield, or await a completion counter) and later
//! resume exactly where it left off, without holding an OS thread.
//!
//! Register save/restore is delegated to `corosensei`, which saves the
//! callee-saved registers, the stack pointer and the floating-point control
//! words of the target ABI. All unsafe code touching fiber internals lives in
//! this module.

use crate::counter::Counter;
use crate::error::JobError;
use crate::job::{JobDescriptor, JobRecord};
use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult, Yielder};
use std::cell::{Cell, RefCell, UnsafeCell};
use std::panic::{self, AssertUnwindSafe};
use std::ptr::{self, NonNull};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle status of a fiber in the pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum FiberStatus {
    /// In the pool, free to be claimed by any worker.
    Idle = 0,
    /// Owned by a worker, about to run or running a job.
    Running = 1,
    /// Owned by a worker, suspended mid-job by a yield or an await.
    Waiting = 2,
}

impl FiberStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => FiberStatus::Idle,
            1 => FiberStatus::Running,
            2 => FiberStatus::Waiting,
            other => unreachable!("invalid fiber status {other}"),
        }
    }
}

/// Value passed into the fiber when the host switches to it.
#[derive(Clone, Copy, Debug)]
pub enum FiberInput {
    /// Start the job loaded into the given fiber.
    Start(*const Fiber),
    /// Continue after a yield or an await.
    Resume,
}

/// Reason the fiber handed control back to its host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FiberYield {
    /// Cooperative yield with no dependency.
    Yield,
    /// Suspended until the fiber's await counter reaches its target.
    Await,
    /// The job returned; the fiber is ready for reuse.
    Complete,
}

/// A counter value a suspended fiber is blocked on.
#[derive(Debug)]
pub struct AwaitTarget {
    pub counter: Arc<Counter>,
    pub target: u32,
}

impl AwaitTarget {
    pub fn is_satisfied(&self) -> bool {
        self.counter.reached(self.target)
    }
}

thread_local! {
    static CURRENT_FIBER: Cell<*const Fiber> = const { Cell::new(ptr::null()) };
}

/// A reusable stackful execution context.
///
/// Everything except `status` is only touched by the worker that won the
/// Idle -> Running compare-and-swap, and by the job running on the fiber on
/// that same worker thread.
pub struct Fiber {
    status: AtomicU8,
    coroutine: UnsafeCell<Coroutine<FiberInput, FiberYield, (), DefaultStack>>,
    yielder: Cell<*const Yielder<FiberInput, FiberYield>>,
    job: Cell<Option<JobDescriptor>>,
    completion_counter: Cell<Option<Arc<Counter>>>,
    await_counter: RefCell<Option<AwaitTarget>>,
    job_complete: Cell<bool>,
    needs_start: Cell<bool>,
}

// SAFETY: ownership of the non-atomic fields is handed between threads only
// through the `status` CAS (acquire) and the release store back to Idle. A
// fiber with an unfinished job never changes threads.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Creates a fiber with its own stack of `stack_size` bytes.
    ///
    /// The coroutine body is an endless trampoline: run the loaded job,
    /// decrement its counter, flag completion, switch back to the host, and
    /// wait for the next job.
    pub fn new(stack_size: usize) -> Result<Self, JobError> {
        let stack = DefaultStack::new(stack_size).map_err(|source| JobError::StackAllocation {
            size: stack_size,
            source,
        })?;

        let coroutine: Coroutine<FiberInput, FiberYield, (), DefaultStack> =
            Coroutine::with_stack(stack, |yielder, mut input: FiberInput| {
                loop {
                    match input {
                        FiberInput::Start(fiber_ptr) => {
                            // SAFETY: the pool keeps fibers at a stable address
                            // for as long as their coroutine exists.
                            let fiber = unsafe { &*fiber_ptr };
                            fiber.yielder.set(yielder as *const _);

                            if let Some(job) = fiber.job.take() {
                                job.run();
                            }

                            // Exit trampoline.
                            if let Some(counter) = fiber.completion_counter.take() {
                                counter.decrement();
                            }
                            fiber.job_complete.set(true);
                            fiber.yielder.set(ptr::null());
                        }
                        FiberInput::Resume => {
                            tracing::error!("fiber resumed without a job in flight");
                            std::process::abort();
                        }
                    }

                    input = yielder.suspend(FiberYield::Complete);
                }
            });

        Ok(Fiber {
            status: AtomicU8::new(FiberStatus::Idle as u8),
            coroutine: UnsafeCell::new(coroutine),
            yielder: Cell::new(ptr::null()),
            job: Cell::new(None),
            completion_counter: Cell::new(None),
            await_counter: RefCell::new(None),
            job_complete: Cell::new(false),
            needs_start: Cell::new(false),
        })
    }

    pub fn status(&self) -> FiberStatus {
        FiberStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Atomically takes ownership of an idle fiber.
    pub fn try_claim(&self) -> bool {
        self.status
            .compare_exchange(
                FiberStatus::Idle as u8,
                FiberStatus::Running as u8,
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    /// Marks an owned fiber as suspended (`Waiting`) or running again.
    pub(crate) fn set_owned_status(&self, status: FiberStatus) {
        debug_assert_ne!(status, FiberStatus::Idle, "use release() to return a fiber");
        self.status.store(status as u8, Ordering::Relaxed);
    }

    /// Returns the fiber to the pool. Must be the last access by its owner.
    pub fn release(&self) {
        self.job_complete.set(false);
        self.status
            .store(FiberStatus::Idle as u8, Ordering::Release);
    }

    /// Loads a job so that the next [`Fiber::resume`] starts it.
    ///
    /// Records the job's completion counter and clears the completion flag and
    /// any await counter.
    pub fn load_job(&self, record: JobRecord) {
        debug_assert_eq!(self.status(), FiberStatus::Running);
        let (job, counter) = record.into_parts();
        self.job.set(Some(job));
        self.completion_counter.set(Some(counter));
        self.await_counter.replace(None);
        self.job_complete.set(false);
        self.needs_start.set(true);
    }

    /// Whether the last job loaded into this fiber has returned.
    pub fn is_job_complete(&self) -> bool {
        self.job_complete.get()
    }

    /// Whether the fiber may be switched into: it has no await counter, or
    /// the awaited counter reached its target.
    pub fn is_runnable(&self) -> bool {
        self.await_counter
            .borrow()
            .as_ref()
            .is_none_or(AwaitTarget::is_satisfied)
    }

    /// Switches from the calling (host) context into the fiber.
    ///
    /// Returns when the fiber completes its job or suspends itself. A panic
    /// escaping the job is a fatal fault: it is logged and the process aborts.
    pub fn resume(&self) -> FiberYield {
        let input = if self.needs_start.replace(false) {
            FiberInput::Start(self as *const Fiber)
        } else {
            FiberInput::Resume
        };

        let previous = CURRENT_FIBER.replace(self as *const Fiber);
        // SAFETY: only the owning worker resumes a fiber, and the coroutine is
        // never borrowed from inside itself.
        let coroutine = unsafe { &mut *self.coroutine.get() };
        let result = panic::catch_unwind(AssertUnwindSafe(|| coroutine.resume(input)));
        CURRENT_FIBER.set(previous);

        match result {
            Ok(CoroutineResult::Yield(reason)) => {
                if reason != FiberYield::Await {
                    self.await_counter.replace(None);
                }
                reason
            }
            Ok(CoroutineResult::Return(())) => {
                tracing::error!("fiber trampoline returned");
                std::process::abort();
            }
            Err(payload) => {
                let msg = if let Some(s) = payload.downcast_ref::<&str>() {
                    *s
                } else if let Some(s) = payload.downcast_ref::<String>() {
                    s.as_str()
                } else {
                    "unknown panic"
                };
                tracing::error!("job panicked: {msg}");
                std::process::abort();
            }
        }
    }

    /// Returns the fiber the calling code runs on, if any.
    pub(crate) fn current() -> Option<NonNull<Fiber>> {
        NonNull::new(CURRENT_FIBER.get() as *mut Fiber)
    }

    /// Whether the calling code runs inside a fiber.
    pub fn in_fiber() -> bool {
        Self::current().is_some()
    }

    /// Switches from the current fiber back to its host context.
    ///
    /// # Panics
    ///
    /// Panics if not called from inside a running fiber.
    pub(crate) fn suspend(reason: FiberYield) {
        let fiber = Self::current().expect("Fiber::suspend called outside of a fiber");
        // SAFETY: CURRENT_FIBER is only set while the fiber runs on this thread.
        let fiber = unsafe { fiber.as_ref() };
        let yielder = fiber.yielder.get();
        assert!(!yielder.is_null(), "fiber suspended without a yielder");

        // SAFETY: the yielder belongs to the coroutine currently executing.
        let input = unsafe { &*yielder }.suspend(reason);
        debug_assert!(matches!(input, FiberInput::Resume));
    }

    /// Suspends the current fiber until `counter` equals `target`.
    pub(crate) fn await_counter(counter: Arc<Counter>, target: u32) {
        let fiber = Self::current().expect("Fiber::await_counter called outside of a fiber");
        // SAFETY: see `suspend`.
        let fiber = unsafe { fiber.as_ref() };
        fiber
            .await_counter
            .replace(Some(AwaitTarget { counter, target }));
        Self::suspend(FiberYield::Await);
        fiber.await_counter.replace(None);
    }
}
