use crate::error::JobError;
use crate::fiber::{Fiber, FiberStatus};

/// A fixed pool of fibers shared by all workers of a manager.
///
/// Fibers are allocated once, at initialization, and reused for the whole
/// lifetime of the manager. The pool never grows: a worker that finds no idle
/// fiber simply tries again on its next dispatch pass.
pub struct FiberPool {
    fibers: Box<[Fiber]>,
}

impl FiberPool {
    /// Allocates `count` fibers with `stack_size` byte stacks.
    ///
    /// Fails as a whole if any stack cannot be allocated.
    pub fn new(count: usize, stack_size: usize) -> Result<Self, JobError> {
        let fibers = (0..count)
            .map(|_| Fiber::new(stack_size))
            .collect::<Result<Vec<_>, _>>()?
            .into_boxed_slice();
        Ok(FiberPool { fibers })
    }

    /// Claims the first idle fiber (Idle -> Running), if any.
    pub fn try_claim(&self) -> Option<&Fiber> {
        self.fibers.iter().find(|fiber| fiber.try_claim())
    }

    /// Total number of fibers in the pool.
    pub fn len(&self) -> usize {
        self.fibers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fibers.is_empty()
    }

    /// Number of fibers currently idle. Only a snapshot under concurrent use.
    pub fn idle_count(&self) -> usize {
        self.fibers
            .iter()
            .filter(|fiber| fiber.status() == FiberStatus::Idle)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_claims_each_fiber_once() {
        let pool = FiberPool::new(4, 64 * 1024).unwrap();
        assert_eq!(pool.len(), 4);
        assert_eq!(pool.idle_count(), 4);

        let claimed: Vec<_> = (0..4).map(|_| pool.try_claim().unwrap()).collect();
        assert!(pool.try_claim().is_none());
        assert_eq!(pool.idle_count(), 0);

        claimed[2].release();
        assert_eq!(pool.idle_count(), 1);
        let again = pool.try_claim().unwrap();
        assert!(std::ptr::eq(again, claimed[2]));
    }
}
