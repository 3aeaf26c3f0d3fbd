//! Error types for job manager construction and teardown.
//!
//! Only lifecycle operations are fallible. Violations of the scheduling
//! protocol itself (stale counter handles, counter underflow, a job panicking)
//! are invariant violations and panic or abort instead.

use crate::config::MAX_WORKER_THREAD_COUNT;

/// Errors reported by [`JobManager`](crate::JobManager) lifecycle calls.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("thread count must be in 1..={max}, got {requested}", max = MAX_WORKER_THREAD_COUNT)]
    InvalidThreadCount { requested: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to allocate a {size} byte fiber stack")]
    StackAllocation {
        size: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to spawn worker thread {index}")]
    ThreadSpawn {
        index: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("a job manager cannot be initialized from a worker thread")]
    NestedInitialize,

    #[error("{0} worker thread(s) panicked")]
    WorkerPanicked(usize),

    #[error("failed to parse configuration")]
    Config(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = JobError::InvalidThreadCount { requested: 17 };
        assert_eq!(err.to_string(), "thread count must be in 1..=16, got 17");

        let err = JobError::WorkerPanicked(2);
        assert_eq!(err.to_string(), "2 worker thread(s) panicked");
    }
}
