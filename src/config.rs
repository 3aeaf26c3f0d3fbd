//! Capacity limits and runtime configuration for the job manager.
//!
//! The fiber pool, the worker set and the job queue are fixed-size. Their
//! sizes are chosen once, at initialization, and never grow afterwards.

use crate::error::JobError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Maximum number of worker threads a manager may start.
pub const MAX_WORKER_THREAD_COUNT: usize = 16;

/// Maximum number of fibers in the pool.
pub const MAX_FIBER_POOL_SIZE: usize = 1024;

/// Smallest accepted fiber stack.
pub const MIN_FIBER_STACK_SIZE: usize = 16 * 1024;

/// Largest accepted job queue, as a power of two.
pub const MAX_QUEUE_CAPACITY_LOG2: u32 = 20;

/// Strategy for pinning worker threads to CPU cores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PinningStrategy {
    /// No pinning (standard OS scheduling).
    #[default]
    None,
    /// Worker i -> logical processor i.
    Linear,
    /// Worker i -> logical processor i + 1, leaving core 0 to the thread
    /// that drives the application.
    SkipFirst,
}

impl PinningStrategy {
    /// Returns the core index worker `worker_index` should run on, if any.
    pub fn core_for(self, worker_index: usize) -> Option<usize> {
        match self {
            PinningStrategy::None => None,
            PinningStrategy::Linear => Some(worker_index),
            PinningStrategy::SkipFirst => Some(worker_index + 1),
        }
    }
}

/// Configuration for the job manager.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobManagerConfig {
    /// Number of fibers, each with its own stack. Default: 128.
    pub fiber_pool_size: usize,
    /// Stack size for each fiber in bytes, a power of two. Default: 512KB.
    pub fiber_stack_size: usize,
    /// Job queue capacity as a power of two. Default: 10 (1024 jobs).
    pub queue_capacity_log2: u32,
    /// Sleep between polls when a worker finds no job, and between counter
    /// checks when waiting off a worker thread. Default: 100ns.
    #[serde(with = "duration_nanos")]
    pub idle_backoff: Duration,
    /// CPU pinning of worker threads. Default: none.
    pub pinning: PinningStrategy,
}

impl Default for JobManagerConfig {
    fn default() -> Self {
        Self {
            fiber_pool_size: 128,
            fiber_stack_size: 512 * 1024,
            queue_capacity_log2: 10,
            idle_backoff: Duration::from_nanos(100),
            pinning: PinningStrategy::None,
        }
    }
}

impl JobManagerConfig {
    /// Parses a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, JobError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Number of slots in the job queue.
    pub fn queue_capacity(&self) -> usize {
        1usize << self.queue_capacity_log2
    }

    /// Checks every field against the hard capacity limits.
    pub fn validate(&self) -> Result<(), JobError> {
        if self.fiber_pool_size == 0 || self.fiber_pool_size > MAX_FIBER_POOL_SIZE {
            return Err(JobError::InvalidConfig(format!(
                "fiber_pool_size must be in 1..={MAX_FIBER_POOL_SIZE}, got {}",
                self.fiber_pool_size
            )));
        }
        if !self.fiber_stack_size.is_power_of_two() || self.fiber_stack_size < MIN_FIBER_STACK_SIZE
        {
            return Err(JobError::InvalidConfig(format!(
                "fiber_stack_size must be a power of two >= {MIN_FIBER_STACK_SIZE}, got {}",
                self.fiber_stack_size
            )));
        }
        if self.queue_capacity_log2 == 0 || self.queue_capacity_log2 > MAX_QUEUE_CAPACITY_LOG2 {
            return Err(JobError::InvalidConfig(format!(
                "queue_capacity_log2 must be in 1..={MAX_QUEUE_CAPACITY_LOG2}, got {}",
                self.queue_capacity_log2
            )));
        }
        Ok(())
    }
}

mod duration_nanos {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_nanos().min(u64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_nanos)
    }
}
