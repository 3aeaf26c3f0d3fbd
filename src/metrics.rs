use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Optional scheduling metrics of one job manager.
#[derive(Debug)]
pub struct Metrics {
    /// Jobs pushed into the queue.
    pub jobs_submitted: AtomicU64,
    /// Jobs whose function returned.
    pub jobs_completed: AtomicU64,
    /// Pushes that found the queue full and had to retry.
    pub queue_full_retries: AtomicU64,
    /// Idle fibers claimed and loaded with a job.
    pub fiber_claims: AtomicU64,
    /// Dispatch passes that found no idle fiber.
    pub fiber_claim_misses: AtomicU64,
    /// Fibers suspended by a plain yield.
    pub yields: AtomicU64,
    /// Fibers suspended on a counter.
    pub awaits: AtomicU64,
    /// Time when metrics collection started.
    pub start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            jobs_submitted: AtomicU64::new(0),
            jobs_completed: AtomicU64::new(0),
            queue_full_retries: AtomicU64::new(0),
            fiber_claims: AtomicU64::new(0),
            fiber_claim_misses: AtomicU64::new(0),
            yields: AtomicU64::new(0),
            awaits: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Returns a snapshot of current metrics values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            jobs_submitted: self.jobs_submitted.load(Ordering::Relaxed),
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
            queue_full_retries: self.queue_full_retries.load(Ordering::Relaxed),
            fiber_claims: self.fiber_claims.load(Ordering::Relaxed),
            fiber_claim_misses: self.fiber_claim_misses.load(Ordering::Relaxed),
            yields: self.yields.load(Ordering::Relaxed),
            awaits: self.awaits.load(Ordering::Relaxed),
            elapsed_seconds: self.start_time.elapsed().as_secs_f64(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub jobs_submitted: u64,
    pub jobs_completed: u64,
    pub queue_full_retries: u64,
    pub fiber_claims: u64,
    pub fiber_claim_misses: u64,
    pub yields: u64,
    pub awaits: u64,
    pub elapsed_seconds: f64,
}

impl MetricsSnapshot {
    /// Calculates jobs per second throughput.
    pub fn jobs_per_second(&self) -> f64 {
        if self.elapsed_seconds > 0.0 {
            self.jobs_completed as f64 / self.elapsed_seconds
        } else {
            0.0
        }
    }

    /// Jobs submitted but not yet completed.
    pub fn jobs_in_flight(&self) -> u64 {
        self.jobs_submitted.saturating_sub(self.jobs_completed)
    }
}
