//! High-level recording interface over the raw Prometheus metrics.
//!
//! Every method is a no-op until `init_metrics()` has run, so library users
//! and tests that never initialize metrics pay nothing.

use crate::pipeline::stages::Stage;
use crate::scheduler::job::JobStatus;

use super::prometheus::{
    ACTIVE_JOBS, JOBS_DISCOVERED_TOTAL, JOBS_TOTAL, POLL_FAILURES_TOTAL, QUEUE_DEPTH,
    RETRIES_TOTAL, STAGE_DURATION,
};

/// Metrics collector for recording orchestrator metrics.
///
/// # Example
///
/// ```ignore
/// use contentforge::metrics::{init_metrics, MetricsCollector};
///
/// init_metrics().expect("Failed to init metrics");
/// let collector = MetricsCollector::new();
/// collector.record_job_finished(JobStatus::Completed);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    /// Create a new MetricsCollector instance.
    pub fn new() -> Self {
        Self
    }

    /// Record a job reaching a terminal status.
    pub fn record_job_finished(&self, status: JobStatus) {
        if let Some(jobs_total) = JOBS_TOTAL.get() {
            jobs_total.with_label_values(&[status.as_str()]).inc();
        }

        tracing::trace!(status = %status, "Recorded job metric");
    }

    /// Record one stage call.
    ///
    /// `outcome` is `success`, `transient`, `timeout`, `permanent` or `cancelled`.
    pub fn record_stage(&self, stage: Stage, outcome: &str, duration_secs: f64) {
        if let Some(stage_duration) = STAGE_DURATION.get() {
            stage_duration
                .with_label_values(&[stage.as_str(), outcome])
                .observe(duration_secs);
        }

        tracing::trace!(
            stage = %stage,
            outcome = outcome,
            duration_secs = duration_secs,
            "Recorded stage metric"
        );
    }

    /// Record a scheduled retry.
    pub fn record_retry(&self) {
        if let Some(retries) = RETRIES_TOTAL.get() {
            retries.inc();
        }
    }

    /// Record the result of a readiness poll.
    pub fn record_poll(&self, discovered: usize) {
        if let Some(counter) = JOBS_DISCOVERED_TOTAL.get() {
            counter.inc_by(discovered as f64);
        }
    }

    /// Record a readiness poll that failed.
    pub fn record_poll_failure(&self) {
        if let Some(counter) = POLL_FAILURES_TOTAL.get() {
            counter.inc();
        }
    }

    /// Update the queue depth and active job gauges.
    pub fn update_occupancy(&self, queued: usize, active: usize) {
        if let Some(queue_depth) = QUEUE_DEPTH.get() {
            queue_depth.set(queued as f64);
        }
        if let Some(active_jobs) = ACTIVE_JOBS.get() {
            active_jobs.set(active as f64);
        }
    }
}
