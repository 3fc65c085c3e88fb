//! Readiness polling.
//!
//! The poller asks the job store for `Pending` jobs whose scheduled time has
//! passed and enqueues the ones the control loop does not already track.
//! A failed poll is logged and retried on the next tick with an exponential
//! delay capped at a multiple of the base interval.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use crate::error::StoreError;
use crate::metrics::MetricsCollector;
use crate::storage::JobStore;

use super::job::ScheduledTask;
use super::queue::{ActiveTaskRegistry, PendingQueue};

/// Periodically discovers ready jobs.
#[derive(Debug)]
pub struct ReadinessPoller {
    interval: Duration,
    max_backoff: Duration,
    consecutive_failures: u32,
    next_poll_at: Instant,
    metrics: MetricsCollector,
}

impl ReadinessPoller {
    /// Creates a poller that is due immediately.
    pub fn new(interval: Duration, max_backoff: Duration) -> Self {
        Self {
            interval,
            max_backoff: max_backoff.max(interval),
            consecutive_failures: 0,
            next_poll_at: Instant::now(),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// When the next poll should run.
    pub fn next_poll_at(&self) -> Instant {
        self.next_poll_at
    }

    pub fn is_due(&self, now: Instant) -> bool {
        now >= self.next_poll_at
    }

    /// Delay before the next poll given the current failure streak.
    pub fn current_delay(&self) -> Duration {
        if self.consecutive_failures == 0 {
            return self.interval;
        }
        2u32.checked_pow(self.consecutive_failures)
            .and_then(|factor| self.interval.checked_mul(factor))
            .map_or(self.max_backoff, |delay| delay.min(self.max_backoff))
    }

    /// Runs one poll and enqueues newly discovered jobs.
    ///
    /// Jobs already queued or holding a slot are skipped. Returns the number
    /// of jobs enqueued. On failure nothing is enqueued and the next poll is
    /// pushed back.
    pub async fn poll(
        &mut self,
        store: &dyn JobStore,
        now: DateTime<Utc>,
        registry: &ActiveTaskRegistry,
        queue: &mut PendingQueue,
    ) -> Result<usize, StoreError> {
        let result = store.list_ready(now).await;
        let ready = match result {
            Ok(jobs) => jobs,
            Err(e) => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                let delay = self.current_delay();
                self.next_poll_at = Instant::now() + delay;
                self.metrics.record_poll_failure();
                tracing::warn!(
                    error = %e,
                    consecutive_failures = self.consecutive_failures,
                    retry_in_secs = delay.as_secs_f64(),
                    "Poll for ready jobs failed"
                );
                return Err(e);
            }
        };

        if self.consecutive_failures > 0 {
            tracing::info!(
                consecutive_failures = self.consecutive_failures,
                "Job store reachable again"
            );
        }
        self.consecutive_failures = 0;
        self.next_poll_at = Instant::now() + self.interval;

        let mut discovered = 0;
        for job in ready {
            if registry.contains(job.id) || queue.contains(job.id) {
                continue;
            }
            let job_id = job.id;
            if queue.push(ScheduledTask::new(job, now)) {
                tracing::debug!(job_id = job_id, "Discovered ready job");
                discovered += 1;
            }
        }

        self.metrics.record_poll(discovered);
        if discovered > 0 {
            tracing::info!(discovered = discovered, queued = queue.len(), "Enqueued ready jobs");
        }
        Ok(discovered)
    }
}
