//! Failure handling and retry scheduling.
//!
//! A failed attempt either returns the job to `Pending` with a later
//! scheduled time, so the regular poll/admit path picks it up again after the
//! backoff, or fails it for good.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::{StageError, StoreError};
use crate::metrics::MetricsCollector;
use crate::scheduler::job::{keys, JobStatus, ScheduledTask};
use crate::storage::{ArtifactCleaner, JobStore};

/// Exponential backoff policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Failed attempts after which the job fails for good.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// Backoff after `retries_done` earlier retries: `base_delay * 2^retries_done`.
    ///
    /// Saturates at `Duration::MAX`.
    pub fn backoff_for(&self, retries_done: u32) -> Duration {
        2u32.checked_pow(retries_done)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .unwrap_or(Duration::MAX)
    }

    /// Returns whether a job with `failed_attempts` failures gets another attempt.
    pub fn should_retry(&self, failed_attempts: u32) -> bool {
        failed_attempts < self.max_retries
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(60))
    }
}

/// What the retry manager did with a failed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureDisposition {
    /// The job is back in `Pending`, eligible again at `next_attempt_at`.
    Retry {
        retry_count: u32,
        delay: Duration,
        next_attempt_at: DateTime<Utc>,
    },
    /// The job is `Failed`.
    Failed { retry_count: u32 },
}

/// Applies the retry policy to failed attempts.
#[derive(Clone)]
pub struct RetryManager {
    store: Arc<dyn JobStore>,
    policy: RetryPolicy,
    cleaner: ArtifactCleaner,
    metrics: MetricsCollector,
}

impl RetryManager {
    pub fn new(store: Arc<dyn JobStore>, policy: RetryPolicy, cleaner: ArtifactCleaner) -> Self {
        Self {
            store,
            policy,
            cleaner,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Handles a failed attempt of `task`.
    ///
    /// Cleans up the attempt's artifacts and records `last_error`. Permanent
    /// errors fail the job without counting a retry. Otherwise `retry_count`
    /// is incremented; below `max_retries` the job is rescheduled to
    /// `now + backoff` and returned to `Pending`, else it fails. The task's
    /// snapshot is updated to match what was persisted.
    pub async fn handle_failure(
        &self,
        task: &mut ScheduledTask,
        error: &StageError,
    ) -> Result<FailureDisposition, StoreError> {
        let job_id = task.id();
        self.cleaner.cleanup(task).await;
        task.job.set_metadata(keys::LAST_ERROR, error.to_string());

        if !error.is_retryable() {
            let retry_count = task.job.retry_count();
            task.job.metadata.remove(keys::NEXT_ATTEMPT_AT);
            self.fail(task).await?;
            tracing::warn!(job_id = job_id, error = %error, "Job failed permanently");
            return Ok(FailureDisposition::Failed { retry_count });
        }

        let retry_count = task.job.retry_count().saturating_add(1);
        task.job.set_metadata(keys::RETRY_COUNT, retry_count);

        if !self.policy.should_retry(retry_count) {
            task.job.metadata.remove(keys::NEXT_ATTEMPT_AT);
            self.fail(task).await?;
            tracing::warn!(
                job_id = job_id,
                retry_count = retry_count,
                error = %error,
                "Job failed after exhausting retries"
            );
            return Ok(FailureDisposition::Failed { retry_count });
        }

        let delay = self.policy.backoff_for(retry_count - 1);
        let now = Utc::now();
        let next_attempt_at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|offset| now.checked_add_signed(offset))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        task.job
            .set_metadata(keys::NEXT_ATTEMPT_AT, next_attempt_at.to_rfc3339());

        // Reschedule before the job becomes Pending so the poller never sees it early.
        self.store
            .set_metadata(job_id, task.job.metadata.clone())
            .await?;
        self.store.reschedule(job_id, next_attempt_at).await?;
        task.job.schedule_time = next_attempt_at;

        if task.job.status != JobStatus::Pending {
            self.store.set_status(job_id, JobStatus::Pending).await?;
            task.job.status = JobStatus::Pending;
        }

        self.metrics.record_retry();
        tracing::info!(
            job_id = job_id,
            retry_count = retry_count,
            delay_secs = delay.as_secs_f64(),
            error = %error,
            "Job scheduled for retry"
        );

        Ok(FailureDisposition::Retry {
            retry_count,
            delay,
            next_attempt_at,
        })
    }

    async fn fail(&self, task: &mut ScheduledTask) -> Result<(), StoreError> {
        let job_id = task.id();
        self.store
            .set_metadata(job_id, task.job.metadata.clone())
            .await?;
        self.store.set_status(job_id, JobStatus::Failed).await?;
        task.job.status = JobStatus::Failed;
        Ok(())
    }
}
