//! Error types for contentforge operations.
//!
//! Defines the error taxonomy shared by the orchestration core:
//! - Stage failures raised by producers, assemblers and publishers
//! - Job store failures (unreachable store, missing records, bad rows)
//! - Illegal status transitions

use std::time::Duration;

use thiserror::Error;

use crate::scheduler::job::{JobId, JobStatus};

/// Errors raised by a pipeline stage (produce, assemble, publish).
///
/// The variant decides what the failure/retry manager does with the job:
/// transient errors and timeouts are retried with backoff, permanent errors
/// fail the job immediately.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StageError {
    #[error("Transient stage error: {0}")]
    Transient(String),

    #[error("Stage timed out after {0:?}")]
    Timeout(Duration),

    #[error("Permanent stage error: {0}")]
    Permanent(String),
}

impl StageError {
    /// Creates a retryable error.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    /// Creates a non-retryable error.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent(message.into())
    }

    /// Returns whether the job may be attempted again after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout(_))
    }
}

/// Errors that can occur during job store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Job {0} not found")]
    NotFound(JobId),

    #[error("Job store unavailable: {0}")]
    Unavailable(String),

    #[error("Query failed: {0}")]
    Query(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Invalid job record: {0}")]
    InvalidRecord(String),

    #[error("Job {0} is already {1}")]
    Finished(JobId, JobStatus),

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

/// A status write that does not follow an edge of the job state machine.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Invalid state transition for job {job_id} from '{from}' to '{to}'")]
pub struct TransitionError {
    pub job_id: JobId,
    pub from: JobStatus,
    pub to: JobStatus,
}

impl StoreError {
    /// Terminal status another writer left the job in, when that is why the
    /// write was refused.
    pub fn finished_status(&self) -> Option<JobStatus> {
        match self {
            Self::Transition(t) if t.from.is_terminal() => Some(t.from),
            Self::Finished(_, status) => Some(*status),
            _ => None,
        }
    }
}
