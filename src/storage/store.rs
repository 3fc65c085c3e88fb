//! The job store interface.
//!
//! The orchestrator only reads and writes content records through
//! [`JobStore`]. Implementations must reject status writes that do not follow
//! an edge of the job state machine (see [`crate::scheduler::lifecycle`]).

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::scheduler::job::{ContentJob, JobId, JobMetadata, JobStatus, NewContentJob};

/// Durable storage of content records.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Inserts a new record in `Pending` and returns it with its assigned id.
    async fn create(&self, job: NewContentJob) -> Result<ContentJob, StoreError>;

    /// Looks up a record by id.
    async fn get_by_id(&self, id: JobId) -> Result<Option<ContentJob>, StoreError>;

    /// Looks up a record by id, failing with [`StoreError::NotFound`] if absent.
    async fn get(&self, id: JobId) -> Result<ContentJob, StoreError> {
        self.get_by_id(id).await?.ok_or(StoreError::NotFound(id))
    }

    /// Returns jobs in `Pending` whose scheduled time is at or before `now`,
    /// ordered by scheduled time and then id.
    async fn list_ready(&self, now: DateTime<Utc>) -> Result<Vec<ContentJob>, StoreError>;

    /// Returns all jobs, optionally restricted to one status, ordered by id.
    async fn list(&self, status: Option<JobStatus>) -> Result<Vec<ContentJob>, StoreError>;

    /// Moves a job to `status`.
    ///
    /// Fails with [`StoreError::Transition`] when the current status has no
    /// edge to `status`; nothing is written in that case.
    async fn set_status(&self, id: JobId, status: JobStatus) -> Result<(), StoreError>;

    /// Replaces the metadata map of a job.
    ///
    /// Fails with [`StoreError::Finished`] once the job is terminal; a
    /// finished record is never rewritten.
    async fn set_metadata(&self, id: JobId, metadata: JobMetadata) -> Result<(), StoreError>;

    /// Sets the scheduled time of a job.
    async fn reschedule(&self, id: JobId, at: DateTime<Utc>) -> Result<(), StoreError>;
}
