//! Job definitions for the scheduler.
//!
//! This module defines the core job types used by the orchestrator:
//!
//! - `ContentJob`: the durable content record owned by the job store
//! - `NewContentJob`: intake payload used to create a record
//! - `JobStatus`: position of a job in the pipeline state machine
//! - `ScheduledTask`: in-memory working copy of a job once it is ready
//! - `ExecutionPlan`: which stages an admitted task will run

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identifier of a content job, assigned by the job store.
pub type JobId = i64;

/// Open key/value map carrying stage outputs and bookkeeping.
pub type JobMetadata = serde_json::Map<String, Value>;

/// Well-known metadata keys.
pub mod keys {
    /// Pre-existing artifact supplied at intake; enables the publish-only plan.
    pub const EXISTING_ARTIFACT_PATH: &str = "existing_artifact_path";
    /// Output of the produce stage.
    pub const ARTIFACT_PATH: &str = "artifact_path";
    /// Artifact handed to the publisher.
    pub const FINAL_ARTIFACT_PATH: &str = "final_artifact_path";
    /// Identifier issued by the publishing platform.
    pub const EXTERNAL_ID: &str = "external_id";
    /// URL issued by the publishing platform, when it returns one.
    pub const EXTERNAL_URL: &str = "external_url";
    /// Number of failed attempts so far.
    pub const RETRY_COUNT: &str = "retry_count";
    /// Message of the most recent failure.
    pub const LAST_ERROR: &str = "last_error";
    /// Instant (RFC 3339) at which the next attempt becomes eligible.
    pub const NEXT_ATTEMPT_AT: &str = "next_attempt_at";
    /// `produced` or `existing_artifact`.
    pub const GENERATION_METHOD: &str = "generation_method";
}

/// Status of a content job.
///
/// Jobs advance `Pending -> Producing -> Assembling -> Publishing -> Completed`.
/// `Failed` and `Cancelled` can be reached from any non-terminal status.
/// See [`crate::scheduler::lifecycle`] for the full edge set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Producing,
    Assembling,
    Publishing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Every status, in pipeline order.
    pub const ALL: [JobStatus; 7] = [
        JobStatus::Pending,
        JobStatus::Producing,
        JobStatus::Assembling,
        JobStatus::Publishing,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    /// Statuses a job holds while a pipeline stage owns it.
    pub const IN_PROGRESS: [JobStatus; 3] = [
        JobStatus::Producing,
        JobStatus::Assembling,
        JobStatus::Publishing,
    ];

    /// Returns the stored string form of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Producing => "producing",
            JobStatus::Assembling => "assembling",
            JobStatus::Publishing => "publishing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Returns whether no further automatic transition occurs from this status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Returns whether a pipeline stage currently owns the job.
    pub fn is_in_progress(&self) -> bool {
        Self::IN_PROGRESS.contains(self)
    }

    /// Human readable progress label used by status reports.
    pub fn progress_label(&self) -> &'static str {
        match self {
            JobStatus::Pending => "Queued",
            JobStatus::Producing => "Producing media",
            JobStatus::Assembling => "Assembling media",
            JobStatus::Publishing => "Publishing",
            JobStatus::Completed => "Completed",
            JobStatus::Failed => "Failed",
            JobStatus::Cancelled => "Cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown status string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown job status '{0}'")]
pub struct ParseStatusError(pub String);

impl FromStr for JobStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == normalized)
            .ok_or_else(|| ParseStatusError(s.to_string()))
    }
}

/// A durable content record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentJob {
    pub id: JobId,
    pub title: String,
    pub description: String,
    pub category: String,
    pub expected_duration_seconds: u32,
    pub schedule_time: DateTime<Utc>,
    pub status: JobStatus,
    #[serde(default)]
    pub metadata: JobMetadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ContentJob {
    /// Returns whether the job is pending and its scheduled time has elapsed.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.schedule_time <= now
    }

    /// Returns a string metadata value, if present.
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    /// Number of failed attempts recorded so far.
    pub fn retry_count(&self) -> u32 {
        self.metadata
            .get(keys::RETRY_COUNT)
            .and_then(Value::as_u64)
            .map(|count| count.min(u32::MAX as u64) as u32)
            .unwrap_or(0)
    }

    /// Message of the most recent failure.
    pub fn last_error(&self) -> Option<&str> {
        self.metadata_str(keys::LAST_ERROR)
    }

    /// Identifier issued by the publisher once the job completed.
    pub fn external_id(&self) -> Option<&str> {
        self.metadata_str(keys::EXTERNAL_ID)
    }

    /// Sets a metadata value.
    pub fn set_metadata(&mut self, key: &str, value: impl Into<Value>) {
        self.metadata.insert(key.to_string(), value.into());
    }
}

/// Intake payload for creating a content job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewContentJob {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub expected_duration_seconds: u32,
    pub schedule_time: DateTime<Utc>,
    #[serde(default)]
    pub metadata: JobMetadata,
}

impl NewContentJob {
    /// Creates an intake payload with empty description, category and metadata.
    pub fn new(title: impl Into<String>, schedule_time: DateTime<Utc>) -> Self {
        Self {
            title: title.into(),
            description: String::new(),
            category: String::new(),
            expected_duration_seconds: 0,
            schedule_time,
            metadata: JobMetadata::new(),
        }
    }

    /// Sets the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Sets the category.
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    /// Sets the expected duration of the produced media.
    pub fn with_expected_duration(mut self, seconds: u32) -> Self {
        self.expected_duration_seconds = seconds;
        self
    }

    /// Sets a metadata entry.
    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// Points the job at an existing artifact so production is skipped.
    pub fn with_existing_artifact(self, path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_string_lossy().into_owned();
        self.with_metadata(keys::EXISTING_ARTIFACT_PATH, path)
    }

    /// Materializes the record the way a store does on insert.
    pub fn into_job(self, id: JobId, now: DateTime<Utc>) -> ContentJob {
        ContentJob {
            id,
            title: self.title,
            description: self.description,
            category: self.category,
            expected_duration_seconds: self.expected_duration_seconds,
            schedule_time: self.schedule_time,
            status: JobStatus::Pending,
            metadata: self.metadata,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Which stages an admitted task runs.
///
/// Decided once, at admission, and never re-evaluated while the task runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionPlan {
    /// Produce, assemble, then publish.
    Full,
    /// Publish a pre-existing artifact; production and assembly are skipped.
    PublishExisting(PathBuf),
}

impl ExecutionPlan {
    /// Chooses the plan for a job from its metadata.
    ///
    /// The publish-only plan applies when `existing_artifact_path` names a
    /// regular file that exists at the time of the call.
    pub fn decide(job: &ContentJob) -> Self {
        match job.metadata_str(keys::EXISTING_ARTIFACT_PATH) {
            Some(raw) if !raw.trim().is_empty() => {
                let path = PathBuf::from(raw.trim());
                if path.is_file() {
                    ExecutionPlan::PublishExisting(path)
                } else {
                    ExecutionPlan::Full
                }
            }
            _ => ExecutionPlan::Full,
        }
    }

    /// Returns whether production and assembly are skipped.
    pub fn skips_production(&self) -> bool {
        matches!(self, ExecutionPlan::PublishExisting(_))
    }
}

/// In-memory projection of a content job once it is eligible for processing.
#[derive(Debug, Clone)]
pub struct ScheduledTask {
    /// Snapshot of the job; the executor keeps `status` and `metadata` current.
    pub job: ContentJob,
    /// When the readiness poller discovered the job.
    pub discovered_at: DateTime<Utc>,
    /// Files written by the current attempt, removed by artifact cleanup.
    pub attempt_artifacts: Vec<PathBuf>,
}

impl ScheduledTask {
    /// Creates a task from a job snapshot.
    pub fn new(job: ContentJob, discovered_at: DateTime<Utc>) -> Self {
        Self {
            job,
            discovered_at,
            attempt_artifacts: Vec::new(),
        }
    }

    /// Returns the job id.
    pub fn id(&self) -> JobId {
        self.job.id
    }

    /// Returns the current status of the snapshot.
    pub fn status(&self) -> JobStatus {
        self.job.status
    }

    /// Records a file produced by the current attempt.
    pub fn record_artifact(&mut self, path: impl Into<PathBuf>) {
        let path = path.into();
        if !self.attempt_artifacts.contains(&path) {
            self.attempt_artifacts.push(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn sample_job(id: JobId) -> ContentJob {
        NewContentJob::new("Sunrise timelapse", Utc::now())
            .with_description("Thirty seconds of sunrise")
            .with_category("travel")
            .with_expected_duration(30)
            .into_job(id, Utc::now())
    }

    #[test]
    fn test_status_round_trip_strings() {
        for status in JobStatus::ALL {
            let parsed: JobStatus = status.as_str().parse().expect("known status");
            assert_eq!(parsed, status);
        }
        assert_eq!("PUBLISHING".parse::<JobStatus>(), Ok(JobStatus::Publishing));
        assert!("uploading".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_status_classification() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(JobStatus::Assembling.is_in_progress());
        assert!(!JobStatus::Pending.is_in_progress());
        assert_eq!(JobStatus::Pending.progress_label(), "Queued");
    }

    #[test]
    fn test_status_serde_snake_case() {
        let json = serde_json::to_string(&JobStatus::Publishing).expect("serialize");
        assert_eq!(json, "\"publishing\"");
    }

    #[test]
    fn test_new_job_defaults_to_pending() {
        let job = sample_job(3);
        assert_eq!(job.id, 3);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.category, "travel");
        assert_eq!(job.retry_count(), 0);
        assert!(job.last_error().is_none());
    }

    #[test]
    fn test_is_ready() {
        let now = Utc::now();
        let mut job = sample_job(1);
        job.schedule_time = now - ChronoDuration::seconds(5);
        assert!(job.is_ready(now));

        job.schedule_time = now + ChronoDuration::seconds(5);
        assert!(!job.is_ready(now));

        job.schedule_time = now;
        job.status = JobStatus::Producing;
        assert!(!job.is_ready(now));
    }

    #[test]
    fn test_retry_count_from_metadata() {
        let mut job = sample_job(1);
        job.set_metadata(keys::RETRY_COUNT, 2);
        job.set_metadata(keys::LAST_ERROR, "upstream 502");
        assert_eq!(job.retry_count(), 2);
        assert_eq!(job.last_error(), Some("upstream 502"));
    }

    #[test]
    fn test_plan_uses_existing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let artifact = dir.path().join("final.mp4");
        std::fs::write(&artifact, b"video").expect("write artifact");

        let job = NewContentJob::new("Reuse", Utc::now())
            .with_existing_artifact(&artifact)
            .into_job(1, Utc::now());

        assert_eq!(
            ExecutionPlan::decide(&job),
            ExecutionPlan::PublishExisting(artifact)
        );
    }

    #[test]
    fn test_plan_ignores_missing_or_blank_reference() {
        let missing = NewContentJob::new("Missing", Utc::now())
            .with_existing_artifact("/definitely/not/here.mp4")
            .into_job(1, Utc::now());
        assert_eq!(ExecutionPlan::decide(&missing), ExecutionPlan::Full);

        let blank = NewContentJob::new("Blank", Utc::now())
            .with_metadata(keys::EXISTING_ARTIFACT_PATH, "  ")
            .into_job(2, Utc::now());
        assert_eq!(ExecutionPlan::decide(&blank), ExecutionPlan::Full);

        let directory = tempfile::tempdir().expect("tempdir");
        let dir_ref = NewContentJob::new("Dir", Utc::now())
            .with_existing_artifact(directory.path())
            .into_job(3, Utc::now());
        assert_eq!(ExecutionPlan::decide(&dir_ref), ExecutionPlan::Full);
    }

    #[test]
    fn test_record_artifact_deduplicates() {
        let mut task = ScheduledTask::new(sample_job(9), Utc::now());
        task.record_artifact("/tmp/a.png");
        task.record_artifact("/tmp/a.png");
        task.record_artifact("/tmp/b.mp4");
        assert_eq!(task.attempt_artifacts.len(), 2);
        assert_eq!(task.id(), 9);
        assert_eq!(task.status(), JobStatus::Pending);
    }

    #[test]
    fn test_job_serialization() {
        let job = sample_job(5);
        let json = serde_json::to_string(&job).expect("serialization should work");
        let parsed: ContentJob = serde_json::from_str(&json).expect("deserialization should work");
        assert_eq!(parsed, job);
    }
}
