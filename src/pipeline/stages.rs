//! Collaborator interfaces of the pipeline.
//!
//! The executor reaches media synthesis, assembly, publishing and
//! notification delivery only through these traits.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StageError;
use crate::scheduler::job::{ContentJob, JobId, JobStatus};

/// Reference to an artifact on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub path: PathBuf,
}

impl ArtifactRef {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

/// What the publishing platform returned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishReceipt {
    pub external_id: String,
    #[serde(default)]
    pub url: Option<String>,
}

impl PublishReceipt {
    pub fn new(external_id: impl Into<String>) -> Self {
        Self {
            external_id: external_id.into(),
            url: None,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }
}

/// Per-call context handed to a stage.
#[derive(Debug, Clone)]
pub struct StageContext {
    pub job_id: JobId,
    /// Scratch directory owned by the job; removed by artifact cleanup.
    pub work_dir: PathBuf,
    /// 1-based attempt number.
    pub attempt: u32,
}

/// The three pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Produce,
    Assemble,
    Publish,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Produce => "produce",
            Stage::Assemble => "assemble",
            Stage::Publish => "publish",
        }
    }

    /// Status a job holds while this stage runs.
    pub fn status(&self) -> JobStatus {
        match self {
            Stage::Produce => JobStatus::Producing,
            Stage::Assemble => JobStatus::Assembling,
            Stage::Publish => JobStatus::Publishing,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Produces the raw media of a job.
#[async_trait]
pub trait MediaProducer: Send + Sync {
    async fn produce(&self, job: &ContentJob, ctx: &StageContext) -> Result<ArtifactRef, StageError>;
}

/// Turns produced media into the final artifact.
#[async_trait]
pub trait Assembler: Send + Sync {
    async fn assemble(
        &self,
        job: &ContentJob,
        artifact: &ArtifactRef,
        ctx: &StageContext,
    ) -> Result<ArtifactRef, StageError>;
}

/// Uploads the final artifact to the external platform.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(
        &self,
        job: &ContentJob,
        artifact: &ArtifactRef,
        ctx: &StageContext,
    ) -> Result<PublishReceipt, StageError>;
}

/// Receives job outcome notifications.
///
/// Delivery is fire-and-forget: implementations log their own failures.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, job_id: JobId, status: JobStatus, error: Option<&str>);
}

/// The collaborators an executor drives.
#[derive(Clone)]
pub struct Collaborators {
    pub producer: Arc<dyn MediaProducer>,
    pub assembler: Arc<dyn Assembler>,
    pub publisher: Arc<dyn Publisher>,
    pub notifier: Option<Arc<dyn Notifier>>,
}

impl Collaborators {
    pub fn new(
        producer: Arc<dyn MediaProducer>,
        assembler: Arc<dyn Assembler>,
        publisher: Arc<dyn Publisher>,
    ) -> Self {
        Self {
            producer,
            assembler,
            publisher,
            notifier: None,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }
}
