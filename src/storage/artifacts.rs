//! Per-attempt artifact management.
//!
//! Every job gets a work directory under the configured temp root. Stages
//! write intermediate files there, and the files produced by the current
//! attempt are tracked on the [`ScheduledTask`]. Cleanup removes both, but
//! only inside the temp root: the pre-existing artifact a job was submitted
//! with and any file a stage pointed at elsewhere are left alone.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::fs;

use crate::scheduler::job::{keys, JobId, ScheduledTask};

/// Errors that can occur while preparing artifact storage.
#[derive(Debug, Error)]
pub enum ArtifactError {
    /// IO operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Work directory creation failed.
    #[error("Failed to create work directory {path:?}: {source}")]
    DirectoryCreationFailed {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Creates and removes the files belonging to job attempts.
#[derive(Debug, Clone)]
pub struct ArtifactCleaner {
    temp_root: PathBuf,
}

impl ArtifactCleaner {
    /// Creates a cleaner rooted at `temp_root`.
    pub fn new(temp_root: impl Into<PathBuf>) -> Self {
        Self {
            temp_root: temp_root.into(),
        }
    }

    /// Returns the temp root.
    pub fn temp_root(&self) -> &Path {
        &self.temp_root
    }

    /// Returns the work directory of a job.
    pub fn work_dir(&self, job_id: JobId) -> PathBuf {
        self.temp_root.join(format!("job-{}", job_id))
    }

    /// Creates the work directory of a job and returns its path.
    pub async fn prepare(&self, job_id: JobId) -> Result<PathBuf, ArtifactError> {
        let dir = self.work_dir(job_id);
        fs::create_dir_all(&dir)
            .await
            .map_err(|source| ArtifactError::DirectoryCreationFailed {
                path: dir.clone(),
                source,
            })?;
        Ok(dir)
    }

    /// Removes the artifacts of the task's current attempt that live under
    /// the temp root, and the job's work directory. Metadata entries pointing
    /// at files that no longer exist are dropped.
    ///
    /// Best effort: failures are logged and skipped. Returns the number of
    /// filesystem entries removed.
    pub async fn cleanup(&self, task: &mut ScheduledTask) -> usize {
        let job_id = task.id();
        let protected = task
            .job
            .metadata_str(keys::EXISTING_ARTIFACT_PATH)
            .map(|raw| PathBuf::from(raw.trim()));
        let is_protected = |path: &Path| protected.as_deref() == Some(path);

        let mut removed = 0;
        for path in std::mem::take(&mut task.attempt_artifacts) {
            if is_protected(&path) {
                continue;
            }
            if !self.owns(&path).await {
                tracing::debug!(
                    job_id = job_id,
                    path = %path.display(),
                    "Leaving artifact outside the temp root"
                );
                continue;
            }
            if remove_path(&path).await {
                removed += 1;
            }
        }

        let work_dir = self.work_dir(job_id);
        if remove_path(&work_dir).await {
            removed += 1;
        }

        for key in [keys::ARTIFACT_PATH, keys::FINAL_ARTIFACT_PATH] {
            let Some(raw) = task.job.metadata_str(key) else {
                continue;
            };
            let path = PathBuf::from(raw);
            let still_there = fs::try_exists(&path).await.unwrap_or(false);
            if !is_protected(&path) && !still_there {
                task.job.metadata.remove(key);
            }
        }

        if removed > 0 {
            tracing::debug!(job_id = job_id, removed, "Cleaned up attempt artifacts");
        }
        removed
    }

    /// Whether `path` resolves to an entry below the temp root.
    ///
    /// Paths that cannot be resolved (missing files, a missing root) are not
    /// owned.
    async fn owns(&self, path: &Path) -> bool {
        let (Ok(root), Ok(resolved)) = (
            fs::canonicalize(&self.temp_root).await,
            fs::canonicalize(path).await,
        ) else {
            return false;
        };
        resolved != root && resolved.starts_with(&root)
    }
}

/// Removes a file or directory tree. Returns whether anything was removed.
async fn remove_path(path: &Path) -> bool {
    let metadata = match fs::symlink_metadata(path).await {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == ErrorKind::NotFound => return false,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to stat artifact");
            return false;
        }
    };

    let result = if metadata.is_dir() {
        fs::remove_dir_all(path).await
    } else {
        fs::remove_file(path).await
    };

    match result {
        Ok(()) => true,
        Err(e) if e.kind() == ErrorKind::NotFound => false,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove artifact");
            false
        }
    }
}
