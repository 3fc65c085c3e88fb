//! Slot reclamation.
//!
//! Executors report completion over the event channel; the reaper then frees
//! their slots and sweeps leftover artifacts of jobs that did not complete.

use crate::pipeline::executor::TaskOutcome;
use crate::storage::ArtifactCleaner;

use super::job::JobId;
use super::queue::ActiveTaskRegistry;

/// A slot freed by the reaper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReapedTask {
    pub job_id: JobId,
    pub outcome: TaskOutcome,
    /// Filesystem entries removed while reaping.
    pub removed: usize,
    /// Whether cancellation had been requested for the job.
    pub cancel_requested: bool,
}

/// Removes finished entries from the active registry.
#[derive(Debug, Clone)]
pub struct LifecycleReaper {
    cleaner: ArtifactCleaner,
}

impl LifecycleReaper {
    pub fn new(cleaner: ArtifactCleaner) -> Self {
        Self { cleaner }
    }

    /// Frees the slot of every finished entry.
    ///
    /// Entries whose outcome leaves the job failed, cancelled or unknown get
    /// a cleanup sweep; a completed or retried job keeps its files.
    pub async fn reap(&self, registry: &mut ActiveTaskRegistry) -> Vec<ReapedTask> {
        let mut reaped = Vec::new();
        for mut entry in registry.drain_finished() {
            let job_id = entry.id();
            let Some(outcome) = entry.finished.take() else {
                continue;
            };
            let removed = if outcome.needs_cleanup() {
                self.cleaner.cleanup(&mut entry.task).await
            } else {
                0
            };
            tracing::debug!(
                job_id = job_id,
                status = ?outcome.final_status(),
                removed = removed,
                "Released job slot"
            );
            reaped.push(ReapedTask {
                job_id,
                outcome,
                removed,
                cancel_requested: entry.cancel.is_cancelled(),
            });
        }
        reaped
    }
}
