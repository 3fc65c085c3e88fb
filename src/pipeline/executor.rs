//! Pipeline executor.
//!
//! Drives one admitted job through its stages as an independent task.
//! Every status write is checked against the lifecycle before it reaches the
//! store, and every change is reported to the control loop over the event
//! channel. Cancellation is cooperative: it is observed between stages and
//! after each stage call returns, never by aborting a call in flight.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};

use crate::error::{StageError, StoreError};
use crate::metrics::MetricsCollector;
use crate::scheduler::job::{keys, ExecutionPlan, JobId, JobStatus, ScheduledTask};
use crate::scheduler::lifecycle::LifecycleManager;
use crate::scheduler::retry::{FailureDisposition, RetryManager};
use crate::storage::{ArtifactCleaner, JobStore};

use super::stages::{ArtifactRef, Collaborators, PublishReceipt, Stage, StageContext};

/// Messages from executor tasks to the control loop.
#[derive(Debug)]
pub enum ExecutorEvent {
    /// The job moved to a new status.
    StatusChanged { job_id: JobId, status: JobStatus },
    /// The executor is done with the job; its slot may be freed.
    Finished {
        job_id: JobId,
        task: ScheduledTask,
        outcome: TaskOutcome,
    },
}

/// How an executor run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Published; the job is `Completed`.
    Completed { external_id: String },
    /// The job is `Failed`.
    Failed { error: String },
    /// The job is back in `Pending` awaiting its next attempt.
    RetryScheduled { retry_count: u32, delay: Duration },
    /// The job is `Cancelled`.
    Cancelled,
    /// Another writer moved the job to a terminal status while it ran.
    Superseded { status: JobStatus },
    /// The outcome could not be recorded because the job store failed.
    Stranded { error: String },
}

impl TaskOutcome {
    /// Status the job holds after this outcome, when known.
    pub fn final_status(&self) -> Option<JobStatus> {
        match self {
            TaskOutcome::Completed { .. } => Some(JobStatus::Completed),
            TaskOutcome::Failed { .. } => Some(JobStatus::Failed),
            TaskOutcome::RetryScheduled { .. } => Some(JobStatus::Pending),
            TaskOutcome::Cancelled => Some(JobStatus::Cancelled),
            TaskOutcome::Superseded { status } => Some(*status),
            TaskOutcome::Stranded { .. } => None,
        }
    }

    /// Whether the reaper removes the attempt's artifacts.
    pub fn needs_cleanup(&self) -> bool {
        matches!(
            self.final_status(),
            Some(JobStatus::Failed) | Some(JobStatus::Cancelled) | None
        )
    }
}

/// Why a run stopped before completing.
#[derive(Debug)]
enum Halt {
    Cancelled,
    Stage(StageError),
    Superseded(JobStatus),
}

impl From<StoreError> for Halt {
    fn from(err: StoreError) -> Self {
        match err.finished_status() {
            Some(status) => Halt::Superseded(status),
            None => Halt::Stage(StageError::transient(format!("job store error: {}", err))),
        }
    }
}

/// Requests cancellation of one running job.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Observes cancellation inside an executor.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }
}

/// Creates a connected cancel handle and signal.
pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx: Arc::new(tx) }, CancelSignal { rx })
}

/// Runs admitted jobs through produce, assemble and publish.
#[derive(Clone)]
pub struct PipelineExecutor {
    store: Arc<dyn JobStore>,
    collaborators: Collaborators,
    retry: RetryManager,
    cleaner: ArtifactCleaner,
    lifecycle: Arc<LifecycleManager>,
    stage_timeout: Duration,
    metrics: MetricsCollector,
}

impl PipelineExecutor {
    pub fn new(
        store: Arc<dyn JobStore>,
        collaborators: Collaborators,
        retry: RetryManager,
        cleaner: ArtifactCleaner,
        stage_timeout: Duration,
    ) -> Self {
        Self {
            store,
            collaborators,
            retry,
            cleaner,
            lifecycle: Arc::new(LifecycleManager::new()),
            stage_timeout,
            metrics: MetricsCollector::new(),
        }
    }

    /// Executes `task` according to `plan` and reports the result as
    /// [`ExecutorEvent::Finished`].
    pub async fn run(
        self,
        task: ScheduledTask,
        plan: ExecutionPlan,
        cancel: CancelSignal,
        events: mpsc::UnboundedSender<ExecutorEvent>,
    ) {
        let job_id = task.id();
        let (task, outcome) = self.execute(task, plan, &cancel, &events).await;
        if events
            .send(ExecutorEvent::Finished {
                job_id,
                task,
                outcome,
            })
            .is_err()
        {
            tracing::warn!(job_id = job_id, "Control loop gone before job finished");
        }
    }

    /// Executes `task` and returns the updated snapshot with the outcome.
    pub async fn execute(
        &self,
        mut task: ScheduledTask,
        plan: ExecutionPlan,
        cancel: &CancelSignal,
        events: &mpsc::UnboundedSender<ExecutorEvent>,
    ) -> (ScheduledTask, TaskOutcome) {
        let job_id = task.id();
        tracing::info!(
            job_id = job_id,
            title = %task.job.title,
            publish_only = plan.skips_production(),
            "Starting job"
        );

        let outcome = match self.drive(&mut task, &plan, cancel, events).await {
            Ok(receipt) => {
                tracing::info!(
                    job_id = job_id,
                    external_id = %receipt.external_id,
                    "Job completed"
                );
                self.metrics.record_job_finished(JobStatus::Completed);
                self.notify(job_id, JobStatus::Completed, None);
                TaskOutcome::Completed {
                    external_id: receipt.external_id,
                }
            }
            Err(Halt::Cancelled) => self.finish_cancelled(&mut task).await,
            Err(Halt::Superseded(status)) => {
                tracing::info!(job_id = job_id, status = %status, "Job changed status externally");
                TaskOutcome::Superseded { status }
            }
            Err(Halt::Stage(error)) => self.finish_failed(&mut task, error).await,
        };

        (task, outcome)
    }

    async fn drive(
        &self,
        task: &mut ScheduledTask,
        plan: &ExecutionPlan,
        cancel: &CancelSignal,
        events: &mpsc::UnboundedSender<ExecutorEvent>,
    ) -> Result<PublishReceipt, Halt> {
        let job_id = task.id();
        check_cancel(cancel)?;

        let work_dir = self
            .cleaner
            .prepare(job_id)
            .await
            .map_err(|e| Halt::Stage(StageError::transient(e.to_string())))?;
        let ctx = StageContext {
            job_id,
            work_dir,
            attempt: task.job.retry_count() + 1,
        };

        let final_artifact = match plan {
            ExecutionPlan::Full => {
                self.transition(task, JobStatus::Producing, events).await?;
                let produced = self
                    .call_stage(
                        Stage::Produce,
                        job_id,
                        self.collaborators.producer.produce(&task.job, &ctx),
                    )
                    .await;
                if let Ok(artifact) = &produced {
                    task.record_artifact(artifact.path.clone());
                }
                check_cancel(cancel)?;
                let produced = produced.map_err(Halt::Stage)?;

                task.job.set_metadata(keys::ARTIFACT_PATH, produced.to_string());
                task.job.set_metadata(keys::GENERATION_METHOD, "produced");
                self.persist_metadata(task).await?;
                self.transition(task, JobStatus::Assembling, events).await?;

                let assembled = self
                    .call_stage(
                        Stage::Assemble,
                        job_id,
                        self.collaborators.assembler.assemble(&task.job, &produced, &ctx),
                    )
                    .await;
                if let Ok(artifact) = &assembled {
                    task.record_artifact(artifact.path.clone());
                }
                check_cancel(cancel)?;
                let assembled = assembled.map_err(Halt::Stage)?;

                task.job
                    .set_metadata(keys::FINAL_ARTIFACT_PATH, assembled.to_string());
                self.persist_metadata(task).await?;
                self.transition(task, JobStatus::Publishing, events).await?;
                assembled
            }
            ExecutionPlan::PublishExisting(path) => {
                let artifact = ArtifactRef::new(path.clone());
                task.job
                    .set_metadata(keys::FINAL_ARTIFACT_PATH, artifact.to_string());
                task.job
                    .set_metadata(keys::GENERATION_METHOD, "existing_artifact");
                self.persist_metadata(task).await?;
                self.transition(task, JobStatus::Publishing, events).await?;
                artifact
            }
        };

        let receipt = self
            .call_stage(
                Stage::Publish,
                job_id,
                self.collaborators
                    .publisher
                    .publish(&task.job, &final_artifact, &ctx),
            )
            .await;
        check_cancel(cancel)?;
        let receipt = receipt.map_err(Halt::Stage)?;

        task.job
            .set_metadata(keys::EXTERNAL_ID, receipt.external_id.clone());
        if let Some(url) = &receipt.url {
            task.job.set_metadata(keys::EXTERNAL_URL, url.clone());
        }
        task.job.metadata.remove(keys::NEXT_ATTEMPT_AT);
        self.persist_metadata(task).await?;
        self.transition(task, JobStatus::Completed, events).await?;

        Ok(receipt)
    }

    /// Runs one collaborator call under the stage timeout.
    async fn call_stage<T, F>(&self, stage: Stage, job_id: JobId, call: F) -> Result<T, StageError>
    where
        F: std::future::Future<Output = Result<T, StageError>>,
    {
        let started = Instant::now();
        let result = match tokio::time::timeout(self.stage_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(StageError::Timeout(self.stage_timeout)),
        };
        let elapsed = started.elapsed().as_secs_f64();

        let outcome = match &result {
            Ok(_) => "success",
            Err(StageError::Transient(_)) => "transient",
            Err(StageError::Timeout(_)) => "timeout",
            Err(StageError::Permanent(_)) => "permanent",
        };
        self.metrics.record_stage(stage, outcome, elapsed);

        match &result {
            Ok(_) => tracing::debug!(job_id = job_id, stage = %stage, elapsed_secs = elapsed, "Stage succeeded"),
            Err(e) => tracing::warn!(job_id = job_id, stage = %stage, error = %e, "Stage failed"),
        }
        result
    }

    /// Moves the job to `to` after checking the edge locally.
    async fn transition(
        &self,
        task: &mut ScheduledTask,
        to: JobStatus,
        events: &mpsc::UnboundedSender<ExecutorEvent>,
    ) -> Result<(), Halt> {
        let job_id = task.id();
        self.lifecycle
            .check(job_id, task.job.status, to)
            .map_err(|e| Halt::Stage(StageError::permanent(e.to_string())))?;

        self.store.set_status(job_id, to).await?;
        task.job.status = to;
        let _ = events.send(ExecutorEvent::StatusChanged { job_id, status: to });

        tracing::info!(job_id = job_id, status = %to, "Job status changed");
        Ok(())
    }

    async fn persist_metadata(&self, task: &ScheduledTask) -> Result<(), Halt> {
        self.store
            .set_metadata(task.id(), task.job.metadata.clone())
            .await?;
        Ok(())
    }

    async fn finish_cancelled(&self, task: &mut ScheduledTask) -> TaskOutcome {
        let job_id = task.id();
        self.cleaner.cleanup(task).await;

        if let Err(e) = self
            .store
            .set_metadata(job_id, task.job.metadata.clone())
            .await
        {
            tracing::warn!(job_id = job_id, error = %e, "Failed to persist metadata of cancelled job");
        }

        match self.store.set_status(job_id, JobStatus::Cancelled).await {
            Ok(()) => {
                task.job.status = JobStatus::Cancelled;
                tracing::info!(job_id = job_id, "Job cancelled");
                self.metrics.record_job_finished(JobStatus::Cancelled);
                self.notify(job_id, JobStatus::Cancelled, None);
                TaskOutcome::Cancelled
            }
            Err(e) => self.store_failure_outcome(job_id, e),
        }
    }

    async fn finish_failed(&self, task: &mut ScheduledTask, error: StageError) -> TaskOutcome {
        let job_id = task.id();
        match self.retry.handle_failure(task, &error).await {
            Ok(FailureDisposition::Retry {
                retry_count, delay, ..
            }) => {
                self.notify(job_id, JobStatus::Pending, Some(&error.to_string()));
                TaskOutcome::RetryScheduled { retry_count, delay }
            }
            Ok(FailureDisposition::Failed { .. }) => {
                self.metrics.record_job_finished(JobStatus::Failed);
                self.notify(job_id, JobStatus::Failed, Some(&error.to_string()));
                TaskOutcome::Failed {
                    error: error.to_string(),
                }
            }
            Err(e) => self.store_failure_outcome(job_id, e),
        }
    }

    fn store_failure_outcome(&self, job_id: JobId, err: StoreError) -> TaskOutcome {
        if let Some(status) = err.finished_status() {
            tracing::info!(job_id = job_id, status = %status, "Job changed status externally");
            return TaskOutcome::Superseded { status };
        }
        tracing::error!(
            job_id = job_id,
            error = %err,
            "Could not record job outcome; it will be settled once the store recovers"
        );
        TaskOutcome::Stranded {
            error: err.to_string(),
        }
    }

    /// Sends a notification without waiting for delivery.
    fn notify(&self, job_id: JobId, status: JobStatus, error: Option<&str>) {
        let Some(notifier) = self.collaborators.notifier.clone() else {
            return;
        };
        let error = error.map(str::to_string);
        tokio::spawn(async move {
            notifier.notify(job_id, status, error.as_deref()).await;
        });
    }
}

fn check_cancel(cancel: &CancelSignal) -> Result<(), Halt> {
    if cancel.is_cancelled() {
        Err(Halt::Cancelled)
    } else {
        Ok(())
    }
}
