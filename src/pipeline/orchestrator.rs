//! Orchestrator control loop.
//!
//! This module provides the `Orchestrator` that coordinates:
//! - Readiness polling against the job store
//! - Admission of ready jobs under the concurrency limit
//! - Spawning one executor task per admitted job
//! - Reaping finished slots
//! - Cancellation, status queries and graceful shutdown
//!
//! The loop is the only writer of the pending queue and the active registry.
//! Executors talk to it through [`ExecutorEvent`]s; callers talk to it
//! through a cloneable [`OrchestratorHandle`].

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use uuid::Uuid;

use crate::error::{StageError, StoreError};
use crate::metrics::MetricsCollector;
use crate::scheduler::job::{JobId, JobStatus, ScheduledTask};
use crate::scheduler::poller::ReadinessPoller;
use crate::scheduler::queue::{ActiveTask, ActiveTaskRegistry, ConcurrencyGate, PendingQueue};
use crate::scheduler::reaper::LifecycleReaper;
use crate::scheduler::retry::{FailureDisposition, RetryManager, RetryPolicy};
use crate::storage::{ArtifactCleaner, JobStore};

use super::config::{ConfigError, OrchestratorConfig};
use super::executor::{cancel_pair, ExecutorEvent, PipelineExecutor, TaskOutcome};
use super::stages::{Collaborators, Notifier};

const INTERRUPTED: &str = "interrupted before the job finished";

/// Errors that can occur while running the orchestrator.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Job store error.
    #[error("Job store error: {0}")]
    Store(#[from] StoreError),

    /// The control loop is not running.
    #[error("Orchestrator is not running")]
    NotRunning,

    /// The control loop stopped before answering.
    #[error("Orchestrator loop terminated: {0}")]
    LoopTerminated(String),
}

/// Result of a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "result", content = "status", rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The job was waiting for a slot; it is now `Cancelled`.
    Dequeued,
    /// The job is running; its executor stops at the next stage boundary.
    Requested,
    /// The job was not tracked by this orchestrator and was cancelled in the store.
    CancelledInStore,
    /// The job had already finished.
    AlreadyTerminal(JobStatus),
    /// No such job.
    NotFound,
}

/// Counters kept by the control loop.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OrchestratorStats {
    /// Jobs admitted to a slot.
    pub admitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// Attempts that ended in a scheduled retry.
    pub retried: u64,
    /// Runs ended because another writer finished the job.
    pub superseded: u64,
    /// Runs whose outcome could not be recorded.
    pub stranded: u64,
    /// Interrupted jobs recovered at start-up, and stranded jobs settled
    /// once the store came back.
    pub recovered: u64,
    /// Highest number of simultaneously occupied slots.
    pub peak_active: usize,
}

/// What a stranded job still needs written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settlement {
    /// Route the job through the retry manager.
    Retry,
    /// Record the cancellation that was requested.
    Cancel,
}

impl OrchestratorStats {
    fn record_outcome(&mut self, outcome: &TaskOutcome) {
        match outcome {
            TaskOutcome::Completed { .. } => self.completed += 1,
            TaskOutcome::Failed { .. } => self.failed += 1,
            TaskOutcome::RetryScheduled { .. } => self.retried += 1,
            TaskOutcome::Cancelled => self.cancelled += 1,
            TaskOutcome::Superseded { .. } => self.superseded += 1,
            TaskOutcome::Stranded { .. } => self.stranded += 1,
        }
    }
}

/// A job holding a slot, as reported by [`OrchestratorHandle::status`].
#[derive(Debug, Clone, Serialize)]
pub struct ActiveJobInfo {
    pub job_id: JobId,
    pub title: String,
    pub status: JobStatus,
    pub progress: String,
    pub admitted_at: DateTime<Utc>,
    pub cancel_requested: bool,
    pub publish_only: bool,
}

/// Snapshot of the control loop.
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStatus {
    pub run_id: Uuid,
    /// False once shutdown has started.
    pub running: bool,
    pub max_concurrent: usize,
    pub active: Vec<ActiveJobInfo>,
    pub queue_len: usize,
    pub stats: OrchestratorStats,
}

enum Command {
    Cancel {
        job_id: JobId,
        reply: oneshot::Sender<Result<CancelOutcome, StoreError>>,
    },
    Status {
        reply: oneshot::Sender<OrchestratorStatus>,
    },
    Shutdown {
        reply: oneshot::Sender<OrchestratorStats>,
    },
}

/// Cloneable handle for talking to a running orchestrator.
#[derive(Clone)]
pub struct OrchestratorHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl OrchestratorHandle {
    /// Cancels a job.
    ///
    /// A queued job is cancelled at once; a running job is cancelled at its
    /// next stage boundary; a job this orchestrator does not track is
    /// cancelled directly in the store unless it is already terminal.
    pub async fn cancel(&self, job_id: JobId) -> Result<CancelOutcome, OrchestratorError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Cancel { job_id, reply })?;
        let outcome = rx
            .await
            .map_err(|_| OrchestratorError::LoopTerminated("cancel request dropped".into()))?;
        Ok(outcome?)
    }

    /// Returns a snapshot of the control loop.
    pub async fn status(&self) -> Result<OrchestratorStatus, OrchestratorError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Status { reply })?;
        rx.await
            .map_err(|_| OrchestratorError::LoopTerminated("status request dropped".into()))
    }

    /// Stops polling and admission, waits for in-flight jobs (bounded by the
    /// shutdown timeout) and returns the final counters once the loop exits.
    pub async fn shutdown(&self) -> Result<OrchestratorStats, OrchestratorError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Shutdown { reply })?;
        rx.await
            .map_err(|_| OrchestratorError::LoopTerminated("shutdown request dropped".into()))
    }

    /// Returns whether the control loop is still accepting commands.
    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }

    fn send(&self, command: Command) -> Result<(), OrchestratorError> {
        self.commands
            .send(command)
            .map_err(|_| OrchestratorError::NotRunning)
    }
}

/// Owns the pending queue and active registry and drives every job to a
/// terminal status or back to `Pending`.
pub struct Orchestrator {
    config: OrchestratorConfig,
    run_id: Uuid,
    store: Arc<dyn JobStore>,
    executor: PipelineExecutor,
    retry: RetryManager,
    reaper: LifecycleReaper,
    gate: ConcurrencyGate,
    poller: ReadinessPoller,
    queue: PendingQueue,
    registry: ActiveTaskRegistry,
    /// Jobs whose outcome could not be recorded, left in progress in the store.
    stranded: BTreeMap<JobId, Settlement>,
    notifier: Option<Arc<dyn Notifier>>,
    commands: mpsc::UnboundedReceiver<Command>,
    events_tx: mpsc::UnboundedSender<ExecutorEvent>,
    events: mpsc::UnboundedReceiver<ExecutorEvent>,
    stats: OrchestratorStats,
    metrics: MetricsCollector,
    drain_deadline: Option<Instant>,
    shutdown_waiters: Vec<oneshot::Sender<OrchestratorStats>>,
}

impl Orchestrator {
    /// Creates an orchestrator and the handle used to control it.
    ///
    /// # Errors
    ///
    /// Returns `OrchestratorError::Config` if the configuration is invalid.
    pub fn new(
        config: OrchestratorConfig,
        store: Arc<dyn JobStore>,
        collaborators: Collaborators,
    ) -> Result<(Self, OrchestratorHandle), OrchestratorError> {
        config.validate()?;

        let cleaner = ArtifactCleaner::new(config.temp_dir.clone());
        let retry = RetryManager::new(
            store.clone(),
            RetryPolicy::new(config.max_retries, config.base_backoff),
            cleaner.clone(),
        );
        let notifier = collaborators.notifier.clone();
        let executor = PipelineExecutor::new(
            store.clone(),
            collaborators,
            retry.clone(),
            cleaner.clone(),
            config.stage_timeout,
        );

        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();

        let orchestrator = Self {
            run_id: Uuid::new_v4(),
            store,
            executor,
            retry,
            reaper: LifecycleReaper::new(cleaner),
            gate: ConcurrencyGate::new(config.max_concurrent),
            poller: ReadinessPoller::new(config.poll_interval, config.max_poll_backoff()),
            queue: PendingQueue::new(),
            registry: ActiveTaskRegistry::new(),
            stranded: BTreeMap::new(),
            notifier,
            commands,
            events_tx,
            events,
            stats: OrchestratorStats::default(),
            metrics: MetricsCollector::new(),
            drain_deadline: None,
            shutdown_waiters: Vec::new(),
            config,
        };
        let handle = OrchestratorHandle {
            commands: commands_tx,
        };
        Ok((orchestrator, handle))
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Runs the control loop on a new tokio task.
    pub fn spawn(self) -> JoinHandle<OrchestratorStats> {
        tokio::spawn(self.run())
    }

    /// Runs the control loop until shutdown completes, or until every handle
    /// is dropped and no job is left in flight.
    pub async fn run(mut self) -> OrchestratorStats {
        tracing::info!(
            run_id = %self.run_id,
            max_concurrent = self.config.max_concurrent,
            poll_interval_secs = self.config.poll_interval.as_secs_f64(),
            "Orchestrator started"
        );

        if self.config.recover_interrupted {
            self.recover_interrupted().await;
        }

        let mut handles_open = true;
        loop {
            if self.is_draining() && self.registry.is_empty() {
                break;
            }
            if !handles_open && !self.is_draining() {
                tracing::info!("All orchestrator handles dropped, shutting down");
                self.begin_drain();
                continue;
            }

            let poll_at = self.poller.next_poll_at();
            let deadline = self.drain_deadline;

            tokio::select! {
                biased;

                command = self.commands.recv(), if handles_open => match command {
                    Some(command) => self.handle_command(command).await,
                    None => handles_open = false,
                },
                Some(event) = self.events.recv() => self.handle_event(event),
                _ = sleep_until(poll_at), if deadline.is_none() => self.poll().await,
                _ = sleep_until(deadline.unwrap_or(poll_at)), if deadline.is_some() => {
                    self.abort_remaining().await;
                    break;
                }
            }

            self.collect_lost_executors();
            self.reap().await;
            self.admit();
            self.metrics
                .update_occupancy(self.queue.len(), self.registry.len());
        }

        self.metrics.update_occupancy(0, 0);
        tracing::info!(
            run_id = %self.run_id,
            completed = self.stats.completed,
            failed = self.stats.failed,
            cancelled = self.stats.cancelled,
            retried = self.stats.retried,
            "Orchestrator stopped"
        );

        for waiter in self.shutdown_waiters.drain(..) {
            let _ = waiter.send(self.stats.clone());
        }
        self.stats
    }

    fn is_draining(&self) -> bool {
        self.drain_deadline.is_some()
    }

    /// Feeds jobs left in progress by a previous run through the retry manager.
    async fn recover_interrupted(&mut self) {
        let error = StageError::transient(INTERRUPTED);
        let now = Utc::now();

        for status in JobStatus::IN_PROGRESS {
            let jobs = match self.store.list(Some(status)).await {
                Ok(jobs) => jobs,
                Err(e) => {
                    tracing::warn!(status = %status, error = %e, "Failed to list interrupted jobs");
                    continue;
                }
            };

            for job in jobs {
                let job_id = job.id;
                let mut task = ScheduledTask::new(job, now);
                match self.retry.handle_failure(&mut task, &error).await {
                    Ok(disposition) => {
                        self.stats.recovered += 1;
                        let requeued = matches!(disposition, FailureDisposition::Retry { .. });
                        tracing::info!(
                            job_id = job_id,
                            previous_status = %status,
                            requeued = requeued,
                            "Recovered interrupted job"
                        );
                    }
                    Err(e) => {
                        tracing::warn!(job_id = job_id, error = %e, "Failed to recover interrupted job")
                    }
                }
            }
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Cancel { job_id, reply } => {
                let result = self.cancel(job_id).await;
                let _ = reply.send(result);
            }
            Command::Status { reply } => {
                let _ = reply.send(self.status());
            }
            Command::Shutdown { reply } => {
                self.shutdown_waiters.push(reply);
                if !self.is_draining() {
                    self.begin_drain();
                }
            }
        }
    }

    fn handle_event(&mut self, event: ExecutorEvent) {
        match event {
            ExecutorEvent::StatusChanged { job_id, status } => {
                if let Some(entry) = self.registry.get_mut(job_id) {
                    entry.status = status;
                }
            }
            ExecutorEvent::Finished {
                job_id,
                task,
                outcome,
            } => {
                self.stats.record_outcome(&outcome);
                let Some(entry) = self.registry.get_mut(job_id) else {
                    tracing::warn!(job_id = job_id, "Finished event for unknown job");
                    return;
                };
                if let Some(status) = outcome.final_status() {
                    entry.status = status;
                }
                entry.task = task;
                entry.handle = None;
                entry.finished = Some(outcome);
            }
        }
    }

    async fn cancel(&mut self, job_id: JobId) -> Result<CancelOutcome, StoreError> {
        if let Some(entry) = self.registry.get(job_id) {
            match entry.finished.as_ref().and_then(TaskOutcome::final_status) {
                Some(status) if status.is_terminal() => {
                    return Ok(CancelOutcome::AlreadyTerminal(status));
                }
                Some(_) => {}
                None if entry.is_finished() => {}
                None => {
                    entry.cancel.cancel();
                    tracing::info!(job_id = job_id, status = %entry.status, "Cancellation requested");
                    return Ok(CancelOutcome::Requested);
                }
            }
        }

        if let Some(task) = self.queue.remove(job_id) {
            if let Err(e) = self.store.set_status(job_id, JobStatus::Cancelled).await {
                self.queue.push(task);
                return Err(e);
            }
            self.stats.cancelled += 1;
            self.metrics.record_job_finished(JobStatus::Cancelled);
            self.notify(job_id, JobStatus::Cancelled);
            tracing::info!(job_id = job_id, "Cancelled queued job");
            return Ok(CancelOutcome::Dequeued);
        }

        let Some(job) = self.store.get_by_id(job_id).await? else {
            return Ok(CancelOutcome::NotFound);
        };
        if job.status.is_terminal() {
            return Ok(CancelOutcome::AlreadyTerminal(job.status));
        }
        self.store.set_status(job_id, JobStatus::Cancelled).await?;
        self.stats.cancelled += 1;
        self.metrics.record_job_finished(JobStatus::Cancelled);
        self.notify(job_id, JobStatus::Cancelled);
        tracing::info!(job_id = job_id, previous_status = %job.status, "Cancelled job in store");
        Ok(CancelOutcome::CancelledInStore)
    }

    fn status(&self) -> OrchestratorStatus {
        let mut active: Vec<ActiveJobInfo> = self
            .registry
            .iter()
            .map(|entry| ActiveJobInfo {
                job_id: entry.id(),
                title: entry.task.job.title.clone(),
                status: entry.status,
                progress: entry.status.progress_label().to_string(),
                admitted_at: entry.admitted_at,
                cancel_requested: entry.cancel.is_cancelled(),
                publish_only: entry.plan.skips_production(),
            })
            .collect();
        active.sort_by_key(|info| info.job_id);

        OrchestratorStatus {
            run_id: self.run_id,
            running: !self.is_draining(),
            max_concurrent: self.gate.max_concurrent(),
            active,
            queue_len: self.queue.len(),
            stats: self.stats.clone(),
        }
    }

    async fn poll(&mut self) {
        self.settle_stranded().await;
        // Failures are logged and backed off by the poller.
        let _ = self
            .poller
            .poll(self.store.as_ref(), Utc::now(), &self.registry, &mut self.queue)
            .await;
    }

    fn admit(&mut self) {
        if self.is_draining() || self.queue.is_empty() {
            return;
        }

        let executor = &self.executor;
        let events = &self.events_tx;
        let admitted = self
            .gate
            .admit(&mut self.queue, &mut self.registry, |task, plan| {
                let (cancel, signal) = cancel_pair();
                let handle = tokio::spawn(executor.clone().run(
                    task.clone(),
                    plan.clone(),
                    signal,
                    events.clone(),
                ));
                ActiveTask::new(task, plan, cancel, Some(handle))
            });

        if admitted.is_empty() {
            return;
        }
        self.stats.admitted += admitted.len() as u64;
        self.stats.peak_active = self.stats.peak_active.max(self.registry.len());
        tracing::debug!(
            admitted = ?admitted,
            active = self.registry.len(),
            queued = self.queue.len(),
            "Admitted jobs"
        );
    }

    async fn reap(&mut self) {
        for reaped in self.reaper.reap(&mut self.registry).await {
            if !matches!(reaped.outcome, TaskOutcome::Stranded { .. }) {
                continue;
            }
            let settlement = if reaped.cancel_requested {
                Settlement::Cancel
            } else {
                Settlement::Retry
            };
            self.stranded.insert(reaped.job_id, settlement);
        }
    }

    /// Writes the outcome of stranded jobs once the store accepts writes.
    ///
    /// A job that is no longer in progress needs nothing more. The first
    /// store failure ends the pass; the rest wait for the next poll.
    async fn settle_stranded(&mut self) {
        let pending: Vec<(JobId, Settlement)> =
            self.stranded.iter().map(|(id, s)| (*id, *s)).collect();

        for (job_id, settlement) in pending {
            if self.registry.contains(job_id) || self.queue.contains(job_id) {
                self.stranded.remove(&job_id);
                continue;
            }
            let job = match self.store.get_by_id(job_id).await {
                Ok(Some(job)) if job.status.is_in_progress() => job,
                Ok(_) => {
                    self.stranded.remove(&job_id);
                    continue;
                }
                Err(e) => {
                    tracing::debug!(job_id = job_id, error = %e, "Stranded job still unreachable");
                    return;
                }
            };

            let previous_status = job.status;
            let result = match settlement {
                Settlement::Cancel => self.store.set_status(job_id, JobStatus::Cancelled).await,
                Settlement::Retry => {
                    let mut task = ScheduledTask::new(job, Utc::now());
                    self.retry
                        .handle_failure(&mut task, &StageError::transient(INTERRUPTED))
                        .await
                        .map(|_| ())
                }
            };

            match result {
                Ok(()) => {
                    self.stranded.remove(&job_id);
                    self.stats.recovered += 1;
                    if settlement == Settlement::Cancel {
                        self.stats.cancelled += 1;
                        self.metrics.record_job_finished(JobStatus::Cancelled);
                        self.notify(job_id, JobStatus::Cancelled);
                    }
                    tracing::info!(
                        job_id = job_id,
                        previous_status = %previous_status,
                        settlement = ?settlement,
                        "Settled stranded job"
                    );
                }
                Err(StoreError::Transition(_)) | Err(StoreError::Finished(..)) => {
                    self.stranded.remove(&job_id);
                }
                Err(e) => {
                    tracing::warn!(job_id = job_id, error = %e, "Failed to settle stranded job");
                    return;
                }
            }
        }
    }

    /// Marks entries whose executor task ended without reporting back.
    fn collect_lost_executors(&mut self) {
        // Executors report before their task ends, so pending events are
        // applied first.
        while let Ok(event) = self.events.try_recv() {
            self.handle_event(event);
        }

        let mut lost = Vec::new();
        for entry in self.registry.iter_mut() {
            let ended = entry
                .handle
                .as_ref()
                .map(JoinHandle::is_finished)
                .unwrap_or(false);
            if ended && !entry.is_finished() {
                entry.handle = None;
                entry.finished = Some(TaskOutcome::Stranded {
                    error: "executor task ended without reporting".to_string(),
                });
                lost.push(entry.id());
            }
        }
        for job_id in lost {
            self.stats.stranded += 1;
            tracing::error!(job_id = job_id, "Executor task ended without reporting");
        }
    }

    fn begin_drain(&mut self) {
        let deadline = Instant::now() + self.config.shutdown_timeout;
        self.drain_deadline = Some(deadline);
        let dropped = self.queue.len();
        self.queue.clear();
        tracing::info!(
            in_flight = self.registry.len(),
            dropped_from_queue = dropped,
            timeout_secs = self.config.shutdown_timeout.as_secs_f64(),
            "Shutting down orchestrator"
        );
    }

    async fn abort_remaining(&mut self) {
        let mut aborted = Vec::new();
        for entry in self.registry.drain() {
            if entry.is_finished() {
                continue;
            }
            entry.cancel.cancel();
            tracing::warn!(
                job_id = entry.id(),
                status = %entry.status,
                "Aborted in-flight job at shutdown deadline"
            );
            if let Some(handle) = entry.handle {
                handle.abort();
                aborted.push(handle);
            }
        }
        // Wait for aborted executors to unwind.
        futures::future::join_all(aborted).await;
    }

    fn notify(&self, job_id: JobId, status: JobStatus) {
        let Some(notifier) = self.notifier.clone() else {
            return;
        };
        tokio::spawn(async move {
            notifier.notify(job_id, status, None).await;
        });
    }
}
