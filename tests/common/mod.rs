//! Shared fixtures for the orchestrator integration tests.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;

use contentforge::pipeline::{
    ArtifactRef, Assembler, Collaborators, MediaProducer, Notifier, Orchestrator,
    OrchestratorConfig, OrchestratorHandle, OrchestratorStats, PublishReceipt, Publisher,
    StageContext,
};
use contentforge::scheduler::{ContentJob, JobId, JobStatus, LifecycleManager};
use contentforge::storage::{JobStore, MemoryJobStore};
use contentforge::StageError;

/// Configuration with millisecond timings rooted at `temp_dir`.
pub fn fast_config(temp_dir: &Path) -> OrchestratorConfig {
    OrchestratorConfig::new()
        .with_poll_interval(Duration::from_millis(10))
        .with_base_backoff(Duration::from_millis(20))
        .with_stage_timeout(Duration::from_secs(5))
        .with_shutdown_timeout(Duration::from_secs(5))
        .with_temp_dir(temp_dir)
}

/// Producer, assembler and publisher with scripted failures and call counters.
#[derive(Default)]
pub struct ScriptedStages {
    pub produce_calls: AtomicUsize,
    pub assemble_calls: AtomicUsize,
    pub publish_calls: AtomicUsize,
    /// Job ids in the order their produce calls started.
    pub produce_log: Mutex<Vec<JobId>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    produce_failures: Mutex<VecDeque<StageError>>,
    always_fail: Option<StageError>,
    produce_delay: Duration,
    stalls: AtomicUsize,
    stall_for: Duration,
}

/// Counts a produce call as running until dropped, including when the call
/// is abandoned at a timeout.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ScriptedStages {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `times` produce calls fail with `error`.
    pub fn failing_produce(self, times: usize, error: StageError) -> Self {
        if let Ok(mut failures) = self.produce_failures.lock() {
            failures.extend(std::iter::repeat(error).take(times));
        }
        self
    }

    /// Every produce call fails with `error`.
    pub fn always_failing(mut self, error: StageError) -> Self {
        self.always_fail = Some(error);
        self
    }

    /// The next `times` produce calls hang for `delay` before doing anything.
    pub fn stalling_produce(mut self, times: usize, delay: Duration) -> Self {
        self.stalls = AtomicUsize::new(times);
        self.stall_for = delay;
        self
    }

    /// Produce calls hold for `delay` after writing their output.
    pub fn with_produce_delay(mut self, delay: Duration) -> Self {
        self.produce_delay = delay;
        self
    }

    pub fn produce_calls(&self) -> usize {
        self.produce_calls.load(Ordering::SeqCst)
    }

    pub fn assemble_calls(&self) -> usize {
        self.assemble_calls.load(Ordering::SeqCst)
    }

    pub fn publish_calls(&self) -> usize {
        self.publish_calls.load(Ordering::SeqCst)
    }

    /// Highest number of produce calls observed running at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn produce_log(&self) -> Vec<JobId> {
        self.produce_log.lock().unwrap().clone()
    }

    async fn produce_inner(&self, ctx: &StageContext) -> Result<ArtifactRef, StageError> {
        let stalled = self
            .stalls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if stalled {
            tokio::time::sleep(self.stall_for).await;
        }
        if let Some(error) = &self.always_fail {
            return Err(error.clone());
        }
        let scripted = self.produce_failures.lock().unwrap().pop_front();
        if let Some(error) = scripted {
            return Err(error);
        }

        let path = ctx.work_dir.join(format!("raw-{}.png", ctx.attempt));
        tokio::fs::write(&path, b"raw frames")
            .await
            .map_err(|e| StageError::transient(e.to_string()))?;
        if !self.produce_delay.is_zero() {
            tokio::time::sleep(self.produce_delay).await;
        }
        Ok(ArtifactRef::new(path))
    }
}

#[async_trait]
impl MediaProducer for ScriptedStages {
    async fn produce(&self, job: &ContentJob, ctx: &StageContext) -> Result<ArtifactRef, StageError> {
        self.produce_calls.fetch_add(1, Ordering::SeqCst);
        self.produce_log.lock().unwrap().push(job.id);
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        let _running = InFlight(&self.in_flight);

        self.produce_inner(ctx).await
    }
}

#[async_trait]
impl Assembler for ScriptedStages {
    async fn assemble(
        &self,
        _job: &ContentJob,
        artifact: &ArtifactRef,
        ctx: &StageContext,
    ) -> Result<ArtifactRef, StageError> {
        self.assemble_calls.fetch_add(1, Ordering::SeqCst);
        let path = ctx.work_dir.join("final.mp4");
        tokio::fs::copy(artifact.path(), &path)
            .await
            .map_err(|e| StageError::transient(e.to_string()))?;
        Ok(ArtifactRef::new(path))
    }
}

#[async_trait]
impl Publisher for ScriptedStages {
    async fn publish(
        &self,
        job: &ContentJob,
        artifact: &ArtifactRef,
        _ctx: &StageContext,
    ) -> Result<PublishReceipt, StageError> {
        self.publish_calls.fetch_add(1, Ordering::SeqCst);
        if !artifact.path().is_file() {
            return Err(StageError::permanent(format!("missing artifact {}", artifact)));
        }
        Ok(PublishReceipt::new(format!("video-{}", job.id))
            .with_url(format!("https://videos.example/{}", job.id)))
    }
}

/// Records every notification it receives.
#[derive(Default)]
pub struct RecordingNotifier {
    pub received: Mutex<Vec<(JobId, JobStatus)>>,
}

impl RecordingNotifier {
    pub fn received(&self) -> Vec<(JobId, JobStatus)> {
        self.received.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, job_id: JobId, status: JobStatus, _error: Option<&str>) {
        self.received.lock().unwrap().push((job_id, status));
    }
}

pub fn collaborators(stages: &Arc<ScriptedStages>) -> Collaborators {
    Collaborators::new(stages.clone(), stages.clone(), stages.clone())
}

/// Starts an orchestrator on a new task.
pub fn start(
    config: OrchestratorConfig,
    store: Arc<dyn JobStore>,
    collaborators: Collaborators,
) -> (OrchestratorHandle, JoinHandle<OrchestratorStats>) {
    let (orchestrator, handle) =
        Orchestrator::new(config, store, collaborators).expect("valid config");
    (handle, orchestrator.spawn())
}

/// Waits until `done` holds for the job; panics after ten seconds.
///
/// Reads that fail because the store is offline are retried.
async fn wait_until(
    store: &dyn JobStore,
    id: JobId,
    what: &str,
    done: impl Fn(&ContentJob) -> bool,
) -> ContentJob {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    let mut last = None;
    loop {
        match store.get_by_id(id).await {
            Ok(Some(job)) if done(&job) => return job,
            Ok(Some(job)) => last = Some(job.status),
            Ok(None) => panic!("job {} does not exist", id),
            Err(_) => {}
        }
        if tokio::time::Instant::now() > deadline {
            panic!("job {} never became {}, last status {:?}", id, what, last);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Waits until the job reaches `expected`.
pub async fn wait_for_status(store: &dyn JobStore, id: JobId, expected: JobStatus) -> ContentJob {
    wait_until(store, id, expected.as_str(), |job| job.status == expected).await
}

/// Waits until the job reaches a terminal status.
pub async fn wait_for_terminal(store: &dyn JobStore, id: JobId) -> ContentJob {
    wait_until(store, id, "terminal", |job| job.status.is_terminal()).await
}

/// Asserts that every transition the store recorded is a legal edge.
pub async fn assert_legal_history(store: &MemoryJobStore) {
    let transitions = store.transitions().await;
    LifecycleManager::new()
        .validate_history(&transitions)
        .expect("transition history is legal");
}

/// Statuses a job moved through, in order.
pub async fn status_path(store: &MemoryJobStore, id: JobId) -> Vec<JobStatus> {
    store.history(id).await.iter().map(|record| record.to).collect()
}
