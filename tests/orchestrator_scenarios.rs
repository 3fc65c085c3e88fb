//! End-to-end orchestrator scenarios against the in-memory job store.

mod common;

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use common::{
    assert_legal_history, collaborators, fast_config, start, status_path, wait_for_status,
    wait_for_terminal, RecordingNotifier, ScriptedStages,
};
use contentforge::pipeline::{
    ArtifactRef, Assembler, CancelOutcome, Collaborators, MediaProducer, StageContext,
};
use contentforge::scheduler::{keys, ContentJob, JobStatus, NewContentJob};
use contentforge::storage::{JobStore, MemoryJobStore, SqliteJobStore};
use contentforge::StageError;

fn ready(title: &str) -> NewContentJob {
    NewContentJob::new(title, Utc::now() - chrono::Duration::seconds(1))
}

#[tokio::test]
async fn test_job_runs_full_pipeline() {
    let root = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryJobStore::new());
    let stages = Arc::new(ScriptedStages::new());
    let notifier = Arc::new(RecordingNotifier::default());
    let job = store.create(ready("Morning news")).await.unwrap();

    let (handle, run) = start(
        fast_config(root.path()),
        store.clone(),
        collaborators(&stages).with_notifier(notifier.clone()),
    );
    let done = wait_for_terminal(store.as_ref(), job.id).await;

    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.external_id(), Some(format!("video-{}", job.id).as_str()));
    assert!(done.metadata_str(keys::FINAL_ARTIFACT_PATH).is_some());
    assert_eq!(
        status_path(&store, job.id).await,
        vec![
            JobStatus::Producing,
            JobStatus::Assembling,
            JobStatus::Publishing,
            JobStatus::Completed
        ]
    );

    let stats = handle.shutdown().await.unwrap();
    run.await.unwrap();
    assert_eq!(stats.completed, 1);
    assert!(notifier.received().contains(&(job.id, JobStatus::Completed)));
    assert_legal_history(&store).await;
}

#[tokio::test]
async fn test_concurrency_is_bounded() {
    let root = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryJobStore::new());
    let stages = Arc::new(ScriptedStages::new().with_produce_delay(Duration::from_millis(60)));
    let mut ids = Vec::new();
    for i in 0..6 {
        ids.push(store.create(ready(&format!("clip {}", i))).await.unwrap().id);
    }

    let (handle, run) = start(
        fast_config(root.path()).with_max_concurrent(2),
        store.clone(),
        collaborators(&stages),
    );
    for id in &ids {
        assert_eq!(wait_for_terminal(store.as_ref(), *id).await.status, JobStatus::Completed);
    }

    let stats = handle.shutdown().await.unwrap();
    run.await.unwrap();
    assert!(stages.max_in_flight() <= 2);
    assert!(stats.peak_active <= 2);
    assert_eq!(stats.admitted, 6);
    assert_legal_history(&store).await;
}

#[tokio::test]
async fn test_job_discovered_repeatedly_is_admitted_once() {
    let root = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryJobStore::new());
    // The first job holds the only slot across many polls while the second waits.
    let stages = Arc::new(ScriptedStages::new().with_produce_delay(Duration::from_millis(150)));
    let first = store.create(ready("first")).await.unwrap();
    let second = store.create(ready("second")).await.unwrap();

    let (handle, run) = start(
        fast_config(root.path()).with_max_concurrent(1),
        store.clone(),
        collaborators(&stages),
    );
    wait_for_terminal(store.as_ref(), first.id).await;
    wait_for_terminal(store.as_ref(), second.id).await;

    let stats = handle.shutdown().await.unwrap();
    run.await.unwrap();
    assert_eq!(stats.admitted, 2);
    assert_eq!(stages.produce_log(), vec![first.id, second.id]);
    let admissions = status_path(&store, second.id)
        .await
        .into_iter()
        .filter(|status| *status == JobStatus::Producing)
        .count();
    assert_eq!(admissions, 1);
}

#[tokio::test]
async fn test_single_slot_admits_second_job_after_first_finishes() {
    let root = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryJobStore::new());
    let stages = Arc::new(ScriptedStages::new().with_produce_delay(Duration::from_millis(40)));
    let first = store.create(ready("first")).await.unwrap();
    let second = store.create(ready("second")).await.unwrap();

    let (handle, run) = start(
        fast_config(root.path()).with_max_concurrent(1),
        store.clone(),
        collaborators(&stages),
    );
    wait_for_terminal(store.as_ref(), second.id).await;
    handle.shutdown().await.unwrap();
    run.await.unwrap();

    let transitions = store.transitions().await;
    let first_completed = transitions
        .iter()
        .find(|r| r.job_id == first.id && r.to == JobStatus::Completed)
        .map(|r| r.sequence)
        .unwrap();
    let second_started = transitions
        .iter()
        .find(|r| r.job_id == second.id && r.to == JobStatus::Producing)
        .map(|r| r.sequence)
        .unwrap();
    assert!(second_started > first_completed);
    assert_eq!(stages.max_in_flight(), 1);
}

#[tokio::test]
async fn test_transient_failures_then_success() {
    let root = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryJobStore::new());
    let stages = Arc::new(
        ScriptedStages::new().failing_produce(2, StageError::transient("render farm busy")),
    );
    let job = store.create(ready("retry me")).await.unwrap();

    let (handle, run) = start(
        fast_config(root.path()).with_max_retries(3),
        store.clone(),
        collaborators(&stages),
    );
    let done = wait_for_terminal(store.as_ref(), job.id).await;
    let stats = handle.shutdown().await.unwrap();
    run.await.unwrap();

    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.retry_count(), 2);
    assert_eq!(stages.produce_calls(), 3);
    assert_eq!(stats.retried, 2);
    assert!(done.metadata_str(keys::NEXT_ATTEMPT_AT).is_none());
    assert_eq!(
        status_path(&store, job.id).await,
        vec![
            JobStatus::Producing,
            JobStatus::Pending,
            JobStatus::Producing,
            JobStatus::Pending,
            JobStatus::Producing,
            JobStatus::Assembling,
            JobStatus::Publishing,
            JobStatus::Completed
        ]
    );
    assert_legal_history(&store).await;
}

#[tokio::test]
async fn test_persistent_failure_exhausts_retries() {
    let root = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryJobStore::new());
    let stages =
        Arc::new(ScriptedStages::new().always_failing(StageError::transient("upstream 503")));
    let job = store.create(ready("doomed")).await.unwrap();

    let (handle, run) = start(
        fast_config(root.path()).with_max_retries(3),
        store.clone(),
        collaborators(&stages),
    );
    let done = wait_for_terminal(store.as_ref(), job.id).await;

    // Give the loop a few more polls to prove the job is not admitted again.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let stats = handle.shutdown().await.unwrap();
    run.await.unwrap();

    assert_eq!(done.status, JobStatus::Failed);
    assert_eq!(done.retry_count(), 3);
    assert!(done.last_error().unwrap().contains("upstream 503"));
    assert_eq!(stages.produce_calls(), 3);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.retried, 2);
    assert_legal_history(&store).await;
}

#[tokio::test]
async fn test_backoff_doubles_between_attempts() {
    let root = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryJobStore::new());
    let stages =
        Arc::new(ScriptedStages::new().always_failing(StageError::transient("upstream 503")));
    let job = store.create(ready("spaced out")).await.unwrap();

    let (handle, run) = start(
        fast_config(root.path())
            .with_max_retries(3)
            .with_base_backoff(Duration::from_millis(100)),
        store.clone(),
        collaborators(&stages),
    );
    wait_for_terminal(store.as_ref(), job.id).await;
    handle.shutdown().await.unwrap();
    run.await.unwrap();

    let starts: Vec<_> = store
        .history(job.id)
        .await
        .into_iter()
        .filter(|r| r.to == JobStatus::Producing)
        .map(|r| r.at)
        .collect();
    assert_eq!(starts.len(), 3);
    let first_gap = starts[1] - starts[0];
    let second_gap = starts[2] - starts[1];
    assert!(first_gap >= chrono::Duration::milliseconds(100));
    assert!(second_gap >= chrono::Duration::milliseconds(200));
}

#[tokio::test]
async fn test_permanent_failure_is_not_retried() {
    let root = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryJobStore::new());
    let stages =
        Arc::new(ScriptedStages::new().always_failing(StageError::permanent("prompt rejected")));
    let job = store.create(ready("bad prompt")).await.unwrap();

    let (handle, run) = start(fast_config(root.path()), store.clone(), collaborators(&stages));
    let done = wait_for_terminal(store.as_ref(), job.id).await;
    handle.shutdown().await.unwrap();
    run.await.unwrap();

    assert_eq!(done.status, JobStatus::Failed);
    assert_eq!(done.retry_count(), 0);
    assert_eq!(stages.produce_calls(), 1);
}

#[tokio::test]
async fn test_existing_artifact_skips_production() {
    let root = tempfile::tempdir().unwrap();
    let existing = root.path().join("supplied.mp4");
    std::fs::write(&existing, b"finished video").unwrap();

    let store = Arc::new(MemoryJobStore::new());
    let stages = Arc::new(ScriptedStages::new());
    let job = store
        .create(ready("reupload").with_existing_artifact(&existing))
        .await
        .unwrap();

    let (handle, run) = start(
        fast_config(&root.path().join("work")),
        store.clone(),
        collaborators(&stages),
    );
    let done = wait_for_terminal(store.as_ref(), job.id).await;
    handle.shutdown().await.unwrap();
    run.await.unwrap();

    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(
        status_path(&store, job.id).await,
        vec![JobStatus::Publishing, JobStatus::Completed]
    );
    assert_eq!(stages.produce_calls(), 0);
    assert_eq!(stages.assemble_calls(), 0);
    assert_eq!(stages.publish_calls(), 1);
    assert_eq!(done.metadata_str(keys::GENERATION_METHOD), Some("existing_artifact"));
    assert!(existing.exists());
    assert_legal_history(&store).await;
}

#[tokio::test]
async fn test_cancel_while_producing_leaves_no_artifacts() {
    let root = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryJobStore::new());
    let stages = Arc::new(ScriptedStages::new().with_produce_delay(Duration::from_millis(300)));
    let job = store.create(ready("cancel me")).await.unwrap();

    let (handle, run) = start(fast_config(root.path()), store.clone(), collaborators(&stages));
    wait_for_status(store.as_ref(), job.id, JobStatus::Producing).await;

    assert_eq!(handle.cancel(job.id).await.unwrap(), CancelOutcome::Requested);
    let done = wait_for_terminal(store.as_ref(), job.id).await;
    let stats = handle.shutdown().await.unwrap();
    run.await.unwrap();

    assert_eq!(done.status, JobStatus::Cancelled);
    assert_eq!(stats.cancelled, 1);
    assert_eq!(stages.assemble_calls(), 0);
    assert!(!root.path().join(format!("job-{}", job.id)).exists());
    assert!(done.metadata_str(keys::ARTIFACT_PATH).is_none());
    assert_legal_history(&store).await;
}

#[tokio::test]
async fn test_cancel_queued_job() {
    let root = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryJobStore::new());
    let stages = Arc::new(ScriptedStages::new().with_produce_delay(Duration::from_millis(200)));
    let first = store.create(ready("first")).await.unwrap();
    let second = store.create(ready("second")).await.unwrap();

    let (handle, run) = start(
        fast_config(root.path()).with_max_concurrent(1),
        store.clone(),
        collaborators(&stages),
    );
    wait_for_status(store.as_ref(), first.id, JobStatus::Producing).await;

    // Both jobs were discovered by the same poll; the second waits for the slot.
    assert_eq!(handle.status().await.unwrap().queue_len, 1);
    assert_eq!(handle.cancel(second.id).await.unwrap(), CancelOutcome::Dequeued);

    wait_for_terminal(store.as_ref(), first.id).await;
    handle.shutdown().await.unwrap();
    run.await.unwrap();

    assert_eq!(store.get(second.id).await.unwrap().status, JobStatus::Cancelled);
    assert_eq!(stages.produce_log(), vec![first.id]);
    assert_legal_history(&store).await;
}

#[tokio::test]
async fn test_interrupted_job_is_recovered_on_start() {
    let root = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryJobStore::new());
    let mut stuck = ready("interrupted").into_job(1, Utc::now());
    stuck.status = JobStatus::Assembling;
    store.insert(stuck).await;

    let stages = Arc::new(ScriptedStages::new());
    let (handle, run) = start(fast_config(root.path()), store.clone(), collaborators(&stages));
    let done = wait_for_terminal(store.as_ref(), 1).await;
    let stats = handle.shutdown().await.unwrap();
    run.await.unwrap();

    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.retry_count(), 1);
    assert_eq!(stats.recovered, 1);
    assert!(done.last_error().unwrap().contains("interrupted"));
}

#[tokio::test]
async fn test_recovery_can_be_disabled() {
    let root = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryJobStore::new());
    let mut stuck = ready("left alone").into_job(1, Utc::now());
    stuck.status = JobStatus::Publishing;
    store.insert(stuck).await;

    let stages = Arc::new(ScriptedStages::new());
    let (handle, run) = start(
        fast_config(root.path()).with_recover_interrupted(false),
        store.clone(),
        collaborators(&stages),
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    let stats = handle.shutdown().await.unwrap();
    run.await.unwrap();

    assert_eq!(store.get(1).await.unwrap().status, JobStatus::Publishing);
    assert_eq!(stats.recovered, 0);
    assert_eq!(stages.publish_calls(), 0);
}

#[tokio::test]
async fn test_store_outage_delays_discovery() {
    let root = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryJobStore::new());
    let job = store.create(ready("patient")).await.unwrap();
    store.set_unavailable(Some("database is locked")).await;

    let stages = Arc::new(ScriptedStages::new());
    let (handle, run) = start(fast_config(root.path()), store.clone(), collaborators(&stages));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(stages.produce_calls(), 0);

    store.set_unavailable(None).await;
    let done = wait_for_terminal(store.as_ref(), job.id).await;
    handle.shutdown().await.unwrap();
    run.await.unwrap();
    assert_eq!(done.status, JobStatus::Completed);
}

#[tokio::test]
async fn test_future_jobs_wait_for_schedule() {
    let root = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryJobStore::new());
    let scheduled_at = Utc::now() + chrono::Duration::milliseconds(150);
    let job = store
        .create(NewContentJob::new("evening show", scheduled_at))
        .await
        .unwrap();

    let stages = Arc::new(ScriptedStages::new());
    let (handle, run) = start(fast_config(root.path()), store.clone(), collaborators(&stages));
    wait_for_terminal(store.as_ref(), job.id).await;
    handle.shutdown().await.unwrap();
    run.await.unwrap();

    let started = store.history(job.id).await[0].at;
    assert!(started >= scheduled_at);
}

#[tokio::test]
async fn test_status_reports_active_jobs() {
    let root = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryJobStore::new());
    let stages = Arc::new(ScriptedStages::new().with_produce_delay(Duration::from_millis(300)));
    let job = store.create(ready("in progress")).await.unwrap();

    let (handle, run) = start(fast_config(root.path()), store.clone(), collaborators(&stages));
    wait_for_status(store.as_ref(), job.id, JobStatus::Producing).await;

    let mut status = handle.status().await.unwrap();
    for _ in 0..100 {
        if status.active.first().map(|a| a.status) == Some(JobStatus::Producing) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
        status = handle.status().await.unwrap();
    }
    assert!(status.running);
    assert_eq!(status.active.len(), 1);
    assert_eq!(status.active[0].job_id, job.id);
    assert_eq!(status.active[0].progress, "Producing media");

    let json = serde_json::to_value(&status).unwrap();
    assert_eq!(json["active"][0]["status"], "producing");

    handle.shutdown().await.unwrap();
    run.await.unwrap();
}

#[tokio::test]
async fn test_shutdown_aborts_after_timeout() {
    let root = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryJobStore::new());
    let stages = Arc::new(ScriptedStages::new().with_produce_delay(Duration::from_secs(30)));
    let job = store.create(ready("slow render")).await.unwrap();

    let (handle, run) = start(
        fast_config(root.path()).with_shutdown_timeout(Duration::from_millis(50)),
        store.clone(),
        collaborators(&stages),
    );
    wait_for_status(store.as_ref(), job.id, JobStatus::Producing).await;

    let stats = tokio::time::timeout(Duration::from_secs(5), handle.shutdown())
        .await
        .expect("shutdown honours its timeout")
        .unwrap();
    run.await.unwrap();

    assert_eq!(stats.completed, 0);
    // Left in progress for crash recovery on the next start.
    assert_eq!(store.get(job.id).await.unwrap().status, JobStatus::Producing);
}

#[tokio::test]
async fn test_sqlite_store_end_to_end() {
    let root = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}?mode=rwc", root.path().join("jobs.db").display());
    let store = Arc::new(SqliteJobStore::connect(&url).await.unwrap());
    store.run_migrations().await.unwrap();
    let job = store.create(ready("persisted")).await.unwrap();

    let stages = Arc::new(
        ScriptedStages::new().failing_produce(1, StageError::transient("cold start")),
    );
    let (handle, run) = start(
        fast_config(&root.path().join("work")),
        store.clone(),
        collaborators(&stages),
    );
    let done = wait_for_terminal(store.as_ref(), job.id).await;
    handle.shutdown().await.unwrap();
    run.await.unwrap();

    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.retry_count(), 1);

    let history = store.history(job.id).await.unwrap();
    contentforge::scheduler::LifecycleManager::new()
        .validate_history(&history)
        .unwrap();
    assert_eq!(history.last().map(|r| r.to), Some(JobStatus::Completed));
}

/// Fails its first call and takes the store offline for `outage` while the
/// failure is being recorded.
struct OutageOnFirstFailure {
    store: Arc<MemoryJobStore>,
    outage: Duration,
    calls: AtomicUsize,
    stages: Arc<ScriptedStages>,
}

#[async_trait]
impl MediaProducer for OutageOnFirstFailure {
    async fn produce(&self, job: &ContentJob, ctx: &StageContext) -> Result<ArtifactRef, StageError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) > 0 {
            return self.stages.produce(job, ctx).await;
        }
        self.store.set_unavailable(Some("database is locked")).await;
        let store = self.store.clone();
        let outage = self.outage;
        tokio::spawn(async move {
            tokio::time::sleep(outage).await;
            store.set_unavailable(None).await;
        });
        Err(StageError::transient("encoder crashed"))
    }
}

#[tokio::test]
async fn test_brief_outage_while_recording_failure_does_not_strand_job() {
    let root = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryJobStore::new());
    let stages = Arc::new(ScriptedStages::new());
    let job = store.create(ready("unlucky")).await.unwrap();
    let producer = Arc::new(OutageOnFirstFailure {
        store: store.clone(),
        outage: Duration::from_millis(100),
        calls: AtomicUsize::new(0),
        stages: stages.clone(),
    });

    let (handle, run) = start(
        fast_config(root.path()),
        store.clone(),
        Collaborators::new(producer.clone(), stages.clone(), stages.clone()),
    );
    let done = wait_for_terminal(store.as_ref(), job.id).await;
    let stats = handle.shutdown().await.unwrap();
    run.await.unwrap();

    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.retry_count(), 1);
    assert!(done.last_error().unwrap_or_default().contains("interrupted"));
    assert_eq!(producer.calls.load(Ordering::SeqCst), 2);
    assert_eq!(stats.stranded, 1);
    assert_eq!(stats.recovered, 1);
    assert_legal_history(&store).await;
}

/// Hands back a file from a shared media library.
struct LibraryProducer {
    path: PathBuf,
}

#[async_trait]
impl MediaProducer for LibraryProducer {
    async fn produce(&self, _job: &ContentJob, _ctx: &StageContext) -> Result<ArtifactRef, StageError> {
        Ok(ArtifactRef::new(self.path.clone()))
    }
}

struct RejectingAssembler;

#[async_trait]
impl Assembler for RejectingAssembler {
    async fn assemble(
        &self,
        _job: &ContentJob,
        _artifact: &ArtifactRef,
        _ctx: &StageContext,
    ) -> Result<ArtifactRef, StageError> {
        Err(StageError::permanent("unsupported codec"))
    }
}

#[tokio::test]
async fn test_failed_job_keeps_files_outside_temp_dir() {
    let root = tempfile::tempdir().unwrap();
    let library = tempfile::tempdir().unwrap();
    let stock = library.path().join("stock-intro.mp4");
    std::fs::write(&stock, b"mp4").unwrap();

    let store = Arc::new(MemoryJobStore::new());
    let stages = Arc::new(ScriptedStages::new());
    let job = store.create(ready("stock footage")).await.unwrap();

    let (handle, run) = start(
        fast_config(root.path()),
        store.clone(),
        Collaborators::new(
            Arc::new(LibraryProducer {
                path: stock.clone(),
            }),
            Arc::new(RejectingAssembler),
            stages.clone(),
        ),
    );
    let done = wait_for_terminal(store.as_ref(), job.id).await;
    handle.shutdown().await.unwrap();
    run.await.unwrap();

    assert_eq!(done.status, JobStatus::Failed);
    assert!(stock.exists());
    assert!(!root.path().join(format!("job-{}", job.id)).exists());
}

#[tokio::test]
async fn test_stage_timeout_is_retried() {
    let root = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryJobStore::new());
    let stages = Arc::new(ScriptedStages::new().stalling_produce(1, Duration::from_secs(3)));
    let job = store.create(ready("slow render")).await.unwrap();

    let (handle, run) = start(
        fast_config(root.path()).with_stage_timeout(Duration::from_millis(100)),
        store.clone(),
        collaborators(&stages),
    );
    let done = wait_for_terminal(store.as_ref(), job.id).await;
    handle.shutdown().await.unwrap();
    run.await.unwrap();

    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.retry_count(), 1);
    assert!(done.last_error().unwrap_or_default().contains("timed out"));
    assert_eq!(stages.produce_calls(), 2);
    assert_legal_history(&store).await;
}

#[tokio::test]
async fn test_cancellation_recorded_after_store_outage() {
    let root = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryJobStore::new());
    let stages = Arc::new(ScriptedStages::new().with_produce_delay(Duration::from_millis(300)));
    let job = store.create(ready("pulled")).await.unwrap();

    let (handle, run) = start(fast_config(root.path()), store.clone(), collaborators(&stages));
    wait_for_status(store.as_ref(), job.id, JobStatus::Producing).await;
    assert_eq!(handle.cancel(job.id).await.unwrap(), CancelOutcome::Requested);

    store.set_unavailable(Some("database is locked")).await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(handle.status().await.unwrap().stats.stranded, 1);
    store.set_unavailable(None).await;

    let done = wait_for_terminal(store.as_ref(), job.id).await;
    let stats = handle.shutdown().await.unwrap();
    run.await.unwrap();

    assert_eq!(done.status, JobStatus::Cancelled);
    assert_eq!(stats.cancelled, 1);
    assert_eq!(stats.recovered, 1);
    assert_eq!(stages.produce_calls(), 1);
    assert_legal_history(&store).await;
}
