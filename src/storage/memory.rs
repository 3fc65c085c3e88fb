//! In-process job store.
//!
//! Keeps every record behind a single async mutex and records each status
//! change with a store-wide sequence number, so tests can inspect the exact
//! order of transitions across jobs.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::error::StoreError;
use crate::scheduler::job::{ContentJob, JobId, JobMetadata, JobStatus, NewContentJob};
use crate::scheduler::lifecycle::{LifecycleManager, TransitionRecord};

use super::store::JobStore;

#[derive(Default)]
struct MemoryState {
    jobs: BTreeMap<JobId, ContentJob>,
    history: Vec<TransitionRecord>,
    next_id: JobId,
    sequence: u64,
    unavailable: Option<String>,
}

impl MemoryState {
    fn ensure_available(&self) -> Result<(), StoreError> {
        match &self.unavailable {
            Some(reason) => Err(StoreError::Unavailable(reason.clone())),
            None => Ok(()),
        }
    }

    fn job_mut(&mut self, id: JobId) -> Result<&mut ContentJob, StoreError> {
        self.jobs.get_mut(&id).ok_or(StoreError::NotFound(id))
    }
}

/// Job store held entirely in memory.
pub struct MemoryJobStore {
    state: Mutex<MemoryState>,
    lifecycle: LifecycleManager,
}

impl MemoryJobStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState {
                next_id: 1,
                ..MemoryState::default()
            }),
            lifecycle: LifecycleManager::new(),
        }
    }

    /// Inserts a record verbatim, keeping its id and status.
    ///
    /// Used to stage jobs left behind by a previous run.
    pub async fn insert(&self, job: ContentJob) {
        let mut state = self.state.lock().await;
        state.next_id = state.next_id.max(job.id + 1);
        state.jobs.insert(job.id, job);
    }

    /// Makes every subsequent call fail with [`StoreError::Unavailable`]
    /// until `None` is passed.
    pub async fn set_unavailable(&self, reason: Option<&str>) {
        self.state.lock().await.unavailable = reason.map(str::to_string);
    }

    /// Transition log of one job, oldest first.
    pub async fn history(&self, id: JobId) -> Vec<TransitionRecord> {
        self.state
            .lock()
            .await
            .history
            .iter()
            .filter(|record| record.job_id == id)
            .cloned()
            .collect()
    }

    /// Transition log of every job, in sequence order.
    pub async fn transitions(&self) -> Vec<TransitionRecord> {
        self.state.lock().await.history.clone()
    }

    /// Number of stored jobs.
    pub async fn len(&self) -> usize {
        self.state.lock().await.jobs.len()
    }

    /// Returns whether the store holds no jobs.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, job: NewContentJob) -> Result<ContentJob, StoreError> {
        let mut state = self.state.lock().await;
        state.ensure_available()?;

        let id = state.next_id;
        state.next_id += 1;
        let record = job.into_job(id, Utc::now());
        state.jobs.insert(id, record.clone());
        Ok(record)
    }

    async fn get_by_id(&self, id: JobId) -> Result<Option<ContentJob>, StoreError> {
        let state = self.state.lock().await;
        state.ensure_available()?;
        Ok(state.jobs.get(&id).cloned())
    }

    async fn list_ready(&self, now: DateTime<Utc>) -> Result<Vec<ContentJob>, StoreError> {
        let state = self.state.lock().await;
        state.ensure_available()?;

        let mut ready: Vec<ContentJob> = state
            .jobs
            .values()
            .filter(|job| job.is_ready(now))
            .cloned()
            .collect();
        ready.sort_by_key(|job| (job.schedule_time, job.id));
        Ok(ready)
    }

    async fn list(&self, status: Option<JobStatus>) -> Result<Vec<ContentJob>, StoreError> {
        let state = self.state.lock().await;
        state.ensure_available()?;

        Ok(state
            .jobs
            .values()
            .filter(|job| status.map_or(true, |wanted| job.status == wanted))
            .cloned()
            .collect())
    }

    async fn set_status(&self, id: JobId, status: JobStatus) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.ensure_available()?;

        let from = state.job_mut(id)?.status;
        self.lifecycle.check(id, from, status)?;

        let now = Utc::now();
        let job = state.job_mut(id)?;
        job.status = status;
        job.updated_at = now;

        state.sequence += 1;
        let sequence = state.sequence;
        state.history.push(TransitionRecord {
            job_id: id,
            from,
            to: status,
            at: now,
            sequence,
        });
        Ok(())
    }

    async fn set_metadata(&self, id: JobId, metadata: JobMetadata) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.ensure_available()?;

        let job = state.job_mut(id)?;
        if job.status.is_terminal() {
            return Err(StoreError::Finished(id, job.status));
        }
        job.metadata = metadata;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn reschedule(&self, id: JobId, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.ensure_available()?;

        let job = state.job_mut(id)?;
        job.schedule_time = at;
        job.updated_at = Utc::now();
        Ok(())
    }
}
