//! In-memory scheduling structures owned by the control loop.
//!
//! - [`PendingQueue`]: FIFO of ready jobs awaiting a slot, deduplicated by id
//! - [`ActiveTaskRegistry`]: jobs holding a slot, keyed by id
//! - [`ConcurrencyGate`]: moves jobs from the queue into the registry while
//!   slots are free
//!
//! None of these types are shared; the control loop is their only writer.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;

use crate::pipeline::executor::{CancelHandle, TaskOutcome};
use crate::scheduler::job::{ExecutionPlan, JobId, JobStatus, ScheduledTask};

/// FIFO of tasks awaiting admission, in discovery order.
#[derive(Debug, Default)]
pub struct PendingQueue {
    tasks: VecDeque<ScheduledTask>,
    ids: HashSet<JobId>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a task. Returns `false` if a task with the same id is queued.
    pub fn push(&mut self, task: ScheduledTask) -> bool {
        if !self.ids.insert(task.id()) {
            return false;
        }
        self.tasks.push_back(task);
        true
    }

    /// Removes and returns the oldest task.
    pub fn pop_front(&mut self) -> Option<ScheduledTask> {
        let task = self.tasks.pop_front()?;
        self.ids.remove(&task.id());
        Some(task)
    }

    /// Removes the task with the given id.
    pub fn remove(&mut self, id: JobId) -> Option<ScheduledTask> {
        if !self.ids.remove(&id) {
            return None;
        }
        let position = self.tasks.iter().position(|task| task.id() == id)?;
        self.tasks.remove(position)
    }

    pub fn contains(&self, id: JobId) -> bool {
        self.ids.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Iterates over queued tasks, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &ScheduledTask> {
        self.tasks.iter()
    }

    /// Drops every queued task.
    pub fn clear(&mut self) {
        self.tasks.clear();
        self.ids.clear();
    }
}

/// A job holding an execution slot.
#[derive(Debug)]
pub struct ActiveTask {
    /// Latest snapshot; replaced by the executor's copy when it finishes.
    pub task: ScheduledTask,
    pub plan: ExecutionPlan,
    /// Last status reported by the executor.
    pub status: JobStatus,
    pub admitted_at: DateTime<Utc>,
    pub cancel: CancelHandle,
    pub handle: Option<JoinHandle<()>>,
    /// Set once the executor reported completion; the slot is then reapable.
    pub finished: Option<TaskOutcome>,
}

impl ActiveTask {
    pub fn new(
        task: ScheduledTask,
        plan: ExecutionPlan,
        cancel: CancelHandle,
        handle: Option<JoinHandle<()>>,
    ) -> Self {
        let status = task.status();
        Self {
            task,
            plan,
            status,
            admitted_at: Utc::now(),
            cancel,
            handle,
            finished: None,
        }
    }

    pub fn id(&self) -> JobId {
        self.task.id()
    }

    pub fn is_finished(&self) -> bool {
        self.finished.is_some()
    }
}

/// Jobs currently holding a slot.
#[derive(Debug, Default)]
pub struct ActiveTaskRegistry {
    entries: HashMap<JobId, ActiveTask>,
}

impl ActiveTaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entry: ActiveTask) {
        self.entries.insert(entry.id(), entry);
    }

    pub fn get(&self, id: JobId) -> Option<&ActiveTask> {
        self.entries.get(&id)
    }

    pub fn get_mut(&mut self, id: JobId) -> Option<&mut ActiveTask> {
        self.entries.get_mut(&id)
    }

    pub fn remove(&mut self, id: JobId) -> Option<ActiveTask> {
        self.entries.remove(&id)
    }

    pub fn contains(&self, id: JobId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Number of occupied slots, including finished entries not yet reaped.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ActiveTask> {
        self.entries.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ActiveTask> {
        self.entries.values_mut()
    }

    /// Removes and returns every finished entry.
    pub fn drain_finished(&mut self) -> Vec<ActiveTask> {
        let finished: Vec<JobId> = self
            .entries
            .values()
            .filter(|entry| entry.is_finished())
            .map(ActiveTask::id)
            .collect();
        finished
            .into_iter()
            .filter_map(|id| self.entries.remove(&id))
            .collect()
    }

    /// Removes and returns every entry.
    pub fn drain(&mut self) -> Vec<ActiveTask> {
        self.entries.drain().map(|(_, entry)| entry).collect()
    }
}

/// Bounds the number of jobs in progress.
#[derive(Debug, Clone, Copy)]
pub struct ConcurrencyGate {
    max_concurrent: usize,
}

impl ConcurrencyGate {
    pub fn new(max_concurrent: usize) -> Self {
        Self { max_concurrent }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Number of free slots.
    pub fn available(&self, registry: &ActiveTaskRegistry) -> usize {
        self.max_concurrent.saturating_sub(registry.len())
    }

    /// Admits queued tasks in FIFO order while slots are free.
    ///
    /// The execution plan of each task is decided here, once, and `launch`
    /// starts its executor. Returns the ids admitted.
    pub fn admit<F>(
        &self,
        queue: &mut PendingQueue,
        registry: &mut ActiveTaskRegistry,
        mut launch: F,
    ) -> Vec<JobId>
    where
        F: FnMut(ScheduledTask, ExecutionPlan) -> ActiveTask,
    {
        let mut admitted = Vec::new();
        while registry.len() < self.max_concurrent {
            let Some(task) = queue.pop_front() else {
                break;
            };
            let plan = ExecutionPlan::decide(&task.job);
            let entry = launch(task, plan);
            admitted.push(entry.id());
            registry.insert(entry);
        }
        admitted
    }
}
