//! Job scheduling: what a content job is, when it becomes eligible, and how
//! many run at once.
//!
//! - **job**: `ContentJob`, `JobStatus`, the execution plan and the in-memory
//!   `ScheduledTask` snapshot
//! - **lifecycle**: the legal status transition graph
//! - **poller**: readiness polling with backoff on store failures
//! - **queue**: pending queue, active registry and the concurrency gate
//! - **retry**: exponential backoff and failure disposition
//! - **reaper**: frees slots of finished executors
//!
//! # Architecture
//!
//! ```text
//!   ┌───────────┐   ready jobs   ┌──────────────┐  admit   ┌──────────────┐
//!   │ Job Store │ ─────────────▶ │ PendingQueue │ ───────▶ │   Registry   │
//!   └───────────┘    (poller)    └──────────────┘  (gate)  └──────┬───────┘
//!         ▲                                                       │ spawn
//!         │ status, metadata, reschedule                          ▼
//!         └──────────────────────────────────────────────── Executor tasks
//! ```
//!
//! The structures here are owned by the orchestrator control loop
//! (`pipeline::orchestrator`), which is their only writer.

pub mod job;
pub mod lifecycle;
pub mod poller;
pub mod queue;
pub mod reaper;
pub mod retry;

// Re-export main types for convenience
pub use job::{
    keys, ContentJob, ExecutionPlan, JobId, JobMetadata, JobStatus, NewContentJob,
    ParseStatusError, ScheduledTask,
};
pub use lifecycle::{LifecycleManager, TransitionRecord};
pub use poller::ReadinessPoller;
pub use queue::{ActiveTask, ActiveTaskRegistry, ConcurrencyGate, PendingQueue};
pub use reaper::{LifecycleReaper, ReapedTask};
pub use retry::{FailureDisposition, RetryManager, RetryPolicy};
