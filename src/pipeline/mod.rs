//! Pipeline orchestration for content jobs.
//!
//! This module provides the runtime that takes ready content jobs through
//! production and publishing.
//!
//! # Architecture
//!
//! The pipeline consists of several components:
//!
//! - **Orchestrator**: the control loop owning the queue and active registry
//! - **Executor**: drives one job through its stages as an independent task
//! - **Stages**: the collaborator traits (producer, assembler, publisher,
//!   notifier) and their inputs and outputs
//! - **Command**: stage implementations backed by external commands
//! - **Config**: configuration for all pipeline components
//!
//! # Pipeline Flow
//!
//! 1. **Discovery**: pending jobs whose scheduled time has passed are queued
//! 2. **Admission**: queued jobs take a free slot, FIFO; the execution plan is fixed
//! 3. **Production**: the producer generates media (`Producing`)
//! 4. **Assembly**: the assembler builds the final artifact (`Assembling`)
//! 5. **Publishing**: the publisher uploads it (`Publishing` → `Completed`)
//! 6. **Failure handling**: transient failures return the job to `Pending`
//!    with a backoff; permanent ones fail it
//!
//! Jobs submitted with an existing artifact skip steps 3 and 4.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use contentforge::pipeline::{Collaborators, Orchestrator, OrchestratorConfig};
//! use contentforge::storage::MemoryJobStore;
//!
//! let config = OrchestratorConfig::new()
//!     .with_max_concurrent(2)
//!     .with_poll_interval(std::time::Duration::from_secs(5));
//! let collaborators = Collaborators::new(producer, assembler, publisher);
//!
//! let (orchestrator, handle) =
//!     Orchestrator::new(config, Arc::new(MemoryJobStore::new()), collaborators)?;
//! let run = orchestrator.spawn();
//!
//! let status = handle.status().await?;
//! println!("{} active, {} queued", status.active.len(), status.queue_len);
//!
//! handle.shutdown().await?;
//! run.await?;
//! ```

pub mod command;
pub mod config;
pub mod executor;
pub mod orchestrator;
pub mod stages;

// Re-export main types for convenience
pub use command::{CommandStage, UnconfiguredStage};
pub use config::{ConfigError, OrchestratorConfig};
pub use executor::{
    cancel_pair, CancelHandle, CancelSignal, ExecutorEvent, PipelineExecutor, TaskOutcome,
};
pub use orchestrator::{
    ActiveJobInfo, CancelOutcome, Orchestrator, OrchestratorError, OrchestratorHandle,
    OrchestratorStats, OrchestratorStatus,
};
pub use stages::{
    ArtifactRef, Assembler, Collaborators, MediaProducer, Notifier, PublishReceipt, Publisher,
    Stage, StageContext,
};
