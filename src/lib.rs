//! contentforge: job orchestration for a scheduled content pipeline.
//!
//! Content records wait in a job store until their scheduled time, are
//! produced, assembled and published through pluggable stages, and are
//! retried with exponential backoff when a stage fails.

// Core modules
pub mod cli;
pub mod error;
pub mod metrics;
pub mod notify;
pub mod pipeline;
pub mod scheduler;
pub mod storage;

// Re-export commonly used error types
pub use error::{StageError, StoreError, TransitionError};
