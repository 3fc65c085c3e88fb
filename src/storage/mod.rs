//! Job persistence and artifact storage.
//!
//! # Overview
//!
//! The storage system consists of:
//! - **JobStore**: the trait through which the orchestrator reads and writes
//!   content records
//! - **MemoryJobStore**: in-process store with a sequence-numbered transition log
//! - **SqliteJobStore**: durable SQLite store (`content_jobs` table)
//! - **Migrations**: idempotent schema management
//! - **Artifacts**: per-job work directories and attempt cleanup
//!
//! # Usage
//!
//! ```rust,ignore
//! use contentforge::storage::{JobStore, SqliteJobStore};
//! use contentforge::scheduler::NewContentJob;
//!
//! let store = SqliteJobStore::connect("sqlite://contentforge.db?mode=rwc").await?;
//! store.run_migrations().await?;
//!
//! let job = store.create(NewContentJob::new("Morning news", chrono::Utc::now())).await?;
//! let ready = store.list_ready(chrono::Utc::now()).await?;
//! ```

pub mod artifacts;
pub mod database;
pub mod memory;
pub mod migrations;
pub mod schema;
pub mod store;

// Re-export main types for convenience
pub use artifacts::{ArtifactCleaner, ArtifactError};
pub use database::SqliteJobStore;
pub use memory::MemoryJobStore;
pub use migrations::{MigrationError, MigrationRunner};
pub use store::JobStore;
