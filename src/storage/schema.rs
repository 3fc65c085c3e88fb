//! Database schema constants and SQL queries.
//!
//! This module contains all SQL schema definitions for the SQLite job store.
//! Instants are stored as INTEGER milliseconds since the Unix epoch so that
//! readiness queries compare numbers, and metadata is stored as JSON text.

/// SQL schema for creating the content_jobs table.
pub const CREATE_CONTENT_JOBS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS content_jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    title TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    category TEXT NOT NULL DEFAULT '',
    expected_duration_seconds INTEGER NOT NULL DEFAULT 0,
    schedule_time INTEGER NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
)
"#;

/// SQL schema for creating the job_transitions table.
pub const CREATE_JOB_TRANSITIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS job_transitions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id INTEGER NOT NULL REFERENCES content_jobs(id) ON DELETE CASCADE,
    from_status TEXT NOT NULL,
    to_status TEXT NOT NULL,
    transitioned_at INTEGER NOT NULL
)
"#;

/// Index backing the readiness query.
pub const CREATE_READY_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_content_jobs_status_schedule
    ON content_jobs(status, schedule_time)
"#;

/// Index for per-job transition lookups.
pub const CREATE_TRANSITIONS_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_job_transitions_job_id
    ON job_transitions(job_id)
"#;

/// Returns all schema creation statements in the correct order.
pub fn all_schema_statements() -> Vec<&'static str> {
    vec![
        CREATE_CONTENT_JOBS_TABLE,
        CREATE_JOB_TRANSITIONS_TABLE,
        CREATE_READY_INDEX,
        CREATE_TRANSITIONS_INDEX,
    ]
}

/// Table names in the schema.
pub mod tables {
    /// Content jobs table name.
    pub const CONTENT_JOBS: &str = "content_jobs";
    /// Transition log table name.
    pub const JOB_TRANSITIONS: &str = "job_transitions";
}
