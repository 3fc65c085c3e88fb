//! SQLite job store.
//!
//! This module provides the durable [`JobStore`] used by the binary. Records
//! live in the `content_jobs` table and every status change is appended to
//! `job_transitions` inside the same transaction that writes it.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};

use crate::error::StoreError;
use crate::scheduler::job::{ContentJob, JobId, JobMetadata, JobStatus, NewContentJob};
use crate::scheduler::lifecycle::{LifecycleManager, TransitionRecord};

use super::migrations::MigrationRunner;
use super::store::JobStore;

const JOB_COLUMNS: &str = "id, title, description, category, expected_duration_seconds, \
     schedule_time, status, metadata, created_at, updated_at";

/// Job store backed by a SQLite database.
pub struct SqliteJobStore {
    pool: SqlitePool,
    lifecycle: LifecycleManager,
}

impl SqliteJobStore {
    /// Connects to the database and returns a new store.
    ///
    /// # Arguments
    ///
    /// * `database_url` - SQLite connection string (e.g., "sqlite://contentforge.db?mode=rwc")
    ///
    /// The database file is created if it does not exist. Call
    /// [`SqliteJobStore::run_migrations`] before use.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| StoreError::Unavailable(format!("invalid database url: {}", e)))?
            .create_if_missing(true)
            .foreign_keys(true);

        // An in-memory database exists per connection, so it must keep exactly one.
        let in_memory = database_url.contains(":memory:");
        let mut pool_options = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 5 })
            .min_connections(1)
            .acquire_timeout(Duration::from_secs(30));
        if in_memory {
            pool_options = pool_options.idle_timeout(None).max_lifetime(None);
        }

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        Ok(Self::from_pool(pool))
    }

    /// Creates a new store from an existing pool.
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            lifecycle: LifecycleManager::new(),
        }
    }

    /// Returns a reference to the connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Runs database migrations.
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        MigrationRunner::new(self.pool.clone())
            .run_migrations()
            .await
            .map_err(|e| StoreError::Migration(e.to_string()))?;
        Ok(())
    }

    /// Returns the recorded status changes of a job, oldest first.
    pub async fn history(&self, id: JobId) -> Result<Vec<TransitionRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, job_id, from_status, to_status, transitioned_at
            FROM job_transitions
            WHERE job_id = ?
            ORDER BY id
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<TransitionRecord, StoreError> {
                Ok(TransitionRecord {
                    job_id: row.try_get("job_id")?,
                    from: parse_status(row.try_get("from_status")?)?,
                    to: parse_status(row.try_get("to_status")?)?,
                    at: from_millis(row.try_get("transitioned_at")?)?,
                    sequence: row.try_get::<i64, _>("id")? as u64,
                })
            })
            .collect()
    }

    /// Maps a database row to a job.
    fn row_to_job(row: &SqliteRow) -> Result<ContentJob, StoreError> {
        let metadata_text: String = row.try_get("metadata")?;
        let metadata: JobMetadata = serde_json::from_str(&metadata_text)?;
        let expected: i64 = row.try_get("expected_duration_seconds")?;

        Ok(ContentJob {
            id: row.try_get("id")?,
            title: row.try_get("title")?,
            description: row.try_get("description")?,
            category: row.try_get("category")?,
            expected_duration_seconds: u32::try_from(expected).map_err(|_| {
                StoreError::InvalidRecord(format!("expected_duration_seconds out of range: {}", expected))
            })?,
            schedule_time: from_millis(row.try_get("schedule_time")?)?,
            status: parse_status(row.try_get("status")?)?,
            metadata,
            created_at: from_millis(row.try_get("created_at")?)?,
            updated_at: from_millis(row.try_get("updated_at")?)?,
        })
    }
}

fn ensure_found(id: JobId, rows_affected: u64) -> Result<(), StoreError> {
    if rows_affected == 0 {
        return Err(StoreError::NotFound(id));
    }
    Ok(())
}

fn parse_status(raw: String) -> Result<JobStatus, StoreError> {
    raw.parse::<JobStatus>()
        .map_err(|e| StoreError::InvalidRecord(e.to_string()))
}

fn from_millis(millis: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .ok_or_else(|| StoreError::InvalidRecord(format!("timestamp out of range: {}", millis)))
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn create(&self, job: NewContentJob) -> Result<ContentJob, StoreError> {
        let now = Utc::now();
        let metadata_text = serde_json::to_string(&job.metadata)?;

        let result = sqlx::query(
            r#"
            INSERT INTO content_jobs (
                title, description, category, expected_duration_seconds,
                schedule_time, status, metadata, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.title)
        .bind(&job.description)
        .bind(&job.category)
        .bind(job.expected_duration_seconds as i64)
        .bind(job.schedule_time.timestamp_millis())
        .bind(JobStatus::Pending.as_str())
        .bind(&metadata_text)
        .bind(now.timestamp_millis())
        .bind(now.timestamp_millis())
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        tracing::debug!(job_id = id, title = %job.title, "Created content job");

        // Reload so that stored precision (milliseconds) is what callers see.
        self.get(id).await
    }

    async fn get_by_id(&self, id: JobId) -> Result<Option<ContentJob>, StoreError> {
        let row = sqlx::query(&format!("SELECT {} FROM content_jobs WHERE id = ?", JOB_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_job).transpose()
    }

    async fn list_ready(&self, now: DateTime<Utc>) -> Result<Vec<ContentJob>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM content_jobs WHERE status = ? AND schedule_time <= ? \
             ORDER BY schedule_time, id",
            JOB_COLUMNS
        ))
        .bind(JobStatus::Pending.as_str())
        .bind(now.timestamp_millis())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_job).collect()
    }

    async fn list(&self, status: Option<JobStatus>) -> Result<Vec<ContentJob>, StoreError> {
        let rows = match status {
            Some(status) => {
                sqlx::query(&format!(
                    "SELECT {} FROM content_jobs WHERE status = ? ORDER BY id",
                    JOB_COLUMNS
                ))
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!("SELECT {} FROM content_jobs ORDER BY id", JOB_COLUMNS))
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        rows.iter().map(Self::row_to_job).collect()
    }

    async fn set_status(&self, id: JobId, status: JobStatus) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        let current: Option<(String,)> =
            sqlx::query_as("SELECT status FROM content_jobs WHERE id = ?")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;
        let from = match current {
            Some((raw,)) => parse_status(raw)?,
            None => return Err(StoreError::NotFound(id)),
        };
        self.lifecycle.check(id, from, status)?;

        let now = Utc::now().timestamp_millis();
        // Guarding on the old status keeps a concurrent writer from being overwritten.
        let result = sqlx::query(
            "UPDATE content_jobs SET status = ?, updated_at = ? WHERE id = ? AND status = ?",
        )
        .bind(status.as_str())
        .bind(now)
        .bind(id)
        .bind(from.as_str())
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Unavailable(format!(
                "job {} changed status concurrently",
                id
            )));
        }

        sqlx::query(
            r#"
            INSERT INTO job_transitions (job_id, from_status, to_status, transitioned_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(id)
        .bind(from.as_str())
        .bind(status.as_str())
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn set_metadata(&self, id: JobId, metadata: JobMetadata) -> Result<(), StoreError> {
        let metadata_text = serde_json::to_string(&metadata)?;
        let result = sqlx::query(
            "UPDATE content_jobs SET metadata = ?, updated_at = ? \
             WHERE id = ? AND status NOT IN (?, ?, ?)",
        )
        .bind(&metadata_text)
        .bind(Utc::now().timestamp_millis())
        .bind(id)
        .bind(JobStatus::Completed.as_str())
        .bind(JobStatus::Failed.as_str())
        .bind(JobStatus::Cancelled.as_str())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() > 0 {
            return Ok(());
        }

        match self.get_by_id(id).await? {
            Some(job) if job.status.is_terminal() => Err(StoreError::Finished(id, job.status)),
            Some(_) => Err(StoreError::Unavailable(format!(
                "job {} changed status concurrently",
                id
            ))),
            None => Err(StoreError::NotFound(id)),
        }
    }

    async fn reschedule(&self, id: JobId, at: DateTime<Utc>) -> Result<(), StoreError> {
        let result =
            sqlx::query("UPDATE content_jobs SET schedule_time = ?, updated_at = ? WHERE id = ?")
                .bind(at.timestamp_millis())
                .bind(Utc::now().timestamp_millis())
                .bind(id)
                .execute(&self.pool)
                .await?;

        ensure_found(id, result.rows_affected())
    }
}
