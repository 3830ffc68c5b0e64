//! Job store: creating jobs, reading them back, operator transitions.

use chrono::Utc;
use sqlx::SqliteConnection;

use super::{from_millis, parse_payload, to_millis};
use crate::error::{Error, Result};
use crate::model::*;
use crate::telemetry::metrics;
use opentelemetry::KeyValue;

impl super::Db {
    /// Create a job in `pending` together with all of its subtasks.
    pub async fn create_job(&self, new: NewJob) -> Result<Job> {
        let now = to_millis(Utc::now());
        let mut tx = self.pool.begin().await?;

        let id: i64 = sqlx::query_scalar(
            "INSERT INTO jobs (job_type, status, payload, created_at, updated_at)
             VALUES (?1, 'pending', ?2, ?3, ?3)
             RETURNING id",
        )
        .bind(&new.job_type)
        .bind(new.payload.to_string())
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        for subtask in &new.subtasks {
            sqlx::query(
                "INSERT INTO queue_items (job_type, job_id, subtask_id, status, payload, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 'pending', ?4, ?5, ?5)",
            )
            .bind(&new.job_type)
            .bind(id)
            .bind(&subtask.subtask_id)
            .bind(subtask.payload.to_string())
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        let job = find_job_on(&mut tx, JobId(id))
            .await?
            .ok_or_else(|| Error::NotFound(format!("job {id}")))?;
        tx.commit().await?;

        metrics::jobs_created().add(1, &[KeyValue::new("job_type", new.job_type)]);
        Ok(job)
    }

    /// Look up a job. `None` if it doesn't exist.
    pub async fn find_job(&self, id: JobId) -> Result<Option<Job>> {
        let mut conn = self.pool.acquire().await?;
        find_job_on(&mut conn, id).await
    }

    /// Get a job by ID.
    pub async fn get_job(&self, id: JobId) -> Result<Job> {
        self.find_job(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("job {id}")))
    }

    /// Hold a job so no further subtasks are dispatched.
    pub async fn pause_job(&self, id: JobId) -> Result<Job> {
        self.transition_job(id, JobStatus::Paused).await
    }

    /// Release a paused job back to `pending`.
    pub async fn resume_job(&self, id: JobId) -> Result<Job> {
        self.transition_job(id, JobStatus::Pending).await
    }

    /// Cancel a job. Subtasks already in flight finish, but the job stays
    /// cancelled and is never finalized.
    pub async fn cancel_job(&self, id: JobId) -> Result<Job> {
        self.transition_job(id, JobStatus::Cancelled).await
    }

    /// Physically delete a job row. Its queue items become orphans.
    pub async fn delete_job(&self, id: JobId) -> Result<bool> {
        let rows = sqlx::query("DELETE FROM jobs WHERE id = ?1")
            .bind(id.0)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(rows > 0)
    }

    /// Operator transition with optimistic concurrency on the current status.
    async fn transition_job(&self, id: JobId, to: JobStatus) -> Result<Job> {
        let from = self.get_job(id).await?.status;
        if !from.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        let rows = sqlx::query("UPDATE jobs SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4")
            .bind(to.as_str())
            .bind(to_millis(Utc::now()))
            .bind(id.0)
            .bind(from.as_str())
            .execute(&self.pool)
            .await?
            .rows_affected();

        if rows == 0 {
            return Err(Error::InvalidTransition {
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        tracing::info!(job_id = %id, %from, %to, "job transitioned");
        self.get_job(id).await
    }
}

// ---------------------------------------------------------------------------
// Inner functions. These take a connection so they run the same inside or
// outside a transaction.
// ---------------------------------------------------------------------------

pub(crate) async fn find_job_on(conn: &mut SqliteConnection, id: JobId) -> Result<Option<Job>> {
    let row: Option<JobRow> = sqlx::query_as(
        "SELECT id, job_type, status, payload, last_processed_at, created_at, updated_at
         FROM jobs WHERE id = ?1",
    )
    .bind(id.0)
    .fetch_optional(&mut *conn)
    .await?;

    row.map(JobRow::try_into_job).transpose()
}

/// Move a dispatchable job to `processing` and stamp `last_processed_at`.
/// Returns false if the job is gone or no longer dispatchable.
pub(crate) async fn mark_job_processing_on(
    conn: &mut SqliteConnection,
    id: JobId,
    now: i64,
) -> Result<bool> {
    let rows = sqlx::query(
        "UPDATE jobs SET status = 'processing', last_processed_at = ?1, updated_at = ?1
         WHERE id = ?2 AND status IN ('pending', 'processing')",
    )
    .bind(now)
    .bind(id.0)
    .execute(&mut *conn)
    .await?
    .rows_affected();
    Ok(rows > 0)
}

/// Write a settled status unless the job is already terminal.
/// Returns whether the row changed.
pub(crate) async fn settle_job_on(
    conn: &mut SqliteConnection,
    id: JobId,
    status: JobStatus,
    now: i64,
) -> Result<bool> {
    let rows = sqlx::query(
        "UPDATE jobs SET status = ?1, updated_at = ?2
         WHERE id = ?3 AND status NOT IN ('completed', 'failed', 'cancelled')",
    )
    .bind(status.as_str())
    .bind(now)
    .bind(id.0)
    .execute(&mut *conn)
    .await?
    .rows_affected();
    Ok(rows > 0)
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct JobRow {
    id: i64,
    job_type: String,
    status: String,
    payload: String,
    last_processed_at: Option<i64>,
    created_at: i64,
    updated_at: i64,
}

impl JobRow {
    fn try_into_job(self) -> Result<Job> {
        Ok(Job {
            id: JobId(self.id),
            job_type: self.job_type,
            status: self.status.parse()?,
            payload: parse_payload(&self.payload),
            last_processed_at: self.last_processed_at.map(from_millis).transpose()?,
            created_at: from_millis(self.created_at)?,
            updated_at: from_millis(self.updated_at)?,
        })
    }
}
