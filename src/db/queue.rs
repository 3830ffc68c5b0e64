//! Queue store: subtask rows keyed by `(job_type, job_id, subtask_id)`.
//!
//! Every write that ends an attempt is guarded by the attempt's lease token,
//! so a worker whose subtask was reclaimed or taken over can't overwrite the
//! newer attempt's state.

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;

use super::{from_millis, parse_payload, to_millis};
use crate::error::Result;
use crate::model::*;

/// A processing subtask and how long it has been since it was last touched.
#[derive(Debug, Clone)]
pub struct ProcessingItem {
    pub item: QueueItem,
    pub elapsed_secs: i64,
}

impl super::Db {
    /// Look up one subtask. `None` if it doesn't exist.
    pub async fn find_subtask(
        &self,
        job_type: &str,
        job_id: JobId,
        subtask_id: &str,
    ) -> Result<Option<QueueItem>> {
        let mut conn = self.pool.acquire().await?;
        find_subtask_on(&mut conn, job_type, job_id, subtask_id).await
    }

    /// All subtasks of a job, ordered by subtask id.
    pub async fn list_subtasks(&self, job_type: &str, job_id: JobId) -> Result<Vec<QueueItem>> {
        let rows: Vec<QueueItemRow> = sqlx::query_as(
            "SELECT job_type, job_id, subtask_id, status, error_message, attempts, lease_token, payload, created_at, updated_at
             FROM queue_items WHERE job_type = ?1 AND job_id = ?2
             ORDER BY subtask_id ASC",
        )
        .bind(job_type)
        .bind(job_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(QueueItemRow::try_into_item).collect()
    }

    /// Subtask counts for a job, by status.
    pub async fn subtask_counts(&self, job_type: &str, job_id: JobId) -> Result<StatusCounts> {
        let mut conn = self.pool.acquire().await?;
        count_by_status_on(&mut conn, job_type, job_id).await
    }

    /// Processing subtasks of a job type whose `updated_at` is before `cutoff`.
    pub async fn find_stale_processing(
        &self,
        job_type: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<QueueItem>> {
        let rows: Vec<QueueItemRow> = sqlx::query_as(
            "SELECT job_type, job_id, subtask_id, status, error_message, attempts, lease_token, payload, created_at, updated_at
             FROM queue_items
             WHERE job_type = ?1 AND status = 'processing' AND updated_at < ?2
             ORDER BY updated_at ASC",
        )
        .bind(job_type)
        .bind(to_millis(cutoff))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(QueueItemRow::try_into_item).collect()
    }

    /// Every processing subtask of a job type, oldest first, with elapsed
    /// seconds since its last update.
    pub async fn processing_items(&self, job_type: &str) -> Result<Vec<ProcessingItem>> {
        let rows: Vec<QueueItemRow> = sqlx::query_as(
            "SELECT job_type, job_id, subtask_id, status, error_message, attempts, lease_token, payload, created_at, updated_at
             FROM queue_items
             WHERE job_type = ?1 AND status = 'processing'
             ORDER BY updated_at ASC",
        )
        .bind(job_type)
        .fetch_all(&self.pool)
        .await?;

        let now = Utc::now();
        rows.into_iter()
            .map(|row| {
                let item = row.try_into_item()?;
                let elapsed_secs = (now - item.updated_at).num_seconds();
                Ok(ProcessingItem { item, elapsed_secs })
            })
            .collect()
    }

    /// Number of other subtasks of the same job holding a processing lease
    /// refreshed after `fresh_after`.
    pub async fn count_in_flight_siblings(
        &self,
        job_type: &str,
        job_id: JobId,
        subtask_id: &str,
        fresh_after: DateTime<Utc>,
    ) -> Result<u64> {
        let n: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM queue_items
             WHERE job_type = ?1 AND job_id = ?2 AND subtask_id != ?3
               AND status = 'processing' AND updated_at >= ?4",
        )
        .bind(job_type)
        .bind(job_id.0)
        .bind(subtask_id)
        .bind(to_millis(fresh_after))
        .fetch_one(&self.pool)
        .await?;
        Ok(n as u64)
    }

    /// Put a stale processing subtask back to `pending`. Only succeeds if the
    /// row still carries the lease token and staleness that were observed.
    pub async fn requeue_stale(&self, item: &QueueItem, cutoff: DateTime<Utc>) -> Result<bool> {
        let rows = sqlx::query(
            "UPDATE queue_items SET status = 'pending', lease_token = NULL, updated_at = ?1
             WHERE job_type = ?2 AND job_id = ?3 AND subtask_id = ?4
               AND status = 'processing' AND lease_token IS ?5 AND updated_at < ?6",
        )
        .bind(to_millis(Utc::now()))
        .bind(&item.job_type)
        .bind(item.job_id.0)
        .bind(&item.subtask_id)
        .bind(&item.lease_token)
        .bind(to_millis(cutoff))
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(rows > 0)
    }

    /// Fail a stale processing subtask whose retry budget is spent. Same
    /// guard as [`requeue_stale`](Self::requeue_stale).
    pub async fn fail_stale(
        &self,
        item: &QueueItem,
        cutoff: DateTime<Utc>,
        message: &str,
    ) -> Result<bool> {
        let rows = sqlx::query(
            "UPDATE queue_items SET status = 'failed', lease_token = NULL, error_message = ?1, updated_at = ?2
             WHERE job_type = ?3 AND job_id = ?4 AND subtask_id = ?5
               AND status = 'processing' AND lease_token IS ?6 AND updated_at < ?7",
        )
        .bind(message)
        .bind(to_millis(Utc::now()))
        .bind(&item.job_type)
        .bind(item.job_id.0)
        .bind(&item.subtask_id)
        .bind(&item.lease_token)
        .bind(to_millis(cutoff))
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(rows > 0)
    }

    /// Delete queue items whose job row (same id and type) no longer exists.
    pub async fn delete_orphaned_queue_items(&self) -> Result<u64> {
        let rows = sqlx::query(
            "DELETE FROM queue_items
             WHERE NOT EXISTS (
                 SELECT 1 FROM jobs
                 WHERE jobs.id = queue_items.job_id AND jobs.job_type = queue_items.job_type
             )",
        )
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(rows)
    }
}

// ---------------------------------------------------------------------------
// Inner functions
// ---------------------------------------------------------------------------

pub(crate) async fn find_subtask_on(
    conn: &mut SqliteConnection,
    job_type: &str,
    job_id: JobId,
    subtask_id: &str,
) -> Result<Option<QueueItem>> {
    let row: Option<QueueItemRow> = sqlx::query_as(
        "SELECT job_type, job_id, subtask_id, status, error_message, attempts, lease_token, payload, created_at, updated_at
         FROM queue_items WHERE job_type = ?1 AND job_id = ?2 AND subtask_id = ?3",
    )
    .bind(job_type)
    .bind(job_id.0)
    .bind(subtask_id)
    .fetch_optional(&mut *conn)
    .await?;

    row.map(QueueItemRow::try_into_item).transpose()
}

pub(crate) async fn count_by_status_on(
    conn: &mut SqliteConnection,
    job_type: &str,
    job_id: JobId,
) -> Result<StatusCounts> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT status, COUNT(*) FROM queue_items
         WHERE job_type = ?1 AND job_id = ?2
         GROUP BY status",
    )
    .bind(job_type)
    .bind(job_id.0)
    .fetch_all(&mut *conn)
    .await?;

    let mut counts = StatusCounts::default();
    for (status, n) in rows {
        counts.add(status.parse()?, n as u64);
    }
    Ok(counts)
}

/// Claim a subtask for one attempt: pending, or processing with a lease
/// older than `stale_cutoff`. Returns false if another worker holds it.
///
/// With `single_flight`, the claim also fails while a sibling of the same
/// job holds a lease newer than `stale_cutoff`. Check and claim are one
/// statement, so two siblings can't both win.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn claim_subtask_on(
    conn: &mut SqliteConnection,
    job_type: &str,
    job_id: JobId,
    subtask_id: &str,
    lease_token: &str,
    now: i64,
    stale_cutoff: i64,
    single_flight: bool,
) -> Result<bool> {
    let rows = sqlx::query(
        "UPDATE queue_items
         SET status = 'processing', attempts = attempts + 1, lease_token = ?1, updated_at = ?2
         WHERE job_type = ?3 AND job_id = ?4 AND subtask_id = ?5
           AND (status = 'pending' OR (status = 'processing' AND updated_at < ?6))
           AND (?7 = 0 OR NOT EXISTS (
               SELECT 1 FROM queue_items s
               WHERE s.job_type = ?3 AND s.job_id = ?4 AND s.subtask_id != ?5
                 AND s.status = 'processing' AND s.updated_at >= ?6
           ))",
    )
    .bind(lease_token)
    .bind(now)
    .bind(job_type)
    .bind(job_id.0)
    .bind(subtask_id)
    .bind(stale_cutoff)
    .bind(single_flight)
    .execute(&mut *conn)
    .await?
    .rows_affected();
    Ok(rows > 0)
}

/// Whether a subtask could be claimed at `stale_cutoff`, ignoring siblings.
pub(crate) fn is_claimable(item: &QueueItem, stale_cutoff: DateTime<Utc>) -> bool {
    match item.status {
        SubtaskStatus::Pending => true,
        SubtaskStatus::Processing => item.updated_at < stale_cutoff,
        SubtaskStatus::Completed | SubtaskStatus::Failed => false,
    }
}

/// Resolve a claimed subtask. Returns false if the lease was lost.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn resolve_subtask_on(
    conn: &mut SqliteConnection,
    job_type: &str,
    job_id: JobId,
    subtask_id: &str,
    lease_token: &str,
    status: SubtaskStatus,
    error_message: Option<&str>,
    now: i64,
) -> Result<bool> {
    let rows = sqlx::query(
        "UPDATE queue_items
         SET status = ?1, error_message = ?2, lease_token = NULL, updated_at = ?3
         WHERE job_type = ?4 AND job_id = ?5 AND subtask_id = ?6
           AND status = 'processing' AND lease_token = ?7",
    )
    .bind(status.as_str())
    .bind(error_message)
    .bind(now)
    .bind(job_type)
    .bind(job_id.0)
    .bind(subtask_id)
    .bind(lease_token)
    .execute(&mut *conn)
    .await?
    .rows_affected();
    Ok(rows > 0)
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct QueueItemRow {
    job_type: String,
    job_id: i64,
    subtask_id: String,
    status: String,
    error_message: Option<String>,
    attempts: i64,
    lease_token: Option<String>,
    payload: String,
    created_at: i64,
    updated_at: i64,
}

impl QueueItemRow {
    fn try_into_item(self) -> Result<QueueItem> {
        Ok(QueueItem {
            job_type: self.job_type,
            job_id: JobId(self.job_id),
            subtask_id: self.subtask_id,
            status: self.status.parse()?,
            error_message: self.error_message,
            attempts: self.attempts as u32,
            lease_token: self.lease_token,
            payload: parse_payload(&self.payload),
            created_at: from_millis(self.created_at)?,
            updated_at: from_millis(self.updated_at)?,
        })
    }
}
