//! Job finalization: derive the parent job's terminal status from its
//! subtasks.
//!
//! The rule only looks at the final multiset of subtask statuses, so it is
//! order-independent, and it never rewrites a terminal job, so running it
//! again is a no-op.

use chrono::Utc;
use opentelemetry::KeyValue;
use serde::Serialize;

use crate::db::{Db, jobs, queue, to_millis};
use crate::error::Result;
use crate::model::{JobId, JobStatus, StatusCounts};
use crate::telemetry::metrics;

/// Status a job settles into, or `None` while subtasks are outstanding.
///
/// Any failed subtask fails the whole job once everything has resolved.
pub fn settled_status(counts: &StatusCounts) -> Option<JobStatus> {
    if counts.resolved() < counts.total() {
        return None;
    }
    if counts.failed > 0 {
        Some(JobStatus::Failed)
    } else {
        Some(JobStatus::Completed)
    }
}

/// What a finalization pass saw and did.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Finalization {
    pub counts: StatusCounts,
    /// Derived status if the job is settled.
    pub settled: Option<JobStatus>,
    /// Whether this pass wrote the job row.
    pub changed: bool,
}

impl Db {
    /// Count the job's subtasks and, if settled, write the terminal status.
    /// Safe to call after every subtask outcome.
    pub async fn finalize_job(&self, job_type: &str, job_id: JobId) -> Result<Finalization> {
        let mut tx = self.pool().begin().await?;

        let counts = queue::count_by_status_on(&mut tx, job_type, job_id).await?;
        let settled = settled_status(&counts);
        let changed = match settled {
            Some(status) => {
                jobs::settle_job_on(&mut tx, job_id, status, to_millis(Utc::now())).await?
            }
            None => false,
        };

        tx.commit().await?;

        if let (Some(status), true) = (settled, changed) {
            tracing::info!(
                job_type,
                job_id = %job_id,
                %status,
                completed = counts.completed,
                failed = counts.failed,
                "job settled"
            );
            metrics::jobs_settled().add(
                1,
                &[
                    KeyValue::new("job_type", job_type.to_string()),
                    KeyValue::new("status", status.to_string()),
                ],
            );
        }

        Ok(Finalization {
            counts,
            settled,
            changed,
        })
    }
}
