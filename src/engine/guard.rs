//! Per-job-type concurrency guards.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::db::Db;
use crate::error::Result;
use crate::model::Job;

/// Answers "is another worker already legitimately occupying this job?".
#[async_trait]
pub trait ConcurrencyGuard: Send + Sync {
    /// Return false to skip this attempt.
    async fn allow(&self, db: &Db, job: &Job, subtask_id: &str) -> Result<bool>;
}

/// Default guard: subtasks of a job may run in parallel.
pub struct AllowAll;

#[async_trait]
impl ConcurrencyGuard for AllowAll {
    async fn allow(&self, _db: &Db, _job: &Job, _subtask_id: &str) -> Result<bool> {
        Ok(true)
    }
}

/// One in-flight subtask per job. A sibling whose processing lease is older
/// than `window` is presumed dead and doesn't block.
///
/// This is the early check; the claim repeats it atomically for policies
/// with `single_flight` set.
pub struct SingleFlightGuard {
    window: Duration,
}

impl SingleFlightGuard {
    pub fn new(window: Duration) -> Self {
        Self { window }
    }
}

#[async_trait]
impl ConcurrencyGuard for SingleFlightGuard {
    async fn allow(&self, db: &Db, job: &Job, subtask_id: &str) -> Result<bool> {
        let window = chrono::Duration::from_std(self.window).unwrap_or(chrono::Duration::MAX);
        let fresh_after = Utc::now()
            .checked_sub_signed(window)
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);
        let in_flight = db
            .count_in_flight_siblings(&job.job_type, job.id, subtask_id, fresh_after)
            .await?;
        Ok(in_flight == 0)
    }
}
