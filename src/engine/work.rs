//! Capabilities a job type plugs into the executor.

use async_trait::async_trait;
use serde::Serialize;
use sqlx::SqliteConnection;

use crate::model::{Job, JobId, StatusCounts};
use crate::telemetry::task::log_success;

/// Everything a work function gets to know about one attempt.
#[derive(Debug, Clone)]
pub struct WorkContext {
    pub job: Job,
    pub subtask_id: String,
    pub subtask_payload: serde_json::Value,
    /// 1 on the first claim.
    pub attempt: u32,
}

/// What a work function reports for one subtask.
///
/// `success = false` is an expected domain failure (quota exceeded, empty
/// generation). Faults are returned as `Err` instead.
#[derive(Debug, Clone, Serialize)]
pub struct WorkOutcome {
    pub success: bool,
    pub message: Option<String>,
    /// Result handed to [`WorkFunction::persist`].
    pub data: serde_json::Value,
}

impl WorkOutcome {
    pub fn success() -> Self {
        Self {
            success: true,
            message: None,
            data: serde_json::Value::Null,
        }
    }

    pub fn success_with(data: serde_json::Value) -> Self {
        Self {
            success: true,
            message: None,
            data,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            data: serde_json::Value::Null,
        }
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// The job-type-specific logic for one subtask.
#[async_trait]
pub trait WorkFunction: Send + Sync {
    /// Do the work (typically an external API call). Runs outside any
    /// storage transaction, under the job type's work timeout.
    async fn perform(&self, ctx: &WorkContext) -> anyhow::Result<WorkOutcome>;

    /// Write the domain result of a successful attempt. Runs inside the
    /// transaction that marks the subtask completed; an error rolls both
    /// back and fails the subtask.
    async fn persist(
        &self,
        _conn: &mut SqliteConnection,
        _ctx: &WorkContext,
        _outcome: &WorkOutcome,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/// How a subtask attempt ended, as seen by progress reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum SubtaskResult {
    Completed,
    Failed { message: String },
}

/// Progress notification after a subtask is resolved.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressUpdate {
    pub job_type: String,
    pub job_id: JobId,
    pub subtask_id: String,
    pub result: SubtaskResult,
    pub counts: StatusCounts,
}

/// Reports aggregate progress ("12 of 50 topics generated").
#[async_trait]
pub trait ProgressReporter: Send + Sync {
    async fn report(&self, update: &ProgressUpdate);
}

/// Default reporter: one log line per resolved subtask.
pub struct LogProgress;

#[async_trait]
impl ProgressReporter for LogProgress {
    async fn report(&self, update: &ProgressUpdate) {
        let message = format!(
            "{} of {} {} subtasks resolved for job {} ({} failed)",
            update.counts.resolved(),
            update.counts.total(),
            update.job_type,
            update.job_id,
            update.counts.failed,
        );
        log_success(
            "Progress",
            &message,
            &serde_json::to_value(update).unwrap_or_default(),
        );
    }
}
