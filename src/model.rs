//! Core data model.
//!
//! A job is one logical request ("generate 50 topics"). It is split into
//! subtasks (queue items), each of which is retried and resolved on its own.
//! The job's terminal status is derived from its subtasks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// A parent job row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,

    /// Discriminator that selects the work function and policies
    /// (e.g., "topic", "article").
    pub job_type: String,

    pub status: JobStatus,

    /// Job-type-specific data. The engine doesn't interpret it.
    pub payload: serde_json::Value,

    /// When a subtask of this job was last claimed.
    pub last_processed_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Newtype for job IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub i64);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Job Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created, no subtask claimed yet.
    Pending,
    /// At least one subtask has been claimed.
    Processing,
    /// Reserved for job producers that drive their own loop.
    Running,
    /// Held by an operator. Not dispatchable.
    Paused,
    /// Settled, every subtask completed. Terminal.
    Completed,
    /// Settled, at least one subtask failed. Terminal.
    Failed,
    /// Stopped by an operator. Terminal.
    Cancelled,
}

impl JobStatus {
    /// Is this a terminal status?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// May the executor claim subtasks of a job in this status?
    pub fn is_dispatchable(self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Processing)
    }

    /// Operator transitions (pause, resume, cancel).
    pub fn can_transition_to(self, to: JobStatus) -> bool {
        use JobStatus::*;
        match (self, to) {
            (Pending | Processing | Running, Paused) => true,
            (Paused, Pending) => true,
            (from, Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "running" => Ok(JobStatus::Running),
            "paused" => Ok(JobStatus::Paused),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(Error::Other(format!("unknown job status: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Queue Item
// ---------------------------------------------------------------------------

/// One subtask of a job. Keyed by `(job_type, job_id, subtask_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub job_type: String,
    /// Not an ownership link: the row may outlive its job.
    pub job_id: JobId,
    /// Unique within a job.
    pub subtask_id: String,
    pub status: SubtaskStatus,
    pub error_message: Option<String>,
    /// Number of times this subtask has been claimed.
    pub attempts: u32,
    /// Token of the attempt currently holding the subtask.
    pub lease_token: Option<String>,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Lifecycle status of a subtask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl SubtaskStatus {
    /// Completed or failed.
    pub fn is_resolved(self) -> bool {
        matches!(self, SubtaskStatus::Completed | SubtaskStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SubtaskStatus::Pending => "pending",
            SubtaskStatus::Processing => "processing",
            SubtaskStatus::Completed => "completed",
            SubtaskStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for SubtaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SubtaskStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SubtaskStatus::Pending),
            "processing" => Ok(SubtaskStatus::Processing),
            "completed" => Ok(SubtaskStatus::Completed),
            "failed" => Ok(SubtaskStatus::Failed),
            other => Err(Error::Other(format!("unknown subtask status: {other}"))),
        }
    }
}

/// Subtask counts for one job, by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
}

impl StatusCounts {
    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.completed + self.failed
    }

    pub fn resolved(&self) -> u64 {
        self.completed + self.failed
    }

    pub(crate) fn add(&mut self, status: SubtaskStatus, n: u64) {
        match status {
            SubtaskStatus::Pending => self.pending += n,
            SubtaskStatus::Processing => self.processing += n,
            SubtaskStatus::Completed => self.completed += n,
            SubtaskStatus::Failed => self.failed += n,
        }
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for a new job and its subtasks. Used by job producers.
pub struct NewJob {
    pub(crate) job_type: String,
    pub(crate) payload: serde_json::Value,
    pub(crate) subtasks: Vec<NewSubtask>,
}

pub(crate) struct NewSubtask {
    pub(crate) subtask_id: String,
    pub(crate) payload: serde_json::Value,
}

impl NewJob {
    pub fn new(job_type: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
            payload: serde_json::Value::Null,
            subtasks: Vec::new(),
        }
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn subtask(self, subtask_id: impl Into<String>) -> Self {
        self.subtask_with(subtask_id, serde_json::Value::Null)
    }

    pub fn subtask_with(mut self, subtask_id: impl Into<String>, payload: serde_json::Value) -> Self {
        self.subtasks.push(NewSubtask {
            subtask_id: subtask_id.into(),
            payload,
        });
        self
    }

    /// Add `n` subtasks with ids "1" through "n".
    pub fn numbered_subtasks(mut self, n: usize) -> Self {
        for i in 1..=n {
            self = self.subtask(i.to_string());
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings_round_trip() {
        for status in [
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::Running,
            JobStatus::Paused,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            assert_eq!(status.to_string().parse::<JobStatus>().unwrap(), status);
        }
        assert!("archived".parse::<JobStatus>().is_err());
        assert!("done".parse::<SubtaskStatus>().is_err());
    }

    #[test]
    fn only_pending_and_processing_are_dispatchable() {
        assert!(JobStatus::Pending.is_dispatchable());
        assert!(JobStatus::Processing.is_dispatchable());
        assert!(!JobStatus::Paused.is_dispatchable());
        assert!(!JobStatus::Running.is_dispatchable());
        assert!(!JobStatus::Cancelled.is_dispatchable());
    }

    #[test]
    fn terminal_jobs_cannot_be_cancelled_or_paused() {
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Cancelled));
        assert!(!JobStatus::Failed.can_transition_to(JobStatus::Paused));
        assert!(JobStatus::Processing.can_transition_to(JobStatus::Cancelled));
        assert!(JobStatus::Paused.can_transition_to(JobStatus::Pending));
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Completed));
    }
}
