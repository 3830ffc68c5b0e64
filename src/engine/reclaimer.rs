//! Timeout reclaimer: recovers subtasks whose worker died mid-flight and
//! removes queue rows whose job is gone.
//!
//! A row is only touched if it is still `processing` with the lease token and
//! staleness observed by the scan, so a worker that finishes while the sweep
//! runs keeps its result. The threshold must exceed the job type's work
//! timeout (enforced by [`JobTypePolicy::validate`]).

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use opentelemetry::KeyValue;
use serde::Serialize;
use serde_json::json;
use tracing::Instrument;

use super::cutoff;
use crate::db::Db;
use crate::error::Result;
use crate::jobtype::{JobTypePolicy, JobTypeRegistry, TimeoutPolicy};
use crate::model::JobId;
use crate::telemetry::metrics;
use crate::telemetry::task::{log_error, log_success, log_warning, start_sweep_span};

/// Counts from one sweep. `processed` were put back to `pending`, `failed`
/// had no retry budget left; rows changed underneath the sweep are in
/// neither.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TimeoutReport {
    pub total_found: u64,
    pub processed: u64,
    pub failed: u64,
}

pub struct TimeoutReclaimer {
    db: Arc<Db>,
    policies: Vec<(String, TimeoutPolicy)>,
}

impl TimeoutReclaimer {
    /// Job types without a timeout policy are ignored.
    pub fn new(db: Arc<Db>, policies: &[JobTypePolicy]) -> Self {
        let policies = policies
            .iter()
            .filter_map(|p| p.timeout.clone().map(|t| (p.name.clone(), t)))
            .collect();
        Self { db, policies }
    }

    pub fn from_registry(db: Arc<Db>, registry: &JobTypeRegistry) -> Self {
        Self::new(db, &registry.policies())
    }

    /// Reset or fail every subtask stuck in `processing` past its job type's
    /// threshold, then finalize jobs that became settled.
    pub async fn handle_timeout_tasks(&self) -> Result<TimeoutReport> {
        self.sweep_timeouts()
            .instrument(start_sweep_span("handle_timeout_tasks"))
            .await
    }

    async fn sweep_timeouts(&self) -> Result<TimeoutReport> {
        let mut report = TimeoutReport::default();

        for (job_type, policy) in &self.policies {
            let stale_cutoff = cutoff(Utc::now(), policy.threshold());
            let stale = self.db.find_stale_processing(job_type, stale_cutoff).await?;
            report.total_found += stale.len() as u64;

            let mut to_finalize: BTreeSet<JobId> = BTreeSet::new();

            for item in &stale {
                let context = json!({
                    "job_type": job_type,
                    "job_id": item.job_id.0,
                    "subtask_id": item.subtask_id,
                    "attempts": item.attempts,
                });

                let retry = item.attempts < policy.max_attempts;
                let changed = if retry {
                    self.db.requeue_stale(item, stale_cutoff).await
                } else {
                    let message = format!(
                        "processing timed out after {} attempt(s)",
                        item.attempts
                    );
                    self.db.fail_stale(item, stale_cutoff, &message).await
                };

                let result = match changed {
                    Ok(true) if retry => {
                        report.processed += 1;
                        log_warning("TimeoutRequeued", "stale subtask reset to pending", &context);
                        "requeued"
                    }
                    Ok(true) => {
                        report.failed += 1;
                        to_finalize.insert(item.job_id);
                        log_warning("TimeoutFailed", "stale subtask out of attempts", &context);
                        "failed"
                    }
                    Ok(false) => "skipped",
                    Err(e) => {
                        log_error("TimeoutReclaimError", &e.to_string(), &context);
                        "error"
                    }
                };

                metrics::subtasks_reclaimed().add(
                    1,
                    &[
                        KeyValue::new("job_type", job_type.clone()),
                        KeyValue::new("result", result),
                    ],
                );
            }

            for job_id in to_finalize {
                if let Err(e) = self.db.finalize_job(job_type, job_id).await {
                    log_error(
                        "FinalizeError",
                        &e.to_string(),
                        &json!({ "job_type": job_type, "job_id": job_id.0 }),
                    );
                }
            }
        }

        if report.total_found > 0 {
            log_success(
                "TimeoutSweep",
                "timeout sweep finished",
                &serde_json::to_value(report).unwrap_or_default(),
            );
        }
        Ok(report)
    }

    /// Delete queue items whose job no longer exists, across all job types.
    pub async fn cleanup_orphaned_queues(&self) -> Result<u64> {
        let deleted = self
            .db
            .delete_orphaned_queue_items()
            .instrument(start_sweep_span("cleanup_orphaned_queues"))
            .await?;

        if deleted > 0 {
            metrics::orphans_deleted().add(deleted, &[]);
            log_success(
                "OrphansDeleted",
                &format!("deleted {deleted} orphaned queue item(s)"),
                &json!({ "deleted": deleted }),
            );
        }
        Ok(deleted)
    }
}
