//! Task executor: drives one subtask attempt through the gate pipeline.
//!
//! ```text
//! process(job_id, subtask_id)
//!   1. load job, job type, subtask        JobNotFound / Unroutable / SubtaskNotFound
//!   2. processability + stale lock        NotProcessable
//!   3. concurrency guard                  ConcurrentSkip
//!   4. rate gate                          RateLimited
//!   5. claim lease + mark job processing  StatusUpdateFailed / NotProcessable /
//!                                         ConcurrentSkip (single flight)
//!   6. perform (no transaction)
//!        success  -> tx { persist, subtask completed } -> progress -> finalize
//!        failure  -> subtask failed -> progress -> finalize
//!        fault    -> log ProcessingException, then as failure
//! ```
//!
//! Gates 1-5 never start a transaction that survives a rejection, and gate
//! rejections are reported in the [`ProcessReport`], not as `Err`.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::FutureExt as _;
use opentelemetry::KeyValue;
use serde::Serialize;
use serde_json::json;
use tracing::{Instrument, Span};
use uuid::Uuid;

use super::cutoff;
use super::work::{ProgressUpdate, SubtaskResult, WorkContext, WorkOutcome};
use crate::db::rate_gate::RateDecision;
use crate::db::{Db, jobs, queue, to_millis};
use crate::error::Result;
use crate::jobtype::{JobType, JobTypeRegistry};
use crate::model::*;
use crate::telemetry::metrics;
use crate::telemetry::task::{
    log_error, log_success, log_warning, record_attempt, record_job_type, record_outcome,
    start_task_span,
};

/// Suggested wait before re-dispatching a subtask vetoed by its guard.
pub const CONCURRENT_SKIP_RETRY_AFTER: Duration = Duration::from_secs(30);

const UNKNOWN_ERROR: &str = "unknown error";

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

/// Why an attempt did not complete the subtask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FailureKind {
    JobNotFound,
    SubtaskNotFound,
    /// No job type registered under the job's `job_type`.
    Unroutable,
    /// Wrong job status, resolved subtask, or subtask in flight elsewhere.
    NotProcessable,
    ConcurrentSkip,
    RateLimited,
    StatusUpdateFailed,
    /// The work function errored, panicked, timed out, or failed to persist.
    ProcessingException,
    /// The work function reported `success = false`.
    WorkFailed,
    /// The attempt's lease was reclaimed or taken over before it finished.
    LeaseLost,
}

impl FailureKind {
    pub fn code(self) -> &'static str {
        match self {
            FailureKind::JobNotFound => "JobNotFound",
            FailureKind::SubtaskNotFound => "SubtaskNotFound",
            FailureKind::Unroutable => "Unroutable",
            FailureKind::NotProcessable => "NotProcessable",
            FailureKind::ConcurrentSkip => "ConcurrentSkip",
            FailureKind::RateLimited => "RateLimited",
            FailureKind::StatusUpdateFailed => "StatusUpdateFailed",
            FailureKind::ProcessingException => "ProcessingException",
            FailureKind::WorkFailed => "WorkFailed",
            FailureKind::LeaseLost => "LeaseLost",
        }
    }

    /// Rejections that left the subtask untouched and may simply be
    /// dispatched again after `retry_after`. They don't use up an attempt.
    pub fn is_deferral(self) -> bool {
        matches!(self, FailureKind::ConcurrentSkip | FailureKind::RateLimited)
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// Result of [`TaskExecutor::process`].
#[derive(Debug, Clone, Serialize)]
pub struct ProcessReport {
    pub success: bool,
    pub message: String,
    pub failure: Option<FailureKind>,
    /// Earliest sensible re-dispatch for deferrals.
    pub retry_after: Option<Duration>,
    /// Job status written by finalization, if this attempt settled the job.
    pub settled: Option<JobStatus>,
}

impl ProcessReport {
    fn completed(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            failure: None,
            retry_after: None,
            settled: None,
        }
    }

    fn failed(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            failure: Some(kind),
            retry_after: None,
            settled: None,
        }
    }

    fn retry_after(mut self, wait: Duration) -> Self {
        self.retry_after = Some(wait);
        self
    }

    fn settled(mut self, status: Option<JobStatus>) -> Self {
        self.settled = status;
        self
    }

    fn outcome_code(&self) -> &'static str {
        self.failure.map_or("completed", FailureKind::code)
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// Processes one subtask at a time on behalf of an external scheduler.
///
/// Holds no per-job state: every call re-reads the rows it needs, so any
/// number of executors in any number of processes can share one database.
#[derive(Clone)]
pub struct TaskExecutor {
    db: Arc<Db>,
    registry: Arc<JobTypeRegistry>,
}

/// How the claim transaction ended.
enum Claim {
    Claimed(QueueItem),
    /// Another worker holds or already resolved the subtask.
    Taken,
    /// Single flight: a sibling subtask won the job first.
    SiblingInFlight,
    /// The job left a dispatchable status after gate 2.
    JobHeld(JobStatus),
}

/// The claimed attempt, threaded through execution and bookkeeping.
struct Attempt<'a> {
    job_type: &'a JobType,
    ctx: WorkContext,
    lease_token: String,
}

impl TaskExecutor {
    pub fn new(db: Arc<Db>, registry: Arc<JobTypeRegistry>) -> Self {
        Self { db, registry }
    }

    /// Run one attempt of `(job_id, subtask_id)`.
    ///
    /// Gate rejections and work failures come back as `Ok` with
    /// `success = false`. `Err` means a storage transaction failed mid-attempt;
    /// the subtask is then left to the stale-lock window and the reclaimer.
    pub async fn process(&self, job_id: JobId, subtask_id: &str) -> Result<ProcessReport> {
        let span = start_task_span(job_id, subtask_id);
        let result = self
            .run(job_id, subtask_id, &span)
            .instrument(span.clone())
            .await;

        if let Ok(ref report) = result {
            record_outcome(&span, report.outcome_code());
        }
        result
    }

    async fn run(&self, job_id: JobId, subtask_id: &str, span: &Span) -> Result<ProcessReport> {
        let context = json!({ "job_id": job_id.0, "subtask_id": subtask_id });

        // 1. Load
        let Some(job) = self.db.find_job(job_id).await? else {
            return Ok(self.reject(
                "unknown",
                FailureKind::JobNotFound,
                format!("job {job_id} not found"),
                &context,
            ));
        };
        record_job_type(span, &job.job_type);

        let Some(job_type) = self.registry.get(&job.job_type) else {
            return Ok(self.reject(
                &job.job_type,
                FailureKind::Unroutable,
                format!("no job type registered for {}", job.job_type),
                &context,
            ));
        };

        let Some(item) = self
            .db
            .find_subtask(&job.job_type, job_id, subtask_id)
            .await?
        else {
            return Ok(self.reject(
                &job.job_type,
                FailureKind::SubtaskNotFound,
                format!("subtask {subtask_id} of job {job_id} not found"),
                &context,
            ));
        };

        // 2. Processability
        let now = Utc::now();
        let stale_cutoff = cutoff(now, job_type.policy.stale_lock_window());
        if let Some(reason) = not_processable_reason(&job, &item, stale_cutoff) {
            return Ok(self.reject(&job.job_type, FailureKind::NotProcessable, reason, &context));
        }
        if item.status == SubtaskStatus::Processing {
            log_warning(
                "StaleLockTakeover",
                "previous attempt presumed dead, taking over subtask",
                &json!({
                    "job_id": job_id.0,
                    "subtask_id": subtask_id,
                    "last_update": item.updated_at.to_rfc3339(),
                }),
            );
        }

        // 3. Concurrency guard
        match job_type.guard.allow(&self.db, &job, subtask_id).await {
            Ok(true) => {}
            Ok(false) => {
                return Ok(self
                    .reject(
                        &job.job_type,
                        FailureKind::ConcurrentSkip,
                        "another worker is occupying this job",
                        &context,
                    )
                    .retry_after(CONCURRENT_SKIP_RETRY_AFTER));
            }
            Err(e) => {
                return Ok(self
                    .reject(
                        &job.job_type,
                        FailureKind::ConcurrentSkip,
                        format!("concurrency guard unavailable: {e}"),
                        &context,
                    )
                    .retry_after(CONCURRENT_SKIP_RETRY_AFTER));
            }
        }

        // 4. Rate gate. A pass is recorded whatever the work's outcome.
        if let Some(ref gate) = job_type.policy.rate_gate {
            match self
                .db
                .try_acquire_rate_slot(&gate.key, gate.min_interval(), now)
                .await
            {
                Ok(RateDecision::Pass) => {}
                Ok(RateDecision::Throttled { retry_after }) => {
                    return Ok(self
                        .reject(
                            &job.job_type,
                            FailureKind::RateLimited,
                            format!(
                                "rate gate {} throttled, retry in {}ms",
                                gate.key,
                                retry_after.as_millis()
                            ),
                            &context,
                        )
                        .retry_after(retry_after));
                }
                Err(e) => {
                    return Ok(self
                        .reject(
                            &job.job_type,
                            FailureKind::RateLimited,
                            format!("rate gate {} unavailable: {e}", gate.key),
                            &context,
                        )
                        .retry_after(gate.min_interval()));
                }
            }
        }

        // 5. Claim
        let lease_token = Uuid::new_v4().to_string();
        let claim = self
            .claim(
                &job,
                subtask_id,
                &lease_token,
                now,
                stale_cutoff,
                job_type.policy.single_flight,
            )
            .await;
        let claimed = match claim {
            Ok(Claim::Claimed(claimed)) => claimed,
            Ok(Claim::Taken) => {
                return Ok(self.reject(
                    &job.job_type,
                    FailureKind::NotProcessable,
                    "subtask was claimed by another worker",
                    &context,
                ));
            }
            Ok(Claim::SiblingInFlight) => {
                return Ok(self
                    .reject(
                        &job.job_type,
                        FailureKind::ConcurrentSkip,
                        "another subtask of this job was claimed first",
                        &context,
                    )
                    .retry_after(CONCURRENT_SKIP_RETRY_AFTER));
            }
            Ok(Claim::JobHeld(status)) => {
                return Ok(self.reject(
                    &job.job_type,
                    FailureKind::NotProcessable,
                    format!("job {job_id} became {status} before the claim"),
                    &context,
                ));
            }
            Err(e) => {
                return Ok(self.reject(
                    &job.job_type,
                    FailureKind::StatusUpdateFailed,
                    format!("failed to mark job processing: {e}"),
                    &context,
                ));
            }
        };
        record_attempt(span, claimed.attempts);

        let attempt = Attempt {
            job_type,
            ctx: WorkContext {
                job,
                subtask_id: subtask_id.to_string(),
                subtask_payload: claimed.payload,
                attempt: claimed.attempts,
            },
            lease_token,
        };

        // 6. Execute
        let performed = self.perform(&attempt).await;
        let report = match performed {
            Ok(outcome) if outcome.success => self.commit_success(&attempt, &outcome).await?,
            Ok(outcome) => {
                let message = outcome
                    .message
                    .filter(|m| !m.is_empty())
                    .unwrap_or_else(|| UNKNOWN_ERROR.to_string());
                self.commit_failure(&attempt, FailureKind::WorkFailed, message)
                    .await?
            }
            Err(fault) => {
                log_error("ProcessingException", &fault, &context);
                self.commit_failure(&attempt, FailureKind::ProcessingException, fault)
                    .await?
            }
        };

        metrics::task_outcomes().add(
            1,
            &[
                KeyValue::new("job_type", attempt.ctx.job.job_type.clone()),
                KeyValue::new("outcome", report.outcome_code()),
            ],
        );
        Ok(report)
    }

    /// Log and count a rejection that left every row untouched.
    fn reject(
        &self,
        job_type: &str,
        kind: FailureKind,
        message: impl Into<String>,
        context: &serde_json::Value,
    ) -> ProcessReport {
        let message = message.into();
        match kind {
            FailureKind::JobNotFound
            | FailureKind::SubtaskNotFound
            | FailureKind::Unroutable
            | FailureKind::StatusUpdateFailed => log_error(kind.code(), &message, context),
            _ => log_warning(kind.code(), &message, context),
        }
        metrics::task_outcomes().add(
            1,
            &[
                KeyValue::new("job_type", job_type.to_string()),
                KeyValue::new("outcome", kind.code()),
            ],
        );
        ProcessReport::failed(kind, message)
    }

    /// Take the subtask's lease and mark the job processing, atomically.
    /// Nothing is written unless both succeed.
    async fn claim(
        &self,
        job: &Job,
        subtask_id: &str,
        lease_token: &str,
        now: DateTime<Utc>,
        stale_cutoff: DateTime<Utc>,
        single_flight: bool,
    ) -> Result<Claim> {
        let now_ms = to_millis(now);
        let mut tx = self.db.pool().begin().await?;

        let claimed = queue::claim_subtask_on(
            &mut tx,
            &job.job_type,
            job.id,
            subtask_id,
            lease_token,
            now_ms,
            to_millis(stale_cutoff),
            single_flight,
        )
        .await?;
        if !claimed {
            // Still claimable on its own means a sibling holds the job.
            let item = queue::find_subtask_on(&mut tx, &job.job_type, job.id, subtask_id).await?;
            tx.rollback().await?;
            return Ok(match item {
                Some(ref item) if single_flight && queue::is_claimable(item, stale_cutoff) => {
                    Claim::SiblingInFlight
                }
                _ => Claim::Taken,
            });
        }

        if !jobs::mark_job_processing_on(&mut tx, job.id, now_ms).await? {
            let status = jobs::find_job_on(&mut tx, job.id).await?.map(|j| j.status);
            tx.rollback().await?;
            return Ok(match status {
                Some(status) => Claim::JobHeld(status),
                None => Claim::Taken,
            });
        }

        let item = queue::find_subtask_on(&mut tx, &job.job_type, job.id, subtask_id).await?;
        tx.commit().await?;
        Ok(item.map_or(Claim::Taken, Claim::Claimed))
    }

    /// Call the work function outside any transaction. Errors, panics and
    /// timeouts all come back as the fault message.
    async fn perform(&self, attempt: &Attempt<'_>) -> std::result::Result<WorkOutcome, String> {
        let timeout = attempt.job_type.policy.work_timeout();
        let started = Instant::now();

        let call = AssertUnwindSafe(attempt.job_type.work.perform(&attempt.ctx)).catch_unwind();
        let result = match tokio::time::timeout(timeout, call).await {
            Err(_) => Err(format!(
                "work function timed out after {}s",
                timeout.as_secs()
            )),
            Ok(Err(panic)) => Err(format!(
                "work function panicked: {}",
                panic_message(panic.as_ref())
            )),
            Ok(Ok(Err(e))) => Err(format!("{e:#}")),
            Ok(Ok(Ok(outcome))) => Ok(outcome),
        };

        metrics::work_duration_ms().record(
            started.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new(
                "job_type",
                attempt.ctx.job.job_type.clone(),
            )],
        );
        result
    }

    /// Persist the domain result and complete the subtask in one transaction.
    async fn commit_success(
        &self,
        attempt: &Attempt<'_>,
        outcome: &WorkOutcome,
    ) -> Result<ProcessReport> {
        let ctx = &attempt.ctx;
        let mut tx = self.db.pool().begin().await?;

        if let Err(e) = attempt.job_type.work.persist(&mut tx, ctx, outcome).await {
            tx.rollback().await?;
            let fault = format!("{e:#}");
            log_error(
                "ProcessingException",
                &fault,
                &json!({ "job_id": ctx.job.id.0, "subtask_id": ctx.subtask_id, "phase": "persist" }),
            );
            return self
                .commit_failure(attempt, FailureKind::ProcessingException, fault)
                .await;
        }

        let resolved = queue::resolve_subtask_on(
            &mut tx,
            &ctx.job.job_type,
            ctx.job.id,
            &ctx.subtask_id,
            &attempt.lease_token,
            SubtaskStatus::Completed,
            None,
            to_millis(Utc::now()),
        )
        .await?;
        if !resolved {
            tx.rollback().await?;
            return Ok(self.lease_lost(attempt));
        }
        tx.commit().await?;

        log_success(
            "SubtaskCompleted",
            "subtask completed",
            &json!({ "job_id": ctx.job.id.0, "subtask_id": ctx.subtask_id, "attempt": ctx.attempt }),
        );

        let settled = self.after_resolution(attempt, SubtaskResult::Completed).await?;
        let message = outcome
            .message
            .clone()
            .unwrap_or_else(|| "subtask completed".to_string());
        Ok(ProcessReport::completed(message).settled(settled))
    }

    /// Mark the subtask failed with `message`. Nothing from the attempt's
    /// domain writes exists at this point.
    async fn commit_failure(
        &self,
        attempt: &Attempt<'_>,
        kind: FailureKind,
        message: String,
    ) -> Result<ProcessReport> {
        let ctx = &attempt.ctx;
        let resolved = {
            let mut conn = self.db.pool().acquire().await?;
            queue::resolve_subtask_on(
                &mut conn,
                &ctx.job.job_type,
                ctx.job.id,
                &ctx.subtask_id,
                &attempt.lease_token,
                SubtaskStatus::Failed,
                Some(&message),
                to_millis(Utc::now()),
            )
            .await?
        };
        if !resolved {
            return Ok(self.lease_lost(attempt));
        }

        log_warning(
            kind.code(),
            &message,
            &json!({ "job_id": ctx.job.id.0, "subtask_id": ctx.subtask_id, "attempt": ctx.attempt }),
        );

        let settled = self
            .after_resolution(
                attempt,
                SubtaskResult::Failed {
                    message: message.clone(),
                },
            )
            .await?;
        Ok(ProcessReport::failed(kind, message).settled(settled))
    }

    /// Progress callback, then finalization. Returns the status the job
    /// settled into, if this attempt settled it.
    async fn after_resolution(
        &self,
        attempt: &Attempt<'_>,
        result: SubtaskResult,
    ) -> Result<Option<JobStatus>> {
        let ctx = &attempt.ctx;
        let counts = self.db.subtask_counts(&ctx.job.job_type, ctx.job.id).await?;
        attempt
            .job_type
            .progress
            .report(&ProgressUpdate {
                job_type: ctx.job.job_type.clone(),
                job_id: ctx.job.id,
                subtask_id: ctx.subtask_id.clone(),
                result,
                counts,
            })
            .await;

        let finalization = self.db.finalize_job(&ctx.job.job_type, ctx.job.id).await?;
        Ok(finalization.settled.filter(|_| finalization.changed))
    }

    fn lease_lost(&self, attempt: &Attempt<'_>) -> ProcessReport {
        let ctx = &attempt.ctx;
        let message = format!(
            "lease on subtask {} of job {} was lost before the attempt finished",
            ctx.subtask_id, ctx.job.id
        );
        log_warning(
            FailureKind::LeaseLost.code(),
            &message,
            &json!({ "job_id": ctx.job.id.0, "subtask_id": ctx.subtask_id, "attempt": ctx.attempt }),
        );
        ProcessReport::failed(FailureKind::LeaseLost, message)
    }
}

/// Gate 2. `None` if the subtask may be claimed.
fn not_processable_reason(
    job: &Job,
    item: &QueueItem,
    stale_cutoff: DateTime<Utc>,
) -> Option<String> {
    if !job.status.is_dispatchable() {
        return Some(format!("job {} is {}", job.id, job.status));
    }
    match item.status {
        SubtaskStatus::Pending => None,
        SubtaskStatus::Processing if item.updated_at < stale_cutoff => None,
        SubtaskStatus::Processing => Some(format!(
            "subtask {} is in progress elsewhere (since {})",
            item.subtask_id,
            item.updated_at.to_rfc3339()
        )),
        SubtaskStatus::Completed | SubtaskStatus::Failed => Some(format!(
            "subtask {} is already {}",
            item.subtask_id, item.status
        )),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
