//! Span helpers and the engine's log sink.
//!
//! `log_success`, `log_warning` and `log_error` are the coded log interface
//! the engine reports through. They only emit `tracing` events; nothing is
//! returned or inspected.

use tracing::Span;

use crate::model::JobId;

/// Start a span for one subtask attempt.
///
/// `task.job_type` is filled once the job row is loaded, `task.outcome` by
/// [`record_outcome`].
pub fn start_task_span(job_id: JobId, subtask_id: &str) -> Span {
    tracing::info_span!(
        "task.process",
        "task.job_type" = tracing::field::Empty,
        "task.job_id" = job_id.0,
        "task.subtask_id" = subtask_id,
        "task.attempt" = tracing::field::Empty,
        "task.outcome" = tracing::field::Empty,
    )
}

/// Record the job type once it is known.
pub fn record_job_type(span: &Span, job_type: &str) {
    span.record("task.job_type", job_type);
}

/// Record the attempt number once the subtask has been claimed.
pub fn record_attempt(span: &Span, attempt: u32) {
    span.record("task.attempt", attempt);
}

/// Record the final outcome code on the span.
pub fn record_outcome(span: &Span, outcome: &str) {
    span.record("task.outcome", outcome);
}

/// Start a span for a reclaimer sweep.
pub fn start_sweep_span(operation: &str) -> Span {
    tracing::info_span!("reclaimer.sweep", "reclaimer.operation" = operation)
}

pub fn log_success(code: &str, message: &str, context: &serde_json::Value) {
    tracing::info!(code, %context, "{message}");
}

pub fn log_warning(code: &str, message: &str, context: &serde_json::Value) {
    tracing::warn!(code, %context, "{message}");
}

pub fn log_error(code: &str, message: &str, context: &serde_json::Value) {
    tracing::error!(code, %context, "{message}");
}
