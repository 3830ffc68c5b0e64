//! Metric instrument factories for jobmill.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! Without a provider these are no-ops.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("jobmill")
}

/// Counter: jobs created.
/// Labels: `job_type`.
pub fn jobs_created() -> Counter<u64> {
    meter()
        .u64_counter("jobmill.jobs.created")
        .with_description("Number of jobs created")
        .build()
}

/// Counter: subtask attempt results.
/// Labels: `job_type`, `outcome` ("completed" or a failure code).
pub fn task_outcomes() -> Counter<u64> {
    meter()
        .u64_counter("jobmill.task.outcomes")
        .with_description("Results of subtask processing attempts")
        .build()
}

/// Counter: jobs reaching a settled status.
/// Labels: `job_type`, `status`.
pub fn jobs_settled() -> Counter<u64> {
    meter()
        .u64_counter("jobmill.jobs.settled")
        .with_description("Number of jobs finalized")
        .build()
}

/// Counter: rate gate checks.
/// Labels: `gate`, `decision` ("pass" | "throttled").
pub fn rate_gate_decisions() -> Counter<u64> {
    meter()
        .u64_counter("jobmill.rate_gate.decisions")
        .with_description("Rate gate pass/throttle decisions")
        .build()
}

/// Counter: stale subtasks handled by the reclaimer.
/// Labels: `job_type`, `result` ("requeued" | "failed" | "skipped").
pub fn subtasks_reclaimed() -> Counter<u64> {
    meter()
        .u64_counter("jobmill.reclaimer.subtasks")
        .with_description("Stale subtasks handled by the timeout sweep")
        .build()
}

/// Counter: orphaned queue rows deleted.
pub fn orphans_deleted() -> Counter<u64> {
    meter()
        .u64_counter("jobmill.reclaimer.orphans_deleted")
        .with_description("Queue rows deleted because their job is gone")
        .build()
}

/// Histogram: work function duration in milliseconds.
/// Labels: `job_type`.
pub fn work_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("jobmill.work.duration_ms")
        .with_description("Work function duration in milliseconds")
        .with_unit("ms")
        .build()
}
