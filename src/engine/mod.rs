//! The execution engine: task executor, timeout reclaimer, finalization.
//!
//! Nothing here schedules itself. An external trigger calls
//! [`TaskExecutor::process`] once per subtask and, separately, runs the
//! [`TimeoutReclaimer`] sweep.

pub mod executor;
pub mod finalize;
pub mod guard;
pub mod reclaimer;
pub mod work;

pub use executor::{FailureKind, ProcessReport, TaskExecutor};
pub use finalize::{Finalization, settled_status};
pub use guard::{AllowAll, ConcurrencyGuard, SingleFlightGuard};
pub use reclaimer::{TimeoutReclaimer, TimeoutReport};
pub use work::{
    LogProgress, ProgressReporter, ProgressUpdate, SubtaskResult, WorkContext, WorkFunction,
    WorkOutcome,
};

use std::time::Duration;

use chrono::{DateTime, Utc};

/// `now - window`, saturating at the earliest representable instant.
pub(crate) fn cutoff(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(window)
        .ok()
        .and_then(|w| now.checked_sub_signed(w))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
