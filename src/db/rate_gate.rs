//! Shared rate gate for external APIs.
//!
//! The last call time lives in the `rate_gates` table, not in process
//! memory, so every worker process sees the same gate.

use std::time::Duration;

use chrono::{DateTime, Utc};

use super::to_millis;
use crate::error::Result;
use crate::telemetry::metrics;
use opentelemetry::KeyValue;

/// Outcome of asking the gate for a call slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    /// The slot was taken; `now` is the new last call time.
    Pass,
    /// Too soon after the last call.
    Throttled { retry_after: Duration },
}

impl super::Db {
    /// Take a call slot on `gate_key` if at least `min_interval` has passed
    /// since the last recorded call.
    ///
    /// Check and record happen in one conditional upsert, so two workers can
    /// never both pass inside the same interval.
    pub async fn try_acquire_rate_slot(
        &self,
        gate_key: &str,
        min_interval: Duration,
        now: DateTime<Utc>,
    ) -> Result<RateDecision> {
        let now_ms = to_millis(now);
        let interval_ms = min_interval.as_millis() as i64;

        let rows = sqlx::query(
            "INSERT INTO rate_gates (gate_key, last_call_at) VALUES (?1, ?2)
             ON CONFLICT(gate_key) DO UPDATE SET last_call_at = excluded.last_call_at
             WHERE rate_gates.last_call_at <= ?3",
        )
        .bind(gate_key)
        .bind(now_ms)
        .bind(now_ms - interval_ms)
        .execute(&self.pool)
        .await?
        .rows_affected();

        let decision = if rows > 0 {
            RateDecision::Pass
        } else {
            let last: Option<i64> =
                sqlx::query_scalar("SELECT last_call_at FROM rate_gates WHERE gate_key = ?1")
                    .bind(gate_key)
                    .fetch_optional(&self.pool)
                    .await?;
            let wait_ms = last.map_or(0, |last| (last + interval_ms - now_ms).max(0));
            RateDecision::Throttled {
                retry_after: Duration::from_millis(wait_ms as u64),
            }
        };

        metrics::rate_gate_decisions().add(
            1,
            &[
                KeyValue::new("gate", gate_key.to_string()),
                KeyValue::new(
                    "decision",
                    match decision {
                        RateDecision::Pass => "pass",
                        RateDecision::Throttled { .. } => "throttled",
                    },
                ),
            ],
        );

        Ok(decision)
    }

    /// Last recorded call time for a gate, if any.
    pub async fn rate_gate_last_call(&self, gate_key: &str) -> Result<Option<DateTime<Utc>>> {
        let last: Option<i64> =
            sqlx::query_scalar("SELECT last_call_at FROM rate_gates WHERE gate_key = ?1")
                .bind(gate_key)
                .fetch_optional(&self.pool)
                .await?;
        last.map(super::from_millis).transpose()
    }
}
