//! # jobmill
//!
//! Job and subtask execution engine for long-running content production
//! (topic discovery, article writing, ...).
//!
//! A job is split into subtasks that are dispatched one at a time by an
//! external scheduler. The engine claims each attempt under a lease, honors
//! shared rate gates and per-job-type concurrency guards, records outcomes
//! transactionally, reclaims subtasks whose worker died, and rolls subtask
//! outcomes up into the job's terminal status.
//!
//! State lives in SQLite (sqlx); observability goes through tracing and
//! OpenTelemetry.

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod jobtype;
pub mod model;
pub mod telemetry;
