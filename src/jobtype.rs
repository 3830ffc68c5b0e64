//! Job type policies and registry.
//!
//! A job type is a configuration value: a policy (loaded from TOML) bound to
//! the work function, progress reporter and concurrency guard that handle
//! it. Adding a job type never means subclassing the engine.
//!
//! ```toml
//! [[job_type]]
//! name = "topic"
//! stale_lock_secs = 1860
//! work_timeout_secs = 900
//!
//! [job_type.rate_gate]
//! key = "openai"
//! min_interval_ms = 1000
//!
//! [job_type.timeout]
//! threshold_secs = 1860
//! max_attempts = 3
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::engine::guard::{AllowAll, ConcurrencyGuard, SingleFlightGuard};
use crate::engine::work::{LogProgress, ProgressReporter, WorkFunction};
use crate::error::{Error, Result};

/// 31 minutes.
pub const DEFAULT_STALE_LOCK_SECS: u64 = 31 * 60;
pub const DEFAULT_WORK_TIMEOUT_SECS: u64 = 30 * 60;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Top-level TOML wrapper.
#[derive(Debug, Deserialize)]
struct PolicyFile {
    #[serde(default, rename = "job_type")]
    job_types: Vec<JobTypePolicy>,
}

/// Per-job-type engine settings.
#[derive(Debug, Clone, Deserialize)]
pub struct JobTypePolicy {
    pub name: String,

    /// How long a processing subtask counts as legitimately in flight.
    #[serde(default = "default_stale_lock_secs")]
    pub stale_lock_secs: u64,

    /// Upper bound on one work function call.
    #[serde(default = "default_work_timeout_secs")]
    pub work_timeout_secs: u64,

    /// Allow at most one in-flight subtask per job.
    #[serde(default)]
    pub single_flight: bool,

    #[serde(default)]
    pub rate_gate: Option<RateGatePolicy>,

    #[serde(default)]
    pub timeout: Option<TimeoutPolicy>,
}

/// Throttle on a shared external API.
#[derive(Debug, Clone, Deserialize)]
pub struct RateGatePolicy {
    /// Gate row name. Job types calling the same API share a key.
    pub key: String,
    pub min_interval_ms: u64,
}

/// Reclaim rule for subtasks stuck in `processing`.
#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutPolicy {
    pub threshold_secs: u64,
    /// Claims allowed before a timed-out subtask is failed instead of retried.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_stale_lock_secs() -> u64 {
    DEFAULT_STALE_LOCK_SECS
}

fn default_work_timeout_secs() -> u64 {
    DEFAULT_WORK_TIMEOUT_SECS
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

impl JobTypePolicy {
    /// Policy with defaults: 31-minute stale lock window, no rate gate, no
    /// timeout reclaim.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stale_lock_secs: DEFAULT_STALE_LOCK_SECS,
            work_timeout_secs: DEFAULT_WORK_TIMEOUT_SECS,
            single_flight: false,
            rate_gate: None,
            timeout: None,
        }
    }

    pub fn stale_lock_window(&self) -> Duration {
        Duration::from_secs(self.stale_lock_secs)
    }

    pub fn work_timeout(&self) -> Duration {
        Duration::from_secs(self.work_timeout_secs)
    }

    /// Rounded up to whole seconds.
    pub fn with_stale_lock(mut self, window: Duration) -> Self {
        self.stale_lock_secs = whole_secs(window);
        self
    }

    /// Rounded up to whole seconds.
    pub fn with_work_timeout(mut self, timeout: Duration) -> Self {
        self.work_timeout_secs = whole_secs(timeout);
        self
    }

    pub fn with_single_flight(mut self) -> Self {
        self.single_flight = true;
        self
    }

    pub fn with_rate_gate(mut self, key: impl Into<String>, min_interval: Duration) -> Self {
        self.rate_gate = Some(RateGatePolicy {
            key: key.into(),
            min_interval_ms: min_interval.as_millis() as u64,
        });
        self
    }

    pub fn with_timeout(mut self, threshold: Duration, max_attempts: u32) -> Self {
        self.timeout = Some(TimeoutPolicy {
            threshold_secs: whole_secs(threshold),
            max_attempts,
        });
        self
    }

    /// Reject settings under which a takeover or the reclaimer would race
    /// healthy workers.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Config("job type name must not be empty".to_string()));
        }
        if self.work_timeout_secs == 0 {
            return Err(Error::Config(format!(
                "job type {}: work timeout must be at least 1s",
                self.name
            )));
        }
        // No takeover while a work call may still be running.
        if self.stale_lock_secs <= self.work_timeout_secs {
            return Err(Error::Config(format!(
                "job type {}: stale lock window ({}s) must exceed the work timeout ({}s)",
                self.name, self.stale_lock_secs, self.work_timeout_secs
            )));
        }
        if let Some(ref timeout) = self.timeout {
            if timeout.threshold_secs <= self.work_timeout_secs {
                return Err(Error::Config(format!(
                    "job type {}: timeout threshold ({}s) must exceed the work timeout ({}s)",
                    self.name, timeout.threshold_secs, self.work_timeout_secs
                )));
            }
            if timeout.max_attempts == 0 {
                return Err(Error::Config(format!(
                    "job type {}: max_attempts must be at least 1",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

fn whole_secs(d: Duration) -> u64 {
    d.as_secs() + u64::from(d.subsec_nanos() > 0)
}

impl RateGatePolicy {
    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }
}

impl TimeoutPolicy {
    pub fn threshold(&self) -> Duration {
        Duration::from_secs(self.threshold_secs)
    }
}

/// Parse and validate a TOML policy document.
pub fn parse_policies(content: &str) -> Result<Vec<JobTypePolicy>> {
    let file: PolicyFile =
        toml::from_str(content).map_err(|e| Error::Config(format!("bad job type policy: {e}")))?;

    let mut seen = std::collections::HashSet::new();
    for policy in &file.job_types {
        policy.validate()?;
        if !seen.insert(policy.name.as_str()) {
            return Err(Error::Config(format!(
                "job type {} is defined twice",
                policy.name
            )));
        }
    }
    Ok(file.job_types)
}

/// Load policies from a TOML file.
pub fn load_policies(path: &Path) -> Result<Vec<JobTypePolicy>> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("cannot read job type policies {}: {e}", path.display()))
    })?;
    parse_policies(&content)
}

// ---------------------------------------------------------------------------
// Job Type
// ---------------------------------------------------------------------------

/// A policy bound to the capabilities that execute it.
#[derive(Clone)]
pub struct JobType {
    pub policy: JobTypePolicy,
    pub(crate) work: Arc<dyn WorkFunction>,
    pub(crate) progress: Arc<dyn ProgressReporter>,
    pub(crate) guard: Arc<dyn ConcurrencyGuard>,
}

impl JobType {
    /// Bind a work function to a policy. Progress goes to the log; the guard
    /// follows `policy.single_flight`.
    pub fn new(policy: JobTypePolicy, work: Arc<dyn WorkFunction>) -> Self {
        let guard: Arc<dyn ConcurrencyGuard> = if policy.single_flight {
            Arc::new(SingleFlightGuard::new(policy.stale_lock_window()))
        } else {
            Arc::new(AllowAll)
        };
        Self {
            policy,
            work,
            progress: Arc::new(LogProgress),
            guard,
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_guard(mut self, guard: Arc<dyn ConcurrencyGuard>) -> Self {
        self.guard = guard;
        self
    }

    pub fn name(&self) -> &str {
        &self.policy.name
    }
}

/// Registry of job types, indexed by name.
#[derive(Clone, Default)]
pub struct JobTypeRegistry {
    types: HashMap<String, JobType>,
}

impl JobTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job type, replacing any previous one with the same name.
    pub fn register(&mut self, job_type: JobType) -> Result<()> {
        job_type.policy.validate()?;
        self.types.insert(job_type.name().to_string(), job_type);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&JobType> {
        self.types.get(name)
    }

    /// Policies of all registered job types.
    pub fn policies(&self) -> Vec<JobTypePolicy> {
        self.types.values().map(|t| t.policy.clone()).collect()
    }
}
