//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing.
//! The database URL is wrapped in `secrecy::SecretString` since it may carry
//! credentials.

use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::jobtype::{JobTypePolicy, load_policies};
use secrecy::SecretString;

pub const DEFAULT_JOB_TYPES_PATH: &str = "job_types.toml";

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    /// TOML file with the job type policies.
    pub job_types_path: PathBuf,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            job_types_path: std::env::var("JOBMILL_JOB_TYPES")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_JOB_TYPES_PATH)),
        })
    }

    /// Read the job type policy file named by `job_types_path`.
    pub fn job_type_policies(&self) -> Result<Vec<JobTypePolicy>> {
        load_policies(&self.job_types_path)
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}
