//! Configuration types for the worker
//!
//! `WorkerConfig` is loaded from a JSON file where every field is optional
//! and falls back to [`tablekeeper_common::defaults`]. Durations are written
//! in humantime form (`"15m"`, `"5s"`).

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tablekeeper_common::defaults::{
    CYCLE_TIMEOUT, default_backoff_multiplier, default_lock_attempts, default_lock_retry_interval,
    default_lock_timeout, default_max_retries, default_monitoring_interval, default_refresh_interval,
    default_refresh_queue_capacity, default_region, default_required_tables, default_retry_delay,
    default_table_prefix,
};

use crate::catalog::{self, BillingMode};
use crate::error::ConfigError;
use crate::orchestrator::Schedule;

/// Deployment environment; controls table names and schedule density
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Environment {
    #[default]
    Development,
    Staging,
    Production,
}

/// Which tables to manage and where
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TableConfig {
    /// Physical name prefix
    pub prefix: String,
    /// AWS region
    pub region: String,
    /// AWS profile name (overrides default credential resolution)
    pub aws_profile: Option<String>,
    /// Logical names of the tables to manage
    pub required: Vec<String>,
    pub billing_mode: BillingMode,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            prefix: default_table_prefix(),
            region: default_region(),
            aws_profile: None,
            required: default_required_tables(),
            billing_mode: BillingMode::default(),
        }
    }
}

/// Cycle scheduling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// `@every 5m`, `@hourly`, `@daily`, or a bare duration. `None` picks
    /// the environment default.
    pub expression: Option<String>,
    /// Interval between health checks once setup has completed
    #[serde(with = "humantime_serde")]
    pub monitoring_interval: Duration,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            expression: None,
            monitoring_interval: default_monitoring_interval(),
        }
    }
}

/// File lock settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Lock file; must be on storage shared by every worker instance
    pub path: PathBuf,
    /// Lock time-to-live
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Pause between acquisition attempts
    #[serde(with = "humantime_serde")]
    pub retry_interval: Duration,
    /// Acquisition attempts per cycle
    pub attempts: u32,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            path: state_dir().join("worker.lock"),
            timeout: default_lock_timeout(),
            retry_interval: default_lock_retry_interval(),
            attempts: default_lock_attempts(),
        }
    }
}

/// Cycle-level retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay: default_retry_delay(),
            multiplier: default_backoff_multiplier(),
        }
    }
}

/// Status file and background refresh
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusConfig {
    pub path: PathBuf,
    #[serde(with = "humantime_serde")]
    pub refresh_interval: Duration,
    pub refresh_queue_capacity: usize,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            path: state_dir().join("setup-status.json"),
            refresh_interval: default_refresh_interval(),
            refresh_queue_capacity: default_refresh_queue_capacity(),
        }
    }
}

/// Runtime behavior flags
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeFlags {
    /// Describe and log, never create or delete
    pub dry_run: bool,
    /// Skip the active-status poll and index check after creation
    pub skip_validation: bool,
    /// Run setup even if a previous run completed
    pub force_recreate: bool,
    /// Execute one cycle then stop
    pub run_once: bool,
    /// Deletion is scheduled for the next cycle
    pub deletion_scheduled: bool,
    /// Deletion was explicitly requested
    pub deletion_requested: bool,
}

impl RuntimeFlags {
    /// Deletion takes priority over setup only when both flags are set
    pub fn deletion_pending(&self) -> bool {
        self.deletion_scheduled && self.deletion_requested
    }
}

/// Complete worker configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub environment: Environment,
    pub tables: TableConfig,
    pub schedule: ScheduleConfig,
    pub lock: LockConfig,
    pub retry: RetryConfig,
    pub status: StatusConfig,
    pub flags: RuntimeFlags,
}

impl WorkerConfig {
    /// Load and validate configuration from a JSON file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::io(path.display().to_string(), e))?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every field that would make the worker misbehave at runtime
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tables.required.is_empty() {
            return Err(ConfigError::EmptyTableList);
        }
        let mut seen = HashSet::new();
        for name in &self.tables.required {
            if !catalog::is_known_table(name) {
                return Err(ConfigError::UnknownTable(name.clone()));
            }
            if !seen.insert(name.as_str()) {
                return Err(ConfigError::DuplicateTable(name.clone()));
            }
        }
        if self.tables.prefix.trim().is_empty() {
            return Err(ConfigError::EmptyPrefix);
        }
        if self.tables.region.trim().is_empty() {
            return Err(ConfigError::EmptyRegion);
        }
        if self.lock.path.as_os_str().is_empty() {
            return Err(ConfigError::EmptyPath("lock"));
        }
        if self.status.path.as_os_str().is_empty() {
            return Err(ConfigError::EmptyPath("status"));
        }
        if self.lock.timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("lock timeout"));
        }
        if self.lock.timeout <= CYCLE_TIMEOUT {
            return Err(ConfigError::LockTimeoutTooShort {
                timeout: self.lock.timeout,
                cycle: CYCLE_TIMEOUT,
            });
        }
        if self.lock.attempts == 0 {
            return Err(ConfigError::InvalidLockAttempts);
        }
        if self.retry.base_delay.is_zero() {
            return Err(ConfigError::ZeroDuration("retry base delay"));
        }
        if !self.retry.multiplier.is_finite() || self.retry.multiplier < 1.0 {
            return Err(ConfigError::InvalidMultiplier(self.retry.multiplier));
        }
        if self.schedule.monitoring_interval.is_zero() {
            return Err(ConfigError::ZeroDuration("monitoring interval"));
        }
        if self.status.refresh_interval.is_zero() {
            return Err(ConfigError::ZeroDuration("refresh interval"));
        }
        self.schedule()?;
        Ok(())
    }

    /// The parsed cycle schedule, falling back to the environment default
    pub fn schedule(&self) -> Result<Schedule, ConfigError> {
        match &self.schedule.expression {
            Some(expression) => expression.parse(),
            None => Ok(Schedule::for_environment(self.environment)),
        }
    }

    pub fn region(&self) -> &str {
        &self.tables.region
    }
    pub fn aws_profile(&self) -> Option<&str> {
        self.tables.aws_profile.as_deref()
    }
    pub fn max_retries(&self) -> u32 {
        self.retry.max_retries
    }
}

/// Directory for default lock and status files
fn state_dir() -> PathBuf {
    ProjectDirs::from("", "", "tablekeeper")
        .map(|dirs| dirs.data_local_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".tablekeeper"))
}
