//! Default configuration values and timing budgets
//!
//! These constants keep the worker, CLI, and tests on the same numbers.

use std::time::Duration;

/// Default table name prefix
pub const DEFAULT_TABLE_PREFIX: &str = "tablekeeper";

/// Default AWS region
pub const DEFAULT_REGION: &str = "us-east-1";

/// Tables managed when the config does not list any
pub const DEFAULT_REQUIRED_TABLES: &[&str] =
    &["users", "roles", "permissions", "organizations", "crews", "jobs"];

/// Lock time-to-live; longer than a full cycle so a live holder never expires
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(20 * 60);

/// Pause between lock acquisition attempts within one cycle
pub const DEFAULT_LOCK_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Lock acquisition attempts per cycle
pub const DEFAULT_LOCK_ATTEMPTS: u32 = 3;

/// Cycle-level retry budget
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Base delay for cycle-level retry backoff
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Multiplier for cycle-level retry backoff
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Upper bound for any computed retry delay (1 hour)
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(60 * 60);

/// Hard budget for a single cycle (15 minutes)
pub const CYCLE_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Interval between health checks in monitoring mode
pub const DEFAULT_MONITORING_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Local create/delete attempts per table
pub const TABLE_OPERATION_ATTEMPTS: u32 = 3;

/// Delay step between create/delete attempts (attempt x step)
pub const TABLE_OPERATION_RETRY_STEP: Duration = Duration::from_secs(5);

/// Poll interval while waiting for a table to become active
pub const ACTIVE_POLL_INTERVAL: Duration = Duration::from_secs(15);

/// Maximum wait for a table to become active (10 minutes)
pub const ACTIVE_WAIT_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Poll interval while waiting for a table to disappear
pub const DELETION_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Maximum wait for a table to disappear (10 minutes)
pub const DELETION_WAIT_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Timeout for a single fast status lookup
pub const FAST_STATUS_TIMEOUT: Duration = Duration::from_secs(2);

/// Wall-clock ceiling for a batch status lookup
pub const BATCH_STATUS_CEILING: Duration = Duration::from_secs(5);

/// Concurrent describe calls in a batch status lookup
pub const BATCH_STATUS_CONCURRENCY: usize = 3;

/// Interval for the background "refresh all" request
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Hard ceiling for one background refresh
pub const REFRESH_TIMEOUT: Duration = Duration::from_secs(10);

/// Capacity of the background refresh queue
pub const DEFAULT_REFRESH_QUEUE_CAPACITY: usize = 16;

/// Grace period for background tasks on shutdown
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

// Serde default functions for struct field defaults

/// Returns the default table prefix
pub fn default_table_prefix() -> String {
    DEFAULT_TABLE_PREFIX.to_string()
}

/// Returns the default region
pub fn default_region() -> String {
    DEFAULT_REGION.to_string()
}

/// Returns the default required table list
pub fn default_required_tables() -> Vec<String> {
    DEFAULT_REQUIRED_TABLES.iter().map(|s| s.to_string()).collect()
}

/// Returns the default lock timeout
pub fn default_lock_timeout() -> Duration {
    DEFAULT_LOCK_TIMEOUT
}

/// Returns the default lock retry interval
pub fn default_lock_retry_interval() -> Duration {
    DEFAULT_LOCK_RETRY_INTERVAL
}

/// Returns the default lock attempts
pub fn default_lock_attempts() -> u32 {
    DEFAULT_LOCK_ATTEMPTS
}

/// Returns the default max retries
pub fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

/// Returns the default retry delay
pub fn default_retry_delay() -> Duration {
    DEFAULT_RETRY_DELAY
}

/// Returns the default backoff multiplier
pub fn default_backoff_multiplier() -> f64 {
    DEFAULT_BACKOFF_MULTIPLIER
}

/// Returns the default monitoring interval
pub fn default_monitoring_interval() -> Duration {
    DEFAULT_MONITORING_INTERVAL
}

/// Returns the default refresh interval
pub fn default_refresh_interval() -> Duration {
    DEFAULT_REFRESH_INTERVAL
}

/// Returns the default refresh queue capacity
pub fn default_refresh_queue_capacity() -> usize {
    DEFAULT_REFRESH_QUEUE_CAPACITY
}
