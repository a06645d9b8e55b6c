//! Worker error taxonomy
//!
//! Typed errors that callers match on. They travel inside `anyhow::Error`
//! and are recovered with `downcast_ref`, the same way AWS errors are
//! classified in [`crate::aws::error`].

use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

/// Configuration validation errors (fatal at construction)
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The required table list is empty
    #[error("required table list cannot be empty")]
    EmptyTableList,

    /// A required table is not in the catalog
    #[error("unknown table '{0}' in required table list")]
    UnknownTable(String),

    /// A table is listed more than once
    #[error("table '{0}' is listed more than once")]
    DuplicateTable(String),

    /// Table prefix is empty
    #[error("table prefix cannot be empty")]
    EmptyPrefix,

    /// Region is empty
    #[error("region cannot be empty")]
    EmptyRegion,

    /// Schedule expression could not be parsed
    #[error("invalid schedule expression '{expression}': {reason}")]
    InvalidSchedule { expression: String, reason: String },

    /// A file path is empty
    #[error("{0} path cannot be empty")]
    EmptyPath(&'static str),

    /// A duration must be non-zero
    #[error("{0} must be greater than 0")]
    ZeroDuration(&'static str),

    /// A lock that can expire mid-cycle lets a second instance reclaim it
    #[error("lock timeout {}s must exceed the {}s cycle timeout", timeout.as_secs(), cycle.as_secs())]
    LockTimeoutTooShort { timeout: Duration, cycle: Duration },

    /// Backoff multiplier below 1.0 or not finite
    #[error("backoff multiplier must be a finite number >= 1.0, got {0}")]
    InvalidMultiplier(f64),

    /// Lock attempts must be at least one
    #[error("lock attempts must be at least 1")]
    InvalidLockAttempts,

    /// Failed to parse JSON configuration
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    /// Failed to read configuration file
    #[error("failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl ConfigError {
    /// Create an IO error with path context
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Lock acquisition failures; they abort only the current cycle
#[derive(Debug, Error)]
pub enum LockError {
    /// Another owner holds an unexpired record
    #[error("lock held by {owner} until {}", expires_at.to_rfc3339())]
    Held {
        owner: String,
        expires_at: DateTime<Utc>,
    },

    /// A lock file appeared that was not written under the guard
    #[error("lost race for lock file '{path}'")]
    Contended { path: String },
}

/// Errors raised by the provisioning cycle and the orchestrator
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Create, delete, or describe failed after local retries
    #[error("provisioning failed for table '{table}': {message}")]
    Provisioning { table: String, message: String },

    /// A table exists but does not match its descriptor
    #[error("validation failed for table '{table}': {message}")]
    Validation { table: String, message: String },

    /// A poll, describe, or cycle budget was exceeded
    #[error("{operation} timed out after {}s", after.as_secs())]
    Timeout { operation: String, after: Duration },

    /// The execution context was cancelled
    #[error("operation cancelled")]
    Cancelled,

    /// A cycle panicked; the payload is kept for the status file
    #[error("cycle panicked: {0}")]
    Panic(String),

    /// `start` was called while the worker is running
    #[error("worker is already running")]
    AlreadyRunning,

    /// The worker has not been started
    #[error("worker is not running")]
    NotRunning,

    /// A run-once worker executes its single cycle and takes no triggers
    #[error("worker runs a single cycle and cannot be triggered")]
    NotTriggerable,

    /// The worker was stopped and its execution context is gone
    #[error("worker has been stopped")]
    Stopped,

    /// `schedule_delete` was called while a deletion is pending
    #[error("deletion already scheduled")]
    DeletionAlreadyScheduled,
}

impl WorkerError {
    pub fn provisioning(table: impl Into<String>, message: impl ToString) -> Self {
        Self::Provisioning {
            table: table.into(),
            message: message.to_string(),
        }
    }

    pub fn validation(table: impl Into<String>, message: impl ToString) -> Self {
        Self::Validation {
            table: table.into(),
            message: message.to_string(),
        }
    }

    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after,
        }
    }
}

/// Errors surfaced by the facade's blocking helpers
#[derive(Debug, Error)]
pub enum FacadeError {
    /// The worker stopped before setup completed
    #[error("worker stopped before setup completed")]
    StoppedBeforeCompletion,

    /// Setup did not complete in time
    #[error("setup did not complete within {seconds}s")]
    TimedOut { seconds: u64 },
}

/// Whether an error chain contains a cancellation
pub fn is_cancelled(error: &anyhow::Error) -> bool {
    error
        .chain()
        .any(|cause| matches!(cause.downcast_ref::<WorkerError>(), Some(WorkerError::Cancelled)))
}
