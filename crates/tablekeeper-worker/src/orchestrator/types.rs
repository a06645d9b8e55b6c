//! Orchestrator state types

use tablekeeper_common::ExecutionStatus;

use crate::provisioner::ProvisionerTiming;

/// How a started worker drives its cycles
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum RunMode {
    /// One cycle, then stop
    RunOnce,
    /// Recurring cycles on the configured schedule
    Scheduled,
    /// Setup already completed; periodic health checks only
    Monitoring,
}

/// Lifecycle of the orchestrator itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    Created,
    Running(RunMode),
    Stopped,
}

impl OrchestratorState {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running(_))
    }
}

/// What one cycle did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Nothing to do (already completed, deleted, cancelled, or out of retries)
    Skipped(&'static str),
    /// The lock is held elsewhere; this cycle was abandoned
    LockUnavailable(String),
    /// The cycle ran and left the status file in this state
    Finished(ExecutionStatus),
}

/// Construction knobs
#[derive(Debug, Clone, Default)]
pub struct OrchestratorOptions {
    /// Lock owner identity; generated when `None`
    pub owner_id: Option<String>,
    pub timing: ProvisionerTiming,
    /// Run the background status refresher while started
    pub refresher: bool,
}
