//! Execution state of the provisioning worker
//!
//! `ExecutionStatus` is persisted verbatim in the status file, so the
//! serialized names must remain stable across releases.
//!
//! ```text
//! Idle -> Running -> {Completed, Failed, Retrying}
//! Retrying -> Running
//! Idle/Completed -> DeletionScheduled -> Deleting -> {Deleted, DeletionFailed}
//! ```

use serde::{Deserialize, Serialize};

/// Lifecycle status of a setup or deletion run
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
    strum::EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum ExecutionStatus {
    /// Nothing has run yet
    #[default]
    Idle,
    /// A setup cycle is in progress
    Running,
    /// All managed tables exist and validated
    Completed,
    /// Setup failed permanently (retry budget exhausted or run-once failure)
    Failed,
    /// Setup failed and will be retried on the next scheduled tick
    Retrying,
    /// Deletion has been requested and waits for the next cycle
    DeletionScheduled,
    /// A deletion cycle is in progress
    Deleting,
    /// All managed tables were deleted
    Deleted,
    /// Deletion failed
    DeletionFailed,
}

impl ExecutionStatus {
    /// A cycle is actively working in this state
    pub fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::Deleting)
    }

    /// Terminal states close a run: end time and duration are recorded
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Deleted | Self::DeletionFailed
        )
    }

    /// Terminal states that count as a successful outcome
    pub fn is_success(self) -> bool {
        matches!(self, Self::Completed | Self::Deleted)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// Re-entering `Running` or `Deleting` is allowed from any quiescent
    /// state so that forced re-runs and restarts after a crash work.
    pub fn can_transition_to(self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        match (self, next) {
            (a, b) if a == b => true,
            (Running, Completed | Failed | Retrying) => true,
            (Running, _) => false,
            (Deleting, Deleted | DeletionFailed) => true,
            (Deleting, _) => false,
            (_, Running) => true,
            (Idle | Completed | Failed | Retrying | Deleted | DeletionFailed, DeletionScheduled) => {
                true
            }
            (DeletionScheduled, Deleting) => true,
            (_, Idle) => true,
            _ => false,
        }
    }

    /// Parse from string, returning None for unknown values
    pub fn parse(s: &str) -> Option<Self> {
        s.parse().ok()
    }
}
