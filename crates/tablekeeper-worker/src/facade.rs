//! Read-mostly service wrapper for callers outside the worker
//!
//! Every method either reads the status file or calls an orchestrator
//! method that does its own locking, so a `SetupService` can be shared
//! freely between request handlers.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tablekeeper_common::ExecutionStatus;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::{FacadeError, WorkerError};
use crate::orchestrator::{Orchestrator, OrchestratorState, RunMode};
use crate::status::{ExecutionResult, ResourceStatus};

const COMPLETION_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Dashboard view of the latest run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub status: ExecutionStatus,
    pub message: String,
    pub retry_count: u32,
    pub max_retries: u32,
    pub error_message: Option<String>,
    pub resources: Vec<ResourceStatus>,
    pub last_updated: Option<DateTime<Utc>>,
}

impl HealthStatus {
    /// Healthy means a real setup completed and every recorded table is ACTIVE
    pub fn from_result(result: Option<&ExecutionResult>, max_retries: u32) -> Self {
        match result {
            Some(result) => Self {
                healthy: result.is_setup_completed()
                    && result.resources.iter().all(ResourceStatus::is_active),
                status: result.status,
                message: result.message.clone(),
                retry_count: result.retry_count,
                max_retries,
                error_message: result.error_message.clone(),
                resources: result.resources.clone(),
                last_updated: Some(result.end_time.unwrap_or(result.start_time)),
            },
            None => Self {
                healthy: false,
                status: ExecutionStatus::Idle,
                message: "No setup has run yet".to_string(),
                retry_count: 0,
                max_retries,
                error_message: None,
                resources: Vec::new(),
                last_updated: None,
            },
        }
    }
}

#[derive(Clone)]
pub struct SetupService {
    orchestrator: Arc<Orchestrator>,
}

impl SetupService {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// The latest persisted result, verbatim
    pub async fn get_status(&self) -> Result<Option<ExecutionResult>> {
        self.orchestrator.status_manager().load_status().await
    }

    pub async fn is_setup_completed(&self) -> Result<bool> {
        self.orchestrator.status_manager().is_setup_completed().await
    }

    pub async fn get_health_status(&self) -> Result<HealthStatus> {
        let result = self.get_status().await?;
        Ok(HealthStatus::from_result(
            result.as_ref(),
            self.orchestrator.config().max_retries(),
        ))
    }

    /// Clear the status file and run a cycle now.
    ///
    /// Requires a scheduled or monitoring worker; any other worker is left
    /// untouched.
    pub async fn force_setup(&self) -> Result<()> {
        match self.orchestrator.state().await {
            OrchestratorState::Running(RunMode::RunOnce) => {
                return Err(WorkerError::NotTriggerable.into());
            }
            OrchestratorState::Running(_) => {}
            OrchestratorState::Created => return Err(WorkerError::NotRunning.into()),
            OrchestratorState::Stopped => return Err(WorkerError::Stopped.into()),
        }
        self.orchestrator.status_manager().reset_status().await?;
        self.orchestrator.trigger_cycle().await?;
        info!("Forced setup triggered");
        Ok(())
    }

    /// Poll once a second until setup completes.
    ///
    /// Fails with [`FacadeError::StoppedBeforeCompletion`] if the worker stops
    /// first, or [`FacadeError::TimedOut`] after `timeout_secs`.
    pub async fn wait_for_completion(&self, timeout_secs: u64) -> Result<ExecutionResult> {
        let deadline = Instant::now() + Duration::from_secs(timeout_secs);
        loop {
            if let Some(result) = self.get_status().await? {
                if result.is_setup_completed() {
                    return Ok(result);
                }
            }
            if self.orchestrator.state().await == OrchestratorState::Stopped {
                return Err(FacadeError::StoppedBeforeCompletion.into());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(FacadeError::TimedOut {
                    seconds: timeout_secs,
                }
                .into());
            }

            let wake = deadline.min(now + COMPLETION_POLL_INTERVAL);
            tokio::select! {
                _ = tokio::time::sleep_until(wake) => {}
                _ = self.orchestrator.wait_stopped() => {}
            }
        }
    }

    /// Ask the background refresher to reconcile live table statuses
    pub fn refresh_status(&self, table: Option<&str>) -> bool {
        self.orchestrator.request_refresh(table)
    }

    pub async fn schedule_delete(&self) -> Result<()> {
        self.orchestrator.schedule_delete().await
    }

    /// Force a setup when unhealthy and idle. Returns whether one was triggered.
    ///
    /// Tables that were deliberately deleted, or are about to be, are left
    /// alone.
    pub async fn restart_if_unhealthy(&self) -> Result<bool> {
        let result = self.get_status().await?;
        let health =
            HealthStatus::from_result(result.as_ref(), self.orchestrator.config().max_retries());
        if health.healthy || health.status.is_active() || self.orchestrator.cycle_in_progress() {
            return Ok(false);
        }
        let deleted = result
            .as_ref()
            .is_some_and(|r| r.status == ExecutionStatus::Deleted && !r.is_dry_run());
        if deleted
            || health.status == ExecutionStatus::DeletionScheduled
            || self.orchestrator.flags().await.deletion_pending()
        {
            debug!(status = %health.status, "Deletion requested, not restarting");
            return Ok(false);
        }
        info!(status = %health.status, "Unhealthy, forcing setup");
        self.force_setup().await?;
        Ok(true)
    }
}
