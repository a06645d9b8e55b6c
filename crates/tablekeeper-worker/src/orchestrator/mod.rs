//! The provisioning state machine
//!
//! One `Orchestrator` per process. It owns the lock and status managers,
//! the provisioner and the background tasks, and moves the status file
//! through its states:
//!
//! ```text
//! Idle -> Running -> {Completed, Failed, Retrying}, Retrying -> Running
//! Idle/Completed -> DeletionScheduled -> Deleting -> {Deleted, DeletionFailed}
//! ```

pub mod retry;
pub mod schedule;
pub mod types;

pub use retry::backoff_delay;
pub use schedule::Schedule;
pub use types::{CycleOutcome, OrchestratorOptions, OrchestratorState, RunMode};

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::{Context, Result};
use chrono::Utc;
use futures::FutureExt;
use serde_json::Value;
use tablekeeper_common::ExecutionStatus;
use tablekeeper_common::defaults::{CYCLE_TIMEOUT, SHUTDOWN_GRACE};
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::aws::TableOperations;
use crate::catalog;
use crate::config::{Environment, RuntimeFlags, WorkerConfig};
use crate::error::{LockError, WorkerError, is_cancelled};
use crate::lock::{LockGuard, LockManager};
use crate::provisioner::{ProvisionOptions, ResourceProvisioner};
use crate::status::{
    FastResourceStatusFetcher, LightweightStatusRefresher, RefresherConfig, ResourceStatus,
    StatusManager, meta,
};

pub struct Orchestrator {
    owner_id: String,
    config: WorkerConfig,
    schedule: Schedule,
    flags: RwLock<RuntimeFlags>,
    state: Mutex<OrchestratorState>,
    /// Held for the duration of a cycle so cycles never overlap
    cycle: Mutex<()>,
    lock: Arc<LockManager>,
    status: Arc<StatusManager>,
    provisioner: ResourceProvisioner,
    fetcher: FastResourceStatusFetcher,
    /// Execution context threaded through every blocking call
    context: CancellationToken,
    /// Cancelled once the worker has fully stopped
    stopped: CancellationToken,
    trigger: Notify,
    refresher_enabled: bool,
    refresher: StdMutex<Option<LightweightStatusRefresher>>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn new(config: WorkerConfig, tables: Arc<dyn TableOperations>) -> Result<Arc<Self>> {
        Self::with_options(
            config,
            tables,
            OrchestratorOptions {
                refresher: true,
                ..Default::default()
            },
        )
    }

    /// Validate `config` and build the worker. Invalid configuration is fatal.
    pub fn with_options(
        config: WorkerConfig,
        tables: Arc<dyn TableOperations>,
        options: OrchestratorOptions,
    ) -> Result<Arc<Self>> {
        config.validate().context("Invalid worker configuration")?;
        let schedule = config.schedule()?;
        let descriptors = catalog::descriptors_for(&config)?;

        let owner_id = options
            .owner_id
            .unwrap_or_else(|| format!("worker-{}-{}", std::process::id(), Uuid::new_v4().simple()));
        let lock = Arc::new(LockManager::new(&config.lock, config.environment));
        let status = Arc::new(StatusManager::new(&config.status.path, config.environment));
        let fetcher = FastResourceStatusFetcher::new(tables.clone());
        let provisioner = ResourceProvisioner::new(tables, descriptors).with_timing(options.timing);

        info!(
            owner = %owner_id,
            environment = %config.environment,
            schedule = %schedule,
            tables = ?provisioner.table_names(),
            "Orchestrator created"
        );

        Ok(Arc::new(Self {
            owner_id,
            flags: RwLock::new(config.flags.clone()),
            schedule,
            config,
            state: Mutex::new(OrchestratorState::Created),
            cycle: Mutex::new(()),
            lock,
            status,
            provisioner,
            fetcher,
            context: CancellationToken::new(),
            stopped: CancellationToken::new(),
            trigger: Notify::new(),
            refresher_enabled: options.refresher,
            refresher: StdMutex::new(None),
            tasks: StdMutex::new(Vec::new()),
        }))
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    pub fn status_manager(&self) -> &Arc<StatusManager> {
        &self.status
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lock
    }

    pub fn table_names(&self) -> Vec<String> {
        self.provisioner.table_names()
    }

    pub async fn state(&self) -> OrchestratorState {
        *self.state.lock().await
    }

    pub async fn is_running(&self) -> bool {
        self.state().await.is_running()
    }

    pub async fn flags(&self) -> RuntimeFlags {
        self.flags.read().await.clone()
    }

    /// Whether a cycle is executing right now
    pub fn cycle_in_progress(&self) -> bool {
        self.cycle.try_lock().is_err()
    }

    /// Resolves once `stop` has finished
    pub async fn wait_stopped(&self) {
        self.stopped.cancelled().await
    }

    /// Start the worker in the mode the persisted status and flags call for.
    pub async fn start(self: &Arc<Self>) -> Result<RunMode> {
        let mut state = self.state.lock().await;
        match *state {
            OrchestratorState::Running(_) => return Err(WorkerError::AlreadyRunning.into()),
            OrchestratorState::Stopped => return Err(WorkerError::Stopped.into()),
            OrchestratorState::Created => {}
        }
        if self.context.is_cancelled() {
            return Err(WorkerError::Stopped.into());
        }

        let flags = self.flags().await;
        let completed = self
            .status
            .load_status()
            .await?
            .is_some_and(|r| r.is_setup_completed());

        let mode = if completed && !flags.force_recreate && !flags.deletion_pending() {
            RunMode::Monitoring
        } else if flags.run_once {
            RunMode::RunOnce
        } else {
            RunMode::Scheduled
        };

        let this = self.clone();
        let handle = match mode {
            RunMode::RunOnce => tokio::spawn(async move {
                this.run_cycle().await;
                this.stop_inner(false).await;
            }),
            RunMode::Scheduled => {
                let immediate = self.config.environment != Environment::Development;
                tokio::spawn(async move { this.run_scheduled(immediate).await })
            }
            RunMode::Monitoring => tokio::spawn(async move { this.run_monitoring().await }),
        };
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);

        if mode != RunMode::RunOnce && self.refresher_enabled {
            let refresher = LightweightStatusRefresher::start(
                self.status.clone(),
                self.fetcher.clone(),
                self.table_names(),
                RefresherConfig::new(
                    self.config.status.refresh_interval,
                    self.config.status.refresh_queue_capacity,
                ),
                &self.context,
            );
            *self.refresher.lock().unwrap_or_else(|e| e.into_inner()) = Some(refresher);
        }

        *state = OrchestratorState::Running(mode);
        info!(owner = %self.owner_id, mode = %mode, "Worker started");
        Ok(mode)
    }

    /// Stop the worker. Idempotent.
    ///
    /// Cancels the execution context first so in-flight polls return, then
    /// waits briefly for background tasks.
    pub async fn stop(&self) {
        self.stop_inner(true).await
    }

    async fn stop_inner(&self, join_tasks: bool) {
        {
            let mut state = self.state.lock().await;
            if *state == OrchestratorState::Stopped {
                return;
            }
            *state = OrchestratorState::Stopped;
        }

        self.context.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        if join_tasks && !tasks.is_empty() {
            let aborts: Vec<_> = tasks.iter().map(JoinHandle::abort_handle).collect();
            if tokio::time::timeout(SHUTDOWN_GRACE, futures::future::join_all(tasks))
                .await
                .is_err()
            {
                warn!("Worker tasks did not stop in time, aborting");
                for abort in aborts {
                    abort.abort();
                }
            }
        }

        let refresher = self.refresher.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(refresher) = refresher {
            refresher.stop().await;
        }

        self.stopped.cancel();
        info!(owner = %self.owner_id, "Worker stopped");
    }

    /// Ask the running worker to execute a cycle now
    pub async fn trigger_cycle(&self) -> Result<()> {
        match *self.state.lock().await {
            OrchestratorState::Running(RunMode::RunOnce) => Err(WorkerError::NotTriggerable.into()),
            OrchestratorState::Running(_) => {
                self.trigger.notify_one();
                Ok(())
            }
            OrchestratorState::Created => Err(WorkerError::NotRunning.into()),
            OrchestratorState::Stopped => Err(WorkerError::Stopped.into()),
        }
    }

    /// Queue a background status refresh for `table`, or every table.
    ///
    /// Returns false when the refresher is not running or its queue is full.
    pub fn request_refresh(&self, table: Option<&str>) -> bool {
        let refresher = self.refresher.lock().unwrap_or_else(|e| e.into_inner());
        match (refresher.as_ref(), table) {
            (Some(refresher), Some(table)) => refresher.request_refresh(table),
            (Some(refresher), None) => refresher.request_refresh_all(),
            (None, _) => false,
        }
    }

    /// Request deletion of every managed table on the next cycle.
    ///
    /// Fails if a deletion is already pending; the flags are left untouched.
    pub async fn schedule_delete(&self) -> Result<()> {
        let _state = self.state.lock().await;
        {
            let mut flags = self.flags.write().await;
            if flags.deletion_scheduled {
                return Err(WorkerError::DeletionAlreadyScheduled.into());
            }
            flags.deletion_scheduled = true;
            flags.deletion_requested = true;
        }

        if let Err(e) = self
            .status
            .update_progress(
                ExecutionStatus::DeletionScheduled,
                "Deletion scheduled for next cycle",
                BTreeMap::new(),
            )
            .await
        {
            let mut flags = self.flags.write().await;
            flags.deletion_scheduled = false;
            flags.deletion_requested = false;
            return Err(e);
        }

        info!(owner = %self.owner_id, "Deletion scheduled");
        Ok(())
    }

    async fn run_scheduled(self: Arc<Self>, immediate: bool) {
        if immediate {
            self.run_cycle().await;
        }

        let interval = self.schedule.interval();
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.context.cancelled() => break,
                _ = ticker.tick() => {}
                _ = self.trigger.notified() => debug!("Cycle triggered"),
            }
            self.run_cycle().await;
        }
    }

    async fn run_monitoring(self: Arc<Self>) {
        let interval = self.config.schedule.monitoring_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.context.cancelled() => break,
                _ = ticker.tick() => {
                    match self.cycle_pending().await {
                        Ok(true) => {
                            self.run_cycle().await;
                        }
                        Ok(false) => {
                            if let Err(e) = self.health_check().await {
                                warn!(error = ?e, "Health check failed");
                            }
                        }
                        Err(e) => warn!(error = ?e, "Failed to read status"),
                    }
                }
                _ = self.trigger.notified() => {
                    debug!("Cycle triggered");
                    self.run_cycle().await;
                }
            }
        }
    }

    /// Whether a monitoring tick owes a cycle: a pending deletion, or a forced
    /// setup that failed with retry budget left
    async fn cycle_pending(&self) -> Result<bool> {
        if self.flags().await.deletion_pending() {
            return Ok(true);
        }
        let pending = self.status.load_status().await?.is_some_and(|r| match r.status {
            ExecutionStatus::Retrying => true,
            ExecutionStatus::Failed => r.retry_count < self.config.max_retries(),
            _ => false,
        });
        Ok(pending)
    }

    /// Run one cycle, converting a panic into a `Failed` status
    pub async fn run_cycle(&self) -> Option<CycleOutcome> {
        match AssertUnwindSafe(self.execute_cycle()).catch_unwind().await {
            Ok(Ok(outcome)) => {
                debug!(outcome = ?outcome, "Cycle finished");
                Some(outcome)
            }
            Ok(Err(e)) => {
                error!(error = ?e, "Cycle failed");
                None
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(panic = %message, "Cycle panicked");
                let error = WorkerError::Panic(message.clone()).to_string();
                if let Err(e) = self.status.mark_failed(&error).await {
                    error!(error = ?e, "Failed to record panic");
                }
                let metadata = BTreeMap::from([(meta::PANIC.to_string(), Value::String(message))]);
                if let Err(e) = self.status.patch_metadata(metadata).await {
                    error!(error = ?e, "Failed to record panic");
                }
                Some(CycleOutcome::Finished(ExecutionStatus::Failed))
            }
        }
    }

    /// One setup-or-delete pass under the lock.
    ///
    /// Errors returned here are infrastructure failures (status file I/O);
    /// provisioning failures are recorded in the status file and reported
    /// through the outcome.
    pub async fn execute_cycle(&self) -> Result<CycleOutcome> {
        let _cycle = self.cycle.lock().await;
        let deadline = Instant::now() + CYCLE_TIMEOUT;
        let cancel = self.context.child_token();

        if cancel.is_cancelled() {
            return Ok(CycleOutcome::Skipped("worker stopping"));
        }

        let flags = self.flags().await;
        let current = self.status.load_status().await?;
        let deleting = flags.deletion_pending();

        if !deleting && !flags.force_recreate {
            if let Some(current) = &current {
                if current.is_setup_completed() {
                    debug!("Setup already completed, skipping cycle");
                    return Ok(CycleOutcome::Skipped("setup already completed"));
                }
                if current.status == ExecutionStatus::Deleted && !current.is_dry_run() {
                    debug!("Tables deleted, skipping cycle");
                    return Ok(CycleOutcome::Skipped("tables deleted"));
                }
                if current.status == ExecutionStatus::Failed
                    && current.retry_count >= self.config.max_retries()
                {
                    debug!("Retry budget exhausted, skipping cycle");
                    return Ok(CycleOutcome::Skipped("retry budget exhausted"));
                }
            }
        }

        let record = match self.lock.acquire_with_retry(&self.owner_id, &cancel).await {
            Ok(record) => record,
            Err(e) if is_cancelled(&e) => return Ok(CycleOutcome::Skipped("worker stopping")),
            Err(e) => {
                if e.downcast_ref::<LockError>().is_some() {
                    warn!(owner = %self.owner_id, error = %e, "Lock unavailable, skipping cycle");
                } else {
                    error!(owner = %self.owner_id, error = ?e, "Lock acquisition failed");
                }
                let metadata = BTreeMap::from([
                    (meta::LOCK_ERROR.to_string(), Value::String(e.to_string())),
                    (
                        meta::LOCK_ERROR_AT.to_string(),
                        Value::String(Utc::now().to_rfc3339()),
                    ),
                ]);
                self.status.patch_metadata(metadata).await?;
                return Ok(CycleOutcome::LockUnavailable(e.to_string()));
            }
        };
        let guard = LockGuard::new(self.lock.clone(), record);

        let options = ProvisionOptions::from(&flags);
        let outcome = if deleting {
            self.delete_cycle(options, deadline, &cancel).await
        } else {
            self.setup_cycle(options, flags.run_once, deadline, &cancel).await
        };

        drop(guard);
        outcome
    }

    async fn setup_cycle(
        &self,
        options: ProvisionOptions,
        run_once: bool,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<CycleOutcome> {
        let metadata = BTreeMap::from([(
            meta::OWNER_ID.to_string(),
            Value::String(self.owner_id.clone()),
        )]);
        self.status
            .update_progress(ExecutionStatus::Running, "Provisioning tables", metadata)
            .await?;

        let result = tokio::time::timeout_at(
            deadline,
            self.provisioner.execute(&self.status, options, cancel),
        )
        .await;

        let error = match result {
            Ok(Ok(result)) => {
                if result.retry_count > 0 && !options.dry_run {
                    self.status.reset_retry_count().await?;
                }
                return Ok(CycleOutcome::Finished(result.status));
            }
            Ok(Err(e)) => e,
            Err(_) => {
                cancel.cancel();
                WorkerError::timeout("provisioning cycle", CYCLE_TIMEOUT).into()
            }
        };

        let message = format!("{error:#}");
        if run_once || is_cancelled(&error) {
            self.status.mark_failed(&message).await?;
            return Ok(CycleOutcome::Finished(ExecutionStatus::Failed));
        }
        let status = self.handle_retry(&message).await?;
        Ok(CycleOutcome::Finished(status))
    }

    async fn delete_cycle(
        &self,
        options: ProvisionOptions,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<CycleOutcome> {
        self.status
            .update_progress(ExecutionStatus::Deleting, "Deleting tables", BTreeMap::new())
            .await?;

        let result = tokio::time::timeout_at(
            deadline,
            self.provisioner.execute_delete(&self.status, options, cancel),
        )
        .await;

        if let Ok(Err(e)) = &result {
            if is_cancelled(e) {
                // The request survives a shutdown and runs on the next cycle
                self.status
                    .update_progress(
                        ExecutionStatus::DeletionScheduled,
                        "Deletion interrupted, still scheduled",
                        BTreeMap::new(),
                    )
                    .await?;
                return Ok(CycleOutcome::Skipped("worker stopping"));
            }
        }

        {
            let mut flags = self.flags.write().await;
            flags.deletion_scheduled = false;
            flags.deletion_requested = false;
        }

        match result {
            Ok(Ok(result)) => Ok(CycleOutcome::Finished(result.status)),
            Ok(Err(e)) => {
                warn!(error = ?e, "Deletion failed");
                Ok(CycleOutcome::Finished(ExecutionStatus::DeletionFailed))
            }
            Err(_) => {
                cancel.cancel();
                let error = WorkerError::timeout("deletion cycle", CYCLE_TIMEOUT);
                self.status.mark_deletion_failed(&error.to_string()).await?;
                Ok(CycleOutcome::Finished(ExecutionStatus::DeletionFailed))
            }
        }
    }

    /// Escalate a failed cycle: schedule a retry or fail permanently.
    ///
    /// The next scheduled tick performs the retry. Cancelled and run-once
    /// cycles never get here.
    async fn handle_retry(&self, error: &str) -> Result<ExecutionStatus> {
        let retries = self.status.get_retry_count().await?;
        let max = self.config.max_retries();
        if retries >= max {
            error!(retries, max, error = %error, "Retry budget exhausted");
            self.status.mark_failed(error).await?;
            return Ok(ExecutionStatus::Failed);
        }

        let delay = backoff_delay(self.config.retry.base_delay, self.config.retry.multiplier, retries);
        let next_retry_at = Utc::now() + chrono::Duration::from_std(delay)?;
        self.status.mark_retrying(error, next_retry_at, delay).await?;
        Ok(ExecutionStatus::Retrying)
    }

    /// Fetch live status for every table and record whether all are ACTIVE
    pub async fn health_check(&self) -> Result<bool> {
        let statuses = self
            .fetcher
            .batch_get_statuses_fast(&self.table_names(), &self.context, None)
            .await;
        let healthy = statuses.iter().all(ResourceStatus::is_active);
        for resource in statuses.iter().filter(|r| !r.is_active()) {
            warn!(table = %resource.name, status = %resource.status, "Table not active");
        }

        self.status.merge_resource_statuses(statuses).await?;
        self.status
            .patch_metadata(BTreeMap::from([
                (
                    meta::LAST_HEALTH_CHECK.to_string(),
                    Value::String(Utc::now().to_rfc3339()),
                ),
                (meta::HEALTHY.to_string(), Value::Bool(healthy)),
            ]))
            .await?;
        info!(healthy, "Health check complete");
        Ok(healthy)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
