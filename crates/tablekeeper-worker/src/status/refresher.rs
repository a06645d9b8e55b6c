//! Background status reconciliation
//!
//! A scheduler task enqueues a full refresh every interval and a worker task
//! drains the queue. Requests never block: when the queue is full they are
//! dropped.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use serde_json::Value;
use tablekeeper_common::defaults::{REFRESH_TIMEOUT, SHUTDOWN_GRACE};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::fetcher::FastResourceStatusFetcher;
use super::manager::StatusManager;
use super::types::meta;

/// What to refresh
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshRequest {
    All,
    Resource(String),
}

/// Refresher timing
#[derive(Debug, Clone)]
pub struct RefresherConfig {
    pub interval: Duration,
    pub queue_capacity: usize,
    pub timeout: Duration,
    pub shutdown_grace: Duration,
}

impl RefresherConfig {
    pub fn new(interval: Duration, queue_capacity: usize) -> Self {
        Self {
            interval,
            queue_capacity: queue_capacity.max(1),
            timeout: REFRESH_TIMEOUT,
            shutdown_grace: SHUTDOWN_GRACE,
        }
    }
}

/// Handle to the running refresher tasks
pub struct LightweightStatusRefresher {
    requests: mpsc::Sender<RefreshRequest>,
    shutdown: CancellationToken,
    shutdown_grace: Duration,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl LightweightStatusRefresher {
    /// Spawn the scheduler and worker tasks for `tables`
    pub fn start(
        status: Arc<StatusManager>,
        fetcher: FastResourceStatusFetcher,
        tables: Vec<String>,
        config: RefresherConfig,
        parent: &CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let shutdown = parent.child_token();

        let scheduler = tokio::spawn(run_scheduler(
            tx.clone(),
            config.interval,
            shutdown.clone(),
        ));
        let worker = tokio::spawn(
            RefreshWorker {
                status,
                fetcher,
                tables,
                timeout: config.timeout,
            }
            .run(rx, shutdown.clone()),
        );

        info!(interval = ?config.interval, "Status refresher started");
        Self {
            requests: tx,
            shutdown,
            shutdown_grace: config.shutdown_grace,
            tasks: Mutex::new(vec![scheduler, worker]),
        }
    }

    /// Queue a refresh of one table. Returns false if the request was dropped.
    pub fn request_refresh(&self, table: impl Into<String>) -> bool {
        self.enqueue(RefreshRequest::Resource(table.into()))
    }

    /// Queue a refresh of every table. Returns false if the request was dropped.
    pub fn request_refresh_all(&self) -> bool {
        self.enqueue(RefreshRequest::All)
    }

    fn enqueue(&self, request: RefreshRequest) -> bool {
        match self.requests.try_send(request) {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, "Refresh request dropped");
                false
            }
        }
    }

    /// Signal both tasks and wait up to the grace period. Idempotent.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        if tasks.is_empty() {
            return;
        }

        let aborts: Vec<_> = tasks.iter().map(JoinHandle::abort_handle).collect();
        if tokio::time::timeout(self.shutdown_grace, futures::future::join_all(tasks))
            .await
            .is_err()
        {
            warn!(grace = ?self.shutdown_grace, "Status refresher did not stop in time, aborting");
            for abort in aborts {
                abort.abort();
            }
        } else {
            debug!("Status refresher stopped");
        }
    }
}

async fn run_scheduler(
    requests: mpsc::Sender<RefreshRequest>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                if requests.try_send(RefreshRequest::All).is_err() {
                    debug!("Refresh queue full, skipping scheduled refresh");
                }
            }
        }
    }
}

struct RefreshWorker {
    status: Arc<StatusManager>,
    fetcher: FastResourceStatusFetcher,
    tables: Vec<String>,
    timeout: Duration,
}

impl RefreshWorker {
    async fn run(self, mut requests: mpsc::Receiver<RefreshRequest>, shutdown: CancellationToken) {
        loop {
            let request = tokio::select! {
                _ = shutdown.cancelled() => break,
                request = requests.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };

            let started = Instant::now();
            let cancel = shutdown.child_token();
            match tokio::time::timeout(self.timeout, self.refresh(&request, &cancel)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(request = ?request, error = ?e, "Status refresh failed"),
                Err(_) => {
                    cancel.cancel();
                    warn!(request = ?request, timeout = ?self.timeout, "Status refresh timed out");
                }
            }

            let elapsed = started.elapsed();
            if elapsed > self.timeout / 2 {
                warn!(request = ?request, elapsed_ms = elapsed.as_millis(), "Slow status refresh");
            }
        }
    }

    async fn refresh(&self, request: &RefreshRequest, cancel: &CancellationToken) -> Result<()> {
        if self.status.load_status().await?.is_none() {
            debug!("No status file yet, skipping refresh");
            return Ok(());
        }

        match request {
            RefreshRequest::Resource(table) => {
                self.status
                    .add_resource_status_live(table, &self.fetcher, cancel)
                    .await?;
            }
            RefreshRequest::All => {
                let deadline = Instant::now() + self.timeout;
                let statuses = self
                    .fetcher
                    .batch_get_statuses_fast(&self.tables, cancel, Some(deadline))
                    .await;
                self.status.merge_resource_statuses(statuses).await?;
                self.status
                    .patch_metadata(BTreeMap::from([(
                        meta::LAST_REFRESH.to_string(),
                        Value::String(Utc::now().to_rfc3339()),
                    )]))
                    .await?;
            }
        }
        Ok(())
    }
}
