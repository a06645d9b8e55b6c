//! Short-timeout live status lookups
//!
//! Used by the status manager, the background refresher and health checks.
//! Every describe is individually bounded, and a batch is bounded as a
//! whole, so a slow provider can delay a caller by at most a few seconds.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tablekeeper_common::defaults::{
    BATCH_STATUS_CEILING, BATCH_STATUS_CONCURRENCY, FAST_STATUS_TIMEOUT,
};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::types::{ResourceStatus, STATUS_ERROR, STATUS_NOT_FOUND};
use crate::aws::{TableOperations, classify_anyhow_error};
use crate::error::WorkerError;

/// Bounded live status fetcher
#[derive(Clone)]
pub struct FastResourceStatusFetcher {
    tables: Arc<dyn TableOperations>,
    timeout: Duration,
    ceiling: Duration,
    concurrency: usize,
}

impl FastResourceStatusFetcher {
    pub fn new(tables: Arc<dyn TableOperations>) -> Self {
        Self {
            tables,
            timeout: FAST_STATUS_TIMEOUT,
            ceiling: BATCH_STATUS_CEILING,
            concurrency: BATCH_STATUS_CONCURRENCY,
        }
    }

    /// Override the per-call timeout, batch ceiling and concurrency cap
    pub fn with_limits(mut self, timeout: Duration, ceiling: Duration, concurrency: usize) -> Self {
        self.timeout = timeout;
        self.ceiling = ceiling;
        self.concurrency = concurrency.max(1);
        self
    }

    /// Describe one table within the per-call timeout.
    ///
    /// An absent table is reported as `NOT_FOUND`, not as an error.
    pub async fn get_status_fast(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<ResourceStatus> {
        let describe = tokio::time::timeout(self.timeout, self.tables.describe_table(name));
        let outcome = tokio::select! {
            outcome = describe => outcome,
            _ = cancel.cancelled() => return Err(WorkerError::Cancelled.into()),
        };

        match outcome {
            Ok(Ok(table)) => Ok(ResourceStatus::from(&table)),
            Ok(Err(e)) if classify_anyhow_error(&e).is_not_found() => {
                Ok(ResourceStatus::sentinel(name, STATUS_NOT_FOUND))
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(WorkerError::timeout(format!("describe {name}"), self.timeout).into()),
        }
    }

    /// Fetch statuses for `names`, in input order.
    ///
    /// At most `concurrency` describes run at once. The whole call stops
    /// waiting at the batch ceiling, at `deadline` if that is sooner, or on
    /// cancellation. Tables without an answer are reported as `ERROR`.
    pub async fn batch_get_statuses_fast(
        &self,
        names: &[String],
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> Vec<ResourceStatus> {
        let ceiling = Instant::now() + self.ceiling;
        let deadline = deadline.map_or(ceiling, |d| d.min(ceiling));

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let results = Arc::new(Mutex::new(HashMap::<String, ResourceStatus>::with_capacity(
            names.len(),
        )));
        let batch_cancel = cancel.child_token();
        let mut tasks = JoinSet::new();

        for name in names {
            let fetcher = self.clone();
            let name = name.clone();
            let semaphore = semaphore.clone();
            let results = results.clone();
            let cancel = batch_cancel.clone();

            tasks.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return;
                };
                let status = match fetcher.get_status_fast(&name, &cancel).await {
                    Ok(status) => status,
                    Err(e) => {
                        debug!(table = %name, error = %e, "Status fetch failed");
                        ResourceStatus::sentinel(&name, STATUS_ERROR)
                    }
                };
                results.lock().await.insert(name, status);
            });
        }

        let finished = tokio::select! {
            _ = async { while tasks.join_next().await.is_some() {} } => true,
            _ = tokio::time::sleep_until(deadline) => false,
            _ = cancel.cancelled() => false,
        };
        if !finished {
            warn!(
                tables = names.len(),
                "Batch status fetch stopped before every table answered"
            );
            batch_cancel.cancel();
            tasks.abort_all();
        }

        let results = results.lock().await;
        names
            .iter()
            .map(|name| {
                results
                    .get(name)
                    .cloned()
                    .unwrap_or_else(|| ResourceStatus::sentinel(name, STATUS_ERROR))
            })
            .collect()
    }
}
