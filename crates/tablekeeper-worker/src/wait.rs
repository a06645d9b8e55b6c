//! Polling with backoff and cancellation support.
//!
//! Waits on a table (or any async condition) until a check reports ready.
//! Timeouts and cancellation surface as [`WorkerError::Timeout`] and
//! [`WorkerError::Cancelled`] so callers can tell them apart.

use crate::error::WorkerError;
use anyhow::Result;
use backon::{BackoffBuilder, ExponentialBuilder};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Configuration for resource waiting.
#[derive(Debug, Clone)]
pub struct WaitConfig {
    /// Delay after the first failed check
    pub initial_delay: Duration,
    /// Cap for exponential growth
    pub max_delay: Duration,
    /// Maximum total time to wait before timeout
    pub timeout: Duration,
    /// Growth factor between delays (1.0 polls at a fixed interval)
    pub factor: f32,
    /// Randomize delays
    pub jitter: bool,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            timeout: Duration::from_secs(60),
            factor: 2.0,
            jitter: true,
        }
    }
}

impl WaitConfig {
    /// Poll every `interval` until `timeout`
    pub fn fixed(interval: Duration, timeout: Duration) -> Self {
        Self {
            initial_delay: interval,
            max_delay: interval,
            timeout,
            factor: 1.0,
            jitter: false,
        }
    }
}

/// Sleep for `duration` unless `cancel` fires first.
pub async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> Result<()> {
    tokio::select! {
        _ = tokio::time::sleep(duration) => Ok(()),
        _ = cancel.cancelled() => Err(WorkerError::Cancelled.into()),
    }
}

/// Wait for a resource to become ready.
///
/// `check` returns `Ok(true)` when ready and `Ok(false)` to poll again; an
/// error from `check` ends the wait immediately.
///
/// # Example
/// ```ignore
/// wait_for_resource(
///     WaitConfig::fixed(Duration::from_secs(15), Duration::from_secs(600)),
///     &cancel,
///     || async { Ok(tables.describe_table(name).await?.is_active()) },
///     name,
/// ).await?;
/// ```
pub async fn wait_for_resource<F, Fut>(
    config: WaitConfig,
    cancel: &CancellationToken,
    check: F,
    resource_name: &str,
) -> Result<()>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let start = Instant::now();
    let mut attempts = 0u32;

    let mut builder = ExponentialBuilder::default()
        .with_min_delay(config.initial_delay)
        .with_max_delay(config.max_delay)
        .with_factor(config.factor)
        .without_max_times();
    if config.jitter {
        builder = builder.with_jitter();
    }
    let mut delays = builder.build();

    loop {
        attempts += 1;

        if cancel.is_cancelled() {
            return Err(WorkerError::Cancelled.into());
        }

        if start.elapsed() >= config.timeout {
            warn!(resource = %resource_name, attempts, "Gave up waiting for resource");
            return Err(WorkerError::timeout(format!("wait for {resource_name}"), config.timeout).into());
        }

        match check().await {
            Ok(true) => {
                debug!(resource = %resource_name, attempts, "Resource ready");
                return Ok(());
            }
            Ok(false) => {
                let remaining = config.timeout.saturating_sub(start.elapsed());
                let delay = delays.next().unwrap_or(config.max_delay).min(remaining);
                debug!(
                    resource = %resource_name,
                    attempt = attempts,
                    delay_ms = delay.as_millis(),
                    "Resource not ready, retrying"
                );
                sleep_or_cancel(delay, cancel).await?;
            }
            Err(e) => {
                warn!(resource = %resource_name, error = ?e, "Resource check failed");
                return Err(e);
            }
        }
    }
}
