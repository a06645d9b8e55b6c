//! Configuration fixtures

use std::path::Path;
use std::time::Duration;

use tablekeeper_worker::config::WorkerConfig;
use tablekeeper_worker::orchestrator::OrchestratorOptions;
use tablekeeper_worker::provisioner::ProvisionerTiming;

/// A valid config managing `users` and `roles`, with lock and status files
/// under `dir` and short retry intervals.
pub fn test_config(dir: &Path) -> WorkerConfig {
    let mut config = WorkerConfig::default();
    config.tables.required = vec!["users".to_string(), "roles".to_string()];
    config.lock.path = dir.join("worker.lock");
    config.lock.retry_interval = Duration::from_millis(10);
    config.lock.attempts = 2;
    config.status.path = dir.join("setup-status.json");
    config.retry.base_delay = Duration::from_secs(1);
    config
}

/// Millisecond-scale retry and polling budgets
pub fn fast_timing() -> ProvisionerTiming {
    ProvisionerTiming {
        attempts: 3,
        retry_step: Duration::from_millis(5),
        active_poll: Duration::from_millis(5),
        active_timeout: Duration::from_secs(2),
        deletion_poll: Duration::from_millis(5),
        deletion_timeout: Duration::from_secs(2),
    }
}

/// Orchestrator options with `fast_timing` and no background refresher
pub fn test_options(owner_id: &str) -> OrchestratorOptions {
    OrchestratorOptions {
        owner_id: Some(owner_id.to_string()),
        timing: fast_timing(),
        refresher: false,
    }
}
