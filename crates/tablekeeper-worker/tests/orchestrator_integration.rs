//! Orchestrator and facade lifecycle tests against the in-memory table store

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tablekeeper_common::ExecutionStatus;
use tablekeeper_test_utils::{InMemoryTableStore, test_config, test_options};
use tablekeeper_worker::aws::{TableOperations, TableState};
use tablekeeper_worker::config::WorkerConfig;
use tablekeeper_worker::error::{FacadeError, WorkerError};
use tablekeeper_worker::lock::LockManager;
use tablekeeper_worker::orchestrator::{CycleOutcome, OrchestratorState, RunMode};
use tablekeeper_worker::status::meta;
use tablekeeper_worker::{Orchestrator, SetupService};
use tempfile::TempDir;

fn worker(config: WorkerConfig, store: &Arc<InMemoryTableStore>, owner: &str) -> Arc<Orchestrator> {
    Orchestrator::with_options(config, store.clone(), test_options(owner))
        .expect("valid test config")
}

async fn wait_stopped(worker: &Orchestrator) {
    tokio::time::timeout(Duration::from_secs(10), worker.wait_stopped())
        .await
        .expect("worker should stop");
}

/// A lock held elsewhere aborts the cycle, not the worker
#[tokio::test]
async fn test_foreign_lock_skips_cycle_and_worker_stays_scheduled() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());
    let foreign = LockManager::new(&config.lock, config.environment);
    let held = foreign.acquire_lock("owner-A").unwrap();

    let store = Arc::new(InMemoryTableStore::new());
    let worker = worker(config, &store, "owner-B");
    assert_eq!(worker.start().await.unwrap(), RunMode::Scheduled);

    let outcome = worker.execute_cycle().await.unwrap();
    let CycleOutcome::LockUnavailable(message) = outcome else {
        panic!("expected lock failure, got {outcome:?}");
    };
    assert!(message.contains("owner-A"));

    assert_eq!(
        worker.state().await,
        OrchestratorState::Running(RunMode::Scheduled)
    );
    assert_eq!(store.create_calls(), 0);
    assert_eq!(foreign.current().unwrap().unwrap().id, held.id);

    let saved = worker.status_manager().load_status().await.unwrap().unwrap();
    assert!(saved.metadata.contains_key(meta::LOCK_ERROR));
    assert!(worker.trigger_cycle().await.is_ok());

    worker.stop().await;
}

/// Each failed cycle bumps the retry count until the budget is spent
#[tokio::test]
async fn test_repeated_cycle_failures_become_terminal() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path());
    config.retry.max_retries = 2;
    let store = Arc::new(InMemoryTableStore::new());
    store.fail_creates(u32::MAX);
    let worker = worker(config, &store, "owner");

    let mut counts = Vec::new();
    let mut statuses = Vec::new();
    for _ in 0..3 {
        let outcome = worker.execute_cycle().await.unwrap();
        let CycleOutcome::Finished(status) = outcome else {
            panic!("expected a finished cycle, got {outcome:?}");
        };
        statuses.push(status);
        counts.push(worker.status_manager().get_retry_count().await.unwrap());
    }

    assert_eq!(
        statuses,
        vec![
            ExecutionStatus::Retrying,
            ExecutionStatus::Retrying,
            ExecutionStatus::Failed
        ]
    );
    assert_eq!(counts, vec![1, 2, 2]);

    let saved = worker.status_manager().load_status().await.unwrap().unwrap();
    assert_eq!(saved.status, ExecutionStatus::Failed);
    assert_eq!(saved.retry_count, 2);
    assert!(saved.error_message.is_some());

    // No further automatic retry
    let creates = store.create_calls();
    assert_eq!(
        worker.execute_cycle().await.unwrap(),
        CycleOutcome::Skipped("retry budget exhausted")
    );
    assert_eq!(store.create_calls(), creates);
}

#[tokio::test]
async fn test_retrying_records_next_attempt() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(InMemoryTableStore::new());
    store.fail_creates(u32::MAX);
    let worker = worker(test_config(dir.path()), &store, "owner");

    worker.execute_cycle().await.unwrap();

    let saved = worker.status_manager().load_status().await.unwrap().unwrap();
    assert_eq!(saved.status, ExecutionStatus::Retrying);
    assert!(saved.metadata.contains_key(meta::NEXT_RETRY_AT));
    // base 1s × 2^0
    assert_eq!(
        saved.metadata.get(meta::RETRY_DELAY_MS),
        Some(&Value::from(1000u64))
    );
}

#[tokio::test]
async fn test_success_after_retry_resets_count() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(InMemoryTableStore::new());
    store.fail_creates(3);
    let worker = worker(test_config(dir.path()), &store, "owner");

    assert_eq!(
        worker.execute_cycle().await.unwrap(),
        CycleOutcome::Finished(ExecutionStatus::Retrying)
    );
    assert_eq!(
        worker.execute_cycle().await.unwrap(),
        CycleOutcome::Finished(ExecutionStatus::Completed)
    );
    assert_eq!(worker.status_manager().get_retry_count().await.unwrap(), 0);
}

/// A second deletion request while one is pending is rejected
#[tokio::test]
async fn test_schedule_delete_twice_leaves_flags_unchanged() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(InMemoryTableStore::new());
    let service = SetupService::new(worker(test_config(dir.path()), &store, "owner"));

    service.schedule_delete().await.unwrap();
    let before = service.orchestrator().flags().await;

    let err = service.schedule_delete().await.unwrap_err();
    assert_eq!(err.to_string(), "deletion already scheduled");
    assert_eq!(service.orchestrator().flags().await, before);
    assert!(before.deletion_scheduled && before.deletion_requested);
}

#[tokio::test]
async fn test_scheduled_deletion_removes_tables() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(InMemoryTableStore::new());
    let worker = worker(test_config(dir.path()), &store, "owner");

    assert_eq!(
        worker.execute_cycle().await.unwrap(),
        CycleOutcome::Finished(ExecutionStatus::Completed)
    );
    assert_eq!(store.table_names().len(), 2);

    worker.schedule_delete().await.unwrap();
    assert_eq!(
        worker.execute_cycle().await.unwrap(),
        CycleOutcome::Finished(ExecutionStatus::Deleted)
    );
    assert!(store.table_names().is_empty());
    assert!(!worker.flags().await.deletion_pending());
}

#[tokio::test]
async fn test_run_once_completes_and_stops() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path());
    config.flags.run_once = true;
    let store = Arc::new(InMemoryTableStore::new());
    let service = SetupService::new(worker(config, &store, "owner"));

    assert_eq!(service.orchestrator().start().await.unwrap(), RunMode::RunOnce);
    let result = service.wait_for_completion(10).await.unwrap();
    wait_stopped(service.orchestrator()).await;

    assert_eq!(result.status, ExecutionStatus::Completed);
    assert!(service.is_setup_completed().await.unwrap());
    assert!(!service.orchestrator().lock_manager().path().exists());

    let health = service.get_health_status().await.unwrap();
    assert!(health.healthy);
    assert_eq!(health.resources.len(), 2);
}

#[tokio::test]
async fn test_run_once_failure_stops_before_completion() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path());
    config.flags.run_once = true;
    let store = Arc::new(InMemoryTableStore::new());
    store.fail_creates(u32::MAX);
    let service = SetupService::new(worker(config, &store, "owner"));

    service.orchestrator().start().await.unwrap();
    let err = service.wait_for_completion(10).await.unwrap_err();

    assert!(matches!(
        err.downcast_ref::<FacadeError>(),
        Some(FacadeError::StoppedBeforeCompletion)
    ));
    let saved = service.get_status().await.unwrap().unwrap();
    assert_eq!(saved.status, ExecutionStatus::Failed);
    // Run-once failures do not consume the cycle retry budget
    assert_eq!(saved.retry_count, 0);
}

#[tokio::test]
async fn test_wait_for_completion_times_out() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(InMemoryTableStore::new());
    let service = SetupService::new(worker(test_config(dir.path()), &store, "owner"));
    service.orchestrator().start().await.unwrap();

    let err = service.wait_for_completion(1).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<FacadeError>(),
        Some(FacadeError::TimedOut { seconds: 1 })
    ));

    service.orchestrator().stop().await;
}

#[tokio::test]
async fn test_force_setup_runs_a_fresh_cycle() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(InMemoryTableStore::new());
    let service = SetupService::new(worker(test_config(dir.path()), &store, "owner"));

    let err = service.force_setup().await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<WorkerError>(),
        Some(WorkerError::NotRunning)
    ));

    service.orchestrator().start().await.unwrap();
    service.force_setup().await.unwrap();
    let result = service.wait_for_completion(10).await.unwrap();
    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(store.create_calls(), 2);

    service.orchestrator().stop().await;
    assert!(service.force_setup().await.is_err());
}

#[tokio::test]
async fn test_restart_if_unhealthy_only_when_needed() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(InMemoryTableStore::new());
    let service = SetupService::new(worker(test_config(dir.path()), &store, "owner"));
    service.orchestrator().start().await.unwrap();

    assert!(service.restart_if_unhealthy().await.unwrap());
    service.wait_for_completion(10).await.unwrap();
    // Let the triggered cycle finish writing
    while service.orchestrator().cycle_in_progress() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert!(!service.restart_if_unhealthy().await.unwrap());
    service.orchestrator().stop().await;
}

#[tokio::test]
async fn test_health_check_records_inactive_tables() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(InMemoryTableStore::new());
    let worker = worker(test_config(dir.path()), &store, "owner");
    worker.execute_cycle().await.unwrap();
    assert!(worker.health_check().await.unwrap());

    let names = worker.table_names();
    store.hang_describes(true);
    assert!(!worker.health_check().await.unwrap());

    let saved = worker.status_manager().load_status().await.unwrap().unwrap();
    assert_eq!(saved.metadata.get(meta::HEALTHY), Some(&Value::Bool(false)));
    for name in &names {
        assert!(!saved.resource(name).unwrap().is_active());
    }
}

#[tokio::test]
async fn test_refresh_request_reconciles_live_status() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(InMemoryTableStore::new());
    let mut options = test_options("owner");
    options.refresher = true;
    let worker = Orchestrator::with_options(test_config(dir.path()), store.clone(), options).unwrap();
    let service = SetupService::new(worker.clone());

    worker.execute_cycle().await.unwrap();
    assert!(!service.refresh_status(None));
    assert_eq!(worker.start().await.unwrap(), RunMode::Monitoring);

    // Someone deletes a table behind the worker's back
    let users = worker.table_names()[0].clone();
    store.delete_table(&users).await.unwrap();
    assert!(service.refresh_status(Some(&users)));

    let mut seen = None;
    for _ in 0..200 {
        let saved = service.get_status().await.unwrap().unwrap();
        let status = saved.resource(&users).unwrap().status.clone();
        if status != TableState::Active.to_string() {
            seen = Some(status);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(seen, Some(TableState::Deleting.to_string()));
    assert!(!service.get_health_status().await.unwrap().healthy);

    worker.stop().await;
}

/// A forced setup that fails while monitoring is retried on the next tick
#[tokio::test]
async fn test_monitoring_retries_failed_forced_setup() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path());
    config.schedule.monitoring_interval = Duration::from_millis(50);
    let store = Arc::new(InMemoryTableStore::new());
    let service = SetupService::new(worker(config, &store, "owner"));
    let worker = service.orchestrator().clone();

    worker.execute_cycle().await.unwrap();
    assert_eq!(worker.start().await.unwrap(), RunMode::Monitoring);

    for name in worker.table_names() {
        store.delete_table(&name).await.unwrap();
        // The first describe that sees DELETING removes the table
        store.describe_table(&name).await.unwrap();
    }
    assert!(store.table_names().is_empty());

    // Enough failures to exhaust one cycle's local retries
    store.fail_creates(3);
    service.force_setup().await.unwrap();

    let result = service.wait_for_completion(10).await.unwrap();
    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(store.table_names().len(), 2);
    assert_eq!(store.create_calls(), 7);

    worker.stop().await;
}

/// Deliberately deleted tables are not recreated by the auto-restart hook
#[tokio::test]
async fn test_restart_if_unhealthy_leaves_deletion_alone() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(InMemoryTableStore::new());
    let service = SetupService::new(worker(test_config(dir.path()), &store, "owner"));
    let worker = service.orchestrator().clone();

    worker.execute_cycle().await.unwrap();
    worker.schedule_delete().await.unwrap();
    assert!(!service.restart_if_unhealthy().await.unwrap());

    assert_eq!(
        worker.execute_cycle().await.unwrap(),
        CycleOutcome::Finished(ExecutionStatus::Deleted)
    );
    assert_eq!(worker.start().await.unwrap(), RunMode::Scheduled);
    assert!(!service.restart_if_unhealthy().await.unwrap());

    assert_eq!(service.get_status().await.unwrap().unwrap().status, ExecutionStatus::Deleted);
    assert!(store.table_names().is_empty());
    assert_eq!(store.create_calls(), 2);

    worker.stop().await;
}

/// A run-once worker never waits for triggers, so forcing must not touch state
#[tokio::test]
async fn test_run_once_worker_rejects_force_setup() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path());
    config.flags.run_once = true;
    let store = Arc::new(InMemoryTableStore::new());
    store.hang_describes(true);
    let service = SetupService::new(worker(config, &store, "owner"));

    assert_eq!(service.orchestrator().start().await.unwrap(), RunMode::RunOnce);
    while store.describe_calls() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let err = service.force_setup().await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<WorkerError>(),
        Some(WorkerError::NotTriggerable)
    ));
    assert!(service.orchestrator().trigger_cycle().await.is_err());

    // The in-flight cycle's status survives
    let saved = service.get_status().await.unwrap().unwrap();
    assert_eq!(saved.status, ExecutionStatus::Running);
    assert_eq!(
        service.orchestrator().state().await,
        OrchestratorState::Running(RunMode::RunOnce)
    );
    // The hung cycle is dropped with the runtime
}

/// Stopping mid-deletion keeps the request for the next cycle
#[tokio::test]
async fn test_stop_during_deletion_keeps_request() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(InMemoryTableStore::new());
    let mut options = test_options("owner");
    options.timing.retry_step = Duration::from_secs(30);
    let worker = Orchestrator::with_options(test_config(dir.path()), store.clone(), options).unwrap();

    worker.execute_cycle().await.unwrap();
    store.fail_deletes(u32::MAX);
    worker.schedule_delete().await.unwrap();

    let cycle = tokio::spawn({
        let worker = worker.clone();
        async move { worker.execute_cycle().await }
    });
    while store.delete_calls() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    worker.stop().await;

    let outcome = tokio::time::timeout(Duration::from_secs(5), cycle)
        .await
        .expect("cycle should observe cancellation")
        .unwrap()
        .unwrap();
    assert_eq!(outcome, CycleOutcome::Skipped("worker stopping"));

    assert!(worker.flags().await.deletion_pending());
    let saved = worker.status_manager().load_status().await.unwrap().unwrap();
    assert_eq!(saved.status, ExecutionStatus::DeletionScheduled);
    assert_eq!(store.table_names().len(), 2);
}
