//! Idempotent create/validate/delete of the managed tables
//!
//! Tables are always handled one at a time. Each create or delete call gets
//! a small local retry budget; this is independent of the orchestrator's
//! cycle-level retries.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde_json::Value;
use tablekeeper_common::defaults::{
    ACTIVE_POLL_INTERVAL, ACTIVE_WAIT_TIMEOUT, DELETION_POLL_INTERVAL, DELETION_WAIT_TIMEOUT,
    TABLE_OPERATION_ATTEMPTS, TABLE_OPERATION_RETRY_STEP,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::aws::{TableDescription, TableOperations, classify_anyhow_error};
use crate::catalog::ResourceDescriptor;
use crate::config::RuntimeFlags;
use crate::error::{WorkerError, is_cancelled};
use crate::status::{ExecutionResult, ResourceStatus, STATUS_NOT_FOUND, StatusManager, meta};
use crate::wait::{WaitConfig, sleep_or_cancel, wait_for_resource};

/// Per-run behavior switches
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProvisionOptions {
    pub dry_run: bool,
    pub skip_validation: bool,
}

impl From<&RuntimeFlags> for ProvisionOptions {
    fn from(flags: &RuntimeFlags) -> Self {
        Self {
            dry_run: flags.dry_run,
            skip_validation: flags.skip_validation,
        }
    }
}

/// Local retry and polling budgets
#[derive(Debug, Clone)]
pub struct ProvisionerTiming {
    pub attempts: u32,
    /// Delay before retry `n` is `n * retry_step`
    pub retry_step: Duration,
    pub active_poll: Duration,
    pub active_timeout: Duration,
    pub deletion_poll: Duration,
    pub deletion_timeout: Duration,
}

impl Default for ProvisionerTiming {
    fn default() -> Self {
        Self {
            attempts: TABLE_OPERATION_ATTEMPTS,
            retry_step: TABLE_OPERATION_RETRY_STEP,
            active_poll: ACTIVE_POLL_INTERVAL,
            active_timeout: ACTIVE_WAIT_TIMEOUT,
            deletion_poll: DELETION_POLL_INTERVAL,
            deletion_timeout: DELETION_WAIT_TIMEOUT,
        }
    }
}

pub struct ResourceProvisioner {
    tables: Arc<dyn TableOperations>,
    descriptors: Vec<ResourceDescriptor>,
    timing: ProvisionerTiming,
}

impl ResourceProvisioner {
    pub fn new(tables: Arc<dyn TableOperations>, descriptors: Vec<ResourceDescriptor>) -> Self {
        Self {
            tables,
            descriptors,
            timing: ProvisionerTiming::default(),
        }
    }

    pub fn with_timing(mut self, timing: ProvisionerTiming) -> Self {
        self.timing = timing;
        self
    }

    pub fn descriptors(&self) -> &[ResourceDescriptor] {
        &self.descriptors
    }

    pub fn table_names(&self) -> Vec<String> {
        self.descriptors.iter().map(|d| d.name.clone()).collect()
    }

    /// Bring every managed table into existence and validate it.
    ///
    /// Tables that already exist are only validated. A pre-existing table
    /// that fails validation is deleted and recreated once; a second
    /// failure is returned.
    pub async fn execute(
        &self,
        status: &StatusManager,
        options: ProvisionOptions,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult> {
        let mut existing = Vec::with_capacity(self.descriptors.len());
        for descriptor in &self.descriptors {
            existing.push(self.describe_if_exists(&descriptor.name, cancel).await?);
        }
        let missing: Vec<&ResourceDescriptor> = self
            .descriptors
            .iter()
            .zip(&existing)
            .filter(|(_, found)| found.is_none())
            .map(|(d, _)| d)
            .collect();

        if options.dry_run {
            return self.dry_run_setup(status, &existing, &missing).await;
        }

        if missing.is_empty() {
            info!(tables = self.descriptors.len(), "All tables exist, validating");
        } else {
            info!(
                missing = missing.len(),
                total = self.descriptors.len(),
                "Creating missing tables"
            );
            for descriptor in &missing {
                check_cancelled(cancel)?;
                self.create_with_retry(descriptor, cancel).await?;
            }
        }

        let mut resources = Vec::with_capacity(self.descriptors.len());
        let mut healed = Vec::new();
        for (descriptor, found) in self.descriptors.iter().zip(&existing) {
            check_cancelled(cancel)?;
            let table = if options.skip_validation {
                self.tables.describe_table(&descriptor.name).await?
            } else {
                match self.validate(descriptor, cancel).await {
                    Ok(table) => table,
                    Err(e) if found.is_some() && is_validation_error(&e) => {
                        warn!(table = %descriptor.name, error = %e, "Existing table failed validation, recreating");
                        healed.push(Value::String(descriptor.name.clone()));
                        self.self_heal(descriptor, cancel).await?
                    }
                    Err(e) => return Err(e),
                }
            };
            let resource = ResourceStatus::from(&table);
            status.add_resource_status(resource.clone()).await?;
            resources.push(resource);
        }

        let mut metadata = BTreeMap::from([(meta::DRY_RUN.to_string(), Value::Bool(false))]);
        if !healed.is_empty() {
            metadata.insert(meta::SELF_HEALED.to_string(), Value::Array(healed));
        }
        let message = if missing.is_empty() {
            format!("All {} tables present and valid", resources.len())
        } else {
            format!("Created {} of {} tables", missing.len(), resources.len())
        };
        status.mark_completed(message, resources, metadata).await
    }

    /// Delete every managed table and wait for each to disappear.
    ///
    /// Tables that are already gone are skipped. The first failure marks the
    /// run `DeletionFailed` and stops.
    pub async fn execute_delete(
        &self,
        status: &StatusManager,
        options: ProvisionOptions,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult> {
        match self.delete_all(options, cancel).await {
            Ok(deleted) => {
                let resources = self
                    .descriptors
                    .iter()
                    .map(|d| ResourceStatus::sentinel(&d.name, STATUS_NOT_FOUND))
                    .collect();
                let message = if options.dry_run {
                    format!("Dry run: {deleted} tables would be deleted")
                } else {
                    format!("Deleted {deleted} tables")
                };
                let metadata =
                    BTreeMap::from([(meta::DRY_RUN.to_string(), Value::Bool(options.dry_run))]);
                status.mark_deleted(message, resources, metadata).await
            }
            Err(e) => {
                status.mark_deletion_failed(&format!("{e:#}")).await?;
                Err(e)
            }
        }
    }

    async fn delete_all(&self, options: ProvisionOptions, cancel: &CancellationToken) -> Result<usize> {
        let mut deleted = 0;
        for descriptor in &self.descriptors {
            check_cancelled(cancel)?;
            let name = &descriptor.name;
            if self.describe_if_exists(name, cancel).await?.is_none() {
                debug!(table = %name, "Table already absent");
                continue;
            }
            deleted += 1;
            if options.dry_run {
                info!(table = %name, "Dry run: would delete table");
                continue;
            }
            self.delete_with_retry(name, cancel).await?;
            self.wait_for_absence(name, cancel).await?;
        }
        Ok(deleted)
    }

    async fn dry_run_setup(
        &self,
        status: &StatusManager,
        existing: &[Option<TableDescription>],
        missing: &[&ResourceDescriptor],
    ) -> Result<ExecutionResult> {
        for descriptor in missing {
            info!(
                table = %descriptor.name,
                indexes = ?descriptor.expected_index_names(),
                "Dry run: would create table"
            );
        }
        let resources = self
            .descriptors
            .iter()
            .zip(existing)
            .map(|(d, found)| match found {
                Some(table) => ResourceStatus::from(table),
                None => ResourceStatus::sentinel(&d.name, STATUS_NOT_FOUND),
            })
            .collect();
        let metadata = BTreeMap::from([(meta::DRY_RUN.to_string(), Value::Bool(true))]);
        status
            .mark_completed(
                format!("Dry run: {} tables would be created", missing.len()),
                resources,
                metadata,
            )
            .await
    }

    /// Describe `name`, mapping "not found" to `None`
    async fn describe_if_exists(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<TableDescription>> {
        self.with_retries("describe", name, cancel, || async move {
            match self.tables.describe_table(name).await {
                Ok(table) => Ok(Some(table)),
                Err(e) if classify_anyhow_error(&e).is_not_found() => Ok(None),
                Err(e) => Err(e),
            }
        })
        .await
    }

    async fn create_with_retry(
        &self,
        descriptor: &ResourceDescriptor,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.with_retries("create", &descriptor.name, cancel, || async move {
            match self.tables.create_table(descriptor).await {
                Err(e) if classify_anyhow_error(&e).is_already_exists() => {
                    info!(table = %descriptor.name, "Table already exists");
                    Ok(())
                }
                other => other,
            }
        })
        .await
    }

    async fn delete_with_retry(&self, name: &str, cancel: &CancellationToken) -> Result<()> {
        self.with_retries("delete", name, cancel, || async move {
            match self.tables.delete_table(name).await {
                Err(e) if classify_anyhow_error(&e).is_not_found() => Ok(()),
                other => other,
            }
        })
        .await
    }

    /// Run `operation` up to `attempts` times, sleeping `attempt * retry_step`
    /// between tries. Exhaustion, or an error DynamoDB will reject again,
    /// yields [`WorkerError::Provisioning`].
    async fn with_retries<T, F, Fut>(
        &self,
        operation: &str,
        table: &str,
        cancel: &CancellationToken,
        mut f: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.timing.attempts.max(1);
        let mut attempt = 1;
        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(e) if !classify_anyhow_error(&e).is_retryable() => {
                    return Err(WorkerError::provisioning(
                        table,
                        format!("{operation} rejected: {e:#}"),
                    )
                    .into());
                }
                Err(e) if attempt >= attempts => {
                    return Err(WorkerError::provisioning(
                        table,
                        format!("{operation} failed after {attempts} attempts: {e:#}"),
                    )
                    .into());
                }
                Err(e) => {
                    let delay = self.timing.retry_step * attempt;
                    warn!(
                        table = %table,
                        operation,
                        attempt,
                        delay_ms = delay.as_millis(),
                        error = %e,
                        "Table operation failed, retrying"
                    );
                    sleep_or_cancel(delay, cancel).await?;
                    attempt += 1;
                }
            }
        }
    }

    /// Wait for ACTIVE, then check the secondary indexes against the descriptor
    async fn validate(
        &self,
        descriptor: &ResourceDescriptor,
        cancel: &CancellationToken,
    ) -> Result<TableDescription> {
        let name = &descriptor.name;
        wait_for_resource(
            WaitConfig::fixed(self.timing.active_poll, self.timing.active_timeout),
            cancel,
            || async move {
                match self.tables.describe_table(name).await {
                    Ok(table) => Ok(table.fully_active()),
                    Err(e) if classify_anyhow_error(&e).is_not_found() => Ok(false),
                    Err(e) => Err(e),
                }
            },
            name,
        )
        .await?;

        let table = self.tables.describe_table(name).await?;
        let expected = descriptor.expected_index_count();
        if table.indexes.len() != expected {
            return Err(WorkerError::validation(
                name.as_str(),
                format!("expected {expected} indexes, found {}", table.indexes.len()),
            )
            .into());
        }
        let actual = table.index_names();
        let missing: Vec<&str> = descriptor
            .expected_index_names()
            .into_iter()
            .filter(|n| !actual.contains(n))
            .collect();
        if !missing.is_empty() {
            return Err(WorkerError::validation(
                name.as_str(),
                format!("missing indexes: {}", missing.join(", ")),
            )
            .into());
        }

        debug!(table = %name, indexes = expected, "Table validated");
        Ok(table)
    }

    /// Delete, wait for absence, recreate and validate once more
    async fn self_heal(
        &self,
        descriptor: &ResourceDescriptor,
        cancel: &CancellationToken,
    ) -> Result<TableDescription> {
        let name = &descriptor.name;
        self.delete_with_retry(name, cancel).await?;
        self.wait_for_absence(name, cancel).await?;
        self.create_with_retry(descriptor, cancel).await?;
        let table = self.validate(descriptor, cancel).await?;
        info!(table = %name, "Table recreated and validated");
        Ok(table)
    }

    async fn wait_for_absence(&self, name: &str, cancel: &CancellationToken) -> Result<()> {
        wait_for_resource(
            WaitConfig::fixed(self.timing.deletion_poll, self.timing.deletion_timeout),
            cancel,
            || async move {
                match self.tables.describe_table(name).await {
                    Ok(_) => Ok(false),
                    Err(e) if classify_anyhow_error(&e).is_not_found() => Ok(true),
                    Err(e) => Err(e),
                }
            },
            name,
        )
        .await
    }
}

fn check_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(WorkerError::Cancelled.into());
    }
    Ok(())
}

fn is_validation_error(error: &anyhow::Error) -> bool {
    !is_cancelled(error)
        && matches!(
            error.downcast_ref::<WorkerError>(),
            Some(WorkerError::Validation { .. })
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aws::{AwsError, IndexDescription, MockTableOperations, TableState};
    use crate::catalog::descriptors_for;
    use crate::config::{Environment, WorkerConfig};
    use tablekeeper_common::ExecutionStatus;
    use tempfile::TempDir;

    fn descriptors(tables: &[&str]) -> Vec<ResourceDescriptor> {
        let mut config = WorkerConfig::default();
        config.tables.required = tables.iter().map(|s| s.to_string()).collect();
        descriptors_for(&config).unwrap()
    }

    fn active(descriptor: &ResourceDescriptor) -> TableDescription {
        TableDescription {
            name: descriptor.name.clone(),
            status: TableState::Active,
            arn: Some(format!("arn:aws:dynamodb:us-east-1:123:table/{}", descriptor.name)),
            indexes: descriptor
                .indexes
                .iter()
                .map(|i| IndexDescription {
                    name: i.name.clone(),
                    status: TableState::Active,
                })
                .collect(),
            created_at: None,
        }
    }

    fn not_found(name: &str) -> anyhow::Error {
        AwsError::NotFound {
            table: name.to_string(),
        }
        .into()
    }

    fn fast_timing() -> ProvisionerTiming {
        ProvisionerTiming {
            attempts: 3,
            retry_step: Duration::from_millis(1),
            active_poll: Duration::from_millis(1),
            active_timeout: Duration::from_secs(1),
            deletion_poll: Duration::from_millis(1),
            deletion_timeout: Duration::from_secs(1),
        }
    }

    fn status(dir: &TempDir) -> StatusManager {
        StatusManager::new(dir.path().join("status.json"), Environment::Development)
    }

    #[tokio::test]
    async fn existing_valid_tables_issue_no_writes() {
        let dir = TempDir::new().unwrap();
        let descriptors = descriptors(&["users", "roles"]);
        let known = descriptors.clone();

        let mut mock = MockTableOperations::new();
        mock.expect_describe_table().returning(move |name| {
            let d = known.iter().find(|d| d.name == name).unwrap();
            Ok(active(d))
        });
        mock.expect_create_table().never();
        mock.expect_delete_table().never();

        let provisioner =
            ResourceProvisioner::new(Arc::new(mock), descriptors).with_timing(fast_timing());
        let result = provisioner
            .execute(&status(&dir), ProvisionOptions::default(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.status, ExecutionStatus::Completed);
        assert!(result.success);
        assert_eq!(result.resources.len(), 2);
    }

    #[tokio::test]
    async fn dry_run_never_creates() {
        let dir = TempDir::new().unwrap();
        let mut mock = MockTableOperations::new();
        mock.expect_describe_table()
            .returning(|name| Err(not_found(name)));
        mock.expect_create_table().never();

        let provisioner = ResourceProvisioner::new(Arc::new(mock), descriptors(&["users"]))
            .with_timing(fast_timing());
        let status = status(&dir);
        let result = provisioner
            .execute(
                &status,
                ProvisionOptions {
                    dry_run: true,
                    skip_validation: false,
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(result.is_dry_run());
        assert_eq!(result.resources[0].status, STATUS_NOT_FOUND);
        assert!(!status.is_setup_completed().await.unwrap());
    }

    #[tokio::test]
    async fn create_gives_up_after_three_attempts() {
        let dir = TempDir::new().unwrap();
        let mut mock = MockTableOperations::new();
        mock.expect_describe_table()
            .returning(|name| Err(not_found(name)));
        mock.expect_create_table()
            .times(3)
            .returning(|_| Err(AwsError::Throttled.into()));

        let provisioner = ResourceProvisioner::new(Arc::new(mock), descriptors(&["users"]))
            .with_timing(fast_timing());
        let err = provisioner
            .execute(&status(&dir), ProvisionOptions::default(), &CancellationToken::new())
            .await
            .unwrap_err();

        match err.downcast_ref::<WorkerError>() {
            Some(WorkerError::Provisioning { table, message }) => {
                assert_eq!(table, "tablekeeper-development-users");
                assert!(message.contains("after 3 attempts"));
            }
            other => panic!("expected Provisioning, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn rejected_create_is_not_retried() {
        let dir = TempDir::new().unwrap();
        let mut mock = MockTableOperations::new();
        mock.expect_describe_table()
            .returning(|name| Err(not_found(name)));
        mock.expect_create_table()
            .times(1)
            .returning(|_| Err(anyhow::anyhow!("ValidationException: bad schema")));

        let provisioner = ResourceProvisioner::new(Arc::new(mock), descriptors(&["users"]))
            .with_timing(fast_timing());
        let err = provisioner
            .execute(&status(&dir), ProvisionOptions::default(), &CancellationToken::new())
            .await
            .unwrap_err();

        match err.downcast_ref::<WorkerError>() {
            Some(WorkerError::Provisioning { message, .. }) => {
                assert!(message.starts_with("create rejected"), "{message}");
                assert!(message.contains("ValidationException"));
            }
            other => panic!("expected Provisioning, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn already_exists_counts_as_created() {
        let dir = TempDir::new().unwrap();
        let descriptors = descriptors(&["organizations"]);
        let table = active(&descriptors[0]);
        let mut describes = 0;

        let mut mock = MockTableOperations::new();
        mock.expect_describe_table().returning(move |name| {
            describes += 1;
            if describes == 1 {
                Err(not_found(name))
            } else {
                Ok(table.clone())
            }
        });
        mock.expect_create_table()
            .times(1)
            .returning(|_| Err(AwsError::AlreadyExists.into()));

        let provisioner =
            ResourceProvisioner::new(Arc::new(mock), descriptors).with_timing(fast_timing());
        let result = provisioner
            .execute(&status(&dir), ProvisionOptions::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn delete_skips_absent_tables() {
        let dir = TempDir::new().unwrap();
        let mut mock = MockTableOperations::new();
        mock.expect_describe_table()
            .returning(|name| Err(not_found(name)));
        mock.expect_delete_table().never();

        let provisioner =
            ResourceProvisioner::new(Arc::new(mock), descriptors(&["users", "jobs"]))
                .with_timing(fast_timing());
        let result = provisioner
            .execute_delete(&status(&dir), ProvisionOptions::default(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.status, ExecutionStatus::Deleted);
        assert_eq!(result.message, "Deleted 0 tables");
    }

    #[tokio::test]
    async fn delete_failure_marks_deletion_failed() {
        let dir = TempDir::new().unwrap();
        let descriptors = descriptors(&["users"]);
        let table = active(&descriptors[0]);

        let mut mock = MockTableOperations::new();
        mock.expect_describe_table()
            .returning(move |_| Ok(table.clone()));
        mock.expect_delete_table()
            .times(1)
            .returning(|_| Err(anyhow::anyhow!("AccessDeniedException")));

        let provisioner =
            ResourceProvisioner::new(Arc::new(mock), descriptors).with_timing(fast_timing());
        let status = status(&dir);
        provisioner
            .execute_delete(&status, ProvisionOptions::default(), &CancellationToken::new())
            .await
            .unwrap_err();

        let saved = status.load_status().await.unwrap().unwrap();
        assert_eq!(saved.status, ExecutionStatus::DeletionFailed);
        assert!(saved.error_message.unwrap().contains("AccessDeniedException"));
    }

    #[tokio::test]
    async fn cancelled_before_create() {
        let dir = TempDir::new().unwrap();
        let mut mock = MockTableOperations::new();
        mock.expect_describe_table()
            .returning(|name| Err(not_found(name)));
        mock.expect_create_table().never();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let provisioner = ResourceProvisioner::new(Arc::new(mock), descriptors(&["users"]))
            .with_timing(fast_timing());
        let err = provisioner
            .execute(&status(&dir), ProvisionOptions::default(), &cancel)
            .await
            .unwrap_err();
        assert!(is_cancelled(&err));
    }
}
