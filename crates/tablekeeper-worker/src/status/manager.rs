//! Atomic persistence of [`ExecutionResult`]
//!
//! Every mutation is load-modify-save under one in-process mutex, and every
//! write goes to a temp file that is renamed over the status file, so
//! readers never observe a partial document.

use std::collections::BTreeMap;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use tempfile::NamedTempFile;
use tablekeeper_common::ExecutionStatus;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::fetcher::FastResourceStatusFetcher;
use super::types::{ExecutionResult, ResourceStatus, STATUS_FETCH_ERROR, meta};
use crate::config::Environment;

/// Owner of the status file
#[derive(Debug)]
pub struct StatusManager {
    path: PathBuf,
    environment: Environment,
    write_lock: Mutex<()>,
}

impl StatusManager {
    pub fn new(path: impl Into<PathBuf>, environment: Environment) -> Self {
        Self {
            path: path.into(),
            environment,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the status file; `None` if nothing has been saved yet
    pub async fn load_status(&self) -> Result<Option<ExecutionResult>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to read status file {}", self.path.display())
                });
            }
        };
        let result = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse status file {}", self.path.display()))?;
        Ok(Some(result))
    }

    /// Save `result`, filling in end time and duration on terminal states
    pub async fn save_status(&self, result: &mut ExecutionResult) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        result.finalize(Utc::now());
        self.write(result).await
    }

    /// Load (or synthesize), apply `change`, save, and return the saved value
    async fn modify<F>(&self, change: F) -> Result<ExecutionResult>
    where
        F: FnOnce(&mut ExecutionResult),
    {
        let _guard = self.write_lock.lock().await;
        let mut result = match self.load_status().await? {
            Some(result) => result,
            None => ExecutionResult::new(ExecutionStatus::Idle, self.environment),
        };
        change(&mut result);
        result.finalize(Utc::now());
        self.write(&result).await?;
        Ok(result)
    }

    /// Move to `status` with `message`, merging `metadata` into the existing map
    pub async fn update_progress(
        &self,
        status: ExecutionStatus,
        message: impl Into<String>,
        metadata: BTreeMap<String, Value>,
    ) -> Result<ExecutionResult> {
        let message = message.into();
        let result = self
            .modify(|result| {
                if !result.status.can_transition_to(status) {
                    warn!(from = %result.status, to = %status, "Unexpected status transition");
                }
                result.transition(status);
                result.message = message;
                result.metadata.extend(metadata);
            })
            .await?;
        debug!(status = %result.status, message = %result.message, "Progress updated");
        Ok(result)
    }

    /// Merge `metadata` without changing status
    pub async fn patch_metadata(&self, metadata: BTreeMap<String, Value>) -> Result<()> {
        self.modify(|result| result.metadata.extend(metadata)).await?;
        Ok(())
    }

    /// Upsert one resource entry
    pub async fn add_resource_status(&self, resource: ResourceStatus) -> Result<()> {
        self.modify(|result| result.upsert_resource(resource)).await?;
        Ok(())
    }

    /// Upsert several resource entries in one write
    pub async fn merge_resource_statuses(&self, resources: Vec<ResourceStatus>) -> Result<()> {
        self.modify(|result| {
            for resource in resources {
                result.upsert_resource(resource);
            }
        })
        .await?;
        Ok(())
    }

    /// Upsert the entry for `name` from a live fetch.
    ///
    /// A failed fetch is recorded as `STATUS_ERROR` with the error text in
    /// metadata; it never fails the save.
    pub async fn add_resource_status_live(
        &self,
        name: &str,
        fetcher: &FastResourceStatusFetcher,
        cancel: &CancellationToken,
    ) -> Result<ResourceStatus> {
        let (resource, error) = match fetcher.get_status_fast(name, cancel).await {
            Ok(resource) => (resource, None),
            Err(e) => {
                warn!(table = %name, error = %e, "Live status fetch failed");
                (
                    ResourceStatus::sentinel(name, STATUS_FETCH_ERROR),
                    Some(format!("{e:#}")),
                )
            }
        };

        let entry = resource.clone();
        self.modify(|result| {
            let key = meta::status_error(name);
            match error {
                Some(error) => {
                    result.metadata.insert(key, Value::String(error));
                }
                None => {
                    result.metadata.remove(&key);
                }
            }
            result.upsert_resource(entry);
        })
        .await?;
        Ok(resource)
    }

    /// Terminal success for a setup run
    pub async fn mark_completed(
        &self,
        message: impl Into<String>,
        resources: Vec<ResourceStatus>,
        metadata: BTreeMap<String, Value>,
    ) -> Result<ExecutionResult> {
        let message = message.into();
        let result = self
            .modify(|result| {
                result.transition(ExecutionStatus::Completed);
                result.message = message;
                result.error_message = None;
                result.resources = resources;
                result.metadata.extend(metadata);
                result.metadata.remove(meta::NEXT_RETRY_AT);
                result.metadata.remove(meta::RETRY_DELAY_MS);
            })
            .await?;
        info!(resources = result.resources.len(), "Setup completed");
        Ok(result)
    }

    /// Terminal failure for a setup run
    pub async fn mark_failed(&self, error: &str) -> Result<ExecutionResult> {
        let result = self
            .modify(|result| {
                result.transition(ExecutionStatus::Failed);
                result.message = "Setup failed".to_string();
                result.error_message = Some(error.to_string());
            })
            .await?;
        warn!(retry_count = result.retry_count, error = %error, "Setup failed");
        Ok(result)
    }

    /// Terminal success for a deletion run
    pub async fn mark_deleted(
        &self,
        message: impl Into<String>,
        resources: Vec<ResourceStatus>,
        metadata: BTreeMap<String, Value>,
    ) -> Result<ExecutionResult> {
        let message = message.into();
        let result = self
            .modify(|result| {
                result.transition(ExecutionStatus::Deleted);
                result.message = message;
                result.error_message = None;
                result.resources = resources;
                result.metadata.extend(metadata);
            })
            .await?;
        info!(resources = result.resources.len(), "Deletion completed");
        Ok(result)
    }

    /// Terminal failure for a deletion run
    pub async fn mark_deletion_failed(&self, error: &str) -> Result<ExecutionResult> {
        self.modify(|result| {
            result.transition(ExecutionStatus::DeletionFailed);
            result.message = "Deletion failed".to_string();
            result.error_message = Some(error.to_string());
        })
        .await
    }

    /// Count a failed cycle and schedule the next attempt
    pub async fn mark_retrying(
        &self,
        error: &str,
        next_retry_at: DateTime<Utc>,
        delay: Duration,
    ) -> Result<ExecutionResult> {
        let result = self
            .modify(|result| {
                result.transition(ExecutionStatus::Retrying);
                result.retry_count = result.retry_count.saturating_add(1);
                result.message = format!("Retry {} scheduled", result.retry_count);
                result.error_message = Some(error.to_string());
                result.metadata.insert(
                    meta::NEXT_RETRY_AT.to_string(),
                    Value::String(next_retry_at.to_rfc3339()),
                );
                result.metadata.insert(
                    meta::RETRY_DELAY_MS.to_string(),
                    Value::from(u64::try_from(delay.as_millis()).unwrap_or(u64::MAX)),
                );
            })
            .await?;
        warn!(
            retry_count = result.retry_count,
            delay_ms = delay.as_millis(),
            next_retry_at = %next_retry_at,
            error = %error,
            "Cycle failed, retry scheduled"
        );
        Ok(result)
    }

    /// Add one to the cycle retry counter; returns the new value
    pub async fn increment_retry_count(&self) -> Result<u32> {
        let result = self
            .modify(|result| result.retry_count = result.retry_count.saturating_add(1))
            .await?;
        Ok(result.retry_count)
    }

    pub async fn get_retry_count(&self) -> Result<u32> {
        Ok(self
            .load_status()
            .await?
            .map(|r| r.retry_count)
            .unwrap_or(0))
    }

    pub async fn reset_retry_count(&self) -> Result<()> {
        self.modify(|result| result.retry_count = 0).await?;
        Ok(())
    }

    /// Delete the status file so the next cycle starts from scratch
    pub async fn reset_status(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                info!(path = %self.path.display(), "Status reset");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e)
                .with_context(|| format!("Failed to remove status file {}", self.path.display())),
        }
    }

    pub async fn is_setup_completed(&self) -> Result<bool> {
        Ok(self
            .load_status()
            .await?
            .is_some_and(|r| r.is_setup_completed()))
    }

    /// Atomically replace the status file: temp file in the same directory,
    /// fsync, then rename over the old file.
    async fn write(&self, result: &ExecutionResult) -> Result<()> {
        let json = serde_json::to_vec_pretty(result)?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&path, &json))
            .await
            .context("Status writer task failed")?
    }
}

fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create status directory {}", dir.display()))?;

    let mut tmp = NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;
    tmp.write_all(contents)
        .with_context(|| format!("Failed to write {}", tmp.path().display()))?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .map_err(|e| e.error)
        .with_context(|| format!("Failed to replace status file {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aws::{AwsError, MockTableOperations};
    use crate::status::types::STATUS_NOT_FOUND;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> StatusManager {
        StatusManager::new(dir.path().join("state").join("status.json"), Environment::Staging)
    }

    #[tokio::test]
    async fn missing_file_loads_none() {
        let dir = TempDir::new().unwrap();
        let status = manager(&dir);
        assert!(status.load_status().await.unwrap().is_none());
        assert_eq!(status.get_retry_count().await.unwrap(), 0);
        assert!(!status.is_setup_completed().await.unwrap());
    }

    #[tokio::test]
    async fn save_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let status = manager(&dir);

        let mut result = ExecutionResult::new(ExecutionStatus::Completed, Environment::Staging);
        result.success = true;
        result.retry_count = 3;
        result.message = "done".into();
        result.resources.push(ResourceStatus::sentinel("users", "ACTIVE"));
        result
            .metadata
            .insert("note".into(), serde_json::json!({"nested": [1, 2, 3]}));
        status.save_status(&mut result).await.unwrap();

        assert!(result.end_time.is_some());
        assert_eq!(status.load_status().await.unwrap(), Some(result));
    }

    #[tokio::test]
    async fn rewrites_leave_only_the_status_file() {
        let dir = TempDir::new().unwrap();
        let status = manager(&dir);
        for i in 0..3 {
            status
                .update_progress(ExecutionStatus::Running, format!("step {i}"), BTreeMap::new())
                .await
                .unwrap();
        }

        let names: Vec<_> = std::fs::read_dir(dir.path().join("state"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("status.json")]);
        assert_eq!(status.load_status().await.unwrap().unwrap().message, "step 2");
    }

    #[tokio::test]
    async fn update_progress_synthesizes_and_merges() {
        let dir = TempDir::new().unwrap();
        let status = manager(&dir);

        status
            .update_progress(
                ExecutionStatus::Running,
                "starting",
                BTreeMap::from([("a".to_string(), Value::from(1))]),
            )
            .await
            .unwrap();
        let result = status
            .update_progress(
                ExecutionStatus::Retrying,
                "retrying",
                BTreeMap::from([("b".to_string(), Value::from(2))]),
            )
            .await
            .unwrap();

        assert_eq!(result.status, ExecutionStatus::Retrying);
        assert_eq!(result.environment, Environment::Staging);
        assert_eq!(result.metadata.len(), 2);
        assert!(result.end_time.is_none());
    }

    #[tokio::test]
    async fn retry_counter() {
        let dir = TempDir::new().unwrap();
        let status = manager(&dir);

        assert_eq!(status.increment_retry_count().await.unwrap(), 1);
        assert_eq!(status.increment_retry_count().await.unwrap(), 2);
        assert_eq!(status.get_retry_count().await.unwrap(), 2);
        status.reset_retry_count().await.unwrap();
        assert_eq!(status.get_retry_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn mark_failed_keeps_retry_count() {
        let dir = TempDir::new().unwrap();
        let status = manager(&dir);
        status.increment_retry_count().await.unwrap();

        let result = status.mark_failed("create failed").await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.retry_count, 1);
        assert_eq!(result.error_message.as_deref(), Some("create failed"));
        assert!(result.duration_ms.is_some());
    }

    #[tokio::test]
    async fn mark_retrying_records_schedule() {
        let dir = TempDir::new().unwrap();
        let status = manager(&dir);
        let next = Utc::now() + chrono::Duration::seconds(120);

        let result = status
            .mark_retrying("throttled", next, Duration::from_secs(120))
            .await
            .unwrap();
        assert_eq!(result.status, ExecutionStatus::Retrying);
        assert_eq!(result.retry_count, 1);
        assert_eq!(result.metadata[meta::RETRY_DELAY_MS], Value::from(120_000u64));
        assert_eq!(
            result.metadata[meta::NEXT_RETRY_AT],
            Value::String(next.to_rfc3339())
        );

        let completed = status
            .mark_completed("ok", vec![], BTreeMap::new())
            .await
            .unwrap();
        assert!(!completed.metadata.contains_key(meta::NEXT_RETRY_AT));
    }

    #[tokio::test]
    async fn reset_deletes_file() {
        let dir = TempDir::new().unwrap();
        let status = manager(&dir);
        status
            .mark_completed("ok", vec![], BTreeMap::new())
            .await
            .unwrap();
        assert!(status.is_setup_completed().await.unwrap());

        status.reset_status().await.unwrap();
        assert!(!status.path().exists());
        status.reset_status().await.unwrap();
    }

    #[tokio::test]
    async fn live_fetch_failure_degrades_to_sentinel() {
        let dir = TempDir::new().unwrap();
        let status = manager(&dir);

        let mut mock = MockTableOperations::new();
        mock.expect_describe_table().returning(|name| {
            if name == "users" {
                Err(AwsError::NotFound {
                    table: name.to_string(),
                }
                .into())
            } else {
                Err(anyhow::anyhow!("AccessDeniedException: no"))
            }
        });
        let fetcher = FastResourceStatusFetcher::new(Arc::new(mock));
        let cancel = CancellationToken::new();

        let users = status
            .add_resource_status_live("users", &fetcher, &cancel)
            .await
            .unwrap();
        assert_eq!(users.status, STATUS_NOT_FOUND);

        let roles = status
            .add_resource_status_live("roles", &fetcher, &cancel)
            .await
            .unwrap();
        assert_eq!(roles.status, STATUS_FETCH_ERROR);

        let saved = status.load_status().await.unwrap().unwrap();
        assert_eq!(saved.resources.len(), 2);
        assert!(
            saved.metadata[&meta::status_error("roles")]
                .as_str()
                .unwrap()
                .contains("AccessDeniedException")
        );
    }

    #[tokio::test]
    async fn concurrent_writers_do_not_lose_updates() {
        let dir = TempDir::new().unwrap();
        let status = Arc::new(manager(&dir));

        let mut handles = Vec::new();
        for i in 0..10 {
            let status = status.clone();
            handles.push(tokio::spawn(async move {
                status
                    .add_resource_status(ResourceStatus::sentinel(format!("t{i}"), "ACTIVE"))
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let saved = status.load_status().await.unwrap().unwrap();
        assert_eq!(saved.resources.len(), 10);
    }
}
