//! Status file document types

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tablekeeper_common::ExecutionStatus;

use crate::aws::TableDescription;
use crate::config::Environment;

/// Status recorded for a table the provider reports as absent
pub const STATUS_NOT_FOUND: &str = "NOT_FOUND";
/// Status recorded for a table whose describe did not answer in time
pub const STATUS_ERROR: &str = "ERROR";
/// Status recorded when a live fetch failed while saving
pub const STATUS_FETCH_ERROR: &str = "STATUS_ERROR";

/// Metadata keys written by the worker
pub mod meta {
    pub const NEXT_RETRY_AT: &str = "next_retry_at";
    pub const RETRY_DELAY_MS: &str = "retry_delay_ms";
    pub const DRY_RUN: &str = "dry_run";
    pub const LOCK_ERROR: &str = "lock_error";
    pub const LOCK_ERROR_AT: &str = "lock_error_at";
    pub const LAST_HEALTH_CHECK: &str = "last_health_check";
    pub const HEALTHY: &str = "healthy";
    pub const LAST_REFRESH: &str = "last_refresh";
    pub const SELF_HEALED: &str = "self_healed";
    pub const OWNER_ID: &str = "owner_id";
    pub const PANIC: &str = "panic";

    /// Key holding the fetch error for one table
    pub fn status_error(table: &str) -> String {
        format!("status_error:{table}")
    }
}

/// Live index state inside a [`ResourceStatus`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStatus {
    pub name: String,
    pub status: String,
}

/// What is known about one managed table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceStatus {
    pub name: String,
    pub status: String,
    pub arn: Option<String>,
    pub index_count: usize,
    #[serde(default)]
    pub indexes: Vec<IndexStatus>,
    pub created_at: Option<DateTime<Utc>>,
}

impl ResourceStatus {
    /// An entry with no live details, e.g. `NOT_FOUND` or `ERROR`
    pub fn sentinel(name: impl Into<String>, status: &str) -> Self {
        Self {
            name: name.into(),
            status: status.to_string(),
            arn: None,
            index_count: 0,
            indexes: Vec::new(),
            created_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == "ACTIVE"
    }
}

impl From<&TableDescription> for ResourceStatus {
    fn from(table: &TableDescription) -> Self {
        Self {
            name: table.name.clone(),
            status: table.status.to_string(),
            arn: table.arn.clone(),
            index_count: table.indexes.len(),
            indexes: table
                .indexes
                .iter()
                .map(|i| IndexStatus {
                    name: i.name.clone(),
                    status: i.status.to_string(),
                })
                .collect(),
            created_at: table.created_at,
        }
    }
}

/// The persisted record of the latest run.
///
/// Loaded, changed and saved on every significant transition; the status
/// file is the single source of truth across restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    pub success: bool,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub resources: Vec<ResourceStatus>,
    #[serde(default)]
    pub retry_count: u32,
    pub environment: Environment,
    #[serde(default)]
    pub message: String,
    pub error_message: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl ExecutionResult {
    pub fn new(status: ExecutionStatus, environment: Environment) -> Self {
        Self {
            status,
            success: false,
            start_time: Utc::now(),
            end_time: None,
            duration_ms: None,
            resources: Vec::new(),
            retry_count: 0,
            environment,
            message: String::new(),
            error_message: None,
            metadata: BTreeMap::new(),
        }
    }

    /// Move to `status`, opening a new run window when entering an active state
    pub fn transition(&mut self, status: ExecutionStatus) {
        if status.is_active() && !self.status.is_active() {
            self.start_time = Utc::now();
            self.end_time = None;
            self.duration_ms = None;
            self.error_message = None;
        }
        self.status = status;
        self.success = status.is_success();
    }

    /// Record end time and duration on terminal states, if not already set
    pub fn finalize(&mut self, now: DateTime<Utc>) {
        if !self.status.is_terminal() {
            return;
        }
        let end = *self.end_time.get_or_insert(now);
        if self.duration_ms.is_none() {
            let elapsed = (end - self.start_time).num_milliseconds().max(0);
            self.duration_ms = Some(elapsed as u64);
        }
    }

    /// Insert or replace the entry for `resource.name`
    pub fn upsert_resource(&mut self, resource: ResourceStatus) {
        match self.resources.iter_mut().find(|r| r.name == resource.name) {
            Some(existing) => *existing = resource,
            None => self.resources.push(resource),
        }
    }

    pub fn resource(&self, name: &str) -> Option<&ResourceStatus> {
        self.resources.iter().find(|r| r.name == name)
    }

    pub fn is_dry_run(&self) -> bool {
        self.metadata
            .get(meta::DRY_RUN)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// A real (not dry-run) setup finished
    pub fn is_setup_completed(&self) -> bool {
        self.status == ExecutionStatus::Completed && !self.is_dry_run()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aws::{IndexDescription, TableState};

    #[test]
    fn finalize_only_on_terminal() {
        let mut result = ExecutionResult::new(ExecutionStatus::Running, Environment::Development);
        result.finalize(Utc::now());
        assert!(result.end_time.is_none());

        result.transition(ExecutionStatus::Completed);
        let end = result.start_time + chrono::Duration::milliseconds(1500);
        result.finalize(end);
        assert_eq!(result.end_time, Some(end));
        assert_eq!(result.duration_ms, Some(1500));
        assert!(result.success);

        // Already set values are kept
        result.finalize(end + chrono::Duration::seconds(10));
        assert_eq!(result.duration_ms, Some(1500));
    }

    #[test]
    fn entering_running_opens_new_window() {
        let mut result = ExecutionResult::new(ExecutionStatus::Failed, Environment::Development);
        result.end_time = Some(Utc::now());
        result.duration_ms = Some(10);
        result.error_message = Some("boom".into());

        result.transition(ExecutionStatus::Running);
        assert!(result.end_time.is_none());
        assert!(result.duration_ms.is_none());
        assert!(result.error_message.is_none());
        assert!(!result.success);
    }

    #[test]
    fn upsert_replaces_by_name() {
        let mut result = ExecutionResult::new(ExecutionStatus::Running, Environment::Development);
        result.upsert_resource(ResourceStatus::sentinel("users", STATUS_NOT_FOUND));
        result.upsert_resource(ResourceStatus::sentinel("roles", STATUS_NOT_FOUND));
        result.upsert_resource(ResourceStatus::sentinel("users", "ACTIVE"));

        assert_eq!(result.resources.len(), 2);
        assert_eq!(result.resources[0].name, "users");
        assert!(result.resources[0].is_active());
    }

    #[test]
    fn dry_run_is_not_completed_setup() {
        let mut result = ExecutionResult::new(ExecutionStatus::Completed, Environment::Development);
        assert!(result.is_setup_completed());
        result.metadata.insert(meta::DRY_RUN.into(), Value::Bool(true));
        assert!(!result.is_setup_completed());
    }

    #[test]
    fn resource_status_from_description() {
        let table = TableDescription {
            name: "tablekeeper-development-users".into(),
            status: TableState::Active,
            arn: Some("arn:aws:dynamodb:us-east-1:123:table/users".into()),
            indexes: vec![
                IndexDescription {
                    name: "email-index".into(),
                    status: TableState::Active,
                },
                IndexDescription {
                    name: "organization-index".into(),
                    status: TableState::Creating,
                },
            ],
            created_at: None,
        };
        let status = ResourceStatus::from(&table);
        assert_eq!(status.status, "ACTIVE");
        assert_eq!(status.index_count, 2);
        assert_eq!(status.indexes[1].status, "CREATING");
    }
}
