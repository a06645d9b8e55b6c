//! In-memory table store
//!
//! Behaves like DynamoDB closely enough for orchestration tests: creates
//! start in CREATING and become ACTIVE after a configurable number of
//! describes, deletes pass through DELETING, and missing tables surface as
//! `AwsError::NotFound`. Failures can be injected per operation.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::Utc;
use tablekeeper_worker::aws::{
    AwsError, IndexDescription, TableDescription, TableOperations, TableState,
};
use tablekeeper_worker::catalog::ResourceDescriptor;

#[derive(Debug, Default)]
struct StoredTable {
    description: Option<TableDescription>,
    describes_until_active: u32,
}

#[derive(Debug, Default)]
struct StoreState {
    tables: BTreeMap<String, StoredTable>,
    failing_creates: u32,
    failing_creates_for: HashMap<String, u32>,
    failing_deletes: u32,
    index_drift: HashMap<String, u32>,
    describes_until_active: u32,
    hang_describes: bool,
}

/// Fake `TableOperations` backed by a map
#[derive(Debug, Default)]
pub struct InMemoryTableStore {
    state: Mutex<StoreState>,
    create_calls: AtomicUsize,
    delete_calls: AtomicUsize,
    describe_calls: AtomicUsize,
}

impl InMemoryTableStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add an ACTIVE table matching `descriptor`
    pub fn insert_table(&self, descriptor: &ResourceDescriptor) {
        let names = descriptor.expected_index_names();
        self.insert_table_with_indexes(&descriptor.name, &names);
    }

    /// Add an ACTIVE table with exactly these indexes
    pub fn insert_table_with_indexes(&self, name: &str, indexes: &[&str]) {
        let description = active_table(name, indexes.iter().map(|s| s.to_string()).collect());
        self.state().tables.insert(
            name.to_string(),
            StoredTable {
                description: Some(description),
                describes_until_active: 0,
            },
        );
    }

    /// The next `count` creates fail, whatever the table
    pub fn fail_creates(&self, count: u32) {
        self.state().failing_creates = count;
    }

    /// The next `count` creates of `table` fail
    pub fn fail_creates_for(&self, table: &str, count: u32) {
        self.state().failing_creates_for.insert(table.to_string(), count);
    }

    /// The next `count` deletes fail
    pub fn fail_deletes(&self, count: u32) {
        self.state().failing_deletes = count;
    }

    /// The next `count` creates of `table` come up missing their last index
    pub fn drift_indexes_on_create(&self, table: &str, count: u32) {
        self.state().index_drift.insert(table.to_string(), count);
    }

    /// New tables report CREATING for this many describes
    pub fn activate_after(&self, describes: u32) {
        self.state().describes_until_active = describes;
    }

    /// Describes never answer
    pub fn hang_describes(&self, hang: bool) {
        self.state().hang_describes = hang;
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    pub fn describe_calls(&self) -> usize {
        self.describe_calls.load(Ordering::SeqCst)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.state().tables.contains_key(name)
    }

    pub fn table(&self, name: &str) -> Option<TableDescription> {
        self.state()
            .tables
            .get(name)
            .and_then(|t| t.description.clone())
    }

    pub fn table_names(&self) -> Vec<String> {
        self.state().tables.keys().cloned().collect()
    }
}

fn active_table(name: &str, indexes: Vec<String>) -> TableDescription {
    TableDescription {
        name: name.to_string(),
        status: TableState::Active,
        arn: Some(format!("arn:aws:dynamodb:us-east-1:000000000000:table/{name}")),
        indexes: indexes
            .into_iter()
            .map(|name| IndexDescription {
                name,
                status: TableState::Active,
            })
            .collect(),
        created_at: Some(Utc::now()),
    }
}

fn take_one(remaining: &mut u32) -> bool {
    if *remaining > 0 {
        *remaining -= 1;
        true
    } else {
        false
    }
}

fn not_found(name: &str) -> anyhow::Error {
    AwsError::NotFound {
        table: name.to_string(),
    }
    .into()
}

#[async_trait]
impl TableOperations for InMemoryTableStore {
    async fn create_table(&self, descriptor: &ResourceDescriptor) -> Result<()> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state();

        if take_one(&mut state.failing_creates) {
            return Err(anyhow!("InternalServerError: injected create failure"));
        }
        if let Some(remaining) = state.failing_creates_for.get_mut(&descriptor.name) {
            if take_one(remaining) {
                return Err(anyhow!(
                    "InternalServerError: injected create failure for {}",
                    descriptor.name
                ));
            }
        }
        if state.tables.contains_key(&descriptor.name) {
            return Err(AwsError::AlreadyExists.into());
        }

        let mut indexes: Vec<String> = descriptor.indexes.iter().map(|i| i.name.clone()).collect();
        if let Some(remaining) = state.index_drift.get_mut(&descriptor.name) {
            if take_one(remaining) {
                indexes.pop();
            }
        }

        let describes_until_active = state.describes_until_active;
        let mut description = active_table(&descriptor.name, indexes);
        if describes_until_active > 0 {
            description.status = TableState::Creating;
        }
        state.tables.insert(
            descriptor.name.clone(),
            StoredTable {
                description: Some(description),
                describes_until_active,
            },
        );
        Ok(())
    }

    async fn describe_table(&self, name: &str) -> Result<TableDescription> {
        self.describe_calls.fetch_add(1, Ordering::SeqCst);
        if self.state().hang_describes {
            std::future::pending::<()>().await;
        }

        let mut state = self.state();
        let Some(table) = state.tables.get_mut(name) else {
            return Err(not_found(name));
        };
        let Some(mut description) = table.description.clone() else {
            return Err(not_found(name));
        };

        match description.status {
            TableState::Deleting => {
                // Gone after the first describe that sees DELETING
                state.tables.remove(name);
            }
            TableState::Creating => {
                if take_one(&mut table.describes_until_active) {
                    return Ok(description);
                }
                description.status = TableState::Active;
                table.description = Some(description.clone());
            }
            _ => {}
        }
        Ok(description)
    }

    async fn delete_table(&self, name: &str) -> Result<()> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state();

        if take_one(&mut state.failing_deletes) {
            return Err(anyhow!("InternalServerError: injected delete failure"));
        }
        let Some(table) = state.tables.get_mut(name) else {
            return Err(not_found(name));
        };
        if let Some(description) = table.description.as_mut() {
            description.status = TableState::Deleting;
        }
        Ok(())
    }
}
