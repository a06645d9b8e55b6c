//! DynamoDB table snapshot types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state reported by DescribeTable for a table or index
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum TableState {
    Creating,
    Active,
    Updating,
    Deleting,
    InaccessibleEncryptionCredentials,
    Archiving,
    Archived,
    /// A state this build does not know about
    Unknown,
}

impl TableState {
    /// Parse a provider status string, mapping anything unrecognised to `Unknown`
    pub fn from_provider(status: &str) -> Self {
        status.parse().unwrap_or(TableState::Unknown)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, TableState::Active)
    }
}

/// A secondary index as reported by the provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDescription {
    pub name: String,
    pub status: TableState,
}

/// Point-in-time description of one table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDescription {
    pub name: String,
    pub status: TableState,
    pub arn: Option<String>,
    pub indexes: Vec<IndexDescription>,
    pub created_at: Option<DateTime<Utc>>,
}

impl TableDescription {
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    pub fn index_names(&self) -> Vec<&str> {
        self.indexes.iter().map(|i| i.name.as_str()).collect()
    }

    /// Whether the table and every one of its indexes report ACTIVE
    pub fn fully_active(&self) -> bool {
        self.is_active() && self.indexes.iter().all(|i| i.status.is_active())
    }
}
