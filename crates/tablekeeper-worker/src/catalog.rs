//! Managed table catalog
//!
//! The worker manages a fixed set of tables. Each catalog entry fixes the
//! key schema and the global secondary indexes, which in turn fix the index
//! names and count that validation expects. [`descriptors_for`] turns the
//! configured subset into [`ResourceDescriptor`]s once per cycle.

use std::collections::{BTreeMap, HashSet};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tablekeeper_common::tags::{
    TAG_CREATED_AT, TAG_ENVIRONMENT, TAG_MANAGED_BY, TAG_MANAGED_BY_VALUE, TAG_TABLE,
    format_created_at,
};

use crate::config::{Environment, WorkerConfig};
use crate::error::ConfigError;

/// DynamoDB scalar attribute type for key attributes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::AsRefStr)]
pub enum AttributeKind {
    /// String
    S,
    /// Number
    N,
}

/// Table billing mode
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::Display, strum::AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum BillingMode {
    #[default]
    PayPerRequest,
    Provisioned,
}

/// A key attribute (partition or sort key)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyAttribute {
    pub name: String,
    pub kind: AttributeKind,
}

/// A global secondary index on a managed table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDescriptor {
    pub name: String,
    pub partition_key: KeyAttribute,
    pub sort_key: Option<KeyAttribute>,
}

/// Everything needed to create and validate one managed table.
///
/// Derived from static configuration and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    /// Physical table name (`<prefix>-<environment>-<logical>`)
    pub name: String,
    /// Catalog name (e.g. "users")
    pub logical_name: String,
    pub environment: Environment,
    pub billing_mode: BillingMode,
    pub partition_key: KeyAttribute,
    pub sort_key: Option<KeyAttribute>,
    pub indexes: Vec<IndexDescriptor>,
    pub tags: BTreeMap<String, String>,
}

impl ResourceDescriptor {
    /// Number of secondary indexes validation expects
    pub fn expected_index_count(&self) -> usize {
        self.indexes.len()
    }

    /// Names of the secondary indexes validation expects
    pub fn expected_index_names(&self) -> Vec<&str> {
        self.indexes.iter().map(|i| i.name.as_str()).collect()
    }

    /// Every attribute that must appear in the table's attribute definitions,
    /// deduplicated, in first-seen order.
    pub fn attribute_definitions(&self) -> Vec<&KeyAttribute> {
        let mut seen = HashSet::new();
        std::iter::once(&self.partition_key)
            .chain(self.sort_key.as_ref())
            .chain(
                self.indexes
                    .iter()
                    .flat_map(|i| std::iter::once(&i.partition_key).chain(i.sort_key.as_ref())),
            )
            .filter(|attr| seen.insert(attr.name.as_str()))
            .collect()
    }
}

struct KeyDef(&'static str, AttributeKind);

struct IndexDef {
    name: &'static str,
    partition_key: KeyDef,
    sort_key: Option<KeyDef>,
}

struct TableDef {
    name: &'static str,
    partition_key: KeyDef,
    sort_key: Option<KeyDef>,
    indexes: &'static [IndexDef],
}

use AttributeKind::S;

const ORGANIZATION_INDEX: IndexDef = IndexDef {
    name: "organization-index",
    partition_key: KeyDef("organization_id", S),
    sort_key: None,
};

const CATALOG: &[TableDef] = &[
    TableDef {
        name: "users",
        partition_key: KeyDef("id", S),
        sort_key: None,
        indexes: &[
            IndexDef {
                name: "email-index",
                partition_key: KeyDef("email", S),
                sort_key: None,
            },
            ORGANIZATION_INDEX,
        ],
    },
    TableDef {
        name: "roles",
        partition_key: KeyDef("id", S),
        sort_key: None,
        indexes: &[ORGANIZATION_INDEX],
    },
    TableDef {
        name: "permissions",
        partition_key: KeyDef("role_id", S),
        sort_key: Some(KeyDef("permission", S)),
        indexes: &[IndexDef {
            name: "permission-index",
            partition_key: KeyDef("permission", S),
            sort_key: None,
        }],
    },
    TableDef {
        name: "organizations",
        partition_key: KeyDef("id", S),
        sort_key: None,
        indexes: &[IndexDef {
            name: "slug-index",
            partition_key: KeyDef("slug", S),
            sort_key: None,
        }],
    },
    TableDef {
        name: "crews",
        partition_key: KeyDef("id", S),
        sort_key: None,
        indexes: &[ORGANIZATION_INDEX],
    },
    TableDef {
        name: "jobs",
        partition_key: KeyDef("id", S),
        sort_key: None,
        indexes: &[
            ORGANIZATION_INDEX,
            IndexDef {
                name: "crew-index",
                partition_key: KeyDef("crew_id", S),
                sort_key: Some(KeyDef("scheduled_at", S)),
            },
            IndexDef {
                name: "status-index",
                partition_key: KeyDef("status", S),
                sort_key: Some(KeyDef("scheduled_at", S)),
            },
        ],
    },
];

/// Whether `name` is a table the worker knows how to manage
pub fn is_known_table(name: &str) -> bool {
    CATALOG.iter().any(|t| t.name == name)
}

/// Logical names of every catalog table
pub fn known_tables() -> impl Iterator<Item = &'static str> {
    CATALOG.iter().map(|t| t.name)
}

/// Physical table name for a logical table in an environment
pub fn physical_name(prefix: &str, environment: Environment, logical: &str) -> String {
    format!("{prefix}-{environment}-{logical}")
}

fn key(def: &KeyDef) -> KeyAttribute {
    KeyAttribute {
        name: def.0.to_string(),
        kind: def.1,
    }
}

/// Derive descriptors for every required table in the config, in config order.
pub fn descriptors_for(config: &WorkerConfig) -> Result<Vec<ResourceDescriptor>, ConfigError> {
    let created_at = format_created_at(Utc::now());

    config
        .tables
        .required
        .iter()
        .map(|logical| {
            let def = CATALOG
                .iter()
                .find(|t| t.name == logical.as_str())
                .ok_or_else(|| ConfigError::UnknownTable(logical.clone()))?;

            let tags = BTreeMap::from([
                (TAG_MANAGED_BY.to_string(), TAG_MANAGED_BY_VALUE.to_string()),
                (TAG_ENVIRONMENT.to_string(), config.environment.to_string()),
                (TAG_TABLE.to_string(), def.name.to_string()),
                (TAG_CREATED_AT.to_string(), created_at.clone()),
            ]);

            Ok(ResourceDescriptor {
                name: physical_name(&config.tables.prefix, config.environment, def.name),
                logical_name: def.name.to_string(),
                environment: config.environment,
                billing_mode: config.tables.billing_mode,
                partition_key: key(&def.partition_key),
                sort_key: def.sort_key.as_ref().map(key),
                indexes: def
                    .indexes
                    .iter()
                    .map(|i| IndexDescriptor {
                        name: i.name.to_string(),
                        partition_key: key(&i.partition_key),
                        sort_key: i.sort_key.as_ref().map(key),
                    })
                    .collect(),
                tags,
            })
        })
        .collect()
}
