//! DynamoDB table management

mod operations;
mod types;

pub use operations::TableOperations;
pub use types::{IndexDescription, TableDescription, TableState};

#[cfg(test)]
pub use operations::MockTableOperations;

use crate::aws::context::{AwsContext, FromAwsContext};
use crate::aws::error::classify_sdk_error;
use crate::catalog::{AttributeKind, BillingMode, KeyAttribute, ResourceDescriptor};
use anyhow::{Context, Result};
use aws_sdk_dynamodb::{
    Client,
    types::{
        AttributeDefinition, BillingMode as SdkBillingMode, GlobalSecondaryIndex,
        KeySchemaElement, KeyType, Projection, ProjectionType, ProvisionedThroughput,
        ScalarAttributeType, Tag,
    },
};
use chrono::{DateTime, Utc};
use tracing::{debug, info};

/// Read/write capacity used when a table is created in provisioned mode
const PROVISIONED_CAPACITY_UNITS: i64 = 5;

/// DynamoDB client for managed tables
pub struct DynamoClient {
    client: Client,
    region: String,
}

impl DynamoClient {
    /// Create a new client (loads AWS config from environment)
    pub async fn new(region: &str) -> Self {
        let ctx = AwsContext::new(region).await;
        Self::from_context(&ctx)
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    /// Submit a CreateTable request for `descriptor`
    pub async fn create_table(&self, descriptor: &ResourceDescriptor) -> Result<()> {
        let attributes = descriptor
            .attribute_definitions()
            .into_iter()
            .map(|attr| {
                AttributeDefinition::builder()
                    .attribute_name(&attr.name)
                    .attribute_type(scalar_type(attr.kind))
                    .build()
            })
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to build attribute definitions")?;

        let indexes = descriptor
            .indexes
            .iter()
            .map(|index| -> Result<GlobalSecondaryIndex> {
                let mut builder = GlobalSecondaryIndex::builder()
                    .index_name(&index.name)
                    .set_key_schema(Some(key_schema(&index.partition_key, index.sort_key.as_ref())?))
                    .projection(
                        Projection::builder()
                            .projection_type(ProjectionType::All)
                            .build(),
                    );
                if descriptor.billing_mode == BillingMode::Provisioned {
                    builder = builder.provisioned_throughput(provisioned_throughput()?);
                }
                Ok(builder.build()?)
            })
            .collect::<Result<Vec<_>>>()
            .context("Failed to build index definitions")?;

        let tags = descriptor
            .tags
            .iter()
            .map(|(k, v)| Tag::builder().key(k).value(v).build())
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to build tags")?;

        let mut request = self
            .client
            .create_table()
            .table_name(&descriptor.name)
            .set_attribute_definitions(Some(attributes))
            .set_key_schema(Some(key_schema(
                &descriptor.partition_key,
                descriptor.sort_key.as_ref(),
            )?))
            .set_tags(Some(tags));

        if !indexes.is_empty() {
            request = request.set_global_secondary_indexes(Some(indexes));
        }

        request = match descriptor.billing_mode {
            BillingMode::PayPerRequest => request.billing_mode(SdkBillingMode::PayPerRequest),
            BillingMode::Provisioned => request
                .billing_mode(SdkBillingMode::Provisioned)
                .provisioned_throughput(provisioned_throughput()?),
        };

        request
            .send()
            .await
            .map_err(|e| classify_sdk_error(&descriptor.name, &e))?;

        info!(
            table = %descriptor.name,
            indexes = descriptor.indexes.len(),
            billing_mode = %descriptor.billing_mode,
            "Create table request accepted"
        );
        Ok(())
    }

    /// Describe a table; a missing table surfaces as `AwsError::NotFound`
    pub async fn describe_table(&self, name: &str) -> Result<TableDescription> {
        let output = self
            .client
            .describe_table()
            .table_name(name)
            .send()
            .await
            .map_err(|e| classify_sdk_error(name, &e))?;

        let table = output
            .table()
            .with_context(|| format!("DescribeTable returned no table for '{name}'"))?;

        let indexes = table
            .global_secondary_indexes()
            .iter()
            .map(|gsi| IndexDescription {
                name: gsi.index_name().unwrap_or_default().to_string(),
                status: gsi
                    .index_status()
                    .map(|s| TableState::from_provider(s.as_str()))
                    .unwrap_or(TableState::Unknown),
            })
            .collect();

        let description = TableDescription {
            name: table.table_name().unwrap_or(name).to_string(),
            status: table
                .table_status()
                .map(|s| TableState::from_provider(s.as_str()))
                .unwrap_or(TableState::Unknown),
            arn: table.table_arn().map(str::to_string),
            indexes,
            created_at: table
                .creation_date_time()
                .and_then(|t| DateTime::<Utc>::from_timestamp(t.secs(), t.subsec_nanos())),
        };

        debug!(table = %name, status = %description.status, "Described table");
        Ok(description)
    }

    /// Submit a DeleteTable request
    pub async fn delete_table(&self, name: &str) -> Result<()> {
        self.client
            .delete_table()
            .table_name(name)
            .send()
            .await
            .map_err(|e| classify_sdk_error(name, &e))?;

        info!(table = %name, "Delete table request accepted");
        Ok(())
    }
}

impl FromAwsContext for DynamoClient {
    fn from_context(ctx: &AwsContext) -> Self {
        Self {
            client: ctx.dynamodb_client(),
            region: ctx.region().to_string(),
        }
    }
}

fn scalar_type(kind: AttributeKind) -> ScalarAttributeType {
    match kind {
        AttributeKind::S => ScalarAttributeType::S,
        AttributeKind::N => ScalarAttributeType::N,
    }
}

fn key_schema(
    partition_key: &KeyAttribute,
    sort_key: Option<&KeyAttribute>,
) -> Result<Vec<KeySchemaElement>> {
    let mut schema = vec![
        KeySchemaElement::builder()
            .attribute_name(&partition_key.name)
            .key_type(KeyType::Hash)
            .build()?,
    ];
    if let Some(sort_key) = sort_key {
        schema.push(
            KeySchemaElement::builder()
                .attribute_name(&sort_key.name)
                .key_type(KeyType::Range)
                .build()?,
        );
    }
    Ok(schema)
}

fn provisioned_throughput() -> Result<ProvisionedThroughput> {
    Ok(ProvisionedThroughput::builder()
        .read_capacity_units(PROVISIONED_CAPACITY_UNITS)
        .write_capacity_units(PROVISIONED_CAPACITY_UNITS)
        .build()?)
}
