//! Table operations trait for testing

use super::types::TableDescription;
use super::DynamoClient;
use crate::catalog::ResourceDescriptor;
use anyhow::Result;
use async_trait::async_trait;

/// Trait for table operations that can be mocked in tests.
///
/// Abstracts the provider so provisioning, status fetching and the
/// orchestrator can run against an in-memory store.
///
/// `describe_table` reports a missing table as an error carrying
/// [`AwsError::NotFound`](crate::aws::AwsError::NotFound); callers check it
/// with [`classify_anyhow_error`](crate::aws::classify_anyhow_error).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TableOperations: Send + Sync {
    /// Issue a create request; returns once the provider accepted it
    async fn create_table(&self, descriptor: &ResourceDescriptor) -> Result<()>;

    /// Describe a table by physical name
    async fn describe_table(&self, name: &str) -> Result<TableDescription>;

    /// Issue a delete request; returns once the provider accepted it
    async fn delete_table(&self, name: &str) -> Result<()>;
}

#[async_trait]
impl TableOperations for DynamoClient {
    async fn create_table(&self, descriptor: &ResourceDescriptor) -> Result<()> {
        DynamoClient::create_table(self, descriptor).await
    }

    async fn describe_table(&self, name: &str) -> Result<TableDescription> {
        DynamoClient::describe_table(self, name).await
    }

    async fn delete_table(&self, name: &str) -> Result<()> {
        DynamoClient::delete_table(self, name).await
    }
}
