//! AWS client modules for the worker
//!
//! - context: shared SDK configuration
//! - dynamodb: table create/describe/delete behind the `TableOperations` seam
//! - error: DynamoDB error classification

pub mod context;
pub mod dynamodb;
pub mod error;

pub use context::{AwsContext, FromAwsContext};
pub use dynamodb::{
    DynamoClient, IndexDescription, TableDescription, TableOperations, TableState,
};
#[cfg(test)]
pub use dynamodb::MockTableOperations;
pub use error::{AwsError, classify_anyhow_error, classify_aws_error};
