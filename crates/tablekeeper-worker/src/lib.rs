//! tablekeeper-worker - self-healing DynamoDB table provisioning
//!
//! Keeps a fixed catalog of tables present and valid across restarts and
//! across concurrently running worker instances.
//!
//! ## Modules
//!
//! - [`aws`]: DynamoDB client and error classification
//! - [`catalog`]: the managed tables and their descriptors
//! - [`config`]: JSON configuration
//! - [`lock`]: file-based mutual exclusion between instances
//! - [`status`]: persisted run progress and live status refresh
//! - [`provisioner`]: create, validate, self-heal and delete tables
//! - [`orchestrator`]: the cycle state machine
//! - [`facade`]: service wrapper for external callers

pub mod aws;
pub mod catalog;
pub mod config;
pub mod error;
pub mod facade;
pub mod lock;
pub mod orchestrator;
pub mod provisioner;
pub mod status;
pub mod wait;

pub use config::WorkerConfig;
pub use facade::{HealthStatus, SetupService};
pub use orchestrator::Orchestrator;
