//! Shared test utilities for tablekeeper
//!
//! ## Modules
//!
//! - [`aws`]: AWS region detection and unique table prefixes for live tests
//! - [`fixtures`]: configuration and timing tuned for fast tests
//! - [`store`]: in-memory `TableOperations` with failure injection

pub mod aws;
pub mod fixtures;
pub mod store;

pub use aws::{get_test_region, test_table_prefix};
pub use fixtures::{fast_timing, test_config, test_options};
pub use store::InMemoryTableStore;
