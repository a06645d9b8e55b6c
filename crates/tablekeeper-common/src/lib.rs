//! tablekeeper-common - Shared types and constants
//!
//! This crate holds the pieces shared by the worker and its test utilities,
//! without any AWS SDK dependencies to keep it lightweight.
//!
//! ## Modules
//!
//! - [`defaults`]: Default configuration values and timing budgets
//! - [`status`]: Execution state machine shared by the status file and orchestrator
//! - [`tags`]: Table tag constants for discovery and ownership

pub mod defaults;
pub mod status;
pub mod tags;

pub use status::ExecutionStatus;
