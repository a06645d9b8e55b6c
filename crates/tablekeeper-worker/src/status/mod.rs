//! Run progress persistence and live status reconciliation
//!
//! - types: the `ExecutionResult` document persisted to the status file
//! - manager: atomic load/modify/save of that document
//! - fetcher: bounded live status lookups
//! - refresher: background reconciliation of the status file

mod fetcher;
mod manager;
mod refresher;
pub mod types;

pub use fetcher::FastResourceStatusFetcher;
pub use manager::StatusManager;
pub use refresher::{LightweightStatusRefresher, RefreshRequest, RefresherConfig};
pub use types::{
    ExecutionResult, IndexStatus, ResourceStatus, STATUS_ERROR, STATUS_FETCH_ERROR,
    STATUS_NOT_FOUND, meta,
};
