//! Table tag constants for tablekeeper
//!
//! Every table the worker creates carries these tags so operators can tell
//! managed tables apart from hand-made ones.
//!
//! ## Tag Schema
//!
//! | Tag Key | Description |
//! |---------|-------------|
//! | `tablekeeper:managed-by` | Static identifier ("tablekeeper") |
//! | `tablekeeper:environment` | Deployment environment |
//! | `tablekeeper:table` | Logical table name (e.g. "users") |
//! | `tablekeeper:created-at` | RFC 3339 creation timestamp |

/// Tag key for ownership - all managed tables have this
pub const TAG_MANAGED_BY: &str = "tablekeeper:managed-by";

/// Tag value for ownership
pub const TAG_MANAGED_BY_VALUE: &str = "tablekeeper";

/// Tag key for the deployment environment
pub const TAG_ENVIRONMENT: &str = "tablekeeper:environment";

/// Tag key for the logical table name
pub const TAG_TABLE: &str = "tablekeeper:table";

/// Tag key for creation timestamp (RFC 3339 format)
pub const TAG_CREATED_AT: &str = "tablekeeper:created-at";

/// Helper to format creation timestamp for tags
pub fn format_created_at(time: chrono::DateTime<chrono::Utc>) -> String {
    time.to_rfc3339()
}

/// Helper to parse creation timestamp from tags
pub fn parse_created_at(s: &str) -> Option<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&chrono::Utc))
}
