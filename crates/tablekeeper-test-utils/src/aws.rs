//! AWS test utilities
//!
//! Provides region detection and unique table prefixes for tests that run
//! against a real DynamoDB account.

use chrono::Utc;

/// Get the AWS region for tests.
///
/// Checks `AWS_REGION`, then `AWS_DEFAULT_REGION`, then falls back to
/// us-east-1.
pub fn get_test_region() -> String {
    std::env::var("AWS_REGION")
        .or_else(|_| std::env::var("AWS_DEFAULT_REGION"))
        .unwrap_or_else(|_| "us-east-1".to_string())
}

/// Generate a unique table prefix so concurrent test runs never share tables.
///
/// Format: `tktest-{timestamp_ms}-{counter}`
///
/// # Example
///
/// ```
/// use tablekeeper_test_utils::aws::test_table_prefix;
///
/// let prefix = test_table_prefix();
/// assert!(prefix.starts_with("tktest-"));
/// ```
pub fn test_table_prefix() -> String {
    use std::sync::atomic::{AtomicU32, Ordering};
    static COUNTER: AtomicU32 = AtomicU32::new(0);

    let ts = Utc::now().timestamp_millis();
    let counter = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("tktest-{ts}-{counter}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixes_are_unique() {
        assert_ne!(test_table_prefix(), test_table_prefix());
    }
}
