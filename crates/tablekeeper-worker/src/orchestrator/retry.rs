//! Cycle-level retry delay

use std::time::Duration;

use tablekeeper_common::defaults::MAX_RETRY_DELAY;

/// Delay before retry `retry_count`: `base * multiplier^retry_count`,
/// capped at one hour.
pub fn backoff_delay(base: Duration, multiplier: f64, retry_count: u32) -> Duration {
    let exponent = i32::try_from(retry_count).unwrap_or(i32::MAX);
    let secs = base.as_secs_f64() * multiplier.powi(exponent);
    if !secs.is_finite() || secs >= MAX_RETRY_DELAY.as_secs_f64() {
        return MAX_RETRY_DELAY;
    }
    Duration::from_secs_f64(secs.max(0.0))
}
