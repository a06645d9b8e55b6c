//! Cycle schedule expressions
//!
//! Accepted forms: `@every <duration>`, `@hourly`, `@daily`, or a bare
//! humantime duration such as `15m`.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::config::Environment;
use crate::error::ConfigError;

/// A fixed-interval cycle schedule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    interval: Duration,
    expression: String,
}

impl Schedule {
    pub fn every(interval: Duration) -> Self {
        Self {
            interval,
            expression: format!("@every {}", humantime::format_duration(interval)),
        }
    }

    /// Frequent in development, sparse in production
    pub fn for_environment(environment: Environment) -> Self {
        let minutes = match environment {
            Environment::Development => 2,
            Environment::Staging => 15,
            Environment::Production => 60,
        };
        Self::every(Duration::from_secs(minutes * 60))
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}

impl FromStr for Schedule {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let expression = s.trim();
        let invalid = |reason: String| ConfigError::InvalidSchedule {
            expression: s.to_string(),
            reason,
        };

        let interval = match expression {
            "@hourly" => Duration::from_secs(60 * 60),
            "@daily" => Duration::from_secs(24 * 60 * 60),
            _ => {
                let duration = expression
                    .strip_prefix("@every")
                    .map(str::trim)
                    .unwrap_or(expression);
                if duration.is_empty() {
                    return Err(invalid("missing duration".to_string()));
                }
                humantime::parse_duration(duration).map_err(|e| invalid(e.to_string()))?
            }
        };

        if interval.is_zero() {
            return Err(invalid("interval must be greater than 0".to_string()));
        }

        Ok(Self {
            interval,
            expression: expression.to_string(),
        })
    }
}
