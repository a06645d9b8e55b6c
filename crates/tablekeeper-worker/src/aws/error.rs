//! AWS error classification and handling
//!
//! Provides typed errors for DynamoDB operations using the `.code()` method
//! instead of string matching on Debug format. Every provider-specific
//! "not found" signal is normalised into [`AwsError::NotFound`].

use aws_sdk_dynamodb::error::{DisplayErrorContext, ProvideErrorMetadata};
use thiserror::Error;

/// AWS error categories for retry and cleanup logic
#[derive(Debug, Error)]
pub enum AwsError {
    /// Table was not found (safe to skip in deletion)
    #[error("Table not found: '{table}'")]
    NotFound { table: String },

    /// Table already exists (safe to ignore in create operations)
    #[error("Table already exists")]
    AlreadyExists,

    /// Table is being created, updated, or deleted (retryable)
    #[error("Table is in use by another operation")]
    InUse,

    /// Rate or control-plane limit exceeded (retryable with backoff)
    #[error("Rate limit exceeded")]
    Throttled,

    /// Generic AWS SDK error with code and message
    #[error("AWS error: {message}")]
    Sdk {
        code: Option<String>,
        message: String,
    },
}

impl AwsError {
    /// Check if this is a "not found" error
    pub fn is_not_found(&self) -> bool {
        matches!(self, AwsError::NotFound { .. })
    }

    /// Whether repeating the same request can succeed.
    ///
    /// Errors without a recognised code (dispatch failures, server faults)
    /// count as transient; request and credential rejections do not.
    pub fn is_retryable(&self) -> bool {
        match self {
            AwsError::Throttled | AwsError::InUse => true,
            AwsError::Sdk { code: Some(code), .. } => !REJECTED_CODES.contains(&code.as_str()),
            AwsError::Sdk { code: None, .. } => true,
            AwsError::NotFound { .. } | AwsError::AlreadyExists => false,
        }
    }

    /// Check if this is an "already exists" error
    pub fn is_already_exists(&self) -> bool {
        matches!(self, AwsError::AlreadyExists)
    }
}

/// Known DynamoDB error codes for "not found" conditions
const NOT_FOUND_CODES: &[&str] = &[
    "ResourceNotFoundException",
    "TableNotFoundException",
    "IndexNotFoundException",
];

/// Known DynamoDB error codes for throttling/rate limiting
const THROTTLING_CODES: &[&str] = &[
    "ThrottlingException",
    "ProvisionedThroughputExceededException",
    "RequestLimitExceeded",
    "LimitExceededException",
];

/// Codes for requests DynamoDB will reject again if repeated
const REJECTED_CODES: &[&str] = &[
    "ValidationException",
    "AccessDeniedException",
    "UnrecognizedClientException",
    "MissingAuthenticationTokenException",
    "InvalidSignatureException",
];

/// Error code returned both for duplicate creates and for tables mid-transition
const IN_USE_CODE: &str = "ResourceInUseException";

/// Classify an AWS error from its code and message.
///
/// `ResourceInUseException` is ambiguous in DynamoDB: it is returned for a
/// create against an existing table and for any call against a table that
/// is still transitioning. The message disambiguates.
pub fn classify_aws_error(
    table: &str,
    code: Option<&str>,
    message: Option<&str>,
) -> AwsError {
    let message = message.unwrap_or("Unknown error").to_string();

    match code {
        Some(c) if NOT_FOUND_CODES.contains(&c) => AwsError::NotFound {
            table: table.to_string(),
        },
        Some(c) if THROTTLING_CODES.contains(&c) => AwsError::Throttled,
        Some(IN_USE_CODE) if message.to_ascii_lowercase().contains("already exists") => {
            AwsError::AlreadyExists
        }
        Some(IN_USE_CODE) => AwsError::InUse,
        _ if message.contains("Requested resource not found")
            || message.contains("Cannot do operations on a non-existent table") =>
        {
            AwsError::NotFound {
                table: table.to_string(),
            }
        }
        _ => AwsError::Sdk {
            code: code.map(|s| s.to_string()),
            message,
        },
    }
}

/// Classify an SDK operation error for `table`.
///
/// Works for any `SdkError<E>` since they all implement `ProvideErrorMetadata`.
/// Errors without a code (dispatch failures, timeouts) keep the full
/// context chain as their message.
pub fn classify_sdk_error<E>(table: &str, error: &E) -> AwsError
where
    E: ProvideErrorMetadata + std::error::Error,
{
    match error.code() {
        Some(code) => classify_aws_error(table, Some(code), error.message()),
        None => classify_aws_error(
            table,
            None,
            Some(&DisplayErrorContext(error).to_string()),
        ),
    }
}

/// Classify an error from an anyhow::Error by walking its chain.
///
/// Returns the first `AwsError` found. Falls back to string matching on the
/// Debug representation if no typed error is found.
pub fn classify_anyhow_error(error: &anyhow::Error) -> AwsError {
    for cause in error.chain() {
        if let Some(aws) = cause.downcast_ref::<AwsError>() {
            return match aws {
                AwsError::NotFound { table } => AwsError::NotFound {
                    table: table.clone(),
                },
                AwsError::AlreadyExists => AwsError::AlreadyExists,
                AwsError::InUse => AwsError::InUse,
                AwsError::Throttled => AwsError::Throttled,
                AwsError::Sdk { code, message } => AwsError::Sdk {
                    code: code.clone(),
                    message: message.clone(),
                },
            };
        }
    }

    // Fallback: extract error code from debug string representation
    let debug_str = format!("{:?}", error);
    if let Some(code) = extract_error_code(&debug_str) {
        return classify_aws_error("unknown", Some(&code), Some(&debug_str));
    }

    AwsError::Sdk {
        code: None,
        message: error.to_string(),
    }
}

/// All known DynamoDB error codes for extraction from debug strings
const ALL_KNOWN_CODES: &[&str] = &[
    "ResourceNotFoundException",
    "TableNotFoundException",
    "IndexNotFoundException",
    "ResourceInUseException",
    "ThrottlingException",
    "ProvisionedThroughputExceededException",
    "RequestLimitExceeded",
    "LimitExceededException",
    "ValidationException",
    "AccessDeniedException",
    "UnrecognizedClientException",
    "MissingAuthenticationTokenException",
    "InvalidSignatureException",
];

/// Extract an AWS error code from a debug string representation
fn extract_error_code(debug_str: &str) -> Option<String> {
    for code in ALL_KNOWN_CODES {
        if debug_str.contains(code) {
            return Some((*code).to_string());
        }
    }

    // Try to extract any code from `code: Some("...")` pattern
    if let Some(start) = debug_str.find("code: Some(\"") {
        let rest = &debug_str[start + 12..];
        if let Some(end) = rest.find('"') {
            return Some(rest[..end].to_string());
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_codes() {
        for code in NOT_FOUND_CODES {
            let err = classify_aws_error("users", Some(code), Some("some message"));
            assert!(err.is_not_found(), "Expected NotFound for code: {code}");
        }
    }

    #[test]
    fn not_found_messages_without_code() {
        let err = classify_aws_error("users", None, Some("Requested resource not found"));
        assert!(err.is_not_found());
        let err = classify_aws_error(
            "users",
            Some("ValidationException"),
            Some("Cannot do operations on a non-existent table"),
        );
        assert!(err.is_not_found());
    }

    #[test]
    fn throttling_codes() {
        for code in THROTTLING_CODES {
            let err = classify_aws_error("users", Some(code), Some("msg"));
            assert!(err.is_retryable(), "Expected retryable for code: {code}");
            assert!(matches!(err, AwsError::Throttled));
        }
    }

    #[test]
    fn in_use_is_split_by_message() {
        let err = classify_aws_error(
            "users",
            Some("ResourceInUseException"),
            Some("Table already exists: users"),
        );
        assert!(err.is_already_exists());
        assert!(!err.is_retryable());

        let err = classify_aws_error(
            "users",
            Some("ResourceInUseException"),
            Some("Attempt to change a resource which is still in use"),
        );
        assert!(matches!(err, AwsError::InUse));
        assert!(err.is_retryable());
    }

    #[test]
    fn unknown_and_missing_codes() {
        let err = classify_aws_error("users", Some("SomeNewError"), Some("details"));
        assert!(matches!(err, AwsError::Sdk { .. }));

        assert!(err.is_retryable());

        let err2 = classify_aws_error("users", None, Some("something failed"));
        assert!(matches!(err2, AwsError::Sdk { code: None, .. }));
        assert!(err2.is_retryable());
    }

    #[test]
    fn anyhow_chain_finds_typed_error() {
        let err = anyhow::Error::new(AwsError::NotFound {
            table: "users".to_string(),
        })
        .context("Failed to describe table");
        assert!(classify_anyhow_error(&err).is_not_found());
    }

    #[test]
    fn anyhow_fallback_uses_debug_string() {
        let err = anyhow::anyhow!("service error: ThrottlingException: slow down");
        assert!(matches!(classify_anyhow_error(&err), AwsError::Throttled));
        assert!(matches!(
            classify_anyhow_error(&anyhow::anyhow!("connection refused")),
            AwsError::Sdk { code: None, .. }
        ));
    }

    #[test]
    fn rejections_are_not_retryable() {
        for code in REJECTED_CODES {
            let err = classify_aws_error("users", Some(code), Some("msg"));
            assert!(!err.is_retryable(), "Expected permanent for code: {code}");
        }
        let err = classify_anyhow_error(&anyhow::anyhow!("ValidationException: bad key schema"));
        assert!(!err.is_retryable());
        assert!(classify_anyhow_error(&anyhow::anyhow!("InternalServerError: boom")).is_retryable());
    }

    #[test]
    fn extract_code_from_code_field() {
        let debug_str = r#"SdkError { code: Some("SomeRandomCode"), message: "fail" }"#;
        assert_eq!(
            extract_error_code(debug_str).as_deref(),
            Some("SomeRandomCode")
        );
        assert!(extract_error_code("connection refused").is_none());
    }
}
