//! Error types for dataplane operations.

use npm_common::DriverError;
use thiserror::Error;

use crate::report::ApplyReport;
use crate::types::BackendKind;

/// Result type alias for dataplane operations.
pub type Result<T> = std::result::Result<T, DataplaneError>;

/// A fan-out operation that did not succeed everywhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialFailure {
    /// The manager operation (e.g. "add policies").
    pub operation: String,
    /// What succeeded and what failed.
    pub report: ApplyReport,
}

/// Errors returned by the policy manager and backends.
#[derive(Debug, Error)]
pub enum DataplaneError {
    /// Malformed policy content. Nothing was mutated.
    #[error("Invalid policy {key}: {reason}")]
    Validation {
        /// Policy key.
        key: String,
        /// What is wrong.
        reason: String,
    },

    /// A required setting is missing or inconsistent.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Some targets failed; the report lists the rest as succeeded.
    #[error("Failed to {}: {}", .0.operation, .0.report)]
    Partial(Box<PartialFailure>),

    /// The active backend has no such operation.
    #[error("{operation} is not supported by the {backend} backend")]
    Unsupported {
        /// The manager operation.
        operation: String,
        /// The active backend.
        backend: BackendKind,
    },

    /// A single driver call failed.
    #[error(transparent)]
    Driver(#[from] DriverError),

    /// ACL settings could not be (de)serialized.
    #[error("Failed to encode ACL settings: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl DataplaneError {
    /// Creates a validation error.
    pub fn validation(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Creates an unsupported-operation error.
    pub fn unsupported(operation: impl Into<String>, backend: BackendKind) -> Self {
        Self::Unsupported {
            operation: operation.into(),
            backend,
        }
    }

    /// The success/failure report of a partial failure.
    pub fn partial_report(&self) -> Option<&ApplyReport> {
        match self {
            Self::Partial(partial) => Some(&partial.report),
            _ => None,
        }
    }

    /// Returns true if the same call may succeed later.
    ///
    /// Validation and configuration errors never do.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Partial(_) => true,
            Self::Driver(e) => e.is_retryable(),
            Self::Validation { .. }
            | Self::Config(_)
            | Self::Unsupported { .. }
            | Self::Encoding(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_display() {
        let err = DataplaneError::validation("ns/p1", "port 0 is not a valid port");
        assert_eq!(
            err.to_string(),
            "Invalid policy ns/p1: port 0 is not a valid port"
        );
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_partial_display() {
        let mut report = ApplyReport::new();
        report.record_failure("ep-2", "access denied");
        let err = report.into_result("add policies").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Failed to add policies: 1 failure(s): [ep-2: access denied]"
        );
        assert!(err.is_retryable());
    }

    #[test]
    fn test_unsupported_display() {
        let err = DataplaneError::unsupported("add all policies", BackendKind::Chain);
        assert_eq!(
            err.to_string(),
            "add all policies is not supported by the chain backend"
        );
    }

    #[test]
    fn test_driver_error_conversion() {
        let err: DataplaneError = DriverError::endpoint_not_found("ep").into();
        assert!(matches!(err, DataplaneError::Driver(_)));
        assert!(err.partial_report().is_none());
    }
}
