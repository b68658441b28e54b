//! Error types shared by the OS drivers.
//!
//! Every driver (iptables shell driver, host endpoint driver) reports failures
//! through [`DriverError`] so the dataplane can tell "already gone" apart from
//! a real failure without knowing which OS it is talking to.

use std::io;
use thiserror::Error;

/// Result type alias for driver operations.
pub type DriverResult<T> = Result<T, DriverError>;

/// Messages the OS tools print when the object being touched does not exist.
const NOT_FOUND_MARKERS: &[&str] = &[
    "endpoint was not found",
    "No chain/target/match by that name",
    "does a matching rule exist",
    "Chain '",
];

/// Errors reported by an OS driver.
#[derive(Debug, Error)]
pub enum DriverError {
    /// The command could not be spawned at all.
    #[error("Failed to execute '{command}': {source}")]
    Spawn {
        /// The command line.
        command: String,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// The command ran and returned a non-zero exit code.
    #[error("Command failed: '{command}' (exit code {exit_code}): {output}")]
    CommandFailed {
        /// The command line.
        command: String,
        /// The exit code.
        exit_code: i32,
        /// Combined stdout/stderr output.
        output: String,
    },

    /// The host endpoint does not exist (the pod may already be gone).
    #[error("Endpoint {0} was not found")]
    EndpointNotFound(String),

    /// The rule chain does not exist.
    #[error("Chain {0} was not found")]
    ChainNotFound(String),

    /// Any other driver failure.
    #[error("{operation} failed: {message}")]
    Operation {
        /// The driver operation (e.g. "apply endpoint policy").
        operation: String,
        /// Error message.
        message: String,
    },
}

impl DriverError {
    /// Creates a generic operation error.
    pub fn operation(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Operation {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Creates an endpoint-not-found error.
    pub fn endpoint_not_found(endpoint_id: impl Into<String>) -> Self {
        Self::EndpointNotFound(endpoint_id.into())
    }

    /// Returns true if the target object does not exist.
    ///
    /// Drivers do not always surface a typed not-found error, so the
    /// rendered message is checked for the tools' well-known wording too.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::EndpointNotFound(_) | Self::ChainNotFound(_) => true,
            Self::CommandFailed { output, .. } => {
                NOT_FOUND_MARKERS.iter().any(|m| output.contains(m))
            }
            Self::Operation { message, .. } => {
                NOT_FOUND_MARKERS.iter().any(|m| message.contains(m))
            }
            Self::Spawn { .. } => false,
        }
    }

    /// Returns true if retrying the same call later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::CommandFailed { .. } | Self::Operation { .. })
            && !self.is_not_found()
    }
}
