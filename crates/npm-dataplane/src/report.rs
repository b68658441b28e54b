//! Partial-success bookkeeping for multi-endpoint operations.
//!
//! Every fan-out (one policy over many endpoints, many endpoints at bootup)
//! keeps going after a failure. The outcome is an [`ApplyReport`]: what
//! succeeded, per policy, and every `(target, cause)` pair that did not.

use std::collections::BTreeMap;
use std::fmt;

use crate::error::{DataplaneError, PartialFailure};

/// Endpoint address → endpoint identifier.
pub type EndpointSet = BTreeMap<String, String>;

/// One failed target of a fan-out operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetFailure {
    /// Endpoint id, chain name or policy key.
    pub target: String,
    /// Rendered cause.
    pub cause: String,
}

impl TargetFailure {
    pub fn new(target: impl Into<String>, cause: impl fmt::Display) -> Self {
        Self {
            target: target.into(),
            cause: cause.to_string(),
        }
    }
}

impl fmt::Display for TargetFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.target, self.cause)
    }
}

/// Outcome of a fan-out operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Policy key → endpoints where the operation succeeded.
    pub succeeded: BTreeMap<String, EndpointSet>,
    /// Every failure, in the order it happened.
    pub failures: Vec<TargetFailure>,
}

impl ApplyReport {
    /// Creates an empty report.
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a policy as handled even if no endpoint was involved.
    pub fn record_policy(&mut self, policy_key: &str) {
        self.succeeded.entry(policy_key.to_string()).or_default();
    }

    /// Records a successful (policy, endpoint) pair.
    pub fn record_success(&mut self, policy_key: &str, endpoint_ip: &str, endpoint_id: &str) {
        self.succeeded
            .entry(policy_key.to_string())
            .or_default()
            .insert(endpoint_ip.to_string(), endpoint_id.to_string());
    }

    /// Records a failure.
    pub fn record_failure(&mut self, target: impl Into<String>, cause: impl fmt::Display) {
        self.failures.push(TargetFailure::new(target, cause));
    }

    /// Folds another report into this one.
    pub fn merge(&mut self, other: ApplyReport) {
        for (key, endpoints) in other.succeeded {
            self.succeeded.entry(key).or_default().extend(endpoints);
        }
        self.failures.extend(other.failures);
    }

    /// Endpoints that succeeded for one policy.
    pub fn endpoints_for(&self, policy_key: &str) -> Option<&EndpointSet> {
        self.succeeded.get(policy_key)
    }

    /// Returns true if nothing failed.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// Returns the report on full success, or a partial-failure error
    /// carrying the report otherwise.
    pub fn into_result(self, operation: &str) -> Result<Self, DataplaneError> {
        if self.is_complete() {
            Ok(self)
        } else {
            Err(DataplaneError::Partial(Box::new(PartialFailure {
                operation: operation.to_string(),
                report: self,
            })))
        }
    }
}

impl fmt::Display for ApplyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failure(s): [", self.failures.len())?;
        for (i, failure) in self.failures.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{}", failure)?;
        }
        write!(f, "]")
    }
}
