//! OS backends.
//!
//! The manager talks to exactly one [`DataplaneBackend`], picked at
//! construction:
//!
//! - [`chain::ChainBackend`]: one iptables chain per policy (Linux)
//! - [`endpoint::EndpointBackend`]: batched ACL policies on host endpoints (Windows)
//!
//! Backends never touch the policy cache. They receive the cached view of a
//! policy, do the OS work, and describe what happened in an outcome value
//! that the manager folds back into the cache while it still holds the
//! exclusive lock.

pub mod chain;
pub mod endpoint;
pub mod hns;
pub mod iptables;

use async_trait::async_trait;

use crate::error::{DataplaneError, Result};
use crate::policy::NetworkPolicy;
use crate::report::{ApplyReport, EndpointSet, TargetFailure};
use crate::types::BackendKind;

pub use chain::ChainBackend;
pub use endpoint::EndpointBackend;

/// Result of applying one policy.
#[derive(Debug, Default)]
pub struct AddOutcome {
    /// Endpoints the policy now runs on, plus per-target failures. A policy
    /// missing from `succeeded` failed as a whole.
    pub report: ApplyReport,
    /// Endpoint addresses whose cached mapping points at a replaced endpoint.
    pub stale: Vec<String>,
    /// Change in programmed rule count.
    pub rule_delta: i64,
}

/// Result of removing one policy from a set of endpoints.
#[derive(Debug, Default)]
pub struct RemoveOutcome {
    /// Endpoints the policy is confirmed gone from (not-found included).
    pub removed: EndpointSet,
    /// Endpoints where removal failed.
    pub failures: Vec<TargetFailure>,
    /// Change in programmed rule count (zero or negative).
    pub rule_delta: i64,
}

impl RemoveOutcome {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Result of applying several cached policies to one new endpoint.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    /// Policy keys applied to the endpoint, in application order.
    pub applied: Vec<String>,
    /// Policy keys whose cached mapping for the endpoint address points at a
    /// replaced endpoint.
    pub stale: Vec<String>,
    /// Change in programmed rule count.
    pub rule_delta: i64,
    /// Set when a batch failed; later batches are not attempted.
    pub error: Option<DataplaneError>,
}

/// One OS dataplane.
///
/// All methods are best-effort over their targets: a failing endpoint or
/// chain never stops the rest, and failures come back as data.
#[async_trait]
pub trait DataplaneBackend: Send + Sync {
    /// Which backend family this is.
    fn kind(&self) -> BackendKind;

    /// Rules present right after a successful bootup.
    fn baseline_rule_count(&self) -> usize;

    /// Rejects policies this backend cannot express. Called before any
    /// cache mutation.
    fn validate_policy(&self, _policy: &NetworkPolicy) -> Result<()> {
        Ok(())
    }

    /// Resets the given endpoints (or the whole rule table) to the baseline.
    ///
    /// Returns [`DataplaneError::Config`] before touching anything when the
    /// backend is missing required configuration.
    async fn bootup(&self, endpoint_ids: &[String]) -> Result<()>;

    /// Resets one endpoint without disturbing anything else.
    async fn reset_endpoint(&self, _endpoint_id: &str) -> Result<()> {
        Ok(())
    }

    /// Applies `policy` to `endpoints`.
    ///
    /// `policy.pod_endpoints` is the cached mapping; endpoints already in it
    /// with the same identifier are skipped.
    async fn add_policy(&self, policy: &NetworkPolicy, endpoints: &EndpointSet) -> AddOutcome;

    /// Removes `policy` from `endpoints`.
    async fn remove_policy(&self, policy: &NetworkPolicy, endpoints: &EndpointSet)
        -> RemoveOutcome;

    /// Applies several cached policies to one endpoint in size-bounded batches.
    async fn add_policies_to_endpoint(
        &self,
        _policies: &[&NetworkPolicy],
        _endpoint_id: &str,
        _endpoint_ip: &str,
    ) -> Result<BatchOutcome> {
        Err(DataplaneError::unsupported("add all policies", self.kind()))
    }

    /// Applies the fixed baseline ACL set to an endpoint.
    async fn add_base_acls(&self, _endpoint_id: &str) -> Result<()> {
        Ok(())
    }

    /// Best-effort cleanup of orphaned OS state.
    async fn reconcile(&self);
}
