//! Policy Manager.
//!
//! The manager owns the policy cache and is the only way in for the rest of
//! the node agent. Every mutating call validates first, then takes the cache
//! lock exclusively for the whole backend sequence, so the cache never
//! describes a state the dataplane is halfway into.
//!
//! The cache records, per policy, the endpoints the policy is known to be
//! applied to. Only confirmed successes enter that mapping; only confirmed
//! removals leave it.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::backend::chain::{ChainBackend, ChainSettings};
use crate::backend::endpoint::{EndpointBackend, EndpointSettings};
use crate::backend::hns::EndpointDriver;
use crate::backend::iptables::IptablesDriver;
use crate::backend::DataplaneBackend;
use crate::config::{DataplaneConfig, DEFAULT_NETWORK_NAME};
use crate::error::{DataplaneError, Result};
use crate::metrics::DataplaneMetrics;
use crate::policy::NetworkPolicy;
use crate::report::{ApplyReport, EndpointSet};
use crate::types::BackendKind;

/// Policy key → cached policy.
type PolicyCache = BTreeMap<String, NetworkPolicy>;

/// The dataplane entry point for one node.
pub struct PolicyManager {
    cache: RwLock<PolicyCache>,
    backend: Box<dyn DataplaneBackend>,
    metrics: DataplaneMetrics,
    network_name: String,
}

impl PolicyManager {
    /// Creates a manager over an already built backend.
    pub fn new(backend: Box<dyn DataplaneBackend>, metrics: DataplaneMetrics) -> Self {
        Self {
            cache: RwLock::new(PolicyCache::new()),
            backend,
            metrics,
            network_name: DEFAULT_NETWORK_NAME.to_string(),
        }
    }

    /// Sets the container network name (decides whether base ACLs apply).
    pub fn with_network_name(mut self, network_name: impl Into<String>) -> Self {
        self.network_name = network_name.into();
        self
    }

    /// Creates a manager driving iptables chains.
    pub fn with_chain_backend(driver: Arc<dyn IptablesDriver>, config: &DataplaneConfig) -> Self {
        let settings = ChainSettings {
            place_azure_chain_first: config.chain.place_azure_chain_first,
            baseline_rules: config.chain.base_acl_rules,
            lock_timeout: config.reconcile_lock_timeout(),
        };
        Self::new(
            Box::new(ChainBackend::new(driver, settings)),
            DataplaneMetrics::default(),
        )
        .with_network_name(config.node.network_name.clone())
    }

    /// Creates a manager driving host endpoint ACLs.
    pub fn with_endpoint_backend(
        driver: Arc<dyn EndpointDriver>,
        config: &DataplaneConfig,
    ) -> Self {
        let metrics = DataplaneMetrics::default();
        let settings = EndpointSettings {
            node_ip: config.node.node_ip.clone(),
            max_batched_acls_per_pod: config.endpoint.max_batched_acls_per_pod,
        };
        Self::new(
            Box::new(EndpointBackend::new(driver, settings, metrics.clone())),
            metrics,
        )
        .with_network_name(config.node.network_name.clone())
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn metrics(&self) -> &DataplaneMetrics {
        &self.metrics
    }

    /// Resets the dataplane to its baseline and empties the cache.
    ///
    /// Every endpoint is attempted; failures come back together as one
    /// partial-failure error. A configuration error aborts before any
    /// dataplane call and leaves the cache and rule gauge alone. The baseline
    /// only counts toward the gauge when bootup fully succeeded.
    pub async fn bootup(&self, endpoint_ids: &[String]) -> Result<()> {
        let mut cache = self.cache.write().await;

        info!(backend = %self.backend.kind(), endpoints = endpoint_ids.len(), "Booting up policy manager");
        let result = self.backend.bootup(endpoint_ids).await;
        if let Err(e @ DataplaneError::Config(_)) = &result {
            error!(error = %e, "Failed to bootup policy manager");
            self.metrics.record_error();
            return result;
        }

        cache.clear();
        self.metrics.reset_num_acl_rules();

        match &result {
            Ok(()) => self
                .metrics
                .inc_num_acl_rules_by(self.backend.baseline_rule_count()),
            Err(e) => {
                error!(error = %e, "Failed to bootup policy manager");
                self.metrics.record_error();
            }
        }
        result
    }

    /// Clears every owned ACL from one endpoint, leaving the cache alone.
    pub async fn reset_endpoint(&self, endpoint_id: &str) -> Result<()> {
        self.backend.reset_endpoint(endpoint_id).await
    }

    /// Applies policies to the given endpoints.
    ///
    /// Rule-less policies are skipped. A policy that fails validation aborts
    /// the whole call before anything is touched. Otherwise every policy is
    /// (re)cached, recording only the endpoints where it actually landed; if
    /// anything failed the returned error carries that same report.
    pub async fn add_policies(
        &self,
        policies: Vec<NetworkPolicy>,
        endpoints: &EndpointSet,
    ) -> Result<ApplyReport> {
        let mut accepted = Vec::with_capacity(policies.len());
        for mut policy in policies {
            if !policy.has_rules() {
                info!(policy = %policy.key, "No ACLs in policy to apply");
                continue;
            }

            policy.normalize();
            if let Err(e) = policy
                .validate()
                .and_then(|_| self.backend.validate_policy(&policy))
            {
                error!(error = %e, "Failed to validate policy");
                self.metrics.record_error();
                return Err(e);
            }
            accepted.push(policy);
        }

        if accepted.is_empty() {
            return Ok(ApplyReport::new());
        }

        let mut cache = self.cache.write().await;
        let timer = self.metrics.start_acl_exec_timer();
        let mut report = ApplyReport::new();

        for mut policy in accepted {
            policy.pod_endpoints = EndpointSet::new();

            if let Some(cached) = cache.get(&policy.key) {
                if cached.same_rules(&policy) {
                    policy.pod_endpoints = cached.pod_endpoints.clone();
                } else {
                    info!(policy = %policy.key, "Policy rules changed, removing previous version");
                    let outcome = self
                        .backend
                        .remove_policy(cached, &cached.pod_endpoints)
                        .await;
                    self.metrics.adjust_num_acl_rules(outcome.rule_delta);
                    for failure in outcome.failures {
                        report.failures.push(failure);
                    }
                }
            }

            let outcome = self.backend.add_policy(&policy, endpoints).await;
            for ip in &outcome.stale {
                policy.pod_endpoints.remove(ip);
            }
            match outcome.report.endpoints_for(&policy.key) {
                Some(applied) => policy
                    .pod_endpoints
                    .extend(applied.iter().map(|(ip, id)| (ip.clone(), id.clone()))),
                None => {
                    // failed as a whole: nothing is known to be applied
                    if !policy.pod_endpoints.is_empty() {
                        warn!(policy = %policy.key, "Policy failed to apply, dropping endpoint mapping");
                    }
                    policy.pod_endpoints.clear();
                }
            }
            self.metrics.adjust_num_acl_rules(outcome.rule_delta);

            debug!(
                policy = %policy.key,
                endpoints = policy.pod_endpoints.len(),
                failures = outcome.report.failures.len(),
                "Cached policy"
            );
            cache.insert(policy.key.clone(), policy);
            report.merge(outcome.report);
        }
        timer.observe_duration();

        report.into_result("add policies").map_err(|e| {
            error!(error = %e, "Failed to add policies");
            self.metrics.record_error();
            e
        })
    }

    /// Removes a policy from every endpoint it is on and forgets it.
    ///
    /// Unknown or rule-less keys are a no-op. The cache entry is dropped even
    /// when some endpoints failed; those failures are returned.
    pub async fn remove_policy(&self, policy_key: &str) -> Result<()> {
        let mut cache = self.cache.write().await;
        let Some(policy) = cache.get(policy_key) else {
            debug!(policy = policy_key, "Policy not cached, nothing to remove");
            return Ok(());
        };
        if !policy.has_rules() {
            info!(policy = policy_key, "No ACLs in policy to remove");
            return Ok(());
        }

        let outcome = self
            .backend
            .remove_policy(policy, &policy.pod_endpoints)
            .await;
        self.metrics.adjust_num_acl_rules(outcome.rule_delta);
        cache.remove(policy_key);

        let mut report = ApplyReport::new();
        for (ip, id) in &outcome.removed {
            report.record_success(policy_key, ip, id);
        }
        report.failures = outcome.failures;
        report.into_result("remove policy").map(|_| ()).map_err(|e| {
            error!(policy = policy_key, error = %e, "Failed to remove policy");
            self.metrics.record_error();
            e
        })
    }

    /// Removes a policy from some endpoints only; the policy stays cached.
    ///
    /// Chains are per policy, not per endpoint, so the chain backend has no
    /// such operation.
    pub async fn remove_policy_for_endpoints(
        &self,
        policy_key: &str,
        endpoints: &EndpointSet,
    ) -> Result<()> {
        if self.backend.kind() == BackendKind::Chain {
            return Err(DataplaneError::unsupported(
                "remove policy for endpoints",
                BackendKind::Chain,
            ));
        }

        let mut cache = self.cache.write().await;
        let Some(policy) = cache.get_mut(policy_key) else {
            return Ok(());
        };
        if !policy.has_rules() {
            info!(policy = policy_key, "No ACLs in policy to remove for endpoints");
            return Ok(());
        }

        let outcome = self.backend.remove_policy(policy, endpoints).await;
        for ip in outcome.removed.keys() {
            policy.pod_endpoints.remove(ip);
        }
        self.metrics.adjust_num_acl_rules(outcome.rule_delta);

        let mut report = ApplyReport::new();
        for (ip, id) in &outcome.removed {
            report.record_success(policy_key, ip, id);
        }
        report.failures = outcome.failures;
        report
            .into_result("remove policy for endpoints")
            .map(|_| ())
            .map_err(|e| {
                error!(policy = policy_key, error = %e, "Failed to remove policy for endpoints");
                self.metrics.record_error();
                e
            })
    }

    /// Applies every named cached policy to a newly created endpoint.
    ///
    /// Unknown keys and policies already on the endpoint are skipped.
    /// Returns the keys that were applied. When a batch fails, the error's
    /// report lists the keys applied before it.
    pub async fn add_all_policies(
        &self,
        policy_keys: &BTreeSet<String>,
        endpoint_id: &str,
        endpoint_ip: &str,
    ) -> Result<BTreeSet<String>> {
        let mut cache = self.cache.write().await;
        info!(
            endpoint = endpoint_id,
            ip = endpoint_ip,
            policies = policy_keys.len(),
            "Adding all policies to endpoint"
        );

        let outcome = {
            let policies: Vec<&NetworkPolicy> = policy_keys
                .iter()
                .filter_map(|key| {
                    let policy = cache.get(key);
                    if policy.is_none() {
                        debug!(policy = %key, endpoint = endpoint_id, "Policy not cached, skipping");
                    }
                    policy
                })
                .collect();
            self.backend
                .add_policies_to_endpoint(&policies, endpoint_id, endpoint_ip)
                .await?
        };

        for key in &outcome.stale {
            if let Some(policy) = cache.get_mut(key) {
                policy.pod_endpoints.remove(endpoint_ip);
            }
        }

        let mut applied = BTreeSet::new();
        let mut report = ApplyReport::new();
        for key in outcome.applied {
            match cache.get_mut(&key) {
                Some(policy) => {
                    policy
                        .pod_endpoints
                        .insert(endpoint_ip.to_string(), endpoint_id.to_string());
                    report.record_success(&key, endpoint_ip, endpoint_id);
                    applied.insert(key);
                }
                None => warn!(policy = %key, "Applied policy missing from cache"),
            }
        }
        self.metrics.adjust_num_acl_rules(outcome.rule_delta);

        match outcome.error {
            None => Ok(applied),
            Some(e) => {
                report.record_failure(endpoint_id, e);
                error!(endpoint = endpoint_id, error = %report, "Failed to add all policies");
                self.metrics.record_error();
                report.into_result("add all policies").map(|_| applied)
            }
        }
    }

    /// Applies the baseline ACLs to an endpoint on a foreign network.
    ///
    /// Failures are logged, never returned.
    pub async fn add_base_acls(&self, endpoint_id: &str) {
        if self.network_name == DEFAULT_NETWORK_NAME {
            return;
        }
        if let Err(e) = self.backend.add_base_acls(endpoint_id).await {
            error!(endpoint = endpoint_id, network = %self.network_name, error = %e, "Failed to apply base ACLs");
        }
    }

    /// Best-effort cleanup of orphaned dataplane state.
    pub async fn reconcile(&self) {
        self.backend.reconcile().await;
    }

    pub async fn policy_exists(&self, policy_key: &str) -> bool {
        self.cache.read().await.contains_key(policy_key)
    }

    /// Snapshot of a cached policy.
    pub async fn get_policy(&self, policy_key: &str) -> Option<NetworkPolicy> {
        self.cache.read().await.get(policy_key).cloned()
    }

    pub async fn policy_count(&self) -> usize {
        self.cache.read().await.len()
    }
}
