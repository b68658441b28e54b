//! Endpoint backend: ACL policies attached to host endpoints.
//!
//! Each policy becomes one ACL entry per rule plus an injected rule that
//! admits traffic from the node itself (health probes). Entries carry the
//! policy's `acl_policy_id`, which is how they are found again on removal.
//!
//! Removal cannot delete single entries on the host, so it fetches the
//! endpoint, splits its policy list into owned ACLs and foreign entries,
//! drops the matching ACLs, and replaces the whole list.

use async_trait::async_trait;
use npm_common::DriverResult;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::hns::{AclPolicySettings, EndpointDriver, EndpointPolicy, HostEndpoint, RequestType};
use super::{AddOutcome, BatchOutcome, DataplaneBackend, RemoveOutcome};
use crate::error::{DataplaneError, Result};
use crate::metrics::{AclOperation, DataplaneMetrics};
use crate::policy::NetworkPolicy;
use crate::report::{ApplyReport, EndpointSet, TargetFailure};
use crate::types::{BackendKind, Direction, Protocol, RuleScope, Verdict, POLICY_ID_PREFIX};

/// Azure platform wireserver address, blocked on TCP/80 for foreign networks.
pub const WIRESERVER_ADDRESS: &str = "168.63.129.16/32";

/// Priority of the injected allow-from-node rule.
pub const NODE_ALLOW_PRIORITY: u16 = 201;

const WIRESERVER_BLOCK_PRIORITY: u16 = 200;
const BASE_ALLOW_PRIORITY: u16 = 65499;

/// Rule id logged when every owned ACL is reset.
const RESET_ALL_RULE_ID: &str = "RESET-ALL";

/// Endpoint backend settings.
#[derive(Debug, Clone)]
pub struct EndpointSettings {
    /// Node address; every policy admits traffic from it.
    pub node_ip: Option<String>,
    /// Maximum ACL entries applied to one endpoint in one request.
    pub max_batched_acls_per_pod: usize,
}

impl Default for EndpointSettings {
    fn default() -> Self {
        Self {
            node_ip: None,
            max_batched_acls_per_pod: 30,
        }
    }
}

/// Which owned ACLs a removal drops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalMode {
    /// Every ACL whose id starts with the engine prefix.
    ResetAll,
    /// Up to `count` ACLs with exactly the given id.
    Targeted,
}

/// Rules of whole policies applied to one endpoint in a single request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AclBatch {
    pub rules: Vec<AclPolicySettings>,
    pub policies: Vec<String>,
}

/// Groups per-policy rule lists into batches of at most `limit` rules.
///
/// A policy is never split across batches, and every batch holds at least
/// one policy even when that policy alone is over the limit.
pub fn batch_policies(
    policies: impl IntoIterator<Item = (String, Vec<AclPolicySettings>)>,
    limit: usize,
) -> Vec<AclBatch> {
    let mut batches: Vec<AclBatch> = Vec::new();
    for (key, rules) in policies {
        if let Some(last) = batches.last_mut() {
            if last.rules.len() + rules.len() <= limit {
                last.rules.extend(rules);
                last.policies.push(key);
                continue;
            }
        }
        batches.push(AclBatch {
            rules,
            policies: vec![key],
        });
    }
    batches
}

/// Fixed ACLs applied to endpoints on networks the engine does not own.
pub fn base_acls() -> Vec<AclPolicySettings> {
    let id = |suffix: &str| format!("{}-{}", POLICY_ID_PREFIX, suffix);
    vec![
        AclPolicySettings::new(id("baseazurewireserver"), Verdict::Block, Direction::Egress)
            .with_protocols(Protocol::Tcp.hns_value())
            .with_remote_addresses(WIRESERVER_ADDRESS)
            .with_remote_ports("80")
            .with_priority(WIRESERVER_BLOCK_PRIORITY)
            .with_scope(RuleScope::Switch),
        AclPolicySettings::new(id("baseallowinswitch"), Verdict::Allow, Direction::Ingress)
            .with_priority(BASE_ALLOW_PRIORITY),
        AclPolicySettings::new(id("baseallowoutswitch"), Verdict::Allow, Direction::Egress)
            .with_priority(BASE_ALLOW_PRIORITY),
        AclPolicySettings::new(id("baseallowinhost"), Verdict::Allow, Direction::Ingress)
            .with_scope(RuleScope::Host),
        AclPolicySettings::new(id("baseallowouthost"), Verdict::Allow, Direction::Egress)
            .with_scope(RuleScope::Host),
    ]
}

/// An endpoint's policy list split into ACL entries and everything else.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EndpointPartition {
    /// ACL entries in endpoint order.
    pub acls: Vec<AclPolicySettings>,
    /// Non-ACL entries, kept verbatim.
    pub foreign: Vec<EndpointPolicy>,
}

impl EndpointPartition {
    pub fn split(policies: &[EndpointPolicy]) -> Result<Self> {
        let mut partition = Self::default();
        for policy in policies {
            if policy.is_acl() {
                partition
                    .acls
                    .push(serde_json::from_value(policy.settings.clone())?);
            } else {
                partition.foreign.push(policy.clone());
            }
        }
        Ok(partition)
    }

    /// Drops every engine-owned ACL. Returns how many were dropped.
    pub fn reset_owned(&mut self) -> usize {
        let before = self.acls.len();
        self.acls.retain(|acl| !acl.is_owned());
        before - self.acls.len()
    }

    /// Drops up to `count` ACLs with id `rule_id`. Returns how many were dropped.
    pub fn remove_rule(&mut self, rule_id: &str, count: usize) -> usize {
        let mut removed = 0;
        self.acls.retain(|acl| {
            if removed < count && acl.id == rule_id {
                removed += 1;
                false
            } else {
                true
            }
        });
        removed
    }

    /// Replacement policy list: foreign entries first, then remaining ACLs.
    pub fn into_request(self) -> Result<Vec<EndpointPolicy>> {
        let mut request = self.foreign;
        for acl in &self.acls {
            request.push(EndpointPolicy::from_acl(acl)?);
        }
        Ok(request)
    }
}

fn to_request(rules: &[AclPolicySettings]) -> Result<Vec<EndpointPolicy>> {
    rules.iter().map(EndpointPolicy::from_acl).collect()
}

/// Host endpoint ACL backend.
pub struct EndpointBackend {
    driver: Arc<dyn EndpointDriver>,
    settings: EndpointSettings,
    metrics: DataplaneMetrics,
}

impl EndpointBackend {
    pub fn new(
        driver: Arc<dyn EndpointDriver>,
        settings: EndpointSettings,
        metrics: DataplaneMetrics,
    ) -> Self {
        Self {
            driver,
            settings,
            metrics,
        }
    }

    fn node_ip(&self) -> Result<&str> {
        self.settings
            .node_ip
            .as_deref()
            .filter(|ip| !ip.is_empty())
            .ok_or_else(|| {
                DataplaneError::config("the endpoint backend requires a configured node IP")
            })
    }

    /// Converts a policy into its ACL entries, injected node rule last.
    pub fn get_rules_for_policy(&self, policy: &NetworkPolicy) -> Result<Vec<AclPolicySettings>> {
        let mut rules = Vec::with_capacity(policy.acls.len() + 1);
        for (i, acl) in policy.acls.iter().enumerate() {
            let rule = AclPolicySettings::from_rule(acl, &policy.acl_policy_id).map_err(
                |reason| DataplaneError::validation(&policy.key, format!("rule {}: {}", i, reason)),
            )?;
            rules.push(rule);
        }

        rules.push(
            AclPolicySettings::new(&policy.acl_policy_id, Verdict::Allow, Direction::Ingress)
                .with_remote_addresses(self.node_ip()?)
                .with_priority(NODE_ALLOW_PRIORITY)
                .with_scope(RuleScope::Switch),
        );
        Ok(rules)
    }

    /// Fetches an endpoint; `None` when it no longer exists.
    async fn fetch_endpoint(&self, endpoint_id: &str) -> DriverResult<Option<HostEndpoint>> {
        let timer = self.metrics.start_get_endpoint_timer();
        let result = self.driver.get_endpoint(endpoint_id).await;
        timer.observe_duration();

        match result {
            Ok(endpoint) => Ok(Some(endpoint)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => {
                self.metrics.record_get_endpoint_failure();
                Err(e)
            }
        }
    }

    async fn apply(
        &self,
        endpoint: &HostEndpoint,
        request: RequestType,
        policies: Vec<EndpointPolicy>,
    ) -> DriverResult<()> {
        let operation = match request {
            RequestType::Add => AclOperation::Create,
            RequestType::Update => AclOperation::Update,
        };
        let timer = self.metrics.start_acl_timer(operation);
        let result = self
            .driver
            .apply_endpoint_policy(endpoint, request, policies)
            .await;
        timer.observe_duration();

        if result.is_err() {
            self.metrics.record_acl_failure(operation);
        }
        result
    }

    /// Adds policies to an endpoint. Returns false when the endpoint is gone.
    async fn add_to_endpoint(
        &self,
        endpoint_id: &str,
        policies: Vec<EndpointPolicy>,
    ) -> DriverResult<bool> {
        let Some(endpoint) = self.fetch_endpoint(endpoint_id).await? else {
            warn!(endpoint = endpoint_id, "Endpoint not found, skipping policy add");
            return Ok(false);
        };
        self.apply(&endpoint, RequestType::Add, policies).await?;
        Ok(true)
    }

    /// Removes owned ACLs from one endpoint by rewriting its policy list.
    ///
    /// A missing endpoint, or one without matching ACLs, is a successful
    /// no-op. Returns how many ACL entries were dropped.
    pub async fn remove_policy_by_endpoint_id(
        &self,
        rule_id: &str,
        endpoint_id: &str,
        count: usize,
        mode: RemovalMode,
    ) -> Result<usize> {
        let Some(endpoint) = self.fetch_endpoint(endpoint_id).await? else {
            info!(
                rule = rule_id,
                endpoint = endpoint_id,
                "Endpoint not found, the pod may be gone; nothing to remove"
            );
            return Ok(0);
        };

        let mut partition = EndpointPartition::split(&endpoint.policies)?;
        let removed = match mode {
            RemovalMode::ResetAll => partition.reset_owned(),
            RemovalMode::Targeted => {
                let removed = partition.remove_rule(rule_id, count);
                if removed > 0 && removed < count {
                    info!(
                        rule = rule_id,
                        endpoint = endpoint_id,
                        missing = count - removed,
                        "Fewer ACLs on endpoint than expected"
                    );
                }
                removed
            }
        };

        if removed == 0 {
            debug!(rule = rule_id, endpoint = endpoint_id, "No matching ACLs on endpoint");
            return Ok(0);
        }

        let request = partition.into_request()?;
        match self.apply(&endpoint, RequestType::Update, request).await {
            Ok(()) => Ok(removed),
            Err(e) if e.is_not_found() => Ok(removed),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl DataplaneBackend for EndpointBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Endpoint
    }

    fn baseline_rule_count(&self) -> usize {
        0
    }

    fn validate_policy(&self, policy: &NetworkPolicy) -> Result<()> {
        for (i, acl) in policy.acls.iter().enumerate() {
            AclPolicySettings::from_rule(acl, &policy.acl_policy_id).map_err(|reason| {
                DataplaneError::validation(&policy.key, format!("rule {}: {}", i, reason))
            })?;
        }
        Ok(())
    }

    async fn bootup(&self, endpoint_ids: &[String]) -> Result<()> {
        self.node_ip()?;

        let mut report = ApplyReport::new();
        for endpoint_id in endpoint_ids {
            if let Err(e) = self
                .remove_policy_by_endpoint_id(RESET_ALL_RULE_ID, endpoint_id, 0, RemovalMode::ResetAll)
                .await
            {
                warn!(endpoint = %endpoint_id, error = %e, "Failed to reset endpoint ACLs");
                report.record_failure(endpoint_id.as_str(), e);
            }
        }
        report.into_result("bootup").map(|_| ())
    }

    async fn reset_endpoint(&self, endpoint_id: &str) -> Result<()> {
        self.remove_policy_by_endpoint_id(RESET_ALL_RULE_ID, endpoint_id, 0, RemovalMode::ResetAll)
            .await
            .map(|_| ())
    }

    async fn add_policy(&self, policy: &NetworkPolicy, endpoints: &EndpointSet) -> AddOutcome {
        let mut outcome = AddOutcome::default();
        outcome.report.record_policy(&policy.key);

        let mut targets = Vec::with_capacity(endpoints.len());
        for (ip, id) in endpoints {
            match policy.pod_endpoints.get(ip) {
                Some(current) if current == id => {
                    debug!(policy = %policy.key, endpoint = %id, "Policy already on endpoint");
                    outcome.report.record_success(&policy.key, ip, id);
                    continue;
                }
                Some(current) => {
                    info!(
                        policy = %policy.key,
                        ip = %ip,
                        previous = %current,
                        endpoint = %id,
                        "Endpoint replaced, dropping stale mapping"
                    );
                    outcome.stale.push(ip.clone());
                    // the replaced endpoint took its copy of the rules with it
                    outcome.rule_delta -= (policy.acls.len() + 1) as i64;
                }
                None => {}
            }
            targets.push((ip, id));
        }

        if targets.is_empty() {
            debug!(policy = %policy.key, "No endpoints to apply policy on");
            return outcome;
        }

        let rules = self.get_rules_for_policy(policy);
        let (request, rule_count) = match rules.and_then(|r| Ok((to_request(&r)?, r.len()))) {
            Ok(converted) => converted,
            Err(e) => {
                outcome.report.record_failure(policy.key.as_str(), e);
                return outcome;
            }
        };

        let mut applied = 0;
        for (ip, id) in targets {
            match self.add_to_endpoint(id, request.clone()).await {
                Ok(true) => {
                    outcome.report.record_success(&policy.key, ip, id);
                    applied += 1;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(policy = %policy.key, endpoint = %id, error = %e, "Failed to add policy to endpoint");
                    outcome.report.record_failure(id.as_str(), e);
                }
            }
        }
        outcome.rule_delta += (rule_count * applied) as i64;
        outcome
    }

    async fn remove_policy(
        &self,
        policy: &NetworkPolicy,
        endpoints: &EndpointSet,
    ) -> RemoveOutcome {
        let rule_count = policy.acls.len() + 1;
        let mut outcome = RemoveOutcome::default();

        for (ip, id) in endpoints {
            match self
                .remove_policy_by_endpoint_id(&policy.acl_policy_id, id, rule_count, RemovalMode::Targeted)
                .await
            {
                Ok(_) => {
                    if policy.pod_endpoints.get(ip) == Some(id) {
                        outcome.rule_delta -= rule_count as i64;
                    }
                    outcome.removed.insert(ip.clone(), id.clone());
                }
                Err(e) => {
                    warn!(policy = %policy.key, endpoint = %id, error = %e, "Failed to remove policy from endpoint");
                    outcome.failures.push(TargetFailure::new(id.as_str(), e));
                }
            }
        }
        outcome
    }

    async fn add_policies_to_endpoint(
        &self,
        policies: &[&NetworkPolicy],
        endpoint_id: &str,
        endpoint_ip: &str,
    ) -> Result<BatchOutcome> {
        let mut outcome = BatchOutcome::default();
        let mut pending = Vec::with_capacity(policies.len());

        for policy in policies {
            match policy.pod_endpoints.get(endpoint_ip) {
                Some(current) if current == endpoint_id => {
                    debug!(policy = %policy.key, endpoint = endpoint_id, "Policy already on endpoint");
                    continue;
                }
                Some(current) => {
                    info!(
                        policy = %policy.key,
                        ip = endpoint_ip,
                        previous = %current,
                        endpoint = endpoint_id,
                        "Endpoint replaced, dropping stale mapping"
                    );
                    outcome.stale.push(policy.key.clone());
                }
                None => {}
            }
            pending.push((policy.key.clone(), self.get_rules_for_policy(policy)?));
        }

        let batches = batch_policies(pending, self.settings.max_batched_acls_per_pod);
        let total = batches.len();
        for (i, batch) in batches.into_iter().enumerate() {
            info!(
                endpoint = endpoint_id,
                batch = i + 1,
                total,
                policies = ?batch.policies,
                "Applying policy batch to endpoint"
            );

            let applied = match to_request(&batch.rules) {
                Ok(request) => self.add_to_endpoint(endpoint_id, request).await.map_err(DataplaneError::from),
                Err(e) => Err(e),
            };
            match applied {
                Ok(true) => {
                    outcome.rule_delta += batch.rules.len() as i64;
                    outcome.applied.extend(batch.policies);
                }
                Ok(false) => break,
                Err(e) => {
                    warn!(endpoint = endpoint_id, batch = i + 1, total, error = %e, "Policy batch failed");
                    outcome.error = Some(e);
                    break;
                }
            }
        }
        Ok(outcome)
    }

    async fn add_base_acls(&self, endpoint_id: &str) -> Result<()> {
        let request = to_request(&base_acls())?;
        self.add_to_endpoint(endpoint_id, request).await?;
        Ok(())
    }

    async fn reconcile(&self) {
        // orphaned endpoint state goes away with the endpoint
    }
}
