//! Host endpoint policy model for the endpoint backend.
//!
//! The host networking service keeps a list of typed policies per endpoint.
//! This engine only owns entries of type `ACL` whose id starts with
//! [`POLICY_ID_PREFIX`]; everything else on the endpoint is foreign and must
//! survive every update untouched.

use async_trait::async_trait;
use npm_common::DriverResult;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::Result;
use crate::policy::{AclRule, Selector};
use crate::types::{Direction, RuleScope, Verdict, POLICY_ID_PREFIX};

/// Endpoint policy type for ACL entries.
pub const ACL_POLICY_TYPE: &str = "ACL";

/// One entry of an endpoint's policy list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointPolicy {
    #[serde(rename = "Type")]
    pub policy_type: String,
    #[serde(rename = "Settings")]
    pub settings: serde_json::Value,
}

impl EndpointPolicy {
    /// Wraps ACL settings into an `ACL` endpoint policy.
    pub fn from_acl(settings: &AclPolicySettings) -> Result<Self> {
        Ok(Self {
            policy_type: ACL_POLICY_TYPE.to_string(),
            settings: serde_json::to_value(settings)?,
        })
    }

    pub fn is_acl(&self) -> bool {
        self.policy_type == ACL_POLICY_TYPE
    }
}

/// A host endpoint as returned by the driver.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HostEndpoint {
    pub id: String,
    pub ip: Option<String>,
    pub policies: Vec<EndpointPolicy>,
}

/// How a policy list is applied to an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestType {
    /// Append to the endpoint's current policies.
    Add,
    /// Replace the endpoint's policies with the given list.
    Update,
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Add => write!(f, "Add"),
            Self::Update => write!(f, "Update"),
        }
    }
}

/// Access to the host networking service. Supplied by the host.
#[async_trait]
pub trait EndpointDriver: Send + Sync {
    /// Fetches an endpoint. A missing endpoint is a not-found error.
    async fn get_endpoint(&self, endpoint_id: &str) -> DriverResult<HostEndpoint>;

    /// Applies a policy list to an endpoint.
    async fn apply_endpoint_policy(
        &self,
        endpoint: &HostEndpoint,
        request: RequestType,
        policies: Vec<EndpointPolicy>,
    ) -> DriverResult<()>;
}

/// ACL settings in the host service's JSON shape.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AclPolicySettings {
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub protocols: String,
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub direction: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub local_addresses: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub remote_addresses: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub local_ports: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub remote_ports: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub rule_type: String,
    #[serde(default)]
    pub priority: u16,
}

impl AclPolicySettings {
    /// Creates a bare rule; every address and port field is empty (match all).
    pub fn new(id: impl Into<String>, action: Verdict, direction: Direction) -> Self {
        Self {
            id: id.into(),
            action: action.hns_value().to_string(),
            direction: direction.hns_value().to_string(),
            ..Self::default()
        }
    }

    pub fn with_priority(mut self, priority: u16) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_scope(mut self, scope: RuleScope) -> Self {
        self.rule_type = scope.hns_value().to_string();
        self
    }

    pub fn with_remote_addresses(mut self, addresses: impl Into<String>) -> Self {
        self.remote_addresses = addresses.into();
        self
    }

    pub fn with_remote_ports(mut self, ports: impl Into<String>) -> Self {
        self.remote_ports = ports.into();
        self
    }

    pub fn with_protocols(mut self, protocols: impl Into<String>) -> Self {
        self.protocols = protocols.into();
        self
    }

    /// Converts one ACL rule, stamping it with the owning policy's id.
    ///
    /// Host endpoint ACLs cannot negate an address set; such rules fail.
    pub fn from_rule(acl: &AclRule, policy_id: &str) -> std::result::Result<Self, String> {
        Ok(Self {
            id: policy_id.to_string(),
            protocols: acl.protocol.hns_value().to_string(),
            action: acl.action.hns_value().to_string(),
            direction: acl.direction.hns_value().to_string(),
            local_addresses: join_sets(&acl.local)?,
            remote_addresses: join_sets(&acl.remote)?,
            local_ports: acl.local.ports.map(|p| p.hns_value()).unwrap_or_default(),
            remote_ports: acl.remote.ports.map(|p| p.hns_value()).unwrap_or_default(),
            rule_type: acl.scope.hns_value().to_string(),
            priority: acl.priority,
        })
    }

    /// Returns true if this entry belongs to the engine.
    pub fn is_owned(&self) -> bool {
        self.id.starts_with(POLICY_ID_PREFIX)
    }
}

fn join_sets(selector: &Selector) -> std::result::Result<String, String> {
    let mut names = Vec::with_capacity(selector.sets.len());
    for set in &selector.sets {
        if !set.included {
            return Err(format!(
                "negated address set {} is not supported on host endpoints",
                set.name
            ));
        }
        names.push(set.name.as_str());
    }
    Ok(names.join(","))
}
