//! Policy and ACL rule types.
//!
//! A [`NetworkPolicy`] arrives already translated by the upstream policy
//! controller: label selectors and namespaces are reduced to address-set
//! references, so an [`AclRule`] only carries opaque set names, ports, a
//! protocol, a direction and a verdict.
//!
//! Policies are normalized and validated once, before the manager takes its
//! lock; after that the backends treat them as read-only input.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{DataplaneError, Result};
use crate::report::EndpointSet;
use crate::types::{Direction, Protocol, RuleScope, Verdict, POLICY_ID_PREFIX};

/// Highest priority value accepted for a user rule.
pub const MAX_PRIORITY: u16 = 65500;

fn default_included() -> bool {
    true
}

/// Reference to an externally resolved address set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SetRef {
    /// Host-unique resolved set name.
    pub name: String,
    /// False when the rule matches addresses *outside* the set.
    #[serde(default = "default_included")]
    pub included: bool,
}

impl SetRef {
    /// Matches members of the set.
    pub fn included(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            included: true,
        }
    }

    /// Matches everything but members of the set.
    pub fn excluded(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            included: false,
        }
    }
}

/// Inclusive L4 port range. `end == 0` means a single port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    #[serde(default)]
    pub end: u16,
}

impl PortRange {
    /// A single port.
    pub fn single(port: u16) -> Self {
        Self {
            start: port,
            end: port,
        }
    }

    /// An inclusive range.
    pub fn range(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    /// Upper bound, treating `end == 0` as a single port.
    pub fn last(&self) -> u16 {
        if self.end == 0 {
            self.start
        } else {
            self.end
        }
    }

    /// iptables `--dport`/`--sport` argument.
    pub fn iptables_arg(&self) -> String {
        if self.last() == self.start {
            self.start.to_string()
        } else {
            format!("{}:{}", self.start, self.last())
        }
    }

    /// Host endpoint ACL port list (comma separated, ranges expanded).
    pub fn hns_value(&self) -> String {
        (self.start..=self.last())
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.last() == self.start {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.last())
        }
    }
}

/// Address sets and ports on one side (local or remote) of a rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Selector {
    /// All listed sets must match.
    #[serde(default)]
    pub sets: Vec<SetRef>,
    /// Port match, if any.
    #[serde(default)]
    pub ports: Option<PortRange>,
}

/// One directional packet-filter rule owned by this engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AclRule {
    /// Free-form comment, rendered into iptables rules.
    #[serde(default)]
    pub comment: Option<String>,
    pub direction: Direction,
    pub action: Verdict,
    #[serde(default)]
    pub protocol: Protocol,
    /// The endpoint side (pods selected by the policy).
    #[serde(default)]
    pub local: Selector,
    /// The peer side.
    #[serde(default)]
    pub remote: Selector,
    /// Lower values are evaluated first.
    pub priority: u16,
    #[serde(default)]
    pub scope: RuleScope,
}

impl AclRule {
    /// Creates a rule matching all traffic in one direction.
    pub fn new(direction: Direction, action: Verdict) -> Self {
        Self {
            comment: None,
            direction,
            action,
            protocol: Protocol::Any,
            local: Selector::default(),
            remote: Selector::default(),
            priority: 0,
            scope: RuleScope::Switch,
        }
    }

    /// Shorthand for an ingress allow rule.
    pub fn allow_ingress() -> Self {
        Self::new(Direction::Ingress, Verdict::Allow)
    }

    /// Shorthand for an ingress block rule.
    pub fn block_ingress() -> Self {
        Self::new(Direction::Ingress, Verdict::Block)
    }

    /// Shorthand for an egress allow rule.
    pub fn allow_egress() -> Self {
        Self::new(Direction::Egress, Verdict::Allow)
    }

    /// Shorthand for an egress block rule.
    pub fn block_egress() -> Self {
        Self::new(Direction::Egress, Verdict::Block)
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_priority(mut self, priority: u16) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_scope(mut self, scope: RuleScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub fn with_local_set(mut self, set: SetRef) -> Self {
        self.local.sets.push(set);
        self
    }

    pub fn with_remote_set(mut self, set: SetRef) -> Self {
        self.remote.sets.push(set);
        self
    }

    pub fn with_local_ports(mut self, ports: PortRange) -> Self {
        self.local.ports = Some(ports);
        self
    }

    pub fn with_remote_ports(mut self, ports: PortRange) -> Self {
        self.remote.ports = Some(ports);
        self
    }

    /// Canonicalizes the rule in place.
    ///
    /// Single-port ranges get an explicit end, duplicate set references are
    /// dropped (first one wins) and blank comments are cleared.
    pub fn normalize(&mut self) {
        for selector in [&mut self.local, &mut self.remote] {
            if let Some(ports) = selector.ports.as_mut() {
                if ports.end == 0 {
                    ports.end = ports.start;
                }
            }
            let mut seen = Vec::with_capacity(selector.sets.len());
            selector.sets.retain(|set| {
                if seen.contains(set) {
                    false
                } else {
                    seen.push(set.clone());
                    true
                }
            });
            for set in selector.sets.iter_mut() {
                set.name = set.name.trim().to_string();
            }
        }

        if let Some(comment) = &self.comment {
            if comment.trim().is_empty() {
                self.comment = None;
            }
        }
    }

    /// Checks the rule for content no backend can express.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.priority > MAX_PRIORITY {
            return Err(format!(
                "priority {} out of range (0-{})",
                self.priority, MAX_PRIORITY
            ));
        }

        for (side, selector) in [("local", &self.local), ("remote", &self.remote)] {
            if let Some(ports) = selector.ports {
                if !self.protocol.supports_ports() {
                    return Err(format!(
                        "{} ports {} require protocol TCP, UDP or SCTP, got {}",
                        side, ports, self.protocol
                    ));
                }
                if ports.start == 0 {
                    return Err(format!("{} port 0 is not a valid port", side));
                }
                if ports.last() < ports.start {
                    return Err(format!(
                        "{} port range {}-{} is inverted",
                        side, ports.start, ports.end
                    ));
                }
            }

            for set in &selector.sets {
                if set.name.is_empty() {
                    return Err(format!("{} address set name is empty", side));
                }
                if set.name.contains(|c: char| c.is_whitespace() || c == ',') {
                    return Err(format!(
                        "{} address set name {:?} contains whitespace or a comma",
                        side, set.name
                    ));
                }
            }
        }

        Ok(())
    }
}

impl fmt::Display for AclRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} prio={}",
            self.direction, self.action, self.protocol, self.priority
        )?;
        if let Some(ports) = self.local.ports {
            write!(f, " lport={}", ports)?;
        }
        if let Some(ports) = self.remote.ports {
            write!(f, " rport={}", ports)?;
        }
        Ok(())
    }
}

/// A named policy and the endpoints it is currently applied to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkPolicy {
    /// Unique key, `namespace/name`.
    pub key: String,
    /// Identifier stamped on every endpoint ACL derived from this policy.
    pub acl_policy_id: String,
    /// Ordered rules.
    pub acls: Vec<AclRule>,
    /// Endpoint address → endpoint id where the policy is known to be applied.
    #[serde(default)]
    pub pod_endpoints: EndpointSet,
}

impl NetworkPolicy {
    /// Creates an empty policy for `namespace/name`.
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            key: format!("{}/{}", namespace, name),
            acl_policy_id: format!("{}-{}-{}", POLICY_ID_PREFIX, namespace, name),
            acls: Vec::new(),
            pod_endpoints: EndpointSet::new(),
        }
    }

    pub fn with_acl(mut self, acl: AclRule) -> Self {
        self.acls.push(acl);
        self
    }

    /// Returns true if the policy has at least one rule.
    pub fn has_rules(&self) -> bool {
        !self.acls.is_empty()
    }

    /// Returns true if both policies program the same rules.
    pub fn same_rules(&self, other: &NetworkPolicy) -> bool {
        self.acl_policy_id == other.acl_policy_id && self.acls == other.acls
    }

    /// Canonicalizes the policy in place.
    pub fn normalize(&mut self) {
        self.key = self.key.trim().to_string();
        self.acl_policy_id = self.acl_policy_id.trim().to_string();
        for acl in self.acls.iter_mut() {
            acl.normalize();
        }
    }

    /// Validates the whole policy; the first bad rule is reported.
    pub fn validate(&self) -> Result<()> {
        if self.key.is_empty() {
            return Err(DataplaneError::validation("<empty>", "policy key is empty"));
        }
        if !self.acl_policy_id.starts_with(POLICY_ID_PREFIX) {
            return Err(DataplaneError::validation(
                &self.key,
                format!(
                    "ACL policy id {:?} must start with {:?}",
                    self.acl_policy_id, POLICY_ID_PREFIX
                ),
            ));
        }
        for (i, acl) in self.acls.iter().enumerate() {
            acl.validate()
                .map_err(|reason| DataplaneError::validation(&self.key, format!("rule {}: {}", i, reason)))?;
        }
        Ok(())
    }
}
