//! ACL enums shared by both backends.
//!
//! Each enum knows its own rendering for the two OS families: the iptables
//! token (chain backend) and the host endpoint ACL field value (endpoint
//! backend).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Prefix of every ACL identifier owned by this engine.
///
/// Bootup on the endpoint backend removes every ACL whose id starts with it.
pub const POLICY_ID_PREFIX: &str = "azure-acl";

/// Traffic direction relative to the endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Traffic entering the endpoint.
    #[default]
    Ingress,
    /// Traffic leaving the endpoint.
    Egress,
}

impl Direction {
    /// Host endpoint ACL `Direction` value.
    pub fn hns_value(&self) -> &'static str {
        match self {
            Self::Ingress => "In",
            Self::Egress => "Out",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ingress => write!(f, "INGRESS"),
            Self::Egress => write!(f, "EGRESS"),
        }
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "INGRESS" | "IN" => Ok(Self::Ingress),
            "EGRESS" | "OUT" => Ok(Self::Egress),
            _ => Err(format!("Unknown direction: {}", s)),
        }
    }
}

/// What happens to matching traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Let the packet through.
    #[default]
    Allow,
    /// Drop the packet.
    Block,
}

impl Verdict {
    /// iptables jump target.
    pub fn iptables_target(&self) -> &'static str {
        match self {
            Self::Allow => "ACCEPT",
            Self::Block => "DROP",
        }
    }

    /// Host endpoint ACL `Action` value.
    pub fn hns_value(&self) -> &'static str {
        match self {
            Self::Allow => "Allow",
            Self::Block => "Block",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Allow => write!(f, "ALLOW"),
            Self::Block => write!(f, "BLOCK"),
        }
    }
}

impl FromStr for Verdict {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "ALLOW" | "ACCEPT" => Ok(Self::Allow),
            "BLOCK" | "DROP" | "DENY" => Ok(Self::Block),
            _ => Err(format!("Unknown verdict: {}", s)),
        }
    }
}

/// L4 protocol matched by a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    /// Any protocol.
    #[default]
    Any,
    Tcp,
    Udp,
    Sctp,
}

impl Protocol {
    /// Returns true if port matches are meaningful for this protocol.
    pub fn supports_ports(&self) -> bool {
        !matches!(self, Self::Any)
    }

    /// iptables `-p` argument, `None` for any protocol.
    pub fn iptables_name(&self) -> Option<&'static str> {
        match self {
            Self::Any => None,
            Self::Tcp => Some("tcp"),
            Self::Udp => Some("udp"),
            Self::Sctp => Some("sctp"),
        }
    }

    /// Host endpoint ACL `Protocols` value (IANA number, empty for any).
    pub fn hns_value(&self) -> &'static str {
        match self {
            Self::Any => "",
            Self::Tcp => "6",
            Self::Udp => "17",
            Self::Sctp => "132",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => write!(f, "ANY"),
            Self::Tcp => write!(f, "TCP"),
            Self::Udp => write!(f, "UDP"),
            Self::Sctp => write!(f, "SCTP"),
        }
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "" | "ANY" | "ALL" => Ok(Self::Any),
            "TCP" | "6" => Ok(Self::Tcp),
            "UDP" | "17" => Ok(Self::Udp),
            "SCTP" | "132" => Ok(Self::Sctp),
            _ => Err(format!("Unknown protocol: {}", s)),
        }
    }
}

/// Where the endpoint backend evaluates a rule.
///
/// The chain backend ignores the scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleScope {
    /// Virtual switch port of the endpoint.
    #[default]
    Switch,
    /// Host network stack.
    Host,
}

impl RuleScope {
    /// Host endpoint ACL `RuleType` value.
    pub fn hns_value(&self) -> &'static str {
        match self {
            Self::Switch => "Switch",
            Self::Host => "Host",
        }
    }
}

impl fmt::Display for RuleScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hns_value().to_uppercase())
    }
}

/// Which backend family is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// iptables chains (Linux).
    Chain,
    /// Host endpoint ACL policies (Windows).
    Endpoint,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Chain => write!(f, "chain"),
            Self::Endpoint => write!(f, "endpoint"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "chain" | "iptables" | "linux" => Ok(Self::Chain),
            "endpoint" | "hns" | "windows" => Ok(Self::Endpoint),
            _ => Err(format!("Unknown backend: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_parse() {
        assert_eq!("ingress".parse::<Direction>().unwrap(), Direction::Ingress);
        assert_eq!("Out".parse::<Direction>().unwrap(), Direction::Egress);
        assert!("sideways".parse::<Direction>().is_err());
    }

    #[test]
    fn test_verdict_rendering() {
        assert_eq!(Verdict::Allow.iptables_target(), "ACCEPT");
        assert_eq!(Verdict::Block.iptables_target(), "DROP");
        assert_eq!(Verdict::Block.hns_value(), "Block");
        assert_eq!("deny".parse::<Verdict>().unwrap(), Verdict::Block);
    }

    #[test]
    fn test_protocol_rendering() {
        assert_eq!(Protocol::Tcp.hns_value(), "6");
        assert_eq!(Protocol::Any.hns_value(), "");
        assert_eq!(Protocol::Udp.iptables_name(), Some("udp"));
        assert_eq!(Protocol::Any.iptables_name(), None);
        assert!(!Protocol::Any.supports_ports());
        assert_eq!("132".parse::<Protocol>().unwrap(), Protocol::Sctp);
    }

    #[test]
    fn test_scope_display() {
        assert_eq!(RuleScope::Switch.to_string(), "SWITCH");
        assert_eq!(RuleScope::Host.hns_value(), "Host");
    }

    #[test]
    fn test_backend_kind_parse() {
        assert_eq!("iptables".parse::<BackendKind>().unwrap(), BackendKind::Chain);
        assert_eq!("windows".parse::<BackendKind>().unwrap(), BackendKind::Endpoint);
        assert!("bpf".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_serde_snake_case() {
        let json = serde_json::to_string(&Direction::Egress).unwrap();
        assert_eq!(json, "\"egress\"");
        let scope: RuleScope = serde_json::from_str("\"host\"").unwrap();
        assert_eq!(scope, RuleScope::Host);
    }
}
