//! Network policy dataplane engine.
//!
//! Turns resolved network policies into OS packet-filter state on one node
//! and keeps track of where each policy is applied:
//! - Policy cache and single entry point ([`PolicyManager`])
//! - iptables backend: one chain per policy, deferred orphan cleanup
//! - Host endpoint backend: batched ACL policies per endpoint
//! - Background reconcile loop
//! - Prometheus metrics and TOML configuration

pub mod backend;
pub mod config;
pub mod error;
pub mod manager;
pub mod metrics;
pub mod policy;
pub mod reconcile;
pub mod report;
pub mod types;

pub use config::DataplaneConfig;
pub use error::{DataplaneError, Result};
pub use manager::PolicyManager;
pub use metrics::DataplaneMetrics;
pub use policy::{AclRule, NetworkPolicy, PortRange, SetRef};
pub use report::{ApplyReport, EndpointSet};
pub use types::{BackendKind, Direction, Protocol, RuleScope, Verdict};
