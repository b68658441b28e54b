//! Configuration file support for the dataplane daemon.
//!
//! Loads and validates settings from a TOML file.
//! Default location: /etc/azure-npm/dataplane.toml

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::{DataplaneError, Result};
use crate::types::BackendKind;

/// Default configuration file path.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/azure-npm/dataplane.toml";

/// Network name this engine treats as its own default network.
pub const DEFAULT_NETWORK_NAME: &str = "azure";

/// Node-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Which backend to drive
    #[serde(default = "default_backend")]
    pub backend: BackendKind,

    /// Node address, required by the endpoint backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_ip: Option<String>,

    /// Container network name; base ACLs are only applied off the default network
    #[serde(default = "default_network_name")]
    pub network_name: String,
}

/// Chain (iptables) backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    /// Jump from FORWARD at position 1 instead of after KUBE-SERVICES
    #[serde(default)]
    pub place_azure_chain_first: bool,

    /// Rules present after bootup, before any policy is added
    #[serde(default = "default_base_acl_rules")]
    pub base_acl_rules: usize,

    /// Seconds iptables waits for the xtables lock
    #[serde(default = "default_iptables_wait")]
    pub iptables_wait_secs: u64,
}

/// Endpoint (host ACL) backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Maximum ACL rules applied to one endpoint in a single request
    #[serde(default = "default_max_batched_acls")]
    pub max_batched_acls_per_pod: usize,
}

/// Background reconcile settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// Seconds between reconcile passes
    #[serde(default = "default_reconcile_interval")]
    pub interval_secs: u64,

    /// How long one pass waits for the reconcile lock, in milliseconds
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout_ms: u64,
}

/// Complete dataplane configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataplaneConfig {
    #[serde(default)]
    pub node: NodeConfig,

    #[serde(default)]
    pub chain: ChainConfig,

    #[serde(default)]
    pub endpoint: EndpointConfig,

    #[serde(default)]
    pub reconcile: ReconcileConfig,
}

fn default_backend() -> BackendKind {
    if cfg!(windows) {
        BackendKind::Endpoint
    } else {
        BackendKind::Chain
    }
}

fn default_network_name() -> String {
    DEFAULT_NETWORK_NAME.to_string()
}

fn default_base_acl_rules() -> usize {
    11
}

fn default_iptables_wait() -> u64 {
    60
}

fn default_max_batched_acls() -> usize {
    30
}

fn default_reconcile_interval() -> u64 {
    300
}

fn default_lock_timeout() -> u64 {
    5000
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            node_ip: None,
            network_name: default_network_name(),
        }
    }
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            place_azure_chain_first: false,
            base_acl_rules: default_base_acl_rules(),
            iptables_wait_secs: default_iptables_wait(),
        }
    }
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            max_batched_acls_per_pod: default_max_batched_acls(),
        }
    }
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_reconcile_interval(),
            lock_timeout_ms: default_lock_timeout(),
        }
    }
}

impl DataplaneConfig {
    /// Load configuration from file, falling back to defaults if it does not exist.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        match fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content).map_err(|e| {
                DataplaneError::config(format!(
                    "Failed to parse config file {}: {}",
                    path.display(),
                    e
                ))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), "Config file not found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(DataplaneError::config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))),
        }
    }

    /// Save configuration to file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| DataplaneError::config(format!("Failed to serialize config: {}", e)))?;
        fs::write(path.as_ref(), content).map_err(|e| {
            DataplaneError::config(format!(
                "Failed to write config file {}: {}",
                path.as_ref().display(),
                e
            ))
        })
    }

    /// Returns true if the configured network is not the engine's default one.
    pub fn is_foreign_network(&self) -> bool {
        self.node.network_name != DEFAULT_NETWORK_NAME
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile.interval_secs)
    }

    pub fn reconcile_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.reconcile.lock_timeout_ms)
    }

    /// Validate configuration.
    ///
    /// A missing node IP is not checked here; the endpoint backend reports it
    /// at bootup.
    pub fn validate(&self) -> Result<()> {
        if self.endpoint.max_batched_acls_per_pod == 0 {
            return Err(DataplaneError::config(
                "max_batched_acls_per_pod must be > 0",
            ));
        }

        if self.reconcile.interval_secs == 0 {
            return Err(DataplaneError::config("reconcile interval_secs must be > 0"));
        }

        if self.node.network_name.trim().is_empty() {
            return Err(DataplaneError::config("network_name must not be empty"));
        }

        if let Some(ip) = &self.node.node_ip {
            if ip.parse::<std::net::IpAddr>().is_err() {
                return Err(DataplaneError::config(format!(
                    "node_ip {:?} is not an IP address",
                    ip
                )));
            }
        }

        Ok(())
    }
}
