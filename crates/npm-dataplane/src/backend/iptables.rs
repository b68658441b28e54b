//! iptables driver and rule builders for the chain backend.
//!
//! Rule specs are plain argument vectors (everything after the chain name),
//! so the same spec can be appended, checked and deleted, and compared
//! against `iptables -S` output in tests.

use async_trait::async_trait;
use npm_common::shell::{self, IPTABLES_CMD};
use npm_common::{DriverError, DriverResult};
use sha2::{Digest, Sha256};

use crate::policy::{AclRule, Selector};
use crate::types::Direction;

/// Top-level chain every policy chain hangs off.
pub const AZURE_CHAIN: &str = "AZURE-NPM";

/// Prefix of per-policy chains.
pub const POLICY_CHAIN_PREFIX: &str = "AZURE-NPM-POLICY-";

/// Built-in chain the top-level chain is linked from.
pub const FORWARD_CHAIN: &str = "FORWARD";

/// kube-proxy's chain; the top-level jump goes right after its jump.
pub const KUBE_SERVICES_CHAIN: &str = "KUBE-SERVICES";

/// Hex digits of the key hash used in policy chain names.
const CHAIN_HASH_LEN: usize = 8;

/// Minimal iptables surface the chain backend needs (filter table only).
#[async_trait]
pub trait IptablesDriver: Send + Sync {
    /// Names of every chain in the table.
    async fn list_chains(&self) -> DriverResult<Vec<String>>;

    /// `-S <chain>` output lines. A missing chain is a not-found error.
    async fn list_rules(&self, chain: &str) -> DriverResult<Vec<String>>;

    /// Creates a chain; an existing chain is not an error.
    async fn new_chain(&self, chain: &str) -> DriverResult<()>;

    async fn flush_chain(&self, chain: &str) -> DriverResult<()>;

    async fn delete_chain(&self, chain: &str) -> DriverResult<()>;

    async fn append_rule(&self, chain: &str, spec: &[String]) -> DriverResult<()>;

    /// Inserts at a 1-based position.
    async fn insert_rule(&self, chain: &str, position: usize, spec: &[String])
        -> DriverResult<()>;

    async fn delete_rule(&self, chain: &str, spec: &[String]) -> DriverResult<()>;

    /// Returns true if an identical rule exists.
    async fn check_rule(&self, chain: &str, spec: &[String]) -> DriverResult<bool>;
}

/// Driver that shells out to `/sbin/iptables -w`.
#[derive(Debug, Clone)]
pub struct ShellIptables {
    wait_secs: u64,
}

impl ShellIptables {
    pub fn new(wait_secs: u64) -> Self {
        Self { wait_secs }
    }

    fn command<S: AsRef<str>>(&self, args: &[S]) -> String {
        let wait = self.wait_secs.to_string();
        let mut full: Vec<&str> = vec!["-w", &wait, "-t", "filter"];
        full.extend(args.iter().map(|a| a.as_ref()));
        shell::command_line(IPTABLES_CMD, &full)
    }

    async fn run<S: AsRef<str>>(&self, args: &[S]) -> DriverResult<String> {
        shell::exec_or_throw(&self.command(args)).await
    }

    fn with_chain(op: &str, chain: &str, spec: &[String]) -> Vec<String> {
        let mut args = vec![op.to_string(), chain.to_string()];
        args.extend(spec.iter().cloned());
        args
    }
}

#[async_trait]
impl IptablesDriver for ShellIptables {
    async fn list_chains(&self) -> DriverResult<Vec<String>> {
        let output = self.run(&["-S"]).await?;
        Ok(parse_chain_names(&output))
    }

    async fn list_rules(&self, chain: &str) -> DriverResult<Vec<String>> {
        let output = self.run(&["-S", chain]).await?;
        Ok(output.lines().map(str::to_string).collect())
    }

    async fn new_chain(&self, chain: &str) -> DriverResult<()> {
        match self.run(&["-N", chain]).await {
            Ok(_) => Ok(()),
            Err(DriverError::CommandFailed { output, .. }) if output.contains("already exists") => {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn flush_chain(&self, chain: &str) -> DriverResult<()> {
        self.run(&["-F", chain]).await.map(|_| ())
    }

    async fn delete_chain(&self, chain: &str) -> DriverResult<()> {
        self.run(&["-X", chain]).await.map(|_| ())
    }

    async fn append_rule(&self, chain: &str, spec: &[String]) -> DriverResult<()> {
        self.run(&Self::with_chain("-A", chain, spec)).await.map(|_| ())
    }

    async fn insert_rule(
        &self,
        chain: &str,
        position: usize,
        spec: &[String],
    ) -> DriverResult<()> {
        let mut args = vec!["-I".to_string(), chain.to_string(), position.to_string()];
        args.extend(spec.iter().cloned());
        self.run(&args).await.map(|_| ())
    }

    async fn delete_rule(&self, chain: &str, spec: &[String]) -> DriverResult<()> {
        self.run(&Self::with_chain("-D", chain, spec)).await.map(|_| ())
    }

    async fn check_rule(&self, chain: &str, spec: &[String]) -> DriverResult<bool> {
        let command = self.command(&Self::with_chain("-C", chain, spec));
        let result = shell::exec(&command).await?;
        if result.success() {
            return Ok(true);
        }
        let err = DriverError::CommandFailed {
            command,
            exit_code: result.exit_code,
            output: result.combined_output(),
        };
        // -C exits 1 when the rule (or its chain) is missing
        if result.exit_code == 1 || err.is_not_found() {
            Ok(false)
        } else {
            Err(err)
        }
    }
}

/// Extracts chain names from `iptables -S` output (`-P` and `-N` lines).
pub fn parse_chain_names(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            match parts.next() {
                Some("-P") | Some("-N") => parts.next().map(str::to_string),
                _ => None,
            }
        })
        .collect()
}

/// Chain name for a policy key: the prefix plus 8 hex chars of SHA-256(key).
pub fn policy_chain_name(policy_key: &str) -> String {
    let digest = Sha256::digest(policy_key.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    format!("{}{}", POLICY_CHAIN_PREFIX, &hex[..CHAIN_HASH_LEN])
}

/// Jump to `target`.
pub fn jump_spec(target: &str) -> Vec<String> {
    vec!["-j".to_string(), target.to_string()]
}

/// Rules the top-level chain starts with.
pub fn baseline_rules() -> Vec<Vec<String>> {
    vec![vec![
        "-m".to_string(),
        "conntrack".to_string(),
        "--ctstate".to_string(),
        "ESTABLISHED,RELATED".to_string(),
        "-j".to_string(),
        "ACCEPT".to_string(),
    ]]
}

fn push_selector(spec: &mut Vec<String>, selector: &Selector, set_dir: &str, port_flag: &str) {
    for set in &selector.sets {
        spec.push("-m".to_string());
        spec.push("set".to_string());
        if !set.included {
            spec.push("!".to_string());
        }
        spec.push("--match-set".to_string());
        spec.push(set.name.clone());
        spec.push(set_dir.to_string());
    }
    if let Some(ports) = selector.ports {
        spec.push(port_flag.to_string());
        spec.push(ports.iptables_arg());
    }
}

/// Renders one ACL into a rule spec.
///
/// For ingress the local side is the destination; for egress it is the
/// source.
pub fn acl_rule_spec(acl: &AclRule) -> Vec<String> {
    let mut spec = Vec::new();

    if let Some(proto) = acl.protocol.iptables_name() {
        spec.push("-p".to_string());
        spec.push(proto.to_string());
    }

    let (local, remote) = match acl.direction {
        Direction::Ingress => (("dst", "--dport"), ("src", "--sport")),
        Direction::Egress => (("src", "--sport"), ("dst", "--dport")),
    };
    push_selector(&mut spec, &acl.local, local.0, local.1);
    push_selector(&mut spec, &acl.remote, remote.0, remote.1);

    if let Some(comment) = &acl.comment {
        spec.push("-m".to_string());
        spec.push("comment".to_string());
        spec.push("--comment".to_string());
        spec.push(comment.clone());
    }

    spec.push("-j".to_string());
    spec.push(acl.action.iptables_target().to_string());
    spec
}

/// Where the FORWARD → top-level jump goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumpPlacement {
    /// 1-based insert position.
    Insert(usize),
    /// End of the chain.
    Append,
}

/// Picks the jump position from `iptables -S FORWARD` output.
///
/// The policy line (`-P`) is not a rule and does not count. Without
/// `place_first`, the jump goes right after the KUBE-SERVICES jump, or at
/// the end when there is none.
pub fn forward_jump_placement(forward_rules: &[String], place_first: bool) -> JumpPlacement {
    if place_first {
        return JumpPlacement::Insert(1);
    }

    let kube_jump = format!("-j {}", KUBE_SERVICES_CHAIN);
    forward_rules
        .iter()
        .filter(|line| line.starts_with("-A "))
        .position(|line| line.contains(&kube_jump))
        .map(|index| JumpPlacement::Insert(index + 2))
        .unwrap_or(JumpPlacement::Append)
}
