//! Network policy dataplane daemon entry point.
//!
//! Loads the configuration, resets the dataplane, optionally applies a set
//! of policies from a JSON file, then runs the reconcile loop until SIGINT.

use anyhow::{bail, Context, Result};
use clap::Parser;
use npm_dataplane::backend::iptables::ShellIptables;
use npm_dataplane::config::DEFAULT_CONFIG_PATH;
use npm_dataplane::reconcile::spawn_reconcile_loop;
use npm_dataplane::{BackendKind, DataplaneConfig, EndpointSet, NetworkPolicy, PolicyManager};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Kubernetes network policy dataplane daemon
#[derive(Parser, Debug)]
#[command(name = "npm-dataplaned")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    /// JSON file holding an array of policies to apply after bootup
    #[arg(short = 'p', long)]
    policies: Option<PathBuf>,

    /// Target endpoint for the startup policies, as IP=ENDPOINT_ID (repeatable)
    #[arg(short = 'e', long = "endpoint", value_parser = parse_endpoint)]
    endpoints: Vec<(String, String)>,
}

fn parse_endpoint(s: &str) -> std::result::Result<(String, String), String> {
    match s.split_once('=') {
        Some((ip, id)) if !ip.is_empty() && !id.is_empty() => Ok((ip.to_string(), id.to_string())),
        _ => Err(format!("expected IP=ENDPOINT_ID, got {:?}", s)),
    }
}

fn init_logging(log_level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

fn load_policies(path: &Path) -> Result<Vec<NetworkPolicy>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read policy file {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse policy file {}", path.display()))
}

async fn run(args: Args) -> Result<()> {
    let config = DataplaneConfig::load_or_default(&args.config)?;
    config.validate()?;

    let manager = match config.node.backend {
        BackendKind::Chain => {
            let driver = Arc::new(ShellIptables::new(config.chain.iptables_wait_secs));
            PolicyManager::with_chain_backend(driver, &config)
        }
        BackendKind::Endpoint => {
            bail!("the endpoint backend needs a host endpoint driver; embed the library instead")
        }
    };
    let manager = Arc::new(manager);

    manager
        .bootup(&[])
        .await
        .context("Failed to bootup policy manager")?;
    info!(backend = %manager.backend_kind(), "Dataplane reset to baseline");
    if config.is_foreign_network() {
        info!(network = %config.node.network_name, "Base ACLs apply to endpoints on this network");
    }

    if let Some(path) = &args.policies {
        let policies = load_policies(path)?;
        let endpoints: EndpointSet = args.endpoints.iter().cloned().collect();
        info!(count = policies.len(), endpoints = endpoints.len(), "Applying startup policies");
        match manager.add_policies(policies, &endpoints).await {
            Ok(report) => info!(policies = report.succeeded.len(), "Startup policies applied"),
            Err(e) if e.is_retryable() => warn!(error = %e, "Some startup policies failed"),
            Err(e) => return Err(e.into()),
        }
    }

    let cancel = CancellationToken::new();
    let reconcile = spawn_reconcile_loop(manager.clone(), config.reconcile_interval(), cancel.clone());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Received shutdown signal");

    cancel.cancel();
    reconcile.await.context("Reconcile loop panicked")?;
    debug!(metrics = %manager.metrics().gather_metrics(), "Final dataplane metrics");
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args.log_level);

    info!("Starting npm-dataplaned");
    match run(args).await {
        Ok(()) => {
            info!("npm-dataplaned exiting normally");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %format!("{:#}", e), "npm-dataplaned exiting with error");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_endpoint() {
        assert_eq!(
            parse_endpoint("10.0.0.1=ep-a").unwrap(),
            ("10.0.0.1".to_string(), "ep-a".to_string())
        );
        assert!(parse_endpoint("10.0.0.1").is_err());
        assert!(parse_endpoint("=ep-a").is_err());
    }

    #[test]
    fn test_args_defaults() {
        let args = Args::parse_from(["npm-dataplaned"]);
        assert_eq!(args.config, PathBuf::from(DEFAULT_CONFIG_PATH));
        assert_eq!(args.log_level, "info");
        assert!(args.endpoints.is_empty());
    }

    #[test]
    fn test_load_policies_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policies.json");
        std::fs::write(
            &path,
            r#"[{"key": "default/web", "acl_policy_id": "azure-acl-default-web",
                 "acls": [{"direction": "ingress", "action": "allow", "priority": 222}]}]"#,
        )
        .unwrap();

        let policies = load_policies(&path).unwrap();
        assert_eq!(policies.len(), 1);
        assert_eq!(policies[0].key, "default/web");
    }
}
