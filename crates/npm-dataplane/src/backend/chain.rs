//! Chain backend: one iptables chain per policy.
//!
//! ```text
//! FORWARD ─► AZURE-NPM ─┬─ ESTABLISHED,RELATED ACCEPT
//!                       ├─► AZURE-NPM-POLICY-<hash a>
//!                       └─► AZURE-NPM-POLICY-<hash b>
//! ```
//!
//! Removing a policy only unlinks and flushes its chain; the empty chain is
//! remembered as orphaned and deleted later by [`ChainBackend::reconcile`],
//! which keeps chain deletion off the foreground path.

use async_trait::async_trait;
use npm_common::DriverResult;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use super::iptables::{
    acl_rule_spec, baseline_rules, forward_jump_placement, jump_spec, policy_chain_name,
    IptablesDriver, JumpPlacement, AZURE_CHAIN, FORWARD_CHAIN,
};
use super::{AddOutcome, DataplaneBackend, RemoveOutcome};
use crate::error::Result;
use crate::policy::{AclRule, NetworkPolicy};
use crate::report::{ApplyReport, EndpointSet, TargetFailure};
use crate::types::BackendKind;

/// Chain backend settings.
#[derive(Debug, Clone)]
pub struct ChainSettings {
    /// Jump from FORWARD at position 1 instead of after KUBE-SERVICES.
    pub place_azure_chain_first: bool,
    /// Rules present after bootup.
    pub baseline_rules: usize,
    /// How long a reconcile pass waits for the lock.
    pub lock_timeout: Duration,
}

impl Default for ChainSettings {
    fn default() -> Self {
        Self {
            place_azure_chain_first: false,
            baseline_rules: 11,
            lock_timeout: Duration::from_secs(5),
        }
    }
}

/// iptables chain backend.
pub struct ChainBackend {
    driver: Arc<dyn IptablesDriver>,
    settings: ChainSettings,
    /// Reconcile lock; also guards the orphaned chain names.
    orphans: Mutex<BTreeSet<String>>,
}

impl ChainBackend {
    pub fn new(driver: Arc<dyn IptablesDriver>, settings: ChainSettings) -> Self {
        Self {
            driver,
            settings,
            orphans: Mutex::new(BTreeSet::new()),
        }
    }

    /// Chains waiting for deletion.
    pub async fn orphaned_chains(&self) -> Vec<String> {
        self.orphans.lock().await.iter().cloned().collect()
    }

    /// Waits for the reconcile lock, giving up after the configured timeout.
    async fn try_lock_orphans(&self) -> Option<MutexGuard<'_, BTreeSet<String>>> {
        match tokio::time::timeout(self.settings.lock_timeout, self.orphans.lock()).await {
            Ok(guard) => Some(guard),
            Err(_) => {
                debug!(
                    timeout_ms = self.settings.lock_timeout.as_millis() as u64,
                    "Reconcile lock busy, skipping pass"
                );
                None
            }
        }
    }

    /// Rule specs of a chain without the `-A <chain>` prefix, `None` when the
    /// chain does not exist.
    async fn chain_rules(&self, chain: &str) -> DriverResult<Option<Vec<String>>> {
        let prefix = format!("-A {} ", chain);
        match self.driver.list_rules(chain).await {
            Ok(lines) => Ok(Some(
                lines
                    .iter()
                    .filter_map(|line| line.strip_prefix(prefix.as_str()))
                    .map(str::to_string)
                    .collect(),
            )),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn ensure_forward_jump(&self) -> DriverResult<()> {
        let jump = jump_spec(AZURE_CHAIN);
        if self.driver.check_rule(FORWARD_CHAIN, &jump).await? {
            return Ok(());
        }

        let forward_rules = self.driver.list_rules(FORWARD_CHAIN).await?;
        match forward_jump_placement(&forward_rules, self.settings.place_azure_chain_first) {
            JumpPlacement::Insert(position) => {
                self.driver.insert_rule(FORWARD_CHAIN, position, &jump).await
            }
            JumpPlacement::Append => self.driver.append_rule(FORWARD_CHAIN, &jump).await,
        }
    }

    /// Tears down every engine-owned chain and rebuilds the top-level chain.
    async fn reset_tables(&self, report: &mut ApplyReport) -> DriverResult<()> {
        match self.driver.delete_rule(FORWARD_CHAIN, &jump_spec(AZURE_CHAIN)).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => report.record_failure(FORWARD_CHAIN, e),
        }

        let owned: Vec<String> = self
            .driver
            .list_chains()
            .await?
            .into_iter()
            .filter(|chain| chain.starts_with(AZURE_CHAIN))
            .collect();

        // flush everything first so no chain is still referenced when deleted
        for chain in &owned {
            if let Err(e) = self.driver.flush_chain(chain).await {
                if !e.is_not_found() {
                    report.record_failure(chain.as_str(), e);
                }
            }
        }
        for chain in &owned {
            if let Err(e) = self.driver.delete_chain(chain).await {
                if !e.is_not_found() {
                    report.record_failure(chain.as_str(), e);
                }
            }
        }

        self.driver.new_chain(AZURE_CHAIN).await?;
        for rule in baseline_rules() {
            self.driver.append_rule(AZURE_CHAIN, &rule).await?;
        }
        self.ensure_forward_jump().await
    }

    /// Programs a policy chain and links it.
    ///
    /// A linked chain that already holds exactly the rendered rules is left
    /// untouched. `delta` follows every mutation as it lands, so it stays
    /// accurate when a driver call fails halfway through.
    async fn program_chain(
        &self,
        chain: &str,
        policy: &NetworkPolicy,
        orphans: &mut BTreeSet<String>,
        delta: &mut i64,
    ) -> DriverResult<()> {
        if orphans.remove(chain) {
            debug!(chain, "Reusing orphaned chain");
        }

        let mut acls: Vec<&AclRule> = policy.acls.iter().collect();
        acls.sort_by_key(|acl| acl.priority);
        let specs: Vec<Vec<String>> = acls.into_iter().map(acl_rule_spec).collect();

        let current = match self.chain_rules(chain).await? {
            Some(rules) => rules,
            None => {
                self.driver.new_chain(chain).await?;
                Vec::new()
            }
        };
        let jump = jump_spec(chain);
        let linked = self.driver.check_rule(AZURE_CHAIN, &jump).await?;

        let up_to_date = current.len() == specs.len()
            && current.iter().zip(&specs).all(|(have, want)| *have == want.join(" "));
        if up_to_date && linked {
            debug!(chain, "Policy chain already up to date");
            return Ok(());
        }

        if !up_to_date {
            self.driver.flush_chain(chain).await?;
            *delta -= current.len() as i64;
            for spec in &specs {
                self.driver.append_rule(chain, spec).await?;
                *delta += 1;
            }
        }

        if !linked {
            self.driver.append_rule(AZURE_CHAIN, &jump).await?;
            *delta += 1;
        }
        Ok(())
    }

    /// Unlinks and flushes a policy chain; returns how many rules went away.
    async fn unlink_chain(&self, chain: &str) -> DriverResult<Option<usize>> {
        let Some(old_rules) = self.chain_rules(chain).await?.map(|rules| rules.len()) else {
            return Ok(None);
        };

        let jump_removed = match self.driver.delete_rule(AZURE_CHAIN, &jump_spec(chain)).await {
            Ok(()) => 1,
            Err(e) if e.is_not_found() => 0,
            Err(e) => return Err(e),
        };

        match self.driver.flush_chain(chain).await {
            Ok(()) => Ok(Some(old_rules + jump_removed)),
            Err(e) if e.is_not_found() => Ok(Some(jump_removed)),
            Err(e) => Err(e),
        }
    }

    async fn delete_orphan(&self, chain: &str) -> DriverResult<()> {
        self.driver.flush_chain(chain).await?;
        self.driver.delete_chain(chain).await
    }
}

#[async_trait]
impl DataplaneBackend for ChainBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Chain
    }

    fn baseline_rule_count(&self) -> usize {
        self.settings.baseline_rules
    }

    async fn bootup(&self, _endpoint_ids: &[String]) -> Result<()> {
        let mut orphans = self.orphans.lock().await;
        let mut report = ApplyReport::new();

        info!("Resetting iptables chains");
        let reset = self.reset_tables(&mut report).await;
        orphans.clear();
        reset?;

        report.into_result("bootup").map(|_| ())
    }

    async fn add_policy(&self, policy: &NetworkPolicy, endpoints: &EndpointSet) -> AddOutcome {
        let chain = policy_chain_name(&policy.key);
        let mut orphans = self.orphans.lock().await;
        let mut outcome = AddOutcome::default();

        let mut delta = 0;
        match self.program_chain(&chain, policy, &mut orphans, &mut delta).await {
            Ok(()) => {
                debug!(policy = %policy.key, chain = %chain, rules = policy.acls.len(), "Programmed policy chain");
                outcome.report.record_policy(&policy.key);
                for (ip, id) in endpoints {
                    outcome.report.record_success(&policy.key, ip, id);
                }
            }
            Err(e) => {
                warn!(policy = %policy.key, chain = %chain, error = %e, "Failed to program policy chain");
                // a partially programmed chain must not stay reachable
                match self.unlink_chain(&chain).await {
                    Ok(Some(removed)) => {
                        delta -= removed as i64;
                        orphans.insert(chain.clone());
                    }
                    Ok(None) => {}
                    Err(cleanup) => {
                        warn!(chain = %chain, error = %cleanup, "Failed to unlink partially programmed chain");
                    }
                }
                outcome.report.record_failure(chain, e);
            }
        }
        outcome.rule_delta = delta;
        outcome
    }

    async fn remove_policy(
        &self,
        policy: &NetworkPolicy,
        endpoints: &EndpointSet,
    ) -> RemoveOutcome {
        let chain = policy_chain_name(&policy.key);
        let mut orphans = self.orphans.lock().await;
        let mut outcome = RemoveOutcome::default();

        match self.unlink_chain(&chain).await {
            Ok(Some(removed)) => {
                debug!(policy = %policy.key, chain = %chain, "Unlinked policy chain");
                orphans.insert(chain);
                outcome.removed = endpoints.clone();
                outcome.rule_delta = -(removed as i64);
            }
            Ok(None) => {
                debug!(policy = %policy.key, chain = %chain, "Policy chain already gone");
                outcome.removed = endpoints.clone();
            }
            Err(e) => {
                warn!(policy = %policy.key, chain = %chain, error = %e, "Failed to unlink policy chain");
                outcome.failures.push(TargetFailure::new(chain, e));
            }
        }
        outcome
    }

    async fn reconcile(&self) {
        let pending: Vec<String> = match self.try_lock_orphans().await {
            Some(orphans) => orphans.iter().cloned().collect(),
            None => return,
        };
        if pending.is_empty() {
            return;
        }

        debug!(count = pending.len(), "Deleting orphaned chains");
        for chain in pending {
            // one chain per lock hold so foreground edits can interleave
            let Some(mut orphans) = self.try_lock_orphans().await else {
                return;
            };
            if !orphans.contains(&chain) {
                continue;
            }

            match self.delete_orphan(&chain).await {
                Ok(()) => {
                    orphans.remove(&chain);
                }
                Err(e) if e.is_not_found() => {
                    orphans.remove(&chain);
                }
                Err(e) => {
                    warn!(chain = %chain, error = %e, "Failed to delete orphaned chain, will retry");
                }
            }
        }
    }
}
