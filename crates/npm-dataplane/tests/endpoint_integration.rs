//! Integration tests for the policy manager over the host endpoint backend.
//!
//! A mock host networking service keeps endpoint policy lists in memory so
//! the tests can inspect exactly what landed on each endpoint.

use async_trait::async_trait;
use npm_common::{DriverError, DriverResult};
use npm_dataplane::backend::endpoint::NODE_ALLOW_PRIORITY;
use npm_dataplane::backend::hns::{
    AclPolicySettings, EndpointDriver, EndpointPolicy, HostEndpoint, RequestType,
};
use npm_dataplane::{
    AclRule, DataplaneConfig, DataplaneError, EndpointSet, NetworkPolicy, PolicyManager, PortRange,
    Protocol, SetRef,
};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

const NODE_IP: &str = "10.240.0.4";

/// In-memory host networking service.
#[derive(Default)]
struct MockHns {
    endpoints: Mutex<BTreeMap<String, Vec<EndpointPolicy>>>,
    /// Endpoints whose policy updates are rejected.
    failing: Mutex<BTreeSet<String>>,
    /// Every accepted apply request: (endpoint, request type, entry count).
    requests: Mutex<Vec<(String, RequestType, usize)>>,
    calls: AtomicUsize,
}

impl MockHns {
    fn with_endpoints(ids: &[&str]) -> Arc<Self> {
        let hns = Arc::new(Self::default());
        for id in ids {
            hns.create_endpoint(id, Vec::new());
        }
        hns
    }

    fn create_endpoint(&self, id: &str, policies: Vec<EndpointPolicy>) {
        self.endpoints
            .lock()
            .unwrap()
            .insert(id.to_string(), policies);
    }

    fn delete_endpoint(&self, id: &str) {
        self.endpoints.lock().unwrap().remove(id);
    }

    fn fail_endpoint(&self, id: &str) {
        self.failing.lock().unwrap().insert(id.to_string());
    }

    fn policies(&self, id: &str) -> Vec<EndpointPolicy> {
        self.endpoints
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .unwrap_or_default()
    }

    /// ACL entries on an endpoint, in endpoint order.
    fn acls(&self, id: &str) -> Vec<AclPolicySettings> {
        self.policies(id)
            .into_iter()
            .filter(|p| p.is_acl())
            .map(|p| serde_json::from_value(p.settings).unwrap())
            .collect()
    }

    fn owned_acls(&self, id: &str) -> Vec<AclPolicySettings> {
        self.acls(id).into_iter().filter(|a| a.is_owned()).collect()
    }

    fn requests(&self) -> Vec<(String, RequestType, usize)> {
        self.requests.lock().unwrap().clone()
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EndpointDriver for MockHns {
    async fn get_endpoint(&self, endpoint_id: &str) -> DriverResult<HostEndpoint> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let endpoints = self.endpoints.lock().unwrap();
        let policies = endpoints
            .get(endpoint_id)
            .ok_or_else(|| DriverError::endpoint_not_found(endpoint_id))?;
        Ok(HostEndpoint {
            id: endpoint_id.to_string(),
            ip: None,
            policies: policies.clone(),
        })
    }

    async fn apply_endpoint_policy(
        &self,
        endpoint: &HostEndpoint,
        request: RequestType,
        policies: Vec<EndpointPolicy>,
    ) -> DriverResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.lock().unwrap().contains(&endpoint.id) {
            return Err(DriverError::operation(
                "apply endpoint policy",
                format!("access denied on {}", endpoint.id),
            ));
        }

        let mut endpoints = self.endpoints.lock().unwrap();
        let current = endpoints
            .get_mut(&endpoint.id)
            .ok_or_else(|| DriverError::endpoint_not_found(&endpoint.id))?;
        self.requests
            .lock()
            .unwrap()
            .push((endpoint.id.clone(), request, policies.len()));
        match request {
            RequestType::Add => current.extend(policies),
            RequestType::Update => *current = policies,
        }
        Ok(())
    }
}

fn config(network_name: &str, batch_limit: usize) -> DataplaneConfig {
    let mut config = DataplaneConfig::default();
    config.node.node_ip = Some(NODE_IP.to_string());
    config.node.network_name = network_name.to_string();
    config.endpoint.max_batched_acls_per_pod = batch_limit;
    config
}

fn manager(hns: &Arc<MockHns>) -> PolicyManager {
    PolicyManager::with_endpoint_backend(hns.clone(), &config("azure", 30))
}

fn web_policy() -> NetworkPolicy {
    NetworkPolicy::new("default", "web")
        .with_acl(
            AclRule::allow_ingress()
                .with_protocol(Protocol::Tcp)
                .with_remote_set(SetRef::included("app:frontend"))
                .with_local_ports(PortRange::single(8080))
                .with_priority(222),
        )
        .with_acl(AclRule::block_ingress().with_priority(3000))
}

fn policy_with_rules(name: &str, rules: usize) -> NetworkPolicy {
    let mut policy = NetworkPolicy::new("default", name);
    for i in 0..rules {
        policy = policy.with_acl(AclRule::allow_egress().with_priority(300 + i as u16));
    }
    policy
}

fn endpoints(pairs: &[(&str, &str)]) -> EndpointSet {
    pairs
        .iter()
        .map(|(ip, id)| (ip.to_string(), id.to_string()))
        .collect()
}

fn nat_policy() -> EndpointPolicy {
    EndpointPolicy {
        policy_type: "OutBoundNAT".to_string(),
        settings: json!({"VirtualIP": "10.240.0.4"}),
    }
}

#[tokio::test]
async fn test_policy_carries_injected_node_rule() {
    let hns = MockHns::with_endpoints(&["ep-a"]);
    let manager = manager(&hns);

    manager
        .add_policies(vec![web_policy()], &endpoints(&[("10.0.0.1", "ep-a")]))
        .await
        .unwrap();

    let acls = hns.owned_acls("ep-a");
    assert_eq!(acls.len(), 3);
    assert!(acls.iter().all(|a| a.id == "azure-acl-default-web"));

    let injected = acls.last().unwrap();
    assert_eq!(injected.remote_addresses, NODE_IP);
    assert_eq!(injected.priority, NODE_ALLOW_PRIORITY);
    assert_eq!(injected.action, "Allow");
    assert_eq!(injected.direction, "In");

    assert_eq!(acls[0].protocols, "6");
    assert_eq!(acls[0].local_ports, "8080");
    assert_eq!(acls[0].remote_addresses, "app:frontend");
    assert_eq!(manager.metrics().num_acl_rules(), 3);
}

#[tokio::test]
async fn test_add_policies_is_idempotent() {
    let hns = MockHns::with_endpoints(&["ep-a"]);
    let manager = manager(&hns);
    let targets = endpoints(&[("10.0.0.1", "ep-a")]);

    manager.add_policies(vec![web_policy()], &targets).await.unwrap();
    let requests_after_first = hns.requests().len();

    let report = manager.add_policies(vec![web_policy()], &targets).await.unwrap();

    assert_eq!(hns.requests().len(), requests_after_first);
    assert_eq!(hns.owned_acls("ep-a").len(), 3);
    assert_eq!(report.endpoints_for("default/web"), Some(&targets));
    assert_eq!(manager.metrics().num_acl_rules(), 3);
    assert_eq!(
        manager.get_policy("default/web").await.unwrap().pod_endpoints,
        targets
    );
}

#[tokio::test]
async fn test_failing_endpoint_does_not_block_others() {
    let hns = MockHns::with_endpoints(&["ep-a", "ep-b", "ep-c"]);
    hns.fail_endpoint("ep-b");
    let manager = manager(&hns);

    let err = manager
        .add_policies(
            vec![web_policy()],
            &endpoints(&[("10.0.0.1", "ep-a"), ("10.0.0.2", "ep-b"), ("10.0.0.3", "ep-c")]),
        )
        .await
        .unwrap_err();

    assert!(err.is_retryable());
    let report = err.partial_report().expect("partial failure");
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].target, "ep-b");
    assert_eq!(
        report.endpoints_for("default/web"),
        Some(&endpoints(&[("10.0.0.1", "ep-a"), ("10.0.0.3", "ep-c")]))
    );

    let cached = manager.get_policy("default/web").await.unwrap();
    assert_eq!(
        cached.pod_endpoints,
        endpoints(&[("10.0.0.1", "ep-a"), ("10.0.0.3", "ep-c")])
    );
    assert_eq!(hns.owned_acls("ep-c").len(), 3);
    assert!(hns.owned_acls("ep-b").is_empty());
    assert_eq!(manager.metrics().num_acl_rules(), 6);
}

#[tokio::test]
async fn test_remove_unknown_policy_makes_no_driver_calls() {
    let hns = MockHns::with_endpoints(&["ep-a"]);
    let manager = manager(&hns);

    manager.remove_policy("default/missing").await.unwrap();
    manager
        .remove_policy_for_endpoints("default/missing", &endpoints(&[("10.0.0.1", "ep-a")]))
        .await
        .unwrap();

    assert_eq!(hns.calls(), 0);
}

#[tokio::test]
async fn test_replaced_endpoint_takes_over_address() {
    let hns = MockHns::with_endpoints(&["ep-a"]);
    let manager = manager(&hns);

    manager
        .add_policies(vec![web_policy()], &endpoints(&[("10.0.0.1", "ep-a")]))
        .await
        .unwrap();

    // the pod is recreated with the same address
    hns.delete_endpoint("ep-a");
    hns.create_endpoint("ep-new", Vec::new());

    manager
        .add_policies(vec![web_policy()], &endpoints(&[("10.0.0.1", "ep-new")]))
        .await
        .unwrap();

    let cached = manager.get_policy("default/web").await.unwrap();
    assert_eq!(cached.pod_endpoints, endpoints(&[("10.0.0.1", "ep-new")]));
    assert_eq!(hns.owned_acls("ep-new").len(), 3);
    assert_eq!(manager.metrics().num_acl_rules(), 3);
}

#[tokio::test]
async fn test_remove_keeps_foreign_policies_first() {
    let hns = Arc::new(MockHns::default());
    let host_acl = EndpointPolicy::from_acl(&AclPolicySettings {
        id: "host-managed".to_string(),
        action: "Allow".to_string(),
        direction: "Out".to_string(),
        priority: 100,
        ..AclPolicySettings::default()
    })
    .unwrap();
    hns.create_endpoint("ep-a", vec![host_acl, nat_policy()]);
    let manager = manager(&hns);

    manager
        .add_policies(vec![web_policy()], &endpoints(&[("10.0.0.1", "ep-a")]))
        .await
        .unwrap();
    assert_eq!(hns.policies("ep-a").len(), 5);

    manager.remove_policy("default/web").await.unwrap();

    let remaining = hns.policies("ep-a");
    assert_eq!(remaining.len(), 2);
    assert_eq!(remaining[0], nat_policy());
    assert_eq!(hns.acls("ep-a")[0].id, "host-managed");
    assert!(hns.owned_acls("ep-a").is_empty());

    let (_, request, _) = hns.requests().last().cloned().unwrap();
    assert_eq!(request, RequestType::Update);
    assert!(!manager.policy_exists("default/web").await);
    assert_eq!(manager.metrics().num_acl_rules(), 0);
}

#[tokio::test]
async fn test_remove_from_gone_endpoint_succeeds() {
    let hns = MockHns::with_endpoints(&["ep-a", "ep-b"]);
    let manager = manager(&hns);

    manager
        .add_policies(
            vec![web_policy()],
            &endpoints(&[("10.0.0.1", "ep-a"), ("10.0.0.2", "ep-b")]),
        )
        .await
        .unwrap();
    hns.delete_endpoint("ep-b");

    manager.remove_policy("default/web").await.unwrap();
    assert!(hns.owned_acls("ep-a").is_empty());
    assert!(!manager.policy_exists("default/web").await);
}

#[tokio::test]
async fn test_remove_policy_failure_is_reported() {
    let hns = MockHns::with_endpoints(&["ep-a", "ep-b"]);
    let manager = manager(&hns);

    manager
        .add_policies(
            vec![web_policy()],
            &endpoints(&[("10.0.0.1", "ep-a"), ("10.0.0.2", "ep-b")]),
        )
        .await
        .unwrap();
    hns.fail_endpoint("ep-b");

    let err = manager.remove_policy("default/web").await.unwrap_err();
    let report = err.partial_report().expect("partial failure");
    assert_eq!(report.failures[0].target, "ep-b");
    assert!(hns.owned_acls("ep-a").is_empty());
    assert_eq!(hns.owned_acls("ep-b").len(), 3);
    assert_eq!(manager.metrics().num_acl_rules(), 3);
}

#[tokio::test]
async fn test_remove_policy_for_some_endpoints() {
    let hns = MockHns::with_endpoints(&["ep-a", "ep-b"]);
    let manager = manager(&hns);

    manager
        .add_policies(
            vec![web_policy()],
            &endpoints(&[("10.0.0.1", "ep-a"), ("10.0.0.2", "ep-b")]),
        )
        .await
        .unwrap();

    manager
        .remove_policy_for_endpoints("default/web", &endpoints(&[("10.0.0.2", "ep-b")]))
        .await
        .unwrap();

    let cached = manager.get_policy("default/web").await.unwrap();
    assert_eq!(cached.pod_endpoints, endpoints(&[("10.0.0.1", "ep-a")]));
    assert_eq!(hns.owned_acls("ep-a").len(), 3);
    assert!(hns.owned_acls("ep-b").is_empty());
    assert_eq!(manager.metrics().num_acl_rules(), 3);
}

#[tokio::test]
async fn test_add_all_policies_batches_whole_policies() {
    let hns = MockHns::with_endpoints(&["ep-new"]);
    let manager = PolicyManager::with_endpoint_backend(hns.clone(), &config("azure", 20));

    manager
        .add_policies(
            vec![policy_with_rules("small", 9), policy_with_rules("large", 24)],
            &EndpointSet::new(),
        )
        .await
        .unwrap();
    assert_eq!(hns.calls(), 0);

    let keys = BTreeSet::from([
        "default/large".to_string(),
        "default/small".to_string(),
        "default/unknown".to_string(),
    ]);
    let applied = manager
        .add_all_policies(&keys, "ep-new", "10.0.0.9")
        .await
        .unwrap();

    assert_eq!(
        applied,
        BTreeSet::from(["default/large".to_string(), "default/small".to_string()])
    );
    let sizes: Vec<usize> = hns.requests().iter().map(|(_, _, n)| *n).collect();
    assert_eq!(sizes, vec![25, 10]);
    assert_eq!(hns.owned_acls("ep-new").len(), 35);
    assert_eq!(manager.metrics().num_acl_rules(), 35);

    for key in ["default/large", "default/small"] {
        let cached = manager.get_policy(key).await.unwrap();
        assert_eq!(cached.pod_endpoints, endpoints(&[("10.0.0.9", "ep-new")]));
    }

    // already applied policies are skipped on a second call
    let again = manager
        .add_all_policies(&keys, "ep-new", "10.0.0.9")
        .await
        .unwrap();
    assert!(again.is_empty());
    assert_eq!(hns.requests().len(), 2);
}

#[tokio::test]
async fn test_add_all_policies_failed_batch() {
    let hns = MockHns::with_endpoints(&["ep-new"]);
    hns.fail_endpoint("ep-new");
    let manager = manager(&hns);

    manager
        .add_policies(vec![web_policy()], &EndpointSet::new())
        .await
        .unwrap();

    let err = manager
        .add_all_policies(
            &BTreeSet::from(["default/web".to_string()]),
            "ep-new",
            "10.0.0.9",
        )
        .await
        .unwrap_err();

    assert!(matches!(err, DataplaneError::Partial(_)));
    assert_eq!(err.partial_report().unwrap().failures[0].target, "ep-new");
    let cached = manager.get_policy("default/web").await.unwrap();
    assert!(cached.pod_endpoints.is_empty());
}

#[tokio::test]
async fn test_add_all_policies_to_missing_endpoint() {
    let hns = MockHns::with_endpoints(&[]);
    let manager = manager(&hns);

    manager
        .add_policies(vec![web_policy()], &EndpointSet::new())
        .await
        .unwrap();

    let applied = manager
        .add_all_policies(
            &BTreeSet::from(["default/web".to_string()]),
            "ep-gone",
            "10.0.0.9",
        )
        .await
        .unwrap();
    assert!(applied.is_empty());
}

#[tokio::test]
async fn test_bootup_resets_owned_acls_only() {
    let hns = Arc::new(MockHns::default());
    hns.create_endpoint("ep-a", vec![nat_policy()]);
    let manager = manager(&hns);

    manager
        .add_policies(vec![web_policy()], &endpoints(&[("10.0.0.1", "ep-a")]))
        .await
        .unwrap();
    assert_eq!(manager.policy_count().await, 1);

    manager
        .bootup(&["ep-a".to_string(), "ep-gone".to_string()])
        .await
        .unwrap();

    assert_eq!(hns.policies("ep-a"), vec![nat_policy()]);
    assert_eq!(manager.policy_count().await, 0);
    assert_eq!(manager.metrics().num_acl_rules(), 0);
}

#[tokio::test]
async fn test_bootup_reports_failed_endpoints() {
    let hns = MockHns::with_endpoints(&["ep-a", "ep-b"]);
    let manager = manager(&hns);
    manager
        .add_policies(
            vec![web_policy()],
            &endpoints(&[("10.0.0.1", "ep-a"), ("10.0.0.2", "ep-b")]),
        )
        .await
        .unwrap();
    hns.fail_endpoint("ep-a");

    let err = manager
        .bootup(&["ep-a".to_string(), "ep-b".to_string()])
        .await
        .unwrap_err();

    let report = err.partial_report().expect("partial failure");
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].target, "ep-a");
    assert!(hns.owned_acls("ep-b").is_empty());
    assert_eq!(manager.policy_count().await, 0);
}

#[tokio::test]
async fn test_bootup_without_node_ip_is_config_error() {
    let hns = MockHns::with_endpoints(&["ep-a"]);
    let mut config = config("azure", 30);
    config.node.node_ip = None;
    let manager = PolicyManager::with_endpoint_backend(hns.clone(), &config);

    let err = manager.bootup(&["ep-a".to_string()]).await.unwrap_err();

    assert!(matches!(err, DataplaneError::Config(_)));
    assert!(!err.is_retryable());
    assert_eq!(hns.calls(), 0);
}

#[tokio::test]
async fn test_negated_set_rejected_before_any_change() {
    let hns = MockHns::with_endpoints(&["ep-a"]);
    let manager = manager(&hns);
    let policy = NetworkPolicy::new("default", "deny-others")
        .with_acl(AclRule::block_ingress().with_remote_set(SetRef::excluded("ns:default")));

    let err = manager
        .add_policies(vec![policy], &endpoints(&[("10.0.0.1", "ep-a")]))
        .await
        .unwrap_err();

    assert!(matches!(err, DataplaneError::Validation { .. }));
    assert_eq!(hns.calls(), 0);
    assert_eq!(manager.policy_count().await, 0);
}

#[tokio::test]
async fn test_base_acls_only_on_foreign_network() {
    let hns = MockHns::with_endpoints(&["ep-a"]);

    let azure = PolicyManager::with_endpoint_backend(hns.clone(), &config("azure", 30));
    azure.add_base_acls("ep-a").await;
    assert_eq!(hns.calls(), 0);

    let custom = PolicyManager::with_endpoint_backend(hns.clone(), &config("custom-net", 30));
    custom.add_base_acls("ep-a").await;

    let acls = hns.owned_acls("ep-a");
    assert_eq!(acls.len(), 5);
    let wireserver = acls
        .iter()
        .find(|a| a.remote_addresses == "168.63.129.16/32")
        .expect("wireserver block");
    assert_eq!(wireserver.action, "Block");
    assert_eq!(wireserver.remote_ports, "80");
}

#[tokio::test]
async fn test_changed_rules_replace_previous_version() {
    let hns = MockHns::with_endpoints(&["ep-a"]);
    let manager = manager(&hns);
    let targets = endpoints(&[("10.0.0.1", "ep-a")]);

    manager.add_policies(vec![web_policy()], &targets).await.unwrap();

    let narrowed = NetworkPolicy::new("default", "web").with_acl(AclRule::block_ingress());
    manager.add_policies(vec![narrowed], &targets).await.unwrap();

    assert_eq!(hns.owned_acls("ep-a").len(), 2);
    assert_eq!(manager.metrics().num_acl_rules(), 2);
    let cached = manager.get_policy("default/web").await.unwrap();
    assert_eq!(cached.acls.len(), 1);
    assert_eq!(cached.pod_endpoints, targets);
}
