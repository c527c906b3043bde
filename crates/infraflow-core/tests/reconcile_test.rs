mod common;

use assert_matches::assert_matches;
use common::{INSTANCE, PROJECT, REGION, RecordingLegacy, TestEnv, spec};
use infraflow_cloud::{
    Address, Direction, Fault, FirewallAllowed, FirewallRule, Network, RoutingMode,
};
use infraflow_core::{Context, ErrorCode, ReconcileError, StepStatus, USE_FLOW_ANNOTATION};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

const FULL: &str = r#"
network: {name: net-1}
subnets:
  - {name: nodes, cidr: 10.250.0.0/16}
  - {name: internal, cidr: 10.251.0.0/16, purpose: internal}
router: {name: router}
nat: {name: nat, natIpNames: [nat-ip]}
firewallRules:
  - name: allow-internal
    sourceSubnets: [nodes, internal]
    allowed: [{protocol: tcp}]
  - name: allow-nat
    includeNatIps: true
    allowed: [{protocol: tcp, ports: ["443"]}]
serviceAccounts:
  - name: nodes
    roles: [roles/logging.logWriter]
"#;

#[tokio::test]
async fn test_single_network() {
    let env = TestEnv::new();

    let status = env.reconcile(&spec("network: {name: net-1}\n")).await.unwrap();

    let vpc = status.networks.unwrap().vpc.unwrap();
    assert_eq!(vpc.name, "shoot-net-1");
    assert!(vpc.self_link.unwrap().ends_with("/global/networks/shoot-net-1"));

    let state = env.store_state().await;
    assert_eq!(state.steps.len(), 1);
    assert_eq!(state.status("network/net-1"), Some(StepStatus::Succeeded));
}

#[tokio::test]
async fn test_adding_subnet_keeps_network() {
    let env = TestEnv::new();
    env.reconcile(&spec("network: {name: net-1}\n")).await.unwrap();

    let status = env
        .reconcile(&spec(
            "network: {name: net-1}\nsubnets:\n  - {name: sub-a, cidr: 10.0.0.0/24}\n",
        ))
        .await
        .unwrap();

    assert_eq!(env.cloud.calls("create_network"), 1);
    assert_eq!(env.cloud.calls("create_subnetwork"), 1);
    assert_eq!(status.networks.unwrap().subnets[0].name, "shoot-sub-a");
}

#[tokio::test]
async fn test_transient_error_is_retried() {
    let env = TestEnv::new();
    env.cloud.inject("create_firewall", Fault::RateLimited);

    env.reconcile(&spec(
        r#"
network: {name: net-1}
firewallRules:
  - {name: allow-ssh, sourceRanges: [0.0.0.0/0], allowed: [{protocol: tcp, ports: ["22"]}]}
"#,
    ))
    .await
    .unwrap();

    let state = env.store_state().await;
    let record = state.get("firewall/allow-ssh").unwrap();
    assert_eq!(record.status, StepStatus::Succeeded);
    assert_eq!(record.attempts, 2);
    assert!(env.cloud.firewall(PROJECT, "shoot-allow-ssh").is_some());
}

#[tokio::test]
async fn test_dependencies_are_created_first() {
    let env = TestEnv::new();
    env.reconcile(&spec(FULL)).await.unwrap();

    let mutations = env.cloud.mutations();
    let index = |m: &str| {
        mutations
            .iter()
            .position(|x| x == m)
            .unwrap_or_else(|| panic!("{} not in {:?}", m, mutations))
    };
    assert!(index("create_network:shoot-net-1") < index("create_subnetwork:shoot-nodes"));
    assert!(index("create_network:shoot-net-1") < index("create_router:shoot-router"));
    assert!(index("create_router:shoot-router") < index("create_nat:shoot-nat"));
    assert!(index("create_subnetwork:shoot-nodes") < index("create_nat:shoot-nat"));
    assert!(index("create_nat:shoot-nat") < index("create_firewall:shoot-allow-nat"));
    assert!(
        index("create_subnetwork:shoot-internal") < index("create_firewall:shoot-allow-internal")
    );

    let rule = env.cloud.firewall(PROJECT, "shoot-allow-nat").unwrap();
    assert!(rule.source_ranges.contains(&"203.0.113.7/32".to_string()));
    let rule = env.cloud.firewall(PROJECT, "shoot-allow-internal").unwrap();
    assert!(rule.source_ranges.contains(&"10.250.0.0/16".to_string()));
    assert!(rule.source_ranges.contains(&"10.251.0.0/16".to_string()));
}

#[tokio::test]
async fn test_full_status() {
    let env = TestEnv::new();
    let status = env.reconcile(&spec(FULL)).await.unwrap();

    let networks = status.networks.as_ref().unwrap();
    let vpc = networks.vpc.as_ref().unwrap();
    assert_eq!(vpc.cloud_router.as_ref().unwrap().name, "shoot-router");
    assert_eq!(networks.subnets.len(), 2);
    assert_eq!(networks.nat_ips.len(), 1);
    assert_eq!(networks.nat_ips[0].ip, "203.0.113.7");
    assert_eq!(
        status.service_account_email.as_deref(),
        Some("shoot-nodes@proj.iam.gserviceaccount.com")
    );
}

#[tokio::test]
async fn test_reconcile_is_idempotent() {
    let env = TestEnv::new();
    let first = env.reconcile(&spec(FULL)).await.unwrap();
    let mutations = env.cloud.mutations().len();

    let second = env.reconcile(&spec(FULL)).await.unwrap();

    assert_eq!(env.cloud.mutations().len(), mutations);
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_partial_failure_resumes() {
    let env = TestEnv::new();
    let spec = spec(
        r#"
network: {name: net-1}
subnets:
  - {name: a, cidr: 10.0.0.0/24}
firewallRules:
  - {name: allow-a, sourceSubnets: [a], allowed: [{protocol: tcp}]}
serviceAccounts:
  - {name: nodes}
"#,
    );
    env.cloud.inject("create_subnetwork", Fault::PermissionDenied);

    let err = env.reconcile(&spec).await.unwrap_err();
    assert_eq!(err.codes(), vec![ErrorCode::Unauthorized]);
    assert_eq!(err.failures().len(), 1);
    assert_eq!(err.failures()[0].step_id, "subnet/a");
    let status = assert_matches!(err, ReconcileError::PartialFailure { status, .. } => status);
    assert!(status.networks.as_ref().unwrap().vpc.is_some());
    assert!(status.networks.as_ref().unwrap().subnets.is_empty());
    assert!(status.service_account_email.is_some());

    // The independent branch ran, the dependent one did not
    assert_eq!(env.cloud.calls("create_service_account"), 1);
    assert_eq!(env.cloud.calls("create_firewall"), 0);
    let state = env.store_state().await;
    assert_eq!(state.status("subnet/a"), Some(StepStatus::Failed));
    assert_eq!(state.status("firewall/allow-a"), Some(StepStatus::Pending));

    env.reconcile(&spec).await.unwrap();
    assert_eq!(env.cloud.calls("create_network"), 1);
    assert_eq!(env.cloud.calls("create_service_account"), 1);
    assert_eq!(env.cloud.calls("create_subnetwork"), 2);
    assert_eq!(env.cloud.calls("create_firewall"), 1);
}

#[tokio::test]
async fn test_delete_removes_everything() {
    let env = TestEnv::new();
    env.reconcile(&spec(FULL)).await.unwrap();
    assert!(env.cloud.resource_count() > 0);

    env.reconciler()
        .delete(&Context::background(), INSTANCE)
        .await
        .unwrap();

    assert_eq!(env.cloud.resource_count(), 0);
    assert!(!env.store.contains(INSTANCE));
    assert!(
        env.cloud
            .roles(PROJECT, "serviceAccount:shoot-nodes@proj.iam.gserviceaccount.com")
            .is_empty()
    );

    let mutations = env.cloud.mutations();
    let index = |m: &str| mutations.iter().position(|x| x == m).unwrap();
    assert!(index("delete_firewall:shoot-allow-nat") < index("delete_nat:shoot-nat"));
    assert!(index("delete_nat:shoot-nat") < index("delete_router:shoot-router"));
    assert!(index("delete_subnetwork:shoot-nodes") < index("delete_network:shoot-net-1"));

    // Nothing left to delete
    env.reconciler()
        .delete(&Context::background(), INSTANCE)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_delete_keeps_existing_network() {
    let env = TestEnv::new();
    env.cloud.seed_network(
        PROJECT,
        Network {
            name: "shared-vpc".into(),
            routing_mode: RoutingMode::Regional,
            mtu: None,
            owner: None,
            self_link: None,
        },
    );
    let spec = spec(
        "network: {name: shared-vpc, existing: true}\nsubnets:\n  - {name: a, cidr: 10.0.0.0/24}\n",
    );

    let status = env.reconcile(&spec).await.unwrap();
    assert_eq!(status.networks.unwrap().vpc.unwrap().name, "shared-vpc");
    assert_eq!(env.cloud.calls("create_network"), 0);

    env.reconciler()
        .delete(&Context::background(), INSTANCE)
        .await
        .unwrap();
    assert!(env.cloud.network(PROJECT, "shared-vpc").is_some());
    assert!(env.cloud.subnetwork(PROJECT, REGION, "shoot-a").is_none());
    assert_eq!(env.cloud.calls("delete_network"), 0);
}

#[tokio::test]
async fn test_foreign_resource_is_not_taken_over() {
    let env = TestEnv::new();
    env.reconcile(&spec("network: {name: net-1}\n")).await.unwrap();
    let foreign = FirewallRule {
        name: "shoot-allow-ssh".into(),
        network: "shoot-net-1".into(),
        direction: Direction::Ingress,
        priority: 1000,
        source_ranges: vec!["192.0.2.0/24".into()],
        target_tags: Vec::new(),
        allowed: vec![FirewallAllowed {
            protocol: "tcp".into(),
            ports: vec!["22".into()],
        }],
        owner: Some("other-shoot".into()),
        self_link: None,
    };
    env.cloud.seed_firewall(PROJECT, foreign.clone());

    let err = env
        .reconcile(&spec(
            r#"
network: {name: net-1}
firewallRules:
  - {name: allow-ssh, sourceRanges: [0.0.0.0/0], allowed: [{protocol: tcp, ports: ["22"]}]}
"#,
        ))
        .await
        .unwrap_err();

    assert_eq!(err.codes(), vec![ErrorCode::OwnershipConflict]);
    let actual = env.cloud.firewall(PROJECT, "shoot-allow-ssh").unwrap();
    assert_eq!(actual.source_ranges, foreign.source_ranges);
    assert_eq!(actual.owner.as_deref(), Some("other-shoot"));
    assert_eq!(env.cloud.calls("update_firewall"), 0);
}

#[tokio::test]
async fn test_immutable_change_reports_drift() {
    let env = TestEnv::new();
    env.reconcile(&spec(
        "network: {name: net-1}\nsubnets:\n  - {name: a, cidr: 10.0.0.0/24}\n",
    ))
    .await
    .unwrap();

    let err = env
        .reconcile(&spec(
            "network: {name: net-1}\nsubnets:\n  - {name: a, cidr: 10.0.2.0/24}\n",
        ))
        .await
        .unwrap_err();

    assert_eq!(err.codes(), vec![ErrorCode::Drift]);
    let subnet = env.cloud.subnetwork(PROJECT, REGION, "shoot-a").unwrap();
    assert_eq!(subnet.ip_cidr_range, "10.0.0.0/24");
}

#[tokio::test]
async fn test_persistence_failure_is_fatal() {
    let env = TestEnv::new();
    env.store.fail_saves(true);

    let err = env.reconcile(&spec("network: {name: net-1}\n")).await.unwrap_err();

    assert_matches!(err, ReconcileError::Persistence(_));
    assert!(env.cloud.mutations().is_empty());
}

#[tokio::test]
async fn test_invalid_spec_touches_nothing() {
    let env = TestEnv::new();
    let err = env
        .reconcile(&spec(
            "network: {name: net-1}\nsubnets:\n  - {name: a, cidr: not-a-cidr}\n",
        ))
        .await
        .unwrap_err();

    assert_matches!(err, ReconcileError::Spec(_));
    assert_eq!(err.codes(), vec![ErrorCode::ConfigurationProblem]);
    assert!(env.cloud.mutations().is_empty());
    assert!(!env.store.contains(INSTANCE));
}

#[tokio::test]
async fn test_removed_subnet_is_pruned() {
    let env = TestEnv::new();
    env.reconcile(&spec(
        r#"
network: {name: net-1}
subnets:
  - {name: a, cidr: 10.0.0.0/24}
  - {name: b, cidr: 10.0.1.0/24}
"#,
    ))
    .await
    .unwrap();

    let status = env
        .reconcile(&spec(
            "network: {name: net-1}\nsubnets:\n  - {name: a, cidr: 10.0.0.0/24}\n",
        ))
        .await
        .unwrap();

    assert!(env.cloud.subnetwork(PROJECT, REGION, "shoot-b").is_none());
    assert!(env.cloud.subnetwork(PROJECT, REGION, "shoot-a").is_some());
    assert_eq!(status.networks.unwrap().subnets.len(), 1);
    assert!(!env.store_state().await.contains("subnet/b"));
}

#[tokio::test]
async fn test_cancelled_before_start() {
    let env = TestEnv::new();
    let (ctx, handle) = Context::with_cancel();
    handle.cancel();

    let err = env
        .reconciler()
        .reconcile(&ctx, &spec("network: {name: net-1}\n"), INSTANCE)
        .await
        .unwrap_err();

    assert_matches!(err, ReconcileError::Cancelled);
    assert!(env.cloud.mutations().is_empty());
}

#[tokio::test]
async fn test_cancelled_step_resumes() {
    let env = TestEnv::new();
    let spec = spec("network: {name: net-1}\n");
    env.cloud
        .inject("create_network", Fault::Delay(Duration::from_secs(5)));
    let (ctx, handle) = Context::with_cancel();

    let reconciler = env.reconciler();
    let run = reconciler.reconcile(&ctx, &spec, INSTANCE);
    let cancel = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.cancel();
    };
    let (result, ()) = tokio::join!(run, cancel);

    assert_matches!(result, Err(ReconcileError::Cancelled));
    let state = env.store_state().await;
    assert_eq!(state.status("network/net-1"), Some(StepStatus::Pending));
    assert!(env.cloud.network(PROJECT, "shoot-net-1").is_none());

    env.reconcile(&spec).await.unwrap();
    assert!(env.cloud.network(PROJECT, "shoot-net-1").is_some());
}

#[tokio::test]
async fn test_legacy_path_without_reconciler() {
    let env = TestEnv::new();
    env.write_legacy_state();

    let err = env.reconcile(&spec("network: {name: net-1}\n")).await.unwrap_err();

    assert_matches!(err, ReconcileError::LegacyUnavailable);
    assert!(env.cloud.mutations().is_empty());
}

#[tokio::test]
async fn test_legacy_path_is_delegated() {
    let env = TestEnv::new();
    env.write_legacy_state();
    let legacy = Arc::new(RecordingLegacy::default());
    let reconciler = env.reconciler().with_legacy(legacy.clone());

    reconciler
        .reconcile(&Context::background(), &spec("network: {name: net-1}\n"), INSTANCE)
        .await
        .unwrap();
    reconciler
        .delete(&Context::background(), INSTANCE)
        .await
        .unwrap();

    assert_eq!(legacy.reconciles.load(Ordering::SeqCst), 1);
    assert_eq!(legacy.deletes.load(Ordering::SeqCst), 1);
    assert!(env.cloud.mutations().is_empty());
    assert!(env.gate().state_path(INSTANCE).exists());
}

#[tokio::test]
async fn test_migration_cleans_up_legacy_state() {
    let env = TestEnv::new();
    env.write_legacy_state();
    let mut spec = spec("network: {name: net-1}\n");
    spec.annotations
        .insert(USE_FLOW_ANNOTATION.to_string(), "true".to_string());

    env.reconcile(&spec).await.unwrap();

    assert!(!env.gate().state_path(INSTANCE).exists());
    assert!(env.cloud.network(PROJECT, "shoot-net-1").is_some());

    // Flow state now exists, so the annotation is no longer needed
    spec.annotations.clear();
    env.reconcile(&spec).await.unwrap();
    assert_eq!(env.cloud.calls("create_network"), 1);
}

#[tokio::test]
async fn test_plan_reports_pending_changes() {
    let env = TestEnv::new();
    let spec = spec("network: {name: net-1}\n");
    let reconciler = env.reconciler();

    let plan = reconciler.plan(&spec, INSTANCE).await.unwrap();
    assert_eq!(
        plan.summary().to_string(),
        "1 to create, 0 to update, 0 to delete, 0 unchanged"
    );
    assert!(reconciler.status(&spec, INSTANCE).await.unwrap().is_none());

    env.reconcile(&spec).await.unwrap();

    let plan = reconciler.plan(&spec, INSTANCE).await.unwrap();
    assert!(!plan.has_changes());
    assert!(reconciler.status(&spec, INSTANCE).await.unwrap().is_some());
}

#[tokio::test]
async fn test_firewall_follows_changed_nat_ips() {
    let env = TestEnv::new();
    env.cloud.seed_address(
        PROJECT,
        Address {
            name: "nat-ip-2".into(),
            region: REGION.into(),
            address: "198.51.100.9".into(),
            self_link: None,
        },
    );
    env.reconcile(&spec(FULL)).await.unwrap();
    let rule = env.cloud.firewall(PROJECT, "shoot-allow-nat").unwrap();
    assert_eq!(rule.source_ranges, vec!["203.0.113.7/32"]);

    let status = env
        .reconcile(&spec(&FULL.replace("natIpNames: [nat-ip]", "natIpNames: [nat-ip-2]")))
        .await
        .unwrap();

    assert_eq!(status.networks.unwrap().nat_ips[0].ip, "198.51.100.9");
    let rule = env.cloud.firewall(PROJECT, "shoot-allow-nat").unwrap();
    assert_eq!(rule.source_ranges, vec!["198.51.100.9/32"]);
    assert_eq!(env.cloud.calls("update_firewall"), 1);
    // Rules that do not use the NAT addresses are left alone
    assert!(
        !env.cloud
            .mutations()
            .contains(&"update_firewall:shoot-allow-internal".to_string())
    );
}

#[tokio::test]
async fn test_adopts_resource_reported_as_existing() {
    let env = TestEnv::new();
    env.reconcile(&spec("network: {name: net-1}\n")).await.unwrap();
    env.cloud.seed_firewall(
        PROJECT,
        FirewallRule {
            name: "shoot-allow-ssh".into(),
            network: "shoot-net-1".into(),
            direction: Direction::Ingress,
            priority: 1000,
            source_ranges: vec!["0.0.0.0/0".into()],
            target_tags: Vec::new(),
            allowed: vec![FirewallAllowed {
                protocol: "tcp".into(),
                ports: vec!["22".into()],
            }],
            owner: None,
            self_link: None,
        },
    );
    // The first lookup misses the rule, so the create runs into it
    env.cloud.inject("get_firewall", Fault::StaleRead);
    let spec = spec(
        r#"
network: {name: net-1}
firewallRules:
  - {name: allow-ssh, sourceRanges: [0.0.0.0/0], allowed: [{protocol: tcp, ports: ["22"]}]}
"#,
    );

    let first = env.reconcile(&spec).await.unwrap();

    assert_eq!(env.cloud.calls("create_firewall"), 1);
    assert_eq!(env.cloud.calls("update_firewall"), 1);
    let rule = env.cloud.firewall(PROJECT, "shoot-allow-ssh").unwrap();
    assert_eq!(rule.owner.as_deref(), Some(INSTANCE));
    assert_eq!(env.cloud.resource_count(), 2);

    let mutations = env.cloud.mutations().len();
    let second = env.reconcile(&spec).await.unwrap();
    assert_eq!(env.cloud.mutations().len(), mutations);
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_lost_create_response_is_retried() {
    let env = TestEnv::new();
    env.cloud.inject("create_network", Fault::LostResponse);
    let spec = spec("network: {name: net-1}\n");

    let first = env.reconcile(&spec).await.unwrap();

    assert_eq!(env.cloud.calls("create_network"), 1);
    assert_eq!(env.cloud.resource_count(), 1);
    let network = env.cloud.network(PROJECT, "shoot-net-1").unwrap();
    assert_eq!(network.owner.as_deref(), Some(INSTANCE));
    let state = env.store_state().await;
    assert_eq!(state.get("network/net-1").unwrap().attempts, 2);
    assert!(!state.get("network/net-1").unwrap().adopted());

    let second = env.reconcile(&spec).await.unwrap();
    assert_eq!(env.cloud.calls("create_network"), 1);
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_adopted_network_is_deleted_with_instance() {
    let env = TestEnv::new();
    env.cloud.seed_network(
        PROJECT,
        Network {
            name: "shoot-net-1".into(),
            routing_mode: RoutingMode::Regional,
            mtu: None,
            owner: None,
            self_link: None,
        },
    );
    let spec = spec("network: {name: net-1}\n");

    env.reconcile(&spec).await.unwrap();
    env.reconcile(&spec).await.unwrap();

    assert_eq!(env.cloud.calls("create_network"), 0);
    assert_eq!(env.cloud.calls("update_network"), 0);
    assert!(env.store_state().await.get("network/net-1").unwrap().adopted());

    env.reconciler()
        .delete(&Context::background(), INSTANCE)
        .await
        .unwrap();
    assert!(env.cloud.network(PROJECT, "shoot-net-1").is_none());
    assert!(!env.store.contains(INSTANCE));
}
