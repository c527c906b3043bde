//! Desired/actual differ
//!
//! Observed resources are looked up by their deterministic provider names and
//! compared field by field against the step intents. Immutable differences
//! are drift and are reported, never resolved by re-creating the resource.
//! The same comparison functions drive the ensure handlers.

use crate::error::ErrorCode;
use crate::graph::Graph;
use crate::state::FlowState;
use crate::step::{Intent, ResourceRef, StepTask};
use futures_util::future::try_join_all;
use infraflow_cloud::{
    Address, CloudError, FirewallRule, Nat, Network, ProviderClients, ResourceKind, Router,
    ServiceAccount, Subnetwork, resource_name, same_resource,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A resource as currently seen at the provider
#[derive(Debug, Clone, PartialEq)]
pub enum Observed {
    Network(Network),
    Subnet(Subnetwork),
    Router(Router),
    Nat(Nat),
    Firewall(FirewallRule),
    ServiceAccount {
        account: ServiceAccount,
        roles: BTreeSet<String>,
    },
}

impl Observed {
    /// Ownership marker; NAT entries have none
    pub fn owner(&self) -> Option<&str> {
        match self {
            Observed::Network(n) => n.owner.as_deref(),
            Observed::Subnet(s) => s.owner.as_deref(),
            Observed::Router(r) => r.owner.as_deref(),
            Observed::Nat(_) => None,
            Observed::Firewall(f) => f.owner.as_deref(),
            Observed::ServiceAccount { account, .. } => account.owner.as_deref(),
        }
    }

    pub fn self_link(&self) -> Option<&str> {
        match self {
            Observed::Network(n) => n.self_link.as_deref(),
            Observed::Subnet(s) => s.self_link.as_deref(),
            Observed::Router(r) => r.self_link.as_deref(),
            Observed::Nat(_) => None,
            Observed::Firewall(f) => f.self_link.as_deref(),
            Observed::ServiceAccount { .. } => None,
        }
    }
}

/// Snapshot of provider resources keyed by step id
#[derive(Debug, Clone, Default)]
pub struct ObservedState {
    resources: BTreeMap<String, Observed>,
    addresses: BTreeMap<String, Address>,
}

impl ObservedState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, step_id: impl Into<String>, observed: Observed) {
        self.resources.insert(step_id.into(), observed);
    }

    pub fn insert_address(&mut self, address: Address) {
        self.addresses.insert(address.name.clone(), address);
    }

    pub fn get(&self, step_id: &str) -> Option<&Observed> {
        self.resources.get(step_id)
    }

    pub fn address(&self, name: &str) -> Option<&Address> {
        self.addresses.get(name)
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

/// Look up the resource a step addresses
pub async fn fetch(
    clients: &ProviderClients,
    target: &ResourceRef,
) -> Result<Option<Observed>, CloudError> {
    let project = target.project.as_str();
    let name = target.name.as_str();
    let observed = match target.kind {
        ResourceKind::Network => clients
            .network
            .get_network(project, name)
            .await?
            .map(Observed::Network),
        ResourceKind::Subnet => clients
            .network
            .get_subnetwork(project, target.region(), name)
            .await?
            .map(Observed::Subnet),
        ResourceKind::Router => clients
            .network
            .get_router(project, target.region(), name)
            .await?
            .map(Observed::Router),
        ResourceKind::Nat => clients
            .network
            .get_nat(project, target.region(), target.parent(), name)
            .await?
            .map(Observed::Nat),
        ResourceKind::Firewall => clients
            .network
            .get_firewall(project, name)
            .await?
            .map(Observed::Firewall),
        ResourceKind::ServiceAccount => {
            match clients.iam.get_service_account(project, name).await? {
                Some(account) => {
                    let roles = clients.iam.get_roles(project, &account.member()).await?;
                    Some(Observed::ServiceAccount { account, roles })
                }
                None => None,
            }
        }
    };
    Ok(observed)
}

/// Fetch every target concurrently
pub async fn observe<'a>(
    clients: &ProviderClients,
    targets: impl IntoIterator<Item = (&'a str, &'a ResourceRef)>,
) -> Result<ObservedState, CloudError> {
    let fetched = try_join_all(targets.into_iter().map(|(id, target)| async move {
        fetch(clients, target)
            .await
            .map(|observed| (id.to_string(), observed))
    }))
    .await?;

    let mut state = ObservedState::new();
    for (id, observed) in fetched {
        if let Some(observed) = observed {
            state.insert(id, observed);
        }
    }
    Ok(state)
}

/// Observe everything a plan needs: graph targets, recorded orphans and NAT addresses
pub async fn observe_all(
    clients: &ProviderClients,
    graph: &Graph,
    prior: Option<&FlowState>,
) -> Result<ObservedState, CloudError> {
    let orphans = prior
        .into_iter()
        .flat_map(|state| state.steps.iter())
        .filter(|(id, _)| !graph.contains(id))
        .map(|(id, record)| (id.as_str(), &record.target));
    let targets = graph
        .steps()
        .iter()
        .map(|s| (s.id.as_str(), &s.target))
        .chain(orphans);
    let mut observed = observe(clients, targets).await?;

    for step in graph.ensure_steps() {
        if let StepTask::Ensure(Intent::Nat { nat_ip_names, .. }) = &step.task {
            for name in nat_ip_names {
                if let Some(address) = clients
                    .network
                    .get_address(&step.target.project, step.target.region(), name)
                    .await?
                {
                    observed.insert_address(address);
                }
            }
        }
    }
    Ok(observed)
}

/// Fields that differ between desired and observed configuration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldChanges {
    /// Changes applied in place
    pub mutable: Vec<&'static str>,
    /// Changes that would require re-creating the resource
    pub immutable: Vec<&'static str>,
}

impl FieldChanges {
    pub fn is_empty(&self) -> bool {
        self.mutable.is_empty() && self.immutable.is_empty()
    }

    pub fn has_drift(&self) -> bool {
        !self.immutable.is_empty()
    }

    pub fn needs_update(&self) -> bool {
        !self.mutable.is_empty()
    }

    fn mutable_if(&mut self, changed: bool, field: &'static str) {
        if changed {
            self.mutable.push(field);
        }
    }

    fn immutable_if(&mut self, changed: bool, field: &'static str) {
        if changed {
            self.immutable.push(field);
        }
    }

    /// An unmarked resource gets stamped with our marker on adoption
    fn owner(&mut self, desired: &Option<String>, actual: &Option<String>) {
        self.mutable_if(desired.is_some() && actual.is_none(), "owner");
    }

    pub fn all(&self) -> Vec<String> {
        self.immutable
            .iter()
            .chain(self.mutable.iter())
            .map(|f| f.to_string())
            .collect()
    }
}

/// Marker of another instance, if the resource carries one
pub fn foreign_owner<'a>(owner: Option<&'a str>, instance_id: &str) -> Option<&'a str> {
    owner.filter(|o| *o != instance_id)
}

fn name_set<'a>(values: impl IntoIterator<Item = &'a String>) -> BTreeSet<&'a str> {
    values.into_iter().map(|v| resource_name(v)).collect()
}

fn string_set(values: &[String]) -> BTreeSet<&str> {
    values.iter().map(String::as_str).collect()
}

pub fn compare_network(desired: &Network, actual: &Network) -> FieldChanges {
    let mut changes = FieldChanges::default();
    changes.immutable_if(
        desired.mtu.is_some() && desired.mtu != actual.mtu,
        "mtu",
    );
    // A network description cannot change after creation, so an unmarked
    // network is adopted without a marker
    changes.mutable_if(desired.routing_mode != actual.routing_mode, "routingMode");
    changes
}

pub fn compare_subnet(desired: &Subnetwork, actual: &Subnetwork) -> FieldChanges {
    let mut changes = FieldChanges::default();
    changes.immutable_if(!same_resource(&desired.network, &actual.network), "network");
    changes.immutable_if(desired.ip_cidr_range != actual.ip_cidr_range, "ipCidrRange");
    changes.mutable_if(
        desired.private_ip_google_access != actual.private_ip_google_access,
        "privateIpGoogleAccess",
    );
    changes.mutable_if(desired.flow_logs != actual.flow_logs, "logConfig");
    changes.owner(&desired.owner, &actual.owner);
    changes
}

pub fn compare_router(desired: &Router, actual: &Router) -> FieldChanges {
    let mut changes = FieldChanges::default();
    changes.immutable_if(!same_resource(&desired.network, &actual.network), "network");
    changes.owner(&desired.owner, &actual.owner);
    changes
}

/// NAT IPs and subnetworks compare by name, so desired values may be names or links
pub fn compare_nat(desired: &Nat, actual: &Nat) -> FieldChanges {
    let mut changes = FieldChanges::default();
    changes.mutable_if(
        desired.min_ports_per_vm.is_some() && desired.min_ports_per_vm != actual.min_ports_per_vm,
        "minPortsPerVm",
    );
    changes.mutable_if(
        desired.endpoint_independent_mapping != actual.endpoint_independent_mapping,
        "enableEndpointIndependentMapping",
    );
    changes.mutable_if(
        name_set(&desired.nat_ips) != name_set(&actual.nat_ips),
        "natIps",
    );
    changes.mutable_if(
        name_set(&desired.subnetworks) != name_set(&actual.subnetworks),
        "subnetworks",
    );
    changes
}

pub fn compare_firewall(desired: &FirewallRule, actual: &FirewallRule) -> FieldChanges {
    let allowed = |rule: &FirewallRule| {
        let mut entries: Vec<(String, BTreeSet<String>)> = rule
            .allowed
            .iter()
            .map(|a| (a.protocol.to_lowercase(), a.ports.iter().cloned().collect()))
            .collect();
        entries.sort();
        entries
    };

    let mut changes = FieldChanges::default();
    changes.immutable_if(!same_resource(&desired.network, &actual.network), "network");
    changes.immutable_if(desired.direction != actual.direction, "direction");
    changes.mutable_if(desired.priority != actual.priority, "priority");
    changes.mutable_if(
        string_set(&desired.source_ranges) != string_set(&actual.source_ranges),
        "sourceRanges",
    );
    changes.mutable_if(
        string_set(&desired.target_tags) != string_set(&actual.target_tags),
        "targetTags",
    );
    changes.mutable_if(allowed(desired) != allowed(actual), "allowed");
    changes.owner(&desired.owner, &actual.owner);
    changes
}

pub fn compare_service_account(
    desired: &ServiceAccount,
    desired_roles: &BTreeSet<String>,
    actual: &ServiceAccount,
    actual_roles: &BTreeSet<String>,
) -> FieldChanges {
    let mut changes = FieldChanges::default();
    changes.mutable_if(
        desired.display_name.is_some() && desired.display_name != actual.display_name,
        "displayName",
    );
    changes.mutable_if(desired_roles != actual_roles, "roles");
    changes.owner(&desired.owner, &actual.owner);
    changes
}

/// Type of operation required for a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Create,
    Update,
    Delete,
    NoOp,
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationType::Create => write!(f, "create"),
            OperationType::Update => write!(f, "update"),
            OperationType::Delete => write!(f, "delete"),
            OperationType::NoOp => write!(f, "no-op"),
        }
    }
}

/// Planned change for one resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub step_id: String,
    pub kind: ResourceKind,
    /// Provider name
    pub name: String,
    pub action: OperationType,
    /// Changed fields for updates and drift
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changes: Vec<String>,
}

/// Condition that blocks reconciliation of a resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Issue {
    pub step_id: String,
    pub code: ErrorCode,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    pub operations: Vec<Operation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<Issue>,
}

impl Plan {
    pub fn has_changes(&self) -> bool {
        self.operations
            .iter()
            .any(|o| o.action != OperationType::NoOp)
    }

    /// Get operations by type
    pub fn operations_by_type(&self, action: OperationType) -> Vec<&Operation> {
        self.operations
            .iter()
            .filter(|o| o.action == action)
            .collect()
    }

    pub fn summary(&self) -> PlanSummary {
        PlanSummary {
            create: self.operations_by_type(OperationType::Create).len(),
            update: self.operations_by_type(OperationType::Update).len(),
            delete: self.operations_by_type(OperationType::Delete).len(),
            no_change: self.operations_by_type(OperationType::NoOp).len(),
        }
    }
}

/// Summary of planned operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanSummary {
    pub create: usize,
    pub update: usize,
    pub delete: usize,
    pub no_change: usize,
}

impl std::fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} to create, {} to update, {} to delete, {} unchanged",
            self.create, self.update, self.delete, self.no_change
        )
    }
}

/// Recorded resources that are no longer desired
#[derive(Debug, Clone, Default)]
pub struct Orphans {
    /// Owned resources to delete
    pub deletions: Vec<Operation>,
    /// Records to drop without touching the provider
    pub forget: Vec<String>,
}

/// Decide what happens to records without a step in `graph`
///
/// Only resources carrying this instance's marker are deleted. Records of
/// unmanaged, never-created, vanished or foreign resources are forgotten.
pub fn orphans(
    graph: &Graph,
    prior: &FlowState,
    observed: &ObservedState,
    instance_id: &str,
) -> Orphans {
    let mut result = Orphans::default();
    for (id, record) in prior.steps.iter().filter(|(id, _)| !graph.contains(id)) {
        let target = &record.target;
        if !target.managed || !record.was_attempted() {
            result.forget.push(id.clone());
            continue;
        }
        match observed.get(id) {
            None => {
                tracing::debug!(step = %id, "Orphaned {} is already gone", target);
                result.forget.push(id.clone());
            }
            Some(actual)
                if target.kind.has_owner_marker()
                    && actual.owner() != Some(instance_id)
                    && !record.adopted() =>
            {
                tracing::warn!(
                    step = %id,
                    owner = actual.owner().unwrap_or("none"),
                    "Not deleting {}: not owned by {}",
                    target,
                    instance_id
                );
                result.forget.push(id.clone());
            }
            Some(_) => result.deletions.push(Operation {
                step_id: id.clone(),
                kind: target.kind,
                name: target.name.clone(),
                action: OperationType::Delete,
                changes: Vec::new(),
            }),
        }
    }
    result
}

/// Compare the graph's intents against an observed snapshot
pub fn diff(
    graph: &Graph,
    observed: &ObservedState,
    prior: Option<&FlowState>,
    instance_id: &str,
) -> Plan {
    let nat_ranges = nat_source_ranges(graph, observed);
    let mut plan = Plan::default();

    for step in graph.ensure_steps() {
        let StepTask::Ensure(intent) = &step.task else {
            continue;
        };
        let mut operation = Operation {
            step_id: step.id.clone(),
            kind: step.kind(),
            name: step.target.name.clone(),
            action: OperationType::NoOp,
            changes: Vec::new(),
        };

        match observed.get(&step.id) {
            None if !step.target.managed => {
                plan.issues.push(Issue {
                    step_id: step.id.clone(),
                    code: ErrorCode::ConfigurationProblem,
                    message: format!("existing {} not found", step.target),
                });
                continue;
            }
            None => operation.action = OperationType::Create,
            Some(_) if !step.target.managed => {}
            Some(actual) => {
                if let Some(owner) = foreign_owner(actual.owner(), instance_id) {
                    plan.issues.push(Issue {
                        step_id: step.id.clone(),
                        code: ErrorCode::OwnershipConflict,
                        message: format!("{} is owned by {}", step.target, owner),
                    });
                    plan.operations.push(operation);
                    continue;
                }

                let changes = compare(intent, actual, &nat_ranges);
                operation.changes = changes.all();
                if changes.has_drift() {
                    plan.issues.push(Issue {
                        step_id: step.id.clone(),
                        code: ErrorCode::Drift,
                        message: format!(
                            "immutable fields changed on {}: {}",
                            step.target,
                            changes.immutable.join(", ")
                        ),
                    });
                } else if changes.needs_update() {
                    operation.action = OperationType::Update;
                }
            }
        }
        plan.operations.push(operation);
    }

    if let Some(prior) = prior {
        plan.operations
            .extend(orphans(graph, prior, observed, instance_id).deletions);
    }
    plan
}

fn compare(intent: &Intent, actual: &Observed, nat_ranges: &[String]) -> FieldChanges {
    match (intent, actual) {
        (Intent::Network(desired), Observed::Network(actual)) => compare_network(desired, actual),
        (Intent::Subnet { subnet, .. }, Observed::Subnet(actual)) => compare_subnet(subnet, actual),
        (Intent::Router(desired), Observed::Router(actual)) => compare_router(desired, actual),
        (Intent::Nat { nat, nat_ip_names }, Observed::Nat(actual)) => {
            let desired = Nat {
                nat_ips: nat_ip_names.clone(),
                ..nat.clone()
            };
            compare_nat(&desired, actual)
        }
        (
            Intent::Firewall {
                rule,
                include_nat_ips,
            },
            Observed::Firewall(actual),
        ) => {
            let mut desired = rule.clone();
            if *include_nat_ips {
                desired.source_ranges.extend(nat_ranges.iter().cloned());
            }
            compare_firewall(&desired, actual)
        }
        (
            Intent::ServiceAccount { account, roles },
            Observed::ServiceAccount {
                account: actual,
                roles: actual_roles,
            },
        ) => compare_service_account(account, roles, actual, actual_roles),
        _ => FieldChanges::default(),
    }
}

/// `/32` ranges of the observed NAT addresses
fn nat_source_ranges(graph: &Graph, observed: &ObservedState) -> Vec<String> {
    graph
        .ensure_steps()
        .filter_map(|step| match &step.task {
            StepTask::Ensure(Intent::Nat { nat_ip_names, .. }) => Some(nat_ip_names),
            _ => None,
        })
        .flatten()
        .filter_map(|name| observed.address(name))
        .map(|address| format!("{}/32", address.address))
        .collect()
}
