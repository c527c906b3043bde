//! Dependency graph builder
//!
//! Expresses the spec as a DAG of named steps:
//!
//! ```text
//! network ──┬── subnet/* ──┬── nat ── firewall (includeNatIps)
//!           │              └───────── firewall (sourceSubnets)
//!           ├── router ────── nat
//!           └── firewall/*
//! service-account/*  (independent)
//! ```
//!
//! Removal graphs reverse the recorded edges: a resource is removed only
//! after everything that depended on it is gone.

use crate::error::SpecError;
use crate::naming::{provider_name, service_account_id, step_id};
use crate::spec::InfraSpec;
use crate::state::FlowState;
use crate::step::{Intent, ResourceRef, Step, StepTask};
use infraflow_cloud::{
    FirewallAllowed, FirewallRule, Nat, Network, ResourceKind, Router, ServiceAccount, Subnetwork,
};
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use std::collections::{BTreeSet, HashMap};

/// Steps in topological order
#[derive(Debug, Clone, Default)]
pub struct Graph {
    steps: Vec<Step>,
    index: HashMap<String, usize>,
}

impl Graph {
    /// Build the ensure graph for a spec
    ///
    /// Fails with an input error, and no partial graph, when the spec is
    /// structurally invalid.
    pub fn build(spec: &InfraSpec, instance_id: &str) -> Result<Self, SpecError> {
        spec.validate(instance_id)?;
        Self::from_steps(GraphBuilder::new(spec, instance_id).steps())
    }

    /// Removal graph for everything recorded in `state`
    pub fn teardown(state: &FlowState) -> Result<Self, SpecError> {
        let ids: BTreeSet<&String> = state.steps.keys().collect();
        let steps = state
            .steps
            .iter()
            .map(|(id, record)| {
                Step::remove(id.clone(), record.target.clone(), dependents(state, id, &ids))
            })
            .collect();
        Self::from_steps(steps)
    }

    /// Add removal steps for recorded resources that are no longer desired
    ///
    /// A removal waits for every step that previously depended on the
    /// resource: ensure steps must succeed again (so they stop referencing
    /// it) and other removals must finish first.
    pub fn with_removals(self, orphans: &[String], prior: &FlowState) -> Result<Self, SpecError> {
        let mut known: BTreeSet<&String> = self.index.keys().collect();
        known.extend(orphans.iter());

        let mut steps = self.steps.clone();
        for id in orphans {
            let Some(record) = prior.get(id) else {
                continue;
            };
            steps.push(Step::remove(
                id.clone(),
                record.target.clone(),
                dependents(prior, id, &known),
            ));
        }
        Self::from_steps(steps)
    }

    /// Order steps topologically after checking ids and dependencies
    pub fn from_steps(steps: Vec<Step>) -> Result<Self, SpecError> {
        let mut positions = HashMap::with_capacity(steps.len());
        for (i, step) in steps.iter().enumerate() {
            if positions.insert(step.id.clone(), i).is_some() {
                return Err(SpecError::DuplicateStep(step.id.clone()));
            }
        }

        let mut graph = DiGraph::<usize, ()>::with_capacity(steps.len(), steps.len());
        let nodes: Vec<_> = (0..steps.len()).map(|i| graph.add_node(i)).collect();
        for (i, step) in steps.iter().enumerate() {
            for dep in &step.depends_on {
                let Some(&from) = positions.get(dep) else {
                    return Err(SpecError::UnknownDependency {
                        step: step.id.clone(),
                        dependency: dep.clone(),
                    });
                };
                graph.add_edge(nodes[from], nodes[i], ());
            }
        }

        let order = toposort(&graph, None)
            .map_err(|cycle| SpecError::Cycle(steps[graph[cycle.node_id()]].id.clone()))?;

        let mut slots: Vec<Option<Step>> = steps.into_iter().map(Some).collect();
        let ordered: Vec<Step> = order
            .into_iter()
            .filter_map(|node| slots[graph[node]].take())
            .collect();
        let index = ordered
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id.clone(), i))
            .collect();

        Ok(Self {
            steps: ordered,
            index,
        })
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn get(&self, id: &str) -> Option<&Step> {
        self.index.get(id).map(|&i| &self.steps[i])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Ensure steps only
    pub fn ensure_steps(&self) -> impl Iterator<Item = &Step> {
        self.steps
            .iter()
            .filter(|s| matches!(s.task, StepTask::Ensure(_)))
    }
}

/// Ids of recorded steps that depend on `id`, restricted to `known`
fn dependents(state: &FlowState, id: &str, known: &BTreeSet<&String>) -> BTreeSet<String> {
    state
        .steps
        .iter()
        .filter(|(other, record)| known.contains(other) && record.depends_on.contains(id))
        .map(|(other, _)| other.clone())
        .collect()
}

struct GraphBuilder<'a> {
    spec: &'a InfraSpec,
    instance_id: &'a str,
    owner: Option<String>,
    network_id: String,
    network_name: String,
}

impl<'a> GraphBuilder<'a> {
    fn new(spec: &'a InfraSpec, instance_id: &'a str) -> Self {
        Self {
            spec,
            instance_id,
            owner: Some(instance_id.to_string()),
            network_id: step_id(ResourceKind::Network, &spec.network.name),
            network_name: spec.network_name(instance_id),
        }
    }

    fn steps(&self) -> Vec<Step> {
        let mut steps = vec![self.network()];
        steps.extend(self.spec.subnets.iter().map(|s| self.subnet(s)));
        if let Some(router) = self.router() {
            steps.push(router);
        }
        if let Some(nat) = self.nat() {
            steps.push(nat);
        }
        steps.extend(self.spec.firewall_rules.iter().map(|r| self.firewall(r)));
        steps.extend(
            self.spec
                .service_accounts
                .iter()
                .map(|a| self.service_account(a)),
        );
        steps
    }

    fn network(&self) -> Step {
        let spec = &self.spec.network;
        let mut target =
            ResourceRef::global(ResourceKind::Network, &self.spec.project, &self.network_name);
        if spec.existing {
            target = target.unmanaged();
        }
        Step::ensure(
            self.network_id.clone(),
            target,
            BTreeSet::new(),
            Intent::Network(Network {
                name: self.network_name.clone(),
                routing_mode: spec.routing_mode,
                mtu: spec.mtu,
                owner: self.owner.clone(),
                self_link: None,
            }),
        )
    }

    fn subnet(&self, spec: &crate::spec::SubnetSpec) -> Step {
        let name = provider_name(self.instance_id, &spec.name);
        Step::ensure(
            step_id(ResourceKind::Subnet, &spec.name),
            ResourceRef::regional(
                ResourceKind::Subnet,
                &self.spec.project,
                &self.spec.region,
                &name,
            ),
            BTreeSet::from([self.network_id.clone()]),
            Intent::Subnet {
                subnet: Subnetwork {
                    name,
                    region: self.spec.region.clone(),
                    network: self.network_name.clone(),
                    ip_cidr_range: spec.cidr.clone(),
                    private_ip_google_access: spec.private_google_access,
                    flow_logs: spec.flow_logs.as_ref().map(Into::into),
                    owner: self.owner.clone(),
                    self_link: None,
                },
                purpose: spec.purpose,
            },
        )
    }

    fn router(&self) -> Option<Step> {
        let spec = self.spec.router.as_ref()?;
        let name = self.spec.router_name(self.instance_id)?;
        let mut target = ResourceRef::regional(
            ResourceKind::Router,
            &self.spec.project,
            &self.spec.region,
            &name,
        );
        if spec.existing {
            target = target.unmanaged();
        }
        Some(Step::ensure(
            step_id(ResourceKind::Router, &spec.name),
            target,
            BTreeSet::from([self.network_id.clone()]),
            Intent::Router(Router {
                name,
                region: self.spec.region.clone(),
                network: self.network_name.clone(),
                owner: self.owner.clone(),
                self_link: None,
            }),
        ))
    }

    fn nat(&self) -> Option<Step> {
        let spec = self.spec.nat.as_ref()?;
        let router = self.spec.router.as_ref()?;
        let router_name = self.spec.router_name(self.instance_id)?;
        let name = provider_name(self.instance_id, &spec.name);

        let mut depends_on = BTreeSet::from([step_id(ResourceKind::Router, &router.name)]);
        // An empty scope covers every subnet, so every subnet must exist first
        let scoped: Vec<&String> = if spec.subnets.is_empty() {
            depends_on.extend(
                self.spec
                    .subnets
                    .iter()
                    .map(|s| step_id(ResourceKind::Subnet, &s.name)),
            );
            Vec::new()
        } else {
            depends_on.extend(
                spec.subnets
                    .iter()
                    .map(|s| step_id(ResourceKind::Subnet, s)),
            );
            spec.subnets.iter().collect()
        };

        Some(Step::ensure(
            step_id(ResourceKind::Nat, &spec.name),
            ResourceRef::regional(
                ResourceKind::Nat,
                &self.spec.project,
                &self.spec.region,
                &name,
            )
            .with_parent(&router_name),
            depends_on,
            Intent::Nat {
                nat: Nat {
                    name,
                    region: self.spec.region.clone(),
                    router: router_name,
                    min_ports_per_vm: spec.min_ports_per_vm,
                    endpoint_independent_mapping: spec.endpoint_independent_mapping,
                    nat_ips: Vec::new(),
                    subnetworks: scoped
                        .into_iter()
                        .map(|s| provider_name(self.instance_id, s))
                        .collect(),
                },
                nat_ip_names: spec.nat_ip_names.clone(),
            },
        ))
    }

    fn firewall(&self, spec: &crate::spec::FirewallRuleSpec) -> Step {
        let name = provider_name(self.instance_id, &spec.name);
        let mut depends_on = BTreeSet::from([self.network_id.clone()]);

        let mut source_ranges = spec.source_ranges.clone();
        for subnet in &spec.source_subnets {
            depends_on.insert(step_id(ResourceKind::Subnet, subnet));
            if let Some(subnet) = self.spec.subnet(subnet)
                && !source_ranges.contains(&subnet.cidr)
            {
                source_ranges.push(subnet.cidr.clone());
            }
        }
        if spec.include_nat_ips
            && let Some(nat) = &self.spec.nat
        {
            depends_on.insert(step_id(ResourceKind::Nat, &nat.name));
        }

        Step::ensure(
            step_id(ResourceKind::Firewall, &spec.name),
            ResourceRef::global(ResourceKind::Firewall, &self.spec.project, &name),
            depends_on,
            Intent::Firewall {
                rule: FirewallRule {
                    name,
                    network: self.network_name.clone(),
                    direction: spec.direction,
                    priority: spec.priority,
                    source_ranges,
                    target_tags: spec.target_tags.clone(),
                    allowed: spec
                        .allowed
                        .iter()
                        .map(|a| FirewallAllowed {
                            protocol: a.protocol.clone(),
                            ports: a.ports.clone(),
                        })
                        .collect(),
                    owner: self.owner.clone(),
                    self_link: None,
                },
                include_nat_ips: spec.include_nat_ips,
            },
        )
    }

    fn service_account(&self, spec: &crate::spec::ServiceAccountSpec) -> Step {
        let account_id = service_account_id(self.instance_id, &spec.name);
        Step::ensure(
            step_id(ResourceKind::ServiceAccount, &spec.name),
            ResourceRef::global(ResourceKind::ServiceAccount, &self.spec.project, &account_id),
            BTreeSet::new(),
            Intent::ServiceAccount {
                account: ServiceAccount {
                    email: ServiceAccount::email_for(&self.spec.project, &account_id),
                    account_id,
                    display_name: spec.display_name.clone(),
                    owner: self.owner.clone(),
                    unique_id: None,
                },
                roles: spec.roles.clone(),
            },
        )
    }
}
