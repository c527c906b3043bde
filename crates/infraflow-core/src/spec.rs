//! Desired-state document
//!
//! One [`InfraSpec`] describes the infrastructure of a single instance. It is
//! read from YAML (or JSON) with camelCase keys and is never modified by the
//! reconciler.

use crate::error::SpecError;
use crate::naming::{
    MAX_RESOURCE_NAME, MIN_ACCOUNT_ID, is_rfc1035, provider_name, service_account_id,
};
use infraflow_cloud::{Direction, FlowLogs, RoutingMode};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::path::Path;

pub const DEFAULT_FIREWALL_PRIORITY: u32 = 1000;
const MAX_FIREWALL_PRIORITY: u32 = 65535;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InfraSpec {
    pub project: String,
    pub region: String,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    pub network: NetworkSpec,
    #[serde(default)]
    pub subnets: Vec<SubnetSpec>,
    #[serde(default)]
    pub router: Option<RouterSpec>,
    #[serde(default)]
    pub nat: Option<NatSpec>,
    #[serde(default)]
    pub firewall_rules: Vec<FirewallRuleSpec>,
    #[serde(default)]
    pub service_accounts: Vec<ServiceAccountSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSpec {
    /// Logical name, or the provider name when `existing` is set
    pub name: String,
    /// Use a network created outside this instance; never modified or deleted
    #[serde(default)]
    pub existing: bool,
    #[serde(default)]
    pub routing_mode: RoutingMode,
    #[serde(default)]
    pub mtu: Option<u32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubnetPurpose {
    #[default]
    Nodes,
    Internal,
}

impl SubnetPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubnetPurpose::Nodes => "nodes",
            SubnetPurpose::Internal => "internal",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubnetSpec {
    pub name: String,
    pub cidr: String,
    #[serde(default)]
    pub purpose: SubnetPurpose,
    #[serde(default)]
    pub private_google_access: bool,
    #[serde(default)]
    pub flow_logs: Option<FlowLogsSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowLogsSpec {
    #[serde(default)]
    pub aggregation_interval: Option<String>,
    #[serde(default)]
    pub flow_sampling: Option<f64>,
    #[serde(default)]
    pub metadata: Option<String>,
}

impl From<&FlowLogsSpec> for FlowLogs {
    fn from(spec: &FlowLogsSpec) -> Self {
        FlowLogs {
            aggregation_interval: spec.aggregation_interval.clone(),
            flow_sampling: spec.flow_sampling,
            metadata: spec.metadata.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterSpec {
    pub name: String,
    #[serde(default)]
    pub existing: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NatSpec {
    pub name: String,
    #[serde(default)]
    pub min_ports_per_vm: Option<u32>,
    #[serde(default)]
    pub endpoint_independent_mapping: bool,
    /// Reserved static addresses (provider names); empty means auto-allocated
    #[serde(default)]
    pub nat_ip_names: Vec<String>,
    /// Logical subnet names to NAT; empty means all subnets
    #[serde(default)]
    pub subnets: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FirewallRuleSpec {
    pub name: String,
    #[serde(default)]
    pub direction: Direction,
    #[serde(default = "default_priority")]
    pub priority: u32,
    #[serde(default)]
    pub source_ranges: Vec<String>,
    /// Logical subnet names whose CIDRs are added to the source ranges
    #[serde(default)]
    pub source_subnets: Vec<String>,
    /// Add the NAT's static IPs to the source ranges
    #[serde(default)]
    pub include_nat_ips: bool,
    #[serde(default)]
    pub target_tags: Vec<String>,
    #[serde(default)]
    pub allowed: Vec<AllowedSpec>,
}

fn default_priority() -> u32 {
    DEFAULT_FIREWALL_PRIORITY
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllowedSpec {
    pub protocol: String,
    #[serde(default)]
    pub ports: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceAccountSpec {
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub roles: BTreeSet<String>,
}

impl InfraSpec {
    /// Load a spec from a YAML or JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SpecError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| SpecError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, SpecError> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn subnet(&self, name: &str) -> Option<&SubnetSpec> {
        self.subnets.iter().find(|s| s.name == name)
    }

    /// Provider name of the VPC network
    pub fn network_name(&self, instance_id: &str) -> String {
        if self.network.existing {
            self.network.name.clone()
        } else {
            provider_name(instance_id, &self.network.name)
        }
    }

    /// Provider name of the cloud router, if one is configured
    pub fn router_name(&self, instance_id: &str) -> Option<String> {
        self.router.as_ref().map(|r| {
            if r.existing {
                r.name.clone()
            } else {
                provider_name(instance_id, &r.name)
            }
        })
    }

    /// Check every structural rule and report all violations at once
    pub fn validate(&self, instance_id: &str) -> Result<(), SpecError> {
        let mut errors = Vec::new();

        if self.project.trim().is_empty() {
            errors.push("project must not be empty".to_string());
        }
        if self.region.trim().is_empty() {
            errors.push("region must not be empty".to_string());
        }
        if !is_rfc1035(instance_id) {
            errors.push(format!("instance id '{}' is not a valid name", instance_id));
        }

        self.validate_network(instance_id, &mut errors);
        self.validate_subnets(instance_id, &mut errors);
        self.validate_router_and_nat(instance_id, &mut errors);
        self.validate_firewall_rules(instance_id, &mut errors);
        self.validate_service_accounts(instance_id, &mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(SpecError::Invalid(errors))
        }
    }

    fn validate_network(&self, instance_id: &str, errors: &mut Vec<String>) {
        check_name("network", &self.network.name, errors);
        if !self.network.existing {
            check_provider_name("network", instance_id, &self.network.name, errors);
        }
        if let Some(mtu) = self.network.mtu
            && !(1300..=8896).contains(&mtu)
        {
            errors.push(format!("network mtu {} must be within 1300..=8896", mtu));
        }
    }

    fn validate_subnets(&self, instance_id: &str, errors: &mut Vec<String>) {
        let mut seen = BTreeSet::new();
        let mut parsed: Vec<(&str, Ipv4Net)> = Vec::new();

        for subnet in &self.subnets {
            check_name("subnet", &subnet.name, errors);
            check_provider_name("subnet", instance_id, &subnet.name, errors);
            if !seen.insert(subnet.name.as_str()) {
                errors.push(format!("duplicate subnet name '{}'", subnet.name));
            }

            match subnet.cidr.parse::<Ipv4Net>() {
                Ok(net) if net.trunc() != net => errors.push(format!(
                    "subnet '{}' cidr {} has host bits set (expected {})",
                    subnet.name,
                    subnet.cidr,
                    net.trunc()
                )),
                Ok(net) => {
                    for (other, other_net) in &parsed {
                        if subnets_overlap(&net, other_net) {
                            errors.push(format!(
                                "subnet '{}' cidr {} overlaps subnet '{}' ({})",
                                subnet.name, net, other, other_net
                            ));
                        }
                    }
                    parsed.push((subnet.name.as_str(), net));
                }
                Err(_) => errors.push(format!(
                    "subnet '{}' has invalid IPv4 cidr '{}'",
                    subnet.name, subnet.cidr
                )),
            }

            if let Some(sampling) = subnet.flow_logs.as_ref().and_then(|f| f.flow_sampling)
                && !(0.0..=1.0).contains(&sampling)
            {
                errors.push(format!(
                    "subnet '{}' flowSampling must be within 0.0..=1.0",
                    subnet.name
                ));
            }
        }
    }

    fn validate_router_and_nat(&self, instance_id: &str, errors: &mut Vec<String>) {
        if let Some(router) = &self.router {
            check_name("router", &router.name, errors);
            if !router.existing {
                check_provider_name("router", instance_id, &router.name, errors);
            }
        }

        let Some(nat) = &self.nat else {
            return;
        };
        check_name("nat", &nat.name, errors);
        check_provider_name("nat", instance_id, &nat.name, errors);
        if self.router.is_none() {
            errors.push(format!("nat '{}' requires a router", nat.name));
        }
        for subnet in &nat.subnets {
            if self.subnet(subnet).is_none() {
                errors.push(format!(
                    "nat '{}' references undefined subnet '{}'",
                    nat.name, subnet
                ));
            }
        }
        for address in &nat.nat_ip_names {
            check_name("nat ip", address, errors);
        }
        if let Some(ports) = nat.min_ports_per_vm
            && !(2..=65536).contains(&ports)
        {
            errors.push(format!(
                "nat '{}' minPortsPerVm {} must be within 2..=65536",
                nat.name, ports
            ));
        }
    }

    fn validate_firewall_rules(&self, instance_id: &str, errors: &mut Vec<String>) {
        let mut seen = BTreeSet::new();
        for rule in &self.firewall_rules {
            check_name("firewall rule", &rule.name, errors);
            check_provider_name("firewall rule", instance_id, &rule.name, errors);
            if !seen.insert(rule.name.as_str()) {
                errors.push(format!("duplicate firewall rule name '{}'", rule.name));
            }
            if rule.allowed.is_empty() {
                errors.push(format!(
                    "firewall rule '{}' needs at least one allowed entry",
                    rule.name
                ));
            }
            if rule.allowed.iter().any(|a| a.protocol.trim().is_empty()) {
                errors.push(format!(
                    "firewall rule '{}' has an allowed entry without protocol",
                    rule.name
                ));
            }
            if rule.priority > MAX_FIREWALL_PRIORITY {
                errors.push(format!(
                    "firewall rule '{}' priority {} exceeds {}",
                    rule.name, rule.priority, MAX_FIREWALL_PRIORITY
                ));
            }
            for range in &rule.source_ranges {
                if range.parse::<Ipv4Net>().is_err() && range.parse::<Ipv4Addr>().is_err() {
                    errors.push(format!(
                        "firewall rule '{}' has invalid source range '{}'",
                        rule.name, range
                    ));
                }
            }
            for subnet in &rule.source_subnets {
                if self.subnet(subnet).is_none() {
                    errors.push(format!(
                        "firewall rule '{}' references undefined subnet '{}'",
                        rule.name, subnet
                    ));
                }
            }
            if rule.include_nat_ips {
                match &self.nat {
                    None => errors.push(format!(
                        "firewall rule '{}' includes NAT IPs but no nat is defined",
                        rule.name
                    )),
                    Some(nat) if nat.nat_ip_names.is_empty() => errors.push(format!(
                        "firewall rule '{}' includes NAT IPs but nat '{}' has no natIpNames",
                        rule.name, nat.name
                    )),
                    Some(_) => {}
                }
            }
            if rule.source_ranges.is_empty()
                && rule.source_subnets.is_empty()
                && !rule.include_nat_ips
            {
                errors.push(format!(
                    "firewall rule '{}' has no source ranges",
                    rule.name
                ));
            }
        }
    }

    fn validate_service_accounts(&self, instance_id: &str, errors: &mut Vec<String>) {
        let mut seen = BTreeSet::new();
        for account in &self.service_accounts {
            check_name("service account", &account.name, errors);
            if !seen.insert(account.name.as_str()) {
                errors.push(format!("duplicate service account name '{}'", account.name));
            }
            let id = service_account_id(instance_id, &account.name);
            if id.len() < MIN_ACCOUNT_ID {
                errors.push(format!(
                    "service account id '{}' is shorter than {} characters",
                    id, MIN_ACCOUNT_ID
                ));
            }
            for role in &account.roles {
                if !(role.starts_with("roles/")
                    || role.starts_with("projects/")
                    || role.starts_with("organizations/"))
                {
                    errors.push(format!(
                        "service account '{}' has invalid role '{}'",
                        account.name, role
                    ));
                }
            }
        }
    }
}

fn check_name(what: &str, name: &str, errors: &mut Vec<String>) {
    if !is_rfc1035(name) {
        errors.push(format!("{} name '{}' is not a valid RFC 1035 name", what, name));
    }
}

fn check_provider_name(what: &str, instance_id: &str, logical: &str, errors: &mut Vec<String>) {
    let name = provider_name(instance_id, logical);
    if name.len() > MAX_RESOURCE_NAME {
        errors.push(format!(
            "{} name '{}' exceeds {} characters",
            what, name, MAX_RESOURCE_NAME
        ));
    }
}

/// True when two IPv4 subnets share any address
pub fn subnets_overlap(a: &Ipv4Net, b: &Ipv4Net) -> bool {
    a.contains(&b.network())
        || a.contains(&b.broadcast())
        || b.contains(&a.network())
        || b.contains(&a.broadcast())
}
