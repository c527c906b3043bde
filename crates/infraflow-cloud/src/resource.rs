//! Typed cloud resources exchanged with provider clients
//!
//! These are provider-neutral shapes. `owner` carries the ownership marker
//! (the instance id that manages the resource); clients decide how it is
//! stored on the provider side.

use serde::{Deserialize, Serialize};

/// Kind of resource managed by a reconciliation step
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    Network,
    Subnet,
    Router,
    Nat,
    Firewall,
    ServiceAccount,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Network => "network",
            ResourceKind::Subnet => "subnet",
            ResourceKind::Router => "router",
            ResourceKind::Nat => "nat",
            ResourceKind::Firewall => "firewall",
            ResourceKind::ServiceAccount => "service-account",
        }
    }

    /// NAT entries live inside a router and cannot carry their own marker
    pub fn has_owner_marker(&self) -> bool {
        !matches!(self, ResourceKind::Nat)
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Last path segment of a self-link (or the value itself for plain names)
pub fn resource_name(link: &str) -> &str {
    link.rsplit('/').next().unwrap_or(link)
}

/// True when two references (self-links or names) point at the same resource name
pub fn same_resource(a: &str, b: &str) -> bool {
    resource_name(a) == resource_name(b)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoutingMode {
    #[default]
    Regional,
    Global,
}

/// VPC network (always custom-mode: subnets are managed explicitly)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Network {
    pub name: String,
    pub routing_mode: RoutingMode,
    pub mtu: Option<u32>,
    pub owner: Option<String>,
    pub self_link: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowLogs {
    pub aggregation_interval: Option<String>,
    pub flow_sampling: Option<f64>,
    pub metadata: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subnetwork {
    pub name: String,
    pub region: String,
    /// Network self-link
    pub network: String,
    pub ip_cidr_range: String,
    pub private_ip_google_access: bool,
    pub flow_logs: Option<FlowLogs>,
    pub owner: Option<String>,
    pub self_link: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Router {
    pub name: String,
    pub region: String,
    pub network: String,
    pub owner: Option<String>,
    pub self_link: Option<String>,
}

/// NAT gateway configured on a router
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Nat {
    pub name: String,
    pub region: String,
    pub router: String,
    pub min_ports_per_vm: Option<u32>,
    pub endpoint_independent_mapping: bool,
    /// Static address self-links; empty means auto-allocated
    pub nat_ips: Vec<String>,
    /// Subnetwork self-links; empty means all subnetworks
    pub subnetworks: Vec<String>,
}

/// Reserved static external address
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Address {
    pub name: String,
    pub region: String,
    pub address: String,
    pub self_link: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    #[default]
    Ingress,
    Egress,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallAllowed {
    pub protocol: String,
    pub ports: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirewallRule {
    pub name: String,
    pub network: String,
    pub direction: Direction,
    pub priority: u32,
    pub source_ranges: Vec<String>,
    pub target_tags: Vec<String>,
    pub allowed: Vec<FirewallAllowed>,
    pub owner: Option<String>,
    pub self_link: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceAccount {
    pub account_id: String,
    pub email: String,
    pub display_name: Option<String>,
    pub owner: Option<String>,
    pub unique_id: Option<String>,
}

impl ServiceAccount {
    pub fn email_for(project: &str, account_id: &str) -> String {
        format!("{}@{}.iam.gserviceaccount.com", account_id, project)
    }

    /// IAM policy member string for this account
    pub fn member(&self) -> String {
        format!("serviceAccount:{}", self.email)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_name() {
        assert_eq!(
            resource_name("https://www.googleapis.com/compute/v1/projects/p/global/networks/net"),
            "net"
        );
        assert_eq!(resource_name("net"), "net");
        assert!(same_resource("projects/p/global/networks/net", "net"));
        assert!(!same_resource("projects/p/global/networks/net", "other"));
    }

    #[test]
    fn test_kind_serde() {
        let json = serde_json::to_string(&ResourceKind::ServiceAccount).unwrap();
        assert_eq!(json, "\"service-account\"");
        assert_eq!(ResourceKind::Subnet.to_string(), "subnet");
        assert!(!ResourceKind::Nat.has_owner_marker());
    }

    #[test]
    fn test_service_account_member() {
        let sa = ServiceAccount {
            account_id: "shoot-nodes".into(),
            email: ServiceAccount::email_for("proj", "shoot-nodes"),
            display_name: None,
            owner: None,
            unique_id: None,
        };
        assert_eq!(
            sa.member(),
            "serviceAccount:shoot-nodes@proj.iam.gserviceaccount.com"
        );
    }
}
