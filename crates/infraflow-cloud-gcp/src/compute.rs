//! Compute Engine REST client
//!
//! Implements [`NetworkClient`] over the Compute v1 API. Mutations return
//! long-running operations which are awaited before the call returns, so a
//! successful `create_*` means the resource exists.

use crate::api::{ApiClient, GcpConfig, owner_description, parse_owner};
use crate::error::Result as GcpResult;
use async_trait::async_trait;
use infraflow_cloud::{
    Address, CloudError, Direction, FirewallAllowed, FirewallRule, FlowLogs, Nat, Network,
    NetworkClient, Result, Router, RoutingMode, Subnetwork,
};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Compute Engine client
#[derive(Debug, Clone)]
pub struct GcpNetworkClient {
    api: ApiClient,
    endpoint: String,
    operation_timeout: Duration,
}

impl GcpNetworkClient {
    pub fn new(config: &GcpConfig) -> GcpResult<Self> {
        Ok(Self {
            api: ApiClient::new(config)?,
            endpoint: config.compute_endpoint.trim_end_matches('/').to_string(),
            operation_timeout: config.operation_timeout,
        })
    }

    fn global(&self, project: &str, collection: &str) -> String {
        format!(
            "{}/projects/{}/global/{}",
            self.endpoint, project, collection
        )
    }

    fn regional(&self, project: &str, region: &str, collection: &str) -> String {
        format!(
            "{}/projects/{}/regions/{}/{}",
            self.endpoint, project, region, collection
        )
    }

    /// Wait for a long-running operation to reach DONE
    async fn wait(&self, mut operation: ApiOperation) -> Result<()> {
        let started = Instant::now();
        loop {
            if operation.status == "DONE" {
                return operation.into_result();
            }
            if started.elapsed() > self.operation_timeout {
                return Err(CloudError::Timeout(format!(
                    "operation {} did not complete within {:?}",
                    operation.name, self.operation_timeout
                )));
            }

            // The wait endpoint blocks server-side for up to two minutes
            let url = format!("{}/wait", operation.self_link);
            operation = self.api.post(&url, &serde_json::json!({})).await?;
            tracing::debug!(
                operation = %operation.name,
                status = %operation.status,
                "Polled compute operation"
            );
        }
    }

    async fn router_resource(&self, project: &str, region: &str, name: &str) -> Result<ApiRouter> {
        let url = format!("{}/{}", self.regional(project, region, "routers"), name);
        self.api
            .get::<ApiRouter>(&url)
            .await?
            .ok_or_else(|| CloudError::NotFound(format!("router {}", name)))
    }

    async fn patch_router_nats(
        &self,
        project: &str,
        region: &str,
        router: &str,
        nats: Vec<ApiNat>,
    ) -> Result<()> {
        let url = format!("{}/{}", self.regional(project, region, "routers"), router);
        let body = serde_json::json!({ "nats": nats });
        let operation = self.api.patch(&url, &body).await?;
        self.wait(operation).await
    }
}

#[async_trait]
impl NetworkClient for GcpNetworkClient {
    async fn get_network(&self, project: &str, name: &str) -> Result<Option<Network>> {
        let url = format!("{}/{}", self.global(project, "networks"), name);
        Ok(self.api.get::<ApiNetwork>(&url).await?.map(Into::into))
    }

    async fn create_network(&self, project: &str, network: &Network) -> Result<Network> {
        tracing::info!("Creating network: {}", network.name);
        let operation = self
            .api
            .post(&self.global(project, "networks"), &ApiNetwork::from(network))
            .await?;
        self.wait(operation).await?;
        self.get_network(project, &network.name)
            .await?
            .ok_or_else(|| CloudError::NotFound(network.name.clone()))
    }

    async fn update_network(&self, project: &str, network: &Network) -> Result<Network> {
        tracing::info!("Updating network: {}", network.name);
        let url = format!("{}/{}", self.global(project, "networks"), network.name);
        let body = serde_json::json!({
            "routingConfig": { "routingMode": network.routing_mode },
        });
        let operation = self.api.patch(&url, &body).await?;
        self.wait(operation).await?;
        self.get_network(project, &network.name)
            .await?
            .ok_or_else(|| CloudError::NotFound(network.name.clone()))
    }

    async fn delete_network(&self, project: &str, name: &str) -> Result<()> {
        tracing::info!("Deleting network: {}", name);
        let url = format!("{}/{}", self.global(project, "networks"), name);
        let operation = self.api.delete(&url).await?;
        self.wait(operation).await
    }

    async fn get_subnetwork(
        &self,
        project: &str,
        region: &str,
        name: &str,
    ) -> Result<Option<Subnetwork>> {
        let url = format!("{}/{}", self.regional(project, region, "subnetworks"), name);
        Ok(self
            .api
            .get::<ApiSubnetwork>(&url)
            .await?
            .map(|s| s.into_subnetwork(region)))
    }

    async fn create_subnetwork(&self, project: &str, subnet: &Subnetwork) -> Result<Subnetwork> {
        tracing::info!("Creating subnetwork: {}", subnet.name);
        let url = self.regional(project, &subnet.region, "subnetworks");
        let operation = self.api.post(&url, &ApiSubnetwork::from(subnet)).await?;
        self.wait(operation).await?;
        self.get_subnetwork(project, &subnet.region, &subnet.name)
            .await?
            .ok_or_else(|| CloudError::NotFound(subnet.name.clone()))
    }

    async fn update_subnetwork(&self, project: &str, subnet: &Subnetwork) -> Result<Subnetwork> {
        tracing::info!("Updating subnetwork: {}", subnet.name);
        let base = format!(
            "{}/{}",
            self.regional(project, &subnet.region, "subnetworks"),
            subnet.name
        );
        let current = self
            .api
            .get::<ApiSubnetwork>(&base)
            .await?
            .ok_or_else(|| CloudError::NotFound(subnet.name.clone()))?;

        if current.private_ip_google_access != Some(subnet.private_ip_google_access) {
            let body = serde_json::json!({
                "privateIpGoogleAccess": subnet.private_ip_google_access,
            });
            let url = format!("{}/setPrivateIpGoogleAccess", base);
            let operation = self.api.post(&url, &body).await?;
            self.wait(operation).await?;
        }

        // PATCH requires the current fingerprint for optimistic locking
        let body = serde_json::json!({
            "fingerprint": current.fingerprint,
            "description": owner_description(subnet.owner.as_deref()),
            "logConfig": ApiLogConfig::from_flow_logs(subnet.flow_logs.as_ref()),
        });
        let operation = self.api.patch(&base, &body).await?;
        self.wait(operation).await?;

        self.get_subnetwork(project, &subnet.region, &subnet.name)
            .await?
            .ok_or_else(|| CloudError::NotFound(subnet.name.clone()))
    }

    async fn delete_subnetwork(&self, project: &str, region: &str, name: &str) -> Result<()> {
        tracing::info!("Deleting subnetwork: {}", name);
        let url = format!("{}/{}", self.regional(project, region, "subnetworks"), name);
        let operation = self.api.delete(&url).await?;
        self.wait(operation).await
    }

    async fn get_router(&self, project: &str, region: &str, name: &str) -> Result<Option<Router>> {
        let url = format!("{}/{}", self.regional(project, region, "routers"), name);
        Ok(self
            .api
            .get::<ApiRouter>(&url)
            .await?
            .map(|r| r.into_router(region)))
    }

    async fn create_router(&self, project: &str, router: &Router) -> Result<Router> {
        tracing::info!("Creating router: {}", router.name);
        let url = self.regional(project, &router.region, "routers");
        let body = ApiRouter {
            name: router.name.clone(),
            description: owner_description(router.owner.as_deref()),
            network: router.network.clone(),
            nats: Vec::new(),
            self_link: None,
        };
        let operation = self.api.post(&url, &body).await?;
        self.wait(operation).await?;
        self.get_router(project, &router.region, &router.name)
            .await?
            .ok_or_else(|| CloudError::NotFound(router.name.clone()))
    }

    async fn update_router(&self, project: &str, router: &Router) -> Result<Router> {
        tracing::info!("Updating router: {}", router.name);
        let url = format!(
            "{}/{}",
            self.regional(project, &router.region, "routers"),
            router.name
        );
        let body = serde_json::json!({
            "description": owner_description(router.owner.as_deref()),
        });
        let operation = self.api.patch(&url, &body).await?;
        self.wait(operation).await?;
        self.get_router(project, &router.region, &router.name)
            .await?
            .ok_or_else(|| CloudError::NotFound(router.name.clone()))
    }

    async fn delete_router(&self, project: &str, region: &str, name: &str) -> Result<()> {
        tracing::info!("Deleting router: {}", name);
        let url = format!("{}/{}", self.regional(project, region, "routers"), name);
        let operation = self.api.delete(&url).await?;
        self.wait(operation).await
    }

    async fn get_nat(
        &self,
        project: &str,
        region: &str,
        router: &str,
        name: &str,
    ) -> Result<Option<Nat>> {
        let url = format!("{}/{}", self.regional(project, region, "routers"), router);
        let Some(resource) = self.api.get::<ApiRouter>(&url).await? else {
            return Ok(None);
        };
        Ok(resource
            .nats
            .into_iter()
            .find(|n| n.name == name)
            .map(|n| n.into_nat(region, router)))
    }

    async fn create_nat(&self, project: &str, nat: &Nat) -> Result<Nat> {
        tracing::info!("Creating NAT {} on router {}", nat.name, nat.router);
        let router = self
            .router_resource(project, &nat.region, &nat.router)
            .await?;
        if router.nats.iter().any(|n| n.name == nat.name) {
            return Err(CloudError::AlreadyExists(nat.name.clone()));
        }
        let mut nats = router.nats;
        nats.push(ApiNat::from(nat));
        self.patch_router_nats(project, &nat.region, &nat.router, nats)
            .await?;
        Ok(nat.clone())
    }

    async fn update_nat(&self, project: &str, nat: &Nat) -> Result<Nat> {
        tracing::info!("Updating NAT {} on router {}", nat.name, nat.router);
        let router = self
            .router_resource(project, &nat.region, &nat.router)
            .await?;
        if !router.nats.iter().any(|n| n.name == nat.name) {
            return Err(CloudError::NotFound(nat.name.clone()));
        }
        let nats = router
            .nats
            .into_iter()
            .map(|n| if n.name == nat.name { ApiNat::from(nat) } else { n })
            .collect();
        self.patch_router_nats(project, &nat.region, &nat.router, nats)
            .await?;
        Ok(nat.clone())
    }

    async fn delete_nat(
        &self,
        project: &str,
        region: &str,
        router: &str,
        name: &str,
    ) -> Result<()> {
        tracing::info!("Deleting NAT {} from router {}", name, router);
        let resource = self.router_resource(project, region, router).await?;
        if !resource.nats.iter().any(|n| n.name == name) {
            return Err(CloudError::NotFound(name.to_string()));
        }
        let nats = resource.nats.into_iter().filter(|n| n.name != name).collect();
        self.patch_router_nats(project, region, router, nats).await
    }

    async fn get_firewall(&self, project: &str, name: &str) -> Result<Option<FirewallRule>> {
        let url = format!("{}/{}", self.global(project, "firewalls"), name);
        Ok(self.api.get::<ApiFirewall>(&url).await?.map(Into::into))
    }

    async fn create_firewall(&self, project: &str, rule: &FirewallRule) -> Result<FirewallRule> {
        tracing::info!("Creating firewall rule: {}", rule.name);
        let operation = self
            .api
            .post(&self.global(project, "firewalls"), &ApiFirewall::from(rule))
            .await?;
        self.wait(operation).await?;
        self.get_firewall(project, &rule.name)
            .await?
            .ok_or_else(|| CloudError::NotFound(rule.name.clone()))
    }

    async fn update_firewall(&self, project: &str, rule: &FirewallRule) -> Result<FirewallRule> {
        tracing::info!("Updating firewall rule: {}", rule.name);
        let url = format!("{}/{}", self.global(project, "firewalls"), rule.name);
        let operation = self.api.patch(&url, &ApiFirewall::from(rule)).await?;
        self.wait(operation).await?;
        self.get_firewall(project, &rule.name)
            .await?
            .ok_or_else(|| CloudError::NotFound(rule.name.clone()))
    }

    async fn delete_firewall(&self, project: &str, name: &str) -> Result<()> {
        tracing::info!("Deleting firewall rule: {}", name);
        let url = format!("{}/{}", self.global(project, "firewalls"), name);
        let operation = self.api.delete(&url).await?;
        self.wait(operation).await
    }

    async fn get_address(
        &self,
        project: &str,
        region: &str,
        name: &str,
    ) -> Result<Option<Address>> {
        let url = format!("{}/{}", self.regional(project, region, "addresses"), name);
        Ok(self.api.get::<ApiAddress>(&url).await?.map(|a| Address {
            name: a.name,
            region: region.to_string(),
            address: a.address,
            self_link: a.self_link,
        }))
    }
}

// ============ API Types ============

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiOperation {
    name: String,
    status: String,
    self_link: String,
    #[serde(default)]
    error: Option<ApiOperationError>,
}

#[derive(Debug, Deserialize)]
struct ApiOperationError {
    #[serde(default)]
    errors: Vec<ApiOperationErrorItem>,
}

#[derive(Debug, Deserialize)]
struct ApiOperationErrorItem {
    code: String,
    #[serde(default)]
    message: String,
}

impl ApiOperation {
    fn into_result(self) -> Result<()> {
        let Some(first) = self.error.and_then(|e| e.errors.into_iter().next()) else {
            return Ok(());
        };
        let message = format!("{}: {}", first.code, first.message);
        Err(match first.code.as_str() {
            "RESOURCE_NOT_FOUND" => CloudError::NotFound(message),
            "ALREADY_EXISTS" => CloudError::AlreadyExists(message),
            "RATE_LIMIT_EXCEEDED" => CloudError::RateLimited(message),
            "RESOURCE_NOT_READY" | "RESOURCE_OPERATION_RATE_EXCEEDED" => {
                CloudError::Conflict(message)
            }
            "QUOTA_EXCEEDED" => CloudError::QuotaExceeded(message),
            "PERMISSION_DENIED" | "FORBIDDEN" => CloudError::PermissionDenied(message),
            "INTERNAL_ERROR" | "SERVICE_UNAVAILABLE" => CloudError::Unavailable(message),
            _ => CloudError::InvalidArgument(message),
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiNetwork {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(default)]
    auto_create_subnetworks: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    routing_config: Option<ApiRoutingConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    mtu: Option<u32>,
    #[serde(skip_serializing)]
    self_link: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiRoutingConfig {
    routing_mode: RoutingMode,
}

impl From<&Network> for ApiNetwork {
    fn from(network: &Network) -> Self {
        Self {
            name: network.name.clone(),
            description: owner_description(network.owner.as_deref()),
            auto_create_subnetworks: false,
            routing_config: Some(ApiRoutingConfig {
                routing_mode: network.routing_mode,
            }),
            mtu: network.mtu,
            self_link: None,
        }
    }
}

impl From<ApiNetwork> for Network {
    fn from(api: ApiNetwork) -> Self {
        Self {
            owner: parse_owner(api.description.as_deref()),
            name: api.name,
            routing_mode: api
                .routing_config
                .map(|c| c.routing_mode)
                .unwrap_or_default(),
            mtu: api.mtu,
            self_link: api.self_link,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiLogConfig {
    enable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    aggregation_interval: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    flow_sampling: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata: Option<String>,
}

impl ApiLogConfig {
    fn from_flow_logs(flow_logs: Option<&FlowLogs>) -> Self {
        match flow_logs {
            Some(logs) => Self {
                enable: true,
                aggregation_interval: logs.aggregation_interval.clone(),
                flow_sampling: logs.flow_sampling,
                metadata: logs.metadata.clone(),
            },
            None => Self {
                enable: false,
                aggregation_interval: None,
                flow_sampling: None,
                metadata: None,
            },
        }
    }

    fn into_flow_logs(self) -> Option<FlowLogs> {
        self.enable.then_some(FlowLogs {
            aggregation_interval: self.aggregation_interval,
            flow_sampling: self.flow_sampling,
            metadata: self.metadata,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiSubnetwork {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    network: String,
    ip_cidr_range: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    private_ip_google_access: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    log_config: Option<ApiLogConfig>,
    #[serde(skip_serializing)]
    fingerprint: Option<String>,
    #[serde(skip_serializing)]
    self_link: Option<String>,
}

impl From<&Subnetwork> for ApiSubnetwork {
    fn from(subnet: &Subnetwork) -> Self {
        Self {
            name: subnet.name.clone(),
            description: owner_description(subnet.owner.as_deref()),
            network: subnet.network.clone(),
            ip_cidr_range: subnet.ip_cidr_range.clone(),
            private_ip_google_access: Some(subnet.private_ip_google_access),
            log_config: Some(ApiLogConfig::from_flow_logs(subnet.flow_logs.as_ref())),
            fingerprint: None,
            self_link: None,
        }
    }
}

impl ApiSubnetwork {
    fn into_subnetwork(self, region: &str) -> Subnetwork {
        Subnetwork {
            owner: parse_owner(self.description.as_deref()),
            name: self.name,
            region: region.to_string(),
            network: self.network,
            ip_cidr_range: self.ip_cidr_range,
            private_ip_google_access: self.private_ip_google_access.unwrap_or(false),
            flow_logs: self.log_config.and_then(ApiLogConfig::into_flow_logs),
            self_link: self.self_link,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiRouter {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    network: String,
    #[serde(default)]
    nats: Vec<ApiNat>,
    #[serde(skip_serializing)]
    self_link: Option<String>,
}

impl ApiRouter {
    fn into_router(self, region: &str) -> Router {
        Router {
            owner: parse_owner(self.description.as_deref()),
            name: self.name,
            region: region.to_string(),
            network: self.network,
            self_link: self.self_link,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiNat {
    name: String,
    nat_ip_allocate_option: String,
    #[serde(default)]
    nat_ips: Vec<String>,
    source_subnetwork_ip_ranges_to_nat: String,
    #[serde(default)]
    subnetworks: Vec<ApiNatSubnetwork>,
    #[serde(skip_serializing_if = "Option::is_none")]
    min_ports_per_vm: Option<u32>,
    #[serde(default)]
    enable_endpoint_independent_mapping: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiNatSubnetwork {
    name: String,
    source_ip_ranges_to_nat: Vec<String>,
}

impl From<&Nat> for ApiNat {
    fn from(nat: &Nat) -> Self {
        Self {
            name: nat.name.clone(),
            nat_ip_allocate_option: if nat.nat_ips.is_empty() {
                "AUTO_ONLY".to_string()
            } else {
                "MANUAL_ONLY".to_string()
            },
            nat_ips: nat.nat_ips.clone(),
            source_subnetwork_ip_ranges_to_nat: if nat.subnetworks.is_empty() {
                "ALL_SUBNETWORKS_ALL_IP_RANGES".to_string()
            } else {
                "LIST_OF_SUBNETWORKS".to_string()
            },
            subnetworks: nat
                .subnetworks
                .iter()
                .map(|s| ApiNatSubnetwork {
                    name: s.clone(),
                    source_ip_ranges_to_nat: vec!["ALL_IP_RANGES".to_string()],
                })
                .collect(),
            min_ports_per_vm: nat.min_ports_per_vm,
            enable_endpoint_independent_mapping: nat.endpoint_independent_mapping,
        }
    }
}

impl ApiNat {
    fn into_nat(self, region: &str, router: &str) -> Nat {
        Nat {
            name: self.name,
            region: region.to_string(),
            router: router.to_string(),
            min_ports_per_vm: self.min_ports_per_vm,
            endpoint_independent_mapping: self.enable_endpoint_independent_mapping,
            nat_ips: self.nat_ips,
            subnetworks: self.subnetworks.into_iter().map(|s| s.name).collect(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiFirewall {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    network: String,
    direction: Direction,
    priority: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    source_ranges: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    destination_ranges: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    target_tags: Vec<String>,
    #[serde(default)]
    allowed: Vec<ApiFirewallAllowed>,
    #[serde(skip_serializing)]
    self_link: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiFirewallAllowed {
    #[serde(rename = "IPProtocol")]
    ip_protocol: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    ports: Vec<String>,
}

impl From<&FirewallRule> for ApiFirewall {
    fn from(rule: &FirewallRule) -> Self {
        // Egress rules match on destination ranges
        let (source_ranges, destination_ranges) = match rule.direction {
            Direction::Ingress => (rule.source_ranges.clone(), Vec::new()),
            Direction::Egress => (Vec::new(), rule.source_ranges.clone()),
        };
        Self {
            name: rule.name.clone(),
            description: owner_description(rule.owner.as_deref()),
            network: rule.network.clone(),
            direction: rule.direction,
            priority: rule.priority,
            source_ranges,
            destination_ranges,
            target_tags: rule.target_tags.clone(),
            allowed: rule
                .allowed
                .iter()
                .map(|a| ApiFirewallAllowed {
                    ip_protocol: a.protocol.clone(),
                    ports: a.ports.clone(),
                })
                .collect(),
            self_link: None,
        }
    }
}

impl From<ApiFirewall> for FirewallRule {
    fn from(api: ApiFirewall) -> Self {
        let ranges = match api.direction {
            Direction::Ingress => api.source_ranges,
            Direction::Egress => api.destination_ranges,
        };
        Self {
            owner: parse_owner(api.description.as_deref()),
            name: api.name,
            network: api.network,
            direction: api.direction,
            priority: api.priority,
            source_ranges: ranges,
            target_tags: api.target_tags,
            allowed: api
                .allowed
                .into_iter()
                .map(|a| FirewallAllowed {
                    protocol: a.ip_protocol,
                    ports: a.ports,
                })
                .collect(),
            self_link: api.self_link,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiAddress {
    name: String,
    address: String,
    self_link: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_conversion() {
        let json = r#"{
            "name": "shoot--dev--a",
            "description": "infraflow:owner=shoot--dev--a",
            "autoCreateSubnetworks": false,
            "routingConfig": {"routingMode": "GLOBAL"},
            "selfLink": "https://www.googleapis.com/compute/v1/projects/p/global/networks/shoot--dev--a",
            "kind": "compute#network"
        }"#;
        let network: Network = serde_json::from_str::<ApiNetwork>(json).unwrap().into();
        assert_eq!(network.owner.as_deref(), Some("shoot--dev--a"));
        assert_eq!(network.routing_mode, RoutingMode::Global);
        assert!(network.self_link.is_some());

        let body = serde_json::to_value(ApiNetwork::from(&network)).unwrap();
        assert_eq!(body["autoCreateSubnetworks"], false);
        assert_eq!(body["routingConfig"]["routingMode"], "GLOBAL");
        assert!(body.get("selfLink").is_none());
    }

    #[test]
    fn test_egress_firewall_uses_destination_ranges() {
        let rule = FirewallRule {
            name: "egress".into(),
            network: "net".into(),
            direction: Direction::Egress,
            priority: 1000,
            source_ranges: vec!["0.0.0.0/0".into()],
            target_tags: Vec::new(),
            allowed: vec![FirewallAllowed {
                protocol: "tcp".into(),
                ports: vec!["443".into()],
            }],
            owner: None,
            self_link: None,
        };
        let body = serde_json::to_value(ApiFirewall::from(&rule)).unwrap();
        assert_eq!(body["destinationRanges"][0], "0.0.0.0/0");
        assert!(body.get("sourceRanges").is_none());
        assert_eq!(body["allowed"][0]["IPProtocol"], "tcp");
    }

    #[test]
    fn test_nat_allocation_options() {
        let nat = Nat {
            name: "nat".into(),
            region: "europe-west1".into(),
            router: "router".into(),
            min_ports_per_vm: Some(2048),
            endpoint_independent_mapping: false,
            nat_ips: Vec::new(),
            subnetworks: vec!["projects/p/regions/europe-west1/subnetworks/nodes".into()],
        };
        let api = ApiNat::from(&nat);
        assert_eq!(api.nat_ip_allocate_option, "AUTO_ONLY");
        assert_eq!(api.source_subnetwork_ip_ranges_to_nat, "LIST_OF_SUBNETWORKS");

        let back = api.into_nat("europe-west1", "router");
        assert_eq!(back, nat);
    }

    #[test]
    fn test_operation_errors() {
        let op: ApiOperation = serde_json::from_str(
            r#"{"name":"op-1","status":"DONE","selfLink":"x",
                "error":{"errors":[{"code":"QUOTA_EXCEEDED","message":"Quota 'NETWORKS' exceeded"}]}}"#,
        )
        .unwrap();
        assert!(matches!(op.into_result(), Err(CloudError::QuotaExceeded(_))));

        let op: ApiOperation =
            serde_json::from_str(r#"{"name":"op-2","status":"DONE","selfLink":"x"}"#).unwrap();
        assert!(op.into_result().is_ok());
    }
}
