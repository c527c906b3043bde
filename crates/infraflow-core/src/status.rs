//! Status projection
//!
//! [`project`] is a pure function of the flow state and the spec. Only steps
//! that produced a result contribute; everything else is omitted from the
//! document rather than zero-valued.

use crate::naming::step_id;
use crate::spec::{InfraSpec, SubnetPurpose};
use crate::state::FlowState;
use crate::step::{ATTR_EMAIL, ATTR_NAT_IPS, StepOutput};
use infraflow_cloud::ResourceKind;
use serde::{Deserialize, Serialize};

pub const STATUS_API_VERSION: &str = "infraflow.io/v1alpha1";
pub const STATUS_KIND: &str = "InfrastructureStatus";

/// Externally consumed result of a reconciliation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InfrastructureStatus {
    pub api_version: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub networks: Option<NetworkStatus>,
    /// Email of the first declared service account
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_email: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub service_accounts: Vec<ServiceAccountStatus>,
}

impl Default for InfrastructureStatus {
    fn default() -> Self {
        Self {
            api_version: STATUS_API_VERSION.to_string(),
            kind: STATUS_KIND.to_string(),
            networks: None,
            service_account_email: None,
            service_accounts: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vpc: Option<VpcStatus>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subnets: Vec<SubnetStatus>,
    #[serde(rename = "natIPs", default, skip_serializing_if = "Vec::is_empty")]
    pub nat_ips: Vec<NatIpStatus>,
}

impl NetworkStatus {
    fn is_empty(&self) -> bool {
        self.vpc.is_none() && self.subnets.is_empty() && self.nat_ips.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VpcStatus {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub self_link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_router: Option<CloudRouterStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudRouterStatus {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubnetStatus {
    pub name: String,
    pub purpose: SubnetPurpose,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub self_link: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NatIpStatus {
    pub ip: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceAccountStatus {
    pub name: String,
    pub email: String,
}

/// Provider name and last known-good output of a step
///
/// A step keeps its previous result while a changed definition is being
/// re-applied; the resource it names still exists.
fn known_good<'a>(state: &'a FlowState, id: &str) -> Option<(&'a str, &'a StepOutput)> {
    state
        .get(id)
        .and_then(|r| r.result.as_ref().map(|out| (r.target.name.as_str(), out)))
}

/// Build the status document from flow state
pub fn project(state: &FlowState, spec: &InfraSpec) -> InfrastructureStatus {
    let mut networks = NetworkStatus::default();

    if let Some((name, output)) =
        known_good(state, &step_id(ResourceKind::Network, &spec.network.name))
    {
        let cloud_router = spec
            .router
            .as_ref()
            .and_then(|r| known_good(state, &step_id(ResourceKind::Router, &r.name)))
            .map(|(name, _)| CloudRouterStatus {
                name: name.to_string(),
            });
        networks.vpc = Some(VpcStatus {
            name: name.to_string(),
            self_link: output.self_link.clone(),
            cloud_router,
        });
    }

    networks.subnets = spec
        .subnets
        .iter()
        .filter_map(|subnet| {
            let (name, output) = known_good(state, &step_id(ResourceKind::Subnet, &subnet.name))?;
            Some(SubnetStatus {
                name: name.to_string(),
                purpose: subnet.purpose,
                self_link: output.self_link.clone(),
            })
        })
        .collect();

    if let Some(nat) = &spec.nat
        && let Some((_, output)) = known_good(state, &step_id(ResourceKind::Nat, &nat.name))
    {
        networks.nat_ips = output
            .attribute_strings(ATTR_NAT_IPS)
            .into_iter()
            .map(|ip| NatIpStatus { ip })
            .collect();
    }

    let service_accounts: Vec<ServiceAccountStatus> = spec
        .service_accounts
        .iter()
        .filter_map(|account| {
            let (_, output) =
                known_good(state, &step_id(ResourceKind::ServiceAccount, &account.name))?;
            Some(ServiceAccountStatus {
                name: account.name.clone(),
                email: output.attribute_str(ATTR_EMAIL)?.to_string(),
            })
        })
        .collect();

    // Only the first declared account counts, even if a later one succeeded
    let service_account_email = spec.service_accounts.first().and_then(|first| {
        service_accounts
            .iter()
            .find(|s| s.name == first.name)
            .map(|s| s.email.clone())
    });

    InfrastructureStatus {
        networks: (!networks.is_empty()).then_some(networks),
        service_account_email,
        service_accounts,
        ..Default::default()
    }
}
