//! Step definitions
//!
//! A [`Step`] is a stateless description of one unit of work: which resource
//! it addresses, which steps must succeed first, and whether it ensures the
//! resource exists ([`StepTask::Ensure`]) or removes it ([`StepTask::Remove`]).
//! Execution state lives in [`FlowState`](crate::FlowState).

use crate::spec::SubnetPurpose;
use infraflow_cloud::{FirewallRule, Nat, Network, ResourceKind, Router, ServiceAccount, Subnetwork};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

/// Output attribute keys
pub const ATTR_CIDR: &str = "cidr";
pub const ATTR_PURPOSE: &str = "purpose";
pub const ATTR_NAT_IPS: &str = "natIps";
pub const ATTR_EMAIL: &str = "email";
/// Set on resources taken over without an owner marker that cannot be added later
pub const ATTR_ADOPTED: &str = "adopted";

/// Provider-side identity of the resource a step addresses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRef {
    pub kind: ResourceKind,
    /// Deterministic provider name (account id for service accounts)
    pub name: String,
    pub project: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    /// Enclosing resource (the router of a NAT)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    /// False for pre-existing resources that are only looked up
    #[serde(default = "default_managed")]
    pub managed: bool,
}

fn default_managed() -> bool {
    true
}

impl ResourceRef {
    pub fn global(kind: ResourceKind, project: &str, name: &str) -> Self {
        Self {
            kind,
            name: name.to_string(),
            project: project.to_string(),
            region: None,
            parent: None,
            managed: true,
        }
    }

    pub fn regional(kind: ResourceKind, project: &str, region: &str, name: &str) -> Self {
        Self {
            region: Some(region.to_string()),
            ..Self::global(kind, project, name)
        }
    }

    pub fn with_parent(mut self, parent: &str) -> Self {
        self.parent = Some(parent.to_string());
        self
    }

    pub fn unmanaged(mut self) -> Self {
        self.managed = false;
        self
    }

    pub fn region(&self) -> &str {
        self.region.as_deref().unwrap_or_default()
    }

    pub fn parent(&self) -> &str {
        self.parent.as_deref().unwrap_or_default()
    }
}

impl std::fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.kind, self.name)
    }
}

/// What a succeeded step produced
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepOutput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub self_link: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, serde_json::Value>,
}

impl StepOutput {
    pub fn link(self_link: Option<String>) -> Self {
        Self {
            self_link,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }

    pub fn attribute_str(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(|v| v.as_str())
    }

    pub fn attribute_bool(&self, key: &str) -> bool {
        self.attributes
            .get(key)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    pub fn attribute_strings(&self, key: &str) -> Vec<String> {
        self.attributes
            .get(key)
            .and_then(|v| v.as_array())
            .map(|values| {
                values
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Desired configuration of the resource an ensure step manages
///
/// References to other resources are provider names; handlers replace them
/// with the self-links produced by the dependency steps.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Intent {
    Network(Network),
    Subnet {
        subnet: Subnetwork,
        purpose: SubnetPurpose,
    },
    Router(Router),
    Nat {
        nat: Nat,
        nat_ip_names: Vec<String>,
    },
    Firewall {
        rule: FirewallRule,
        include_nat_ips: bool,
    },
    ServiceAccount {
        account: ServiceAccount,
        roles: BTreeSet<String>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepTask {
    Ensure(Intent),
    Remove,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub id: String,
    pub target: ResourceRef,
    pub depends_on: BTreeSet<String>,
    pub task: StepTask,
    /// Hash of the intent and dependencies; a change makes this a new definition
    pub fingerprint: String,
}

impl Step {
    pub fn ensure(
        id: String,
        target: ResourceRef,
        depends_on: BTreeSet<String>,
        intent: Intent,
    ) -> Self {
        let fingerprint = fingerprint(&target, &depends_on, &intent);
        Self {
            id,
            target,
            depends_on,
            task: StepTask::Ensure(intent),
            fingerprint,
        }
    }

    pub fn remove(id: String, target: ResourceRef, depends_on: BTreeSet<String>) -> Self {
        Self {
            id,
            target,
            depends_on,
            task: StepTask::Remove,
            fingerprint: String::new(),
        }
    }

    pub fn kind(&self) -> ResourceKind {
        self.target.kind
    }

    pub fn is_remove(&self) -> bool {
        matches!(self.task, StepTask::Remove)
    }
}

fn fingerprint(target: &ResourceRef, depends_on: &BTreeSet<String>, intent: &Intent) -> String {
    #[derive(Serialize)]
    struct Definition<'a> {
        target: &'a ResourceRef,
        depends_on: &'a BTreeSet<String>,
        intent: &'a Intent,
    }

    let mut hasher = Sha256::new();
    // Serializing plain data with string keys cannot fail
    if let Ok(bytes) = serde_json::to_vec(&Definition {
        target,
        depends_on,
        intent,
    }) {
        hasher.update(&bytes);
    }
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use infraflow_cloud::RoutingMode;

    fn network_step(mtu: Option<u32>) -> Step {
        Step::ensure(
            "network/net-1".into(),
            ResourceRef::global(ResourceKind::Network, "proj", "shoot-net-1"),
            BTreeSet::new(),
            Intent::Network(Network {
                name: "shoot-net-1".into(),
                routing_mode: RoutingMode::Regional,
                mtu,
                owner: Some("shoot".into()),
                self_link: None,
            }),
        )
    }

    #[test]
    fn test_fingerprint_tracks_intent() {
        let a = network_step(None);
        let b = network_step(None);
        let c = network_step(Some(1460));
        assert_eq!(a.fingerprint, b.fingerprint);
        assert_ne!(a.fingerprint, c.fingerprint);
        assert_eq!(a.fingerprint.len(), 64);
    }

    #[test]
    fn test_output_attributes() {
        let output = StepOutput::link(Some("link".into()))
            .with_attribute(ATTR_EMAIL, "sa@proj.iam.gserviceaccount.com")
            .with_attribute(ATTR_NAT_IPS, vec!["203.0.113.7".to_string()]);
        assert_eq!(
            output.attribute_str(ATTR_EMAIL),
            Some("sa@proj.iam.gserviceaccount.com")
        );
        assert_eq!(output.attribute_strings(ATTR_NAT_IPS), vec!["203.0.113.7"]);
        assert!(output.attribute_strings("missing").is_empty());
        assert!(!output.attribute_bool(ATTR_ADOPTED));
        assert!(output.with_attribute(ATTR_ADOPTED, true).attribute_bool(ATTR_ADOPTED));
    }

    #[test]
    fn test_resource_ref_serde_defaults() {
        let target: ResourceRef =
            serde_json::from_str(r#"{"kind":"subnet","name":"shoot-nodes","project":"proj"}"#)
                .unwrap();
        assert!(target.managed);
        assert_eq!(target.region(), "");
    }
}
