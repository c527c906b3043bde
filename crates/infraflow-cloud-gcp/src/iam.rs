//! IAM and Resource Manager REST client
//!
//! Service accounts live in the IAM API; project role bindings are edited
//! with a read-modify-write of the project policy. Concurrent policy edits
//! surface as [`CloudError::Conflict`] (etag mismatch) and are retried by the
//! caller.

use crate::api::{ApiClient, GcpConfig, owner_description, parse_owner};
use crate::error::Result as GcpResult;
use async_trait::async_trait;
use infraflow_cloud::{CloudError, IamClient, Result, ServiceAccount};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone)]
pub struct GcpIamClient {
    api: ApiClient,
    iam_endpoint: String,
    resource_manager_endpoint: String,
}

impl GcpIamClient {
    pub fn new(config: &GcpConfig) -> GcpResult<Self> {
        Ok(Self {
            api: ApiClient::new(config)?,
            iam_endpoint: config.iam_endpoint.trim_end_matches('/').to_string(),
            resource_manager_endpoint: config
                .resource_manager_endpoint
                .trim_end_matches('/')
                .to_string(),
        })
    }

    fn account_url(&self, project: &str, email: &str) -> String {
        format!(
            "{}/projects/{}/serviceAccounts/{}",
            self.iam_endpoint, project, email
        )
    }

    async fn get_policy(&self, project: &str) -> Result<Policy> {
        let url = format!(
            "{}/projects/{}:getIamPolicy",
            self.resource_manager_endpoint, project
        );
        self.api.post(&url, &serde_json::json!({})).await
    }

    async fn set_policy(&self, project: &str, policy: &Policy) -> Result<()> {
        let url = format!(
            "{}/projects/{}:setIamPolicy",
            self.resource_manager_endpoint, project
        );
        let _: Policy = self
            .api
            .post(&url, &serde_json::json!({ "policy": policy }))
            .await
            .map_err(|e| match e {
                CloudError::AlreadyExists(msg) => CloudError::Conflict(msg),
                other => other,
            })?;
        Ok(())
    }
}

#[async_trait]
impl IamClient for GcpIamClient {
    async fn get_service_account(
        &self,
        project: &str,
        account_id: &str,
    ) -> Result<Option<ServiceAccount>> {
        let email = ServiceAccount::email_for(project, account_id);
        Ok(self
            .api
            .get::<ApiServiceAccount>(&self.account_url(project, &email))
            .await?
            .map(Into::into))
    }

    async fn create_service_account(
        &self,
        project: &str,
        account: &ServiceAccount,
    ) -> Result<ServiceAccount> {
        tracing::info!("Creating service account: {}", account.account_id);
        let url = format!("{}/projects/{}/serviceAccounts", self.iam_endpoint, project);
        let body = serde_json::json!({
            "accountId": account.account_id,
            "serviceAccount": {
                "displayName": account.display_name,
                "description": owner_description(account.owner.as_deref()),
            },
        });
        let created: ApiServiceAccount = self.api.post(&url, &body).await?;
        Ok(created.into())
    }

    async fn update_service_account(
        &self,
        project: &str,
        account: &ServiceAccount,
    ) -> Result<ServiceAccount> {
        tracing::info!("Updating service account: {}", account.account_id);
        let updated: ApiServiceAccount = self
            .api
            .patch(
                &self.account_url(project, &account.email),
                &account_patch(account),
            )
            .await?;
        Ok(updated.into())
    }

    async fn delete_service_account(&self, project: &str, email: &str) -> Result<()> {
        tracing::info!("Deleting service account: {}", email);
        let _: serde_json::Value = self.api.delete(&self.account_url(project, email)).await?;
        Ok(())
    }

    async fn get_roles(&self, project: &str, member: &str) -> Result<BTreeSet<String>> {
        let policy = self.get_policy(project).await?;
        Ok(policy.roles_of(member))
    }

    async fn grant_roles(&self, project: &str, member: &str, roles: &[String]) -> Result<()> {
        if roles.is_empty() {
            return Ok(());
        }
        let mut policy = self.get_policy(project).await?;
        if policy.grant(member, roles) {
            tracing::info!("Granting {} role(s) to {}", roles.len(), member);
            self.set_policy(project, &policy).await?;
        }
        Ok(())
    }

    async fn revoke_roles(&self, project: &str, member: &str, roles: &[String]) -> Result<()> {
        if roles.is_empty() {
            return Ok(());
        }
        let mut policy = self.get_policy(project).await?;
        if policy.revoke(member, roles) {
            tracing::info!("Revoking {} role(s) from {}", roles.len(), member);
            self.set_policy(project, &policy).await?;
        }
        Ok(())
    }
}

// ============ API Types ============

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiServiceAccount {
    email: String,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    unique_id: Option<String>,
}

impl From<ApiServiceAccount> for ServiceAccount {
    fn from(api: ApiServiceAccount) -> Self {
        let account_id = api
            .email
            .split('@')
            .next()
            .unwrap_or(&api.email)
            .to_string();
        Self {
            account_id,
            owner: parse_owner(api.description.as_deref()),
            email: api.email,
            display_name: api.display_name.filter(|n| !n.is_empty()),
            unique_id: api.unique_id,
        }
    }
}

/// Project IAM policy; unknown fields (conditions, audit configs) round-trip untouched
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Policy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    version: Option<u32>,
    #[serde(default)]
    bindings: Vec<Binding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    etag: Option<String>,
    #[serde(flatten)]
    extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Binding {
    role: String,
    #[serde(default)]
    members: Vec<String>,
    #[serde(flatten)]
    extra: serde_json::Map<String, serde_json::Value>,
}

impl Policy {
    fn roles_of(&self, member: &str) -> BTreeSet<String> {
        self.bindings
            .iter()
            .filter(|b| b.members.iter().any(|m| m == member))
            .map(|b| b.role.clone())
            .collect()
    }

    /// Add `member` to each role; returns true when the policy changed
    fn grant(&mut self, member: &str, roles: &[String]) -> bool {
        let mut changed = false;
        for role in roles {
            // Conditional bindings are left alone
            let binding = self
                .bindings
                .iter_mut()
                .find(|b| &b.role == role && !b.extra.contains_key("condition"));
            match binding {
                Some(b) if b.members.iter().any(|m| m == member) => {}
                Some(b) => {
                    b.members.push(member.to_string());
                    changed = true;
                }
                None => {
                    self.bindings.push(Binding {
                        role: role.clone(),
                        members: vec![member.to_string()],
                        extra: serde_json::Map::new(),
                    });
                    changed = true;
                }
            }
        }
        changed
    }

    /// Remove `member` from each role; returns true when the policy changed
    fn revoke(&mut self, member: &str, roles: &[String]) -> bool {
        let mut changed = false;
        for binding in self.bindings.iter_mut().filter(|b| roles.contains(&b.role)) {
            let before = binding.members.len();
            binding.members.retain(|m| m != member);
            changed |= binding.members.len() != before;
        }
        self.bindings.retain(|b| !b.members.is_empty());
        changed
    }
}

/// Patch body for the fields we manage; an unset display name is left alone
fn account_patch(account: &ServiceAccount) -> serde_json::Value {
    let mut fields = serde_json::Map::new();
    let mut mask = Vec::new();
    if let Some(display_name) = &account.display_name {
        fields.insert("displayName".into(), display_name.clone().into());
        mask.push("displayName");
    }
    fields.insert(
        "description".into(),
        owner_description(account.owner.as_deref()).into(),
    );
    mask.push("description");
    serde_json::json!({
        "serviceAccount": fields,
        "updateMask": mask.join(","),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const MEMBER: &str = "serviceAccount:shoot-nodes@proj.iam.gserviceaccount.com";

    fn policy() -> Policy {
        serde_json::from_str(
            r#"{
                "version": 1,
                "etag": "BwXyz=",
                "bindings": [
                    {"role": "roles/viewer", "members": ["user:a@example.com"]},
                    {"role": "roles/logging.logWriter", "members": ["serviceAccount:shoot-nodes@proj.iam.gserviceaccount.com"]}
                ]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_grant_and_revoke() {
        let mut policy = policy();
        assert_eq!(
            policy.roles_of(MEMBER),
            BTreeSet::from(["roles/logging.logWriter".to_string()])
        );

        let roles = vec![
            "roles/logging.logWriter".to_string(),
            "roles/monitoring.metricWriter".to_string(),
        ];
        assert!(policy.grant(MEMBER, &roles));
        assert!(!policy.grant(MEMBER, &roles));
        assert_eq!(policy.roles_of(MEMBER).len(), 2);

        assert!(policy.revoke(MEMBER, &roles));
        assert!(policy.roles_of(MEMBER).is_empty());
        // Only the unrelated binding remains
        assert_eq!(policy.bindings.len(), 1);
        assert_eq!(policy.etag.as_deref(), Some("BwXyz="));
    }

    #[test]
    fn test_service_account_conversion() {
        let api: ApiServiceAccount = serde_json::from_str(
            r#"{
                "name": "projects/proj/serviceAccounts/shoot-nodes@proj.iam.gserviceaccount.com",
                "email": "shoot-nodes@proj.iam.gserviceaccount.com",
                "displayName": "nodes",
                "description": "infraflow:owner=shoot--dev",
                "uniqueId": "1234"
            }"#,
        )
        .unwrap();
        let account = ServiceAccount::from(api);
        assert_eq!(account.account_id, "shoot-nodes");
        assert_eq!(account.owner.as_deref(), Some("shoot--dev"));
        assert_eq!(account.unique_id.as_deref(), Some("1234"));
    }

    #[test]
    fn test_account_patch_keeps_unset_display_name() {
        let mut account = ServiceAccount {
            account_id: "shoot-nodes".into(),
            email: "shoot-nodes@proj.iam.gserviceaccount.com".into(),
            display_name: None,
            owner: Some("shoot".into()),
            unique_id: None,
        };
        let body = account_patch(&account);
        assert_eq!(body["updateMask"], "description");
        assert!(body["serviceAccount"].get("displayName").is_none());
        assert_eq!(
            body["serviceAccount"]["description"],
            "infraflow:owner=shoot"
        );

        account.display_name = Some("Nodes".into());
        let body = account_patch(&account);
        assert_eq!(body["updateMask"], "displayName,description");
        assert_eq!(body["serviceAccount"]["displayName"], "Nodes");
    }
}
