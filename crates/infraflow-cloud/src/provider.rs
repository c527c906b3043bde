//! Provider client traits
//!
//! Every operation is keyed by the deterministic provider name of the
//! resource. Getters return `Ok(None)` for absent resources; creates fail
//! with [`CloudError::AlreadyExists`](crate::CloudError::AlreadyExists) and
//! updates/deletes with [`CloudError::NotFound`](crate::CloudError::NotFound).

use crate::error::Result;
use crate::resource::{Address, FirewallRule, Nat, Network, Router, ServiceAccount, Subnetwork};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

/// Network and compute resources (VPC, subnets, routers, NAT, firewalls, addresses)
#[async_trait]
pub trait NetworkClient: Send + Sync {
    async fn get_network(&self, project: &str, name: &str) -> Result<Option<Network>>;
    async fn create_network(&self, project: &str, network: &Network) -> Result<Network>;
    async fn update_network(&self, project: &str, network: &Network) -> Result<Network>;
    async fn delete_network(&self, project: &str, name: &str) -> Result<()>;

    async fn get_subnetwork(
        &self,
        project: &str,
        region: &str,
        name: &str,
    ) -> Result<Option<Subnetwork>>;
    async fn create_subnetwork(&self, project: &str, subnet: &Subnetwork) -> Result<Subnetwork>;
    async fn update_subnetwork(&self, project: &str, subnet: &Subnetwork) -> Result<Subnetwork>;
    async fn delete_subnetwork(&self, project: &str, region: &str, name: &str) -> Result<()>;

    async fn get_router(&self, project: &str, region: &str, name: &str) -> Result<Option<Router>>;
    async fn create_router(&self, project: &str, router: &Router) -> Result<Router>;
    async fn update_router(&self, project: &str, router: &Router) -> Result<Router>;
    async fn delete_router(&self, project: &str, region: &str, name: &str) -> Result<()>;

    async fn get_nat(
        &self,
        project: &str,
        region: &str,
        router: &str,
        name: &str,
    ) -> Result<Option<Nat>>;
    async fn create_nat(&self, project: &str, nat: &Nat) -> Result<Nat>;
    async fn update_nat(&self, project: &str, nat: &Nat) -> Result<Nat>;
    async fn delete_nat(&self, project: &str, region: &str, router: &str, name: &str) -> Result<()>;

    async fn get_firewall(&self, project: &str, name: &str) -> Result<Option<FirewallRule>>;
    async fn create_firewall(&self, project: &str, rule: &FirewallRule) -> Result<FirewallRule>;
    async fn update_firewall(&self, project: &str, rule: &FirewallRule) -> Result<FirewallRule>;
    async fn delete_firewall(&self, project: &str, name: &str) -> Result<()>;

    async fn get_address(&self, project: &str, region: &str, name: &str)
    -> Result<Option<Address>>;
}

/// Service accounts and project-level role bindings
#[async_trait]
pub trait IamClient: Send + Sync {
    async fn get_service_account(
        &self,
        project: &str,
        account_id: &str,
    ) -> Result<Option<ServiceAccount>>;
    async fn create_service_account(
        &self,
        project: &str,
        account: &ServiceAccount,
    ) -> Result<ServiceAccount>;
    async fn update_service_account(
        &self,
        project: &str,
        account: &ServiceAccount,
    ) -> Result<ServiceAccount>;
    async fn delete_service_account(&self, project: &str, email: &str) -> Result<()>;

    /// Roles bound to `member` on the project
    async fn get_roles(&self, project: &str, member: &str) -> Result<BTreeSet<String>>;
    async fn grant_roles(&self, project: &str, member: &str, roles: &[String]) -> Result<()>;
    async fn revoke_roles(&self, project: &str, member: &str, roles: &[String]) -> Result<()>;
}

/// Authenticated client handle passed explicitly into every step
#[derive(Clone)]
pub struct ProviderClients {
    pub network: Arc<dyn NetworkClient>,
    pub iam: Arc<dyn IamClient>,
}

impl ProviderClients {
    pub fn new(network: Arc<dyn NetworkClient>, iam: Arc<dyn IamClient>) -> Self {
        Self { network, iam }
    }
}

impl std::fmt::Debug for ProviderClients {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderClients").finish_non_exhaustive()
    }
}

/// Retry configuration for provider operations
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first)
    pub max_attempts: u32,

    /// Initial delay between retries
    pub initial_delay: Duration,

    /// Maximum delay between retries
    pub max_delay: Duration,

    /// Backoff multiplier
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Delay to wait after the given zero-based failed attempt
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(attempt as i32);
        let delay = self.initial_delay.mul_f64(factor.max(1.0));
        delay.min(self.max_delay)
    }
}
