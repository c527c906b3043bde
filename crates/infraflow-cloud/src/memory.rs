//! In-memory provider
//!
//! Implements [`NetworkClient`] and [`IamClient`] against process-local maps.
//! It enforces the same referential rules as the real APIs (a subnet needs its
//! network, a network in use cannot be deleted), counts every call per
//! operation name and supports injected faults, which makes it suitable for
//! exercising ordering, retry and idempotence behaviour in tests.

use crate::error::{CloudError, Result};
use crate::provider::{IamClient, NetworkClient};
use crate::resource::{
    Address, FirewallRule, Nat, Network, Router, ServiceAccount, Subnetwork, resource_name,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Barrier;

const COMPUTE_BASE: &str = "https://www.googleapis.com/compute/v1";

/// Fault injected into the next call of an operation
#[derive(Debug, Clone)]
pub enum Fault {
    RateLimited,
    Unavailable,
    Timeout,
    PermissionDenied,
    QuotaExceeded,
    InvalidArgument,
    /// Sleep before executing the call normally
    Delay(Duration),
    /// Wait on a shared barrier before executing the call normally
    Barrier(Arc<Barrier>),
    /// Execute the call, then report a timeout as if the response was lost
    LostResponse,
    /// Report the resource as absent on a read, as a lagging read would
    StaleRead,
}

impl Fault {
    fn to_error(&self, op: &str) -> CloudError {
        let message = format!("injected fault on {}", op);
        match self {
            Fault::RateLimited => CloudError::RateLimited(message),
            Fault::Unavailable => CloudError::Unavailable(message),
            Fault::Timeout
            | Fault::LostResponse
            | Fault::Delay(_)
            | Fault::Barrier(_)
            | Fault::StaleRead => {
                CloudError::Timeout(message)
            }
            Fault::PermissionDenied => CloudError::PermissionDenied(message),
            Fault::QuotaExceeded => CloudError::QuotaExceeded(message),
            Fault::InvalidArgument => CloudError::InvalidArgument(message),
        }
    }
}

type Key2 = (String, String);
type Key3 = (String, String, String);

#[derive(Default)]
struct Inner {
    networks: BTreeMap<Key2, Network>,
    subnetworks: BTreeMap<Key3, Subnetwork>,
    routers: BTreeMap<Key3, Router>,
    /// (project, region, router, name)
    nats: BTreeMap<(String, String, String, String), Nat>,
    firewalls: BTreeMap<Key2, FirewallRule>,
    addresses: BTreeMap<Key3, Address>,
    accounts: BTreeMap<Key2, ServiceAccount>,
    /// (project, member) -> roles
    bindings: BTreeMap<Key2, BTreeSet<String>>,
    calls: HashMap<String, usize>,
    faults: HashMap<String, VecDeque<Fault>>,
    mutations: Vec<String>,
    /// Calls currently held by a delay or barrier
    waiting: usize,
    peak_waiting: usize,
}

/// Process-local cloud used by tests
#[derive(Default)]
pub struct InMemoryCloud {
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for InMemoryCloud {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryCloud").finish_non_exhaustive()
    }
}

fn k2(a: &str, b: &str) -> Key2 {
    (a.to_string(), b.to_string())
}

fn k3(a: &str, b: &str, c: &str) -> Key3 {
    (a.to_string(), b.to_string(), c.to_string())
}

fn in_use(what: &str, by: &str) -> CloudError {
    CloudError::InvalidArgument(format!("{} is already being used by {}", what, by))
}

impl InMemoryCloud {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue a fault for the next call of `op` (e.g. "create_firewall")
    pub fn inject(&self, op: &str, fault: Fault) {
        self.inject_times(op, fault, 1);
    }

    /// Queue the same fault for the next `times` calls of `op`
    pub fn inject_times(&self, op: &str, fault: Fault, times: usize) {
        let mut inner = self.lock();
        let queue = inner.faults.entry(op.to_string()).or_default();
        for _ in 0..times {
            queue.push_back(fault.clone());
        }
    }

    /// Number of calls made to `op`
    pub fn calls(&self, op: &str) -> usize {
        self.lock().calls.get(op).copied().unwrap_or(0)
    }

    /// Ordered log of mutating calls, formatted as "op:name"
    pub fn mutations(&self) -> Vec<String> {
        self.lock().mutations.clone()
    }

    /// Most calls ever held by a delay or barrier at the same time
    pub fn peak_concurrency(&self) -> usize {
        self.lock().peak_waiting
    }

    fn hold(&self) {
        let mut inner = self.lock();
        inner.waiting += 1;
        inner.peak_waiting = inner.peak_waiting.max(inner.waiting);
    }

    fn release(&self) {
        self.lock().waiting -= 1;
    }

    /// Total number of resources currently held (excluding seeded addresses)
    pub fn resource_count(&self) -> usize {
        let inner = self.lock();
        inner.networks.len()
            + inner.subnetworks.len()
            + inner.routers.len()
            + inner.nats.len()
            + inner.firewalls.len()
            + inner.accounts.len()
    }

    pub fn seed_network(&self, project: &str, mut network: Network) {
        network.self_link = Some(network_link(project, &network.name));
        self.lock()
            .networks
            .insert(k2(project, &network.name), network);
    }

    pub fn seed_router(&self, project: &str, mut router: Router) {
        router.self_link = Some(router_link(project, &router.region, &router.name));
        self.lock()
            .routers
            .insert(k3(project, &router.region, &router.name), router);
    }

    pub fn seed_firewall(&self, project: &str, mut rule: FirewallRule) {
        rule.self_link = Some(firewall_link(project, &rule.name));
        self.lock().firewalls.insert(k2(project, &rule.name), rule);
    }

    pub fn seed_address(&self, project: &str, mut address: Address) {
        address.self_link = Some(format!(
            "{}/projects/{}/regions/{}/addresses/{}",
            COMPUTE_BASE, project, address.region, address.name
        ));
        self.lock()
            .addresses
            .insert(k3(project, &address.region, &address.name), address);
    }

    pub fn network(&self, project: &str, name: &str) -> Option<Network> {
        self.lock().networks.get(&k2(project, name)).cloned()
    }

    pub fn subnetwork(&self, project: &str, region: &str, name: &str) -> Option<Subnetwork> {
        self.lock().subnetworks.get(&k3(project, region, name)).cloned()
    }

    pub fn router(&self, project: &str, region: &str, name: &str) -> Option<Router> {
        self.lock().routers.get(&k3(project, region, name)).cloned()
    }

    pub fn nat(&self, project: &str, region: &str, router: &str, name: &str) -> Option<Nat> {
        self.lock()
            .nats
            .get(&(
                project.to_string(),
                region.to_string(),
                router.to_string(),
                name.to_string(),
            ))
            .cloned()
    }

    pub fn firewall(&self, project: &str, name: &str) -> Option<FirewallRule> {
        self.lock().firewalls.get(&k2(project, name)).cloned()
    }

    pub fn service_account(&self, project: &str, account_id: &str) -> Option<ServiceAccount> {
        self.lock().accounts.get(&k2(project, account_id)).cloned()
    }

    pub fn roles(&self, project: &str, member: &str) -> BTreeSet<String> {
        self.lock()
            .bindings
            .get(&k2(project, member))
            .cloned()
            .unwrap_or_default()
    }

    /// Record the call and apply any queued fault.
    ///
    /// Returns `true` when the caller must perform the call and then report a
    /// lost response.
    async fn enter(&self, op: &str, target: &str, mutating: bool) -> Result<bool> {
        let fault = {
            let mut inner = self.lock();
            *inner.calls.entry(op.to_string()).or_insert(0) += 1;
            if mutating {
                inner.mutations.push(format!("{}:{}", op, target));
            }
            inner.faults.get_mut(op).and_then(|q| q.pop_front())
        };

        match fault {
            None => Ok(false),
            Some(Fault::Delay(delay)) => {
                self.hold();
                tokio::time::sleep(delay).await;
                self.release();
                Ok(false)
            }
            Some(Fault::Barrier(barrier)) => {
                self.hold();
                barrier.wait().await;
                self.release();
                Ok(false)
            }
            Some(Fault::LostResponse) => Ok(true),
            Some(Fault::StaleRead) => Ok(false),
            Some(other) => Err(other.to_error(op)),
        }
    }

    /// Record a read; `false` when an injected stale read hides the resource
    async fn read(&self, op: &str, target: &str) -> Result<bool> {
        {
            let mut guard = self.lock();
            let inner = &mut *guard;
            if let Some(queue) = inner.faults.get_mut(op)
                && matches!(queue.front(), Some(Fault::StaleRead))
            {
                queue.pop_front();
                *inner.calls.entry(op.to_string()).or_insert(0) += 1;
                return Ok(false);
            }
        }
        self.enter(op, target, false).await?;
        Ok(true)
    }
}

fn network_link(project: &str, name: &str) -> String {
    format!("{}/projects/{}/global/networks/{}", COMPUTE_BASE, project, name)
}

fn subnetwork_link(project: &str, region: &str, name: &str) -> String {
    format!(
        "{}/projects/{}/regions/{}/subnetworks/{}",
        COMPUTE_BASE, project, region, name
    )
}

fn router_link(project: &str, region: &str, name: &str) -> String {
    format!(
        "{}/projects/{}/regions/{}/routers/{}",
        COMPUTE_BASE, project, region, name
    )
}

fn firewall_link(project: &str, name: &str) -> String {
    format!("{}/projects/{}/global/firewalls/{}", COMPUTE_BASE, project, name)
}

fn finish<T>(lost: bool, op: &str, value: T) -> Result<T> {
    if lost {
        Err(CloudError::Timeout(format!("response lost for {}", op)))
    } else {
        Ok(value)
    }
}

#[async_trait]
impl NetworkClient for InMemoryCloud {
    async fn get_network(&self, project: &str, name: &str) -> Result<Option<Network>> {
        if !self.read("get_network", name).await? {
            return Ok(None);
        }
        Ok(self.network(project, name))
    }

    async fn create_network(&self, project: &str, network: &Network) -> Result<Network> {
        let lost = self.enter("create_network", &network.name, true).await?;
        let mut inner = self.lock();
        let key = k2(project, &network.name);
        if inner.networks.contains_key(&key) {
            return Err(CloudError::AlreadyExists(network.name.clone()));
        }
        let mut created = network.clone();
        created.self_link = Some(network_link(project, &network.name));
        inner.networks.insert(key, created.clone());
        finish(lost, "create_network", created)
    }

    async fn update_network(&self, project: &str, network: &Network) -> Result<Network> {
        let lost = self.enter("update_network", &network.name, true).await?;
        let mut inner = self.lock();
        let existing = inner
            .networks
            .get_mut(&k2(project, &network.name))
            .ok_or_else(|| CloudError::NotFound(network.name.clone()))?;
        // The description carrying the owner marker is fixed at creation
        existing.routing_mode = network.routing_mode;
        let updated = existing.clone();
        finish(lost, "update_network", updated)
    }

    async fn delete_network(&self, project: &str, name: &str) -> Result<()> {
        let lost = self.enter("delete_network", name, true).await?;
        let mut inner = self.lock();
        let key = k2(project, name);
        if !inner.networks.contains_key(&key) {
            return Err(CloudError::NotFound(name.to_string()));
        }
        let refers = |link: &str| resource_name(link) == name;
        if let Some(((_, _, s), _)) = inner
            .subnetworks
            .iter()
            .find(|((p, _, _), s)| p == project && refers(&s.network))
        {
            return Err(in_use(name, s));
        }
        if let Some(((_, _, r), _)) = inner
            .routers
            .iter()
            .find(|((p, _, _), r)| p == project && refers(&r.network))
        {
            return Err(in_use(name, r));
        }
        if let Some(((_, f), _)) = inner
            .firewalls
            .iter()
            .find(|((p, _), f)| p == project && refers(&f.network))
        {
            return Err(in_use(name, f));
        }
        inner.networks.remove(&key);
        finish(lost, "delete_network", ())
    }

    async fn get_subnetwork(
        &self,
        project: &str,
        region: &str,
        name: &str,
    ) -> Result<Option<Subnetwork>> {
        if !self.read("get_subnetwork", name).await? {
            return Ok(None);
        }
        Ok(self.subnetwork(project, region, name))
    }

    async fn create_subnetwork(&self, project: &str, subnet: &Subnetwork) -> Result<Subnetwork> {
        let lost = self.enter("create_subnetwork", &subnet.name, true).await?;
        let mut inner = self.lock();
        let network = resource_name(&subnet.network);
        if !inner.networks.contains_key(&k2(project, network)) {
            return Err(CloudError::InvalidArgument(format!(
                "network {} not found",
                network
            )));
        }
        let key = k3(project, &subnet.region, &subnet.name);
        if inner.subnetworks.contains_key(&key) {
            return Err(CloudError::AlreadyExists(subnet.name.clone()));
        }
        let mut created = subnet.clone();
        created.self_link = Some(subnetwork_link(project, &subnet.region, &subnet.name));
        inner.subnetworks.insert(key, created.clone());
        finish(lost, "create_subnetwork", created)
    }

    async fn update_subnetwork(&self, project: &str, subnet: &Subnetwork) -> Result<Subnetwork> {
        let lost = self.enter("update_subnetwork", &subnet.name, true).await?;
        let mut inner = self.lock();
        let existing = inner
            .subnetworks
            .get_mut(&k3(project, &subnet.region, &subnet.name))
            .ok_or_else(|| CloudError::NotFound(subnet.name.clone()))?;
        existing.private_ip_google_access = subnet.private_ip_google_access;
        existing.flow_logs = subnet.flow_logs.clone();
        existing.owner = subnet.owner.clone();
        let updated = existing.clone();
        finish(lost, "update_subnetwork", updated)
    }

    async fn delete_subnetwork(&self, project: &str, region: &str, name: &str) -> Result<()> {
        let lost = self.enter("delete_subnetwork", name, true).await?;
        let mut inner = self.lock();
        let key = k3(project, region, name);
        if !inner.subnetworks.contains_key(&key) {
            return Err(CloudError::NotFound(name.to_string()));
        }
        if let Some(nat) = inner.nats.values().find(|n| {
            n.region == region && n.subnetworks.iter().any(|s| resource_name(s) == name)
        }) {
            return Err(in_use(name, &nat.name));
        }
        inner.subnetworks.remove(&key);
        finish(lost, "delete_subnetwork", ())
    }

    async fn get_router(&self, project: &str, region: &str, name: &str) -> Result<Option<Router>> {
        if !self.read("get_router", name).await? {
            return Ok(None);
        }
        Ok(self.router(project, region, name))
    }

    async fn create_router(&self, project: &str, router: &Router) -> Result<Router> {
        let lost = self.enter("create_router", &router.name, true).await?;
        let mut inner = self.lock();
        let network = resource_name(&router.network);
        if !inner.networks.contains_key(&k2(project, network)) {
            return Err(CloudError::InvalidArgument(format!(
                "network {} not found",
                network
            )));
        }
        let key = k3(project, &router.region, &router.name);
        if inner.routers.contains_key(&key) {
            return Err(CloudError::AlreadyExists(router.name.clone()));
        }
        let mut created = router.clone();
        created.self_link = Some(router_link(project, &router.region, &router.name));
        inner.routers.insert(key, created.clone());
        finish(lost, "create_router", created)
    }

    async fn update_router(&self, project: &str, router: &Router) -> Result<Router> {
        let lost = self.enter("update_router", &router.name, true).await?;
        let mut inner = self.lock();
        let existing = inner
            .routers
            .get_mut(&k3(project, &router.region, &router.name))
            .ok_or_else(|| CloudError::NotFound(router.name.clone()))?;
        existing.owner = router.owner.clone();
        let updated = existing.clone();
        finish(lost, "update_router", updated)
    }

    async fn delete_router(&self, project: &str, region: &str, name: &str) -> Result<()> {
        let lost = self.enter("delete_router", name, true).await?;
        let mut inner = self.lock();
        if inner.routers.remove(&k3(project, region, name)).is_none() {
            return Err(CloudError::NotFound(name.to_string()));
        }
        inner
            .nats
            .retain(|(p, r, router, _), _| !(p == project && r == region && router == name));
        finish(lost, "delete_router", ())
    }

    async fn get_nat(
        &self,
        project: &str,
        region: &str,
        router: &str,
        name: &str,
    ) -> Result<Option<Nat>> {
        if !self.read("get_nat", name).await? {
            return Ok(None);
        }
        Ok(self.nat(project, region, router, name))
    }

    async fn create_nat(&self, project: &str, nat: &Nat) -> Result<Nat> {
        let lost = self.enter("create_nat", &nat.name, true).await?;
        let mut inner = self.lock();
        if !inner
            .routers
            .contains_key(&k3(project, &nat.region, &nat.router))
        {
            return Err(CloudError::NotFound(format!("router {}", nat.router)));
        }
        for subnet in &nat.subnetworks {
            let subnet = resource_name(subnet);
            if !inner
                .subnetworks
                .contains_key(&k3(project, &nat.region, subnet))
            {
                return Err(CloudError::InvalidArgument(format!(
                    "subnetwork {} not found",
                    subnet
                )));
            }
        }
        let key = (
            project.to_string(),
            nat.region.clone(),
            nat.router.clone(),
            nat.name.clone(),
        );
        if inner.nats.contains_key(&key) {
            return Err(CloudError::AlreadyExists(nat.name.clone()));
        }
        inner.nats.insert(key, nat.clone());
        finish(lost, "create_nat", nat.clone())
    }

    async fn update_nat(&self, project: &str, nat: &Nat) -> Result<Nat> {
        let lost = self.enter("update_nat", &nat.name, true).await?;
        let mut inner = self.lock();
        let key = (
            project.to_string(),
            nat.region.clone(),
            nat.router.clone(),
            nat.name.clone(),
        );
        let existing = inner
            .nats
            .get_mut(&key)
            .ok_or_else(|| CloudError::NotFound(nat.name.clone()))?;
        *existing = nat.clone();
        finish(lost, "update_nat", nat.clone())
    }

    async fn delete_nat(
        &self,
        project: &str,
        region: &str,
        router: &str,
        name: &str,
    ) -> Result<()> {
        let lost = self.enter("delete_nat", name, true).await?;
        let mut inner = self.lock();
        let key = (
            project.to_string(),
            region.to_string(),
            router.to_string(),
            name.to_string(),
        );
        if inner.nats.remove(&key).is_none() {
            return Err(CloudError::NotFound(name.to_string()));
        }
        finish(lost, "delete_nat", ())
    }

    async fn get_firewall(&self, project: &str, name: &str) -> Result<Option<FirewallRule>> {
        if !self.read("get_firewall", name).await? {
            return Ok(None);
        }
        Ok(self.firewall(project, name))
    }

    async fn create_firewall(&self, project: &str, rule: &FirewallRule) -> Result<FirewallRule> {
        let lost = self.enter("create_firewall", &rule.name, true).await?;
        let mut inner = self.lock();
        let network = resource_name(&rule.network);
        if !inner.networks.contains_key(&k2(project, network)) {
            return Err(CloudError::InvalidArgument(format!(
                "network {} not found",
                network
            )));
        }
        let key = k2(project, &rule.name);
        if inner.firewalls.contains_key(&key) {
            return Err(CloudError::AlreadyExists(rule.name.clone()));
        }
        let mut created = rule.clone();
        created.self_link = Some(firewall_link(project, &rule.name));
        inner.firewalls.insert(key, created.clone());
        finish(lost, "create_firewall", created)
    }

    async fn update_firewall(&self, project: &str, rule: &FirewallRule) -> Result<FirewallRule> {
        let lost = self.enter("update_firewall", &rule.name, true).await?;
        let mut inner = self.lock();
        let existing = inner
            .firewalls
            .get_mut(&k2(project, &rule.name))
            .ok_or_else(|| CloudError::NotFound(rule.name.clone()))?;
        let self_link = existing.self_link.clone();
        *existing = rule.clone();
        existing.self_link = self_link;
        let updated = existing.clone();
        finish(lost, "update_firewall", updated)
    }

    async fn delete_firewall(&self, project: &str, name: &str) -> Result<()> {
        let lost = self.enter("delete_firewall", name, true).await?;
        let mut inner = self.lock();
        if inner.firewalls.remove(&k2(project, name)).is_none() {
            return Err(CloudError::NotFound(name.to_string()));
        }
        finish(lost, "delete_firewall", ())
    }

    async fn get_address(
        &self,
        project: &str,
        region: &str,
        name: &str,
    ) -> Result<Option<Address>> {
        self.enter("get_address", name, false).await?;
        Ok(self.lock().addresses.get(&k3(project, region, name)).cloned())
    }
}

#[async_trait]
impl IamClient for InMemoryCloud {
    async fn get_service_account(
        &self,
        project: &str,
        account_id: &str,
    ) -> Result<Option<ServiceAccount>> {
        if !self.read("get_service_account", account_id).await? {
            return Ok(None);
        }
        Ok(self.service_account(project, account_id))
    }

    async fn create_service_account(
        &self,
        project: &str,
        account: &ServiceAccount,
    ) -> Result<ServiceAccount> {
        let lost = self
            .enter("create_service_account", &account.account_id, true)
            .await?;
        let mut inner = self.lock();
        let key = k2(project, &account.account_id);
        if inner.accounts.contains_key(&key) {
            return Err(CloudError::AlreadyExists(account.account_id.clone()));
        }
        let mut created = account.clone();
        created.email = ServiceAccount::email_for(project, &account.account_id);
        created.unique_id = Some(format!("1{:020}", inner.accounts.len() + 1));
        inner.accounts.insert(key, created.clone());
        finish(lost, "create_service_account", created)
    }

    async fn update_service_account(
        &self,
        project: &str,
        account: &ServiceAccount,
    ) -> Result<ServiceAccount> {
        let lost = self
            .enter("update_service_account", &account.account_id, true)
            .await?;
        let mut inner = self.lock();
        let existing = inner
            .accounts
            .get_mut(&k2(project, &account.account_id))
            .ok_or_else(|| CloudError::NotFound(account.account_id.clone()))?;
        if account.display_name.is_some() {
            existing.display_name = account.display_name.clone();
        }
        existing.owner = account.owner.clone();
        let updated = existing.clone();
        finish(lost, "update_service_account", updated)
    }

    async fn delete_service_account(&self, project: &str, email: &str) -> Result<()> {
        let lost = self.enter("delete_service_account", email, true).await?;
        let mut inner = self.lock();
        let key = inner
            .accounts
            .iter()
            .find(|((p, _), sa)| p == project && sa.email == email)
            .map(|(key, _)| key.clone())
            .ok_or_else(|| CloudError::NotFound(email.to_string()))?;
        inner.accounts.remove(&key);
        finish(lost, "delete_service_account", ())
    }

    async fn get_roles(&self, project: &str, member: &str) -> Result<BTreeSet<String>> {
        self.enter("get_roles", member, false).await?;
        Ok(self.roles(project, member))
    }

    async fn grant_roles(&self, project: &str, member: &str, roles: &[String]) -> Result<()> {
        let lost = self.enter("grant_roles", member, true).await?;
        let mut inner = self.lock();
        inner
            .bindings
            .entry(k2(project, member))
            .or_default()
            .extend(roles.iter().cloned());
        finish(lost, "grant_roles", ())
    }

    async fn revoke_roles(&self, project: &str, member: &str, roles: &[String]) -> Result<()> {
        let lost = self.enter("revoke_roles", member, true).await?;
        let mut inner = self.lock();
        let key = k2(project, member);
        if let Some(bound) = inner.bindings.get_mut(&key) {
            for role in roles {
                bound.remove(role);
            }
            if bound.is_empty() {
                inner.bindings.remove(&key);
            }
        }
        finish(lost, "revoke_roles", ())
    }
}
