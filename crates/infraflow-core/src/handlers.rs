//! Kind-specific apply and destroy functions
//!
//! Dispatch is a static match on the step's [`Intent`]. Every ensure handler
//! looks the resource up by its deterministic name before creating it, so
//! re-running a step against a converged project issues no mutating call.

use crate::diff::{
    FieldChanges, Observed, compare_firewall, compare_nat, compare_network, compare_router,
    compare_service_account, compare_subnet, fetch, foreign_owner,
};
use crate::error::StepError;
use crate::step::{
    ATTR_ADOPTED, ATTR_CIDR, ATTR_EMAIL, ATTR_NAT_IPS, ATTR_PURPOSE, Intent, ResourceRef, Step,
    StepOutput, StepTask,
};
use infraflow_cloud::{
    CloudError, FirewallRule, Nat, Network, ProviderClients, ResourceKind, Router, ServiceAccount,
    Subnetwork,
};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

/// Everything a step needs besides its own definition
#[derive(Debug, Clone)]
pub struct StepContext {
    pub clients: ProviderClients,
    pub instance_id: String,
    /// Targets and outputs of the succeeded dependencies
    pub dependencies: Vec<(ResourceRef, StepOutput)>,
    /// The step's own record says the resource was adopted unmarked
    pub adopted: bool,
}

impl StepContext {
    fn dependency_link(&self, kind: ResourceKind, name: &str) -> Result<String, StepError> {
        self.dependencies
            .iter()
            .find(|(target, _)| target.kind == kind && target.name == name)
            .and_then(|(_, output)| output.self_link.clone())
            .ok_or_else(|| StepError::Dependency(format!("{} {}", kind, name)))
    }

    fn dependency_attributes(&self, kind: ResourceKind, key: &str) -> Vec<String> {
        self.dependencies
            .iter()
            .filter(|(target, _)| target.kind == kind)
            .flat_map(|(_, output)| output.attribute_strings(key))
            .collect()
    }

    fn check_owner(&self, target: &ResourceRef, owner: Option<&str>) -> Result<(), StepError> {
        match foreign_owner(owner, &self.instance_id) {
            Some(owner) => Err(StepError::Ownership {
                resource: target.to_string(),
                owner: owner.to_string(),
            }),
            None => Ok(()),
        }
    }
}

fn check_drift(target: &ResourceRef, changes: &FieldChanges) -> Result<(), StepError> {
    if changes.has_drift() {
        return Err(StepError::Drift {
            resource: target.to_string(),
            fields: changes.immutable.iter().map(|f| f.to_string()).collect(),
        });
    }
    Ok(())
}

/// A create reported the resource as existing but it cannot be read back yet
fn vanished(target: &ResourceRef) -> StepError {
    StepError::Cloud(CloudError::Conflict(format!(
        "{} exists but could not be read",
        target
    )))
}

fn missing(target: &ResourceRef) -> StepError {
    StepError::Missing(target.to_string())
}

/// Run one step against the provider
pub async fn apply(ctx: &StepContext, step: &Step) -> Result<StepOutput, StepError> {
    match &step.task {
        StepTask::Ensure(intent) => ensure(ctx, &step.target, intent).await,
        StepTask::Remove => {
            remove(ctx, &step.target).await?;
            Ok(StepOutput::default())
        }
    }
}

async fn ensure(
    ctx: &StepContext,
    target: &ResourceRef,
    intent: &Intent,
) -> Result<StepOutput, StepError> {
    match intent {
        Intent::Network(network) => ensure_network(ctx, target, network).await,
        Intent::Subnet { subnet, purpose } => {
            let output = ensure_subnet(ctx, target, subnet).await?;
            Ok(output
                .with_attribute(ATTR_CIDR, subnet.ip_cidr_range.clone())
                .with_attribute(ATTR_PURPOSE, purpose.as_str()))
        }
        Intent::Router(router) => ensure_router(ctx, target, router).await,
        Intent::Nat { nat, nat_ip_names } => ensure_nat(ctx, target, nat, nat_ip_names).await,
        Intent::Firewall {
            rule,
            include_nat_ips,
        } => ensure_firewall(ctx, target, rule, *include_nat_ips).await,
        Intent::ServiceAccount { account, roles } => {
            ensure_service_account(ctx, target, account, roles).await
        }
    }
}

async fn ensure_network(
    ctx: &StepContext,
    target: &ResourceRef,
    desired: &Network,
) -> Result<StepOutput, StepError> {
    let api = &ctx.clients.network;
    let project = target.project.as_str();

    let found = api.get_network(project, &desired.name).await?;
    if !target.managed {
        let network = found.ok_or_else(|| missing(target))?;
        debug!("Using existing {}", target);
        return Ok(StepOutput::link(network.self_link));
    }

    let actual = match found {
        Some(actual) => actual,
        None => match api.create_network(project, desired).await {
            Ok(created) => {
                info!("Created {}", target);
                return Ok(StepOutput::link(created.self_link));
            }
            Err(CloudError::AlreadyExists(_)) => api
                .get_network(project, &desired.name)
                .await?
                .ok_or_else(|| vanished(target))?,
            Err(e) => return Err(e.into()),
        },
    };

    ctx.check_owner(target, actual.owner.as_deref())?;
    let adopted = actual.owner.is_none();
    let changes = compare_network(desired, &actual);
    check_drift(target, &changes)?;
    let self_link = if changes.needs_update() {
        let updated = api.update_network(project, desired).await?;
        info!(fields = ?changes.mutable, "Updated {}", target);
        updated.self_link.or(actual.self_link)
    } else {
        debug!("{} is up to date", target);
        actual.self_link
    };

    let output = StepOutput::link(self_link);
    if adopted {
        debug!("Adopted unmarked {}", target);
        return Ok(output.with_attribute(ATTR_ADOPTED, true));
    }
    Ok(output)
}

async fn ensure_subnet(
    ctx: &StepContext,
    target: &ResourceRef,
    subnet: &Subnetwork,
) -> Result<StepOutput, StepError> {
    let api = &ctx.clients.network;
    let project = target.project.as_str();
    let desired = Subnetwork {
        network: ctx.dependency_link(ResourceKind::Network, &subnet.network)?,
        ..subnet.clone()
    };

    let actual = match api
        .get_subnetwork(project, &desired.region, &desired.name)
        .await?
    {
        Some(actual) => actual,
        None => match api.create_subnetwork(project, &desired).await {
            Ok(created) => {
                info!(cidr = %desired.ip_cidr_range, "Created {}", target);
                return Ok(StepOutput::link(created.self_link));
            }
            Err(CloudError::AlreadyExists(_)) => api
                .get_subnetwork(project, &desired.region, &desired.name)
                .await?
                .ok_or_else(|| vanished(target))?,
            Err(e) => return Err(e.into()),
        },
    };

    ctx.check_owner(target, actual.owner.as_deref())?;
    let changes = compare_subnet(&desired, &actual);
    check_drift(target, &changes)?;
    if changes.needs_update() {
        let updated = api.update_subnetwork(project, &desired).await?;
        info!(fields = ?changes.mutable, "Updated {}", target);
        return Ok(StepOutput::link(updated.self_link.or(actual.self_link)));
    }
    debug!("{} is up to date", target);
    Ok(StepOutput::link(actual.self_link))
}

async fn ensure_router(
    ctx: &StepContext,
    target: &ResourceRef,
    router: &Router,
) -> Result<StepOutput, StepError> {
    let api = &ctx.clients.network;
    let project = target.project.as_str();

    let found = api.get_router(project, &router.region, &router.name).await?;
    if !target.managed {
        let router = found.ok_or_else(|| missing(target))?;
        debug!("Using existing {}", target);
        return Ok(StepOutput::link(router.self_link));
    }

    let desired = Router {
        network: ctx.dependency_link(ResourceKind::Network, &router.network)?,
        ..router.clone()
    };
    let actual = match found {
        Some(actual) => actual,
        None => match api.create_router(project, &desired).await {
            Ok(created) => {
                info!("Created {}", target);
                return Ok(StepOutput::link(created.self_link));
            }
            Err(CloudError::AlreadyExists(_)) => api
                .get_router(project, &desired.region, &desired.name)
                .await?
                .ok_or_else(|| vanished(target))?,
            Err(e) => return Err(e.into()),
        },
    };

    ctx.check_owner(target, actual.owner.as_deref())?;
    let changes = compare_router(&desired, &actual);
    check_drift(target, &changes)?;
    if changes.needs_update() {
        let updated = api.update_router(project, &desired).await?;
        info!(fields = ?changes.mutable, "Updated {}", target);
        return Ok(StepOutput::link(updated.self_link.or(actual.self_link)));
    }
    debug!("{} is up to date", target);
    Ok(StepOutput::link(actual.self_link))
}

async fn ensure_nat(
    ctx: &StepContext,
    target: &ResourceRef,
    nat: &Nat,
    nat_ip_names: &[String],
) -> Result<StepOutput, StepError> {
    let api = &ctx.clients.network;
    let project = target.project.as_str();

    let mut nat_ips = Vec::with_capacity(nat_ip_names.len());
    let mut ips = Vec::with_capacity(nat_ip_names.len());
    for name in nat_ip_names {
        let address = api
            .get_address(project, &nat.region, name)
            .await?
            .ok_or_else(|| StepError::Missing(format!("address {}", name)))?;
        nat_ips.push(address.self_link.unwrap_or_else(|| address.name.clone()));
        ips.push(address.address);
    }
    let subnetworks = nat
        .subnetworks
        .iter()
        .map(|name| ctx.dependency_link(ResourceKind::Subnet, name))
        .collect::<Result<Vec<_>, _>>()?;
    let desired = Nat {
        nat_ips,
        subnetworks,
        ..nat.clone()
    };
    let output = StepOutput::default().with_attribute(ATTR_NAT_IPS, ips);

    let actual = match api
        .get_nat(project, &desired.region, &desired.router, &desired.name)
        .await?
    {
        Some(actual) => actual,
        None => match api.create_nat(project, &desired).await {
            Ok(_) => {
                info!(router = %desired.router, "Created {}", target);
                return Ok(output);
            }
            Err(CloudError::AlreadyExists(_)) => api
                .get_nat(project, &desired.region, &desired.router, &desired.name)
                .await?
                .ok_or_else(|| vanished(target))?,
            Err(e) => return Err(e.into()),
        },
    };

    let changes = compare_nat(&desired, &actual);
    if changes.needs_update() {
        api.update_nat(project, &desired).await?;
        info!(fields = ?changes.mutable, "Updated {}", target);
    } else {
        debug!("{} is up to date", target);
    }
    Ok(output)
}

async fn ensure_firewall(
    ctx: &StepContext,
    target: &ResourceRef,
    rule: &FirewallRule,
    include_nat_ips: bool,
) -> Result<StepOutput, StepError> {
    let api = &ctx.clients.network;
    let project = target.project.as_str();

    let mut desired = FirewallRule {
        network: ctx.dependency_link(ResourceKind::Network, &rule.network)?,
        ..rule.clone()
    };
    if include_nat_ips {
        for ip in ctx.dependency_attributes(ResourceKind::Nat, ATTR_NAT_IPS) {
            let range = format!("{}/32", ip);
            if !desired.source_ranges.contains(&range) {
                desired.source_ranges.push(range);
            }
        }
    }

    let actual = match api.get_firewall(project, &desired.name).await? {
        Some(actual) => actual,
        None => match api.create_firewall(project, &desired).await {
            Ok(created) => {
                info!("Created {}", target);
                return Ok(StepOutput::link(created.self_link));
            }
            Err(CloudError::AlreadyExists(_)) => api
                .get_firewall(project, &desired.name)
                .await?
                .ok_or_else(|| vanished(target))?,
            Err(e) => return Err(e.into()),
        },
    };

    ctx.check_owner(target, actual.owner.as_deref())?;
    let changes = compare_firewall(&desired, &actual);
    check_drift(target, &changes)?;
    if changes.needs_update() {
        let updated = api.update_firewall(project, &desired).await?;
        info!(fields = ?changes.mutable, "Updated {}", target);
        return Ok(StepOutput::link(updated.self_link.or(actual.self_link)));
    }
    debug!("{} is up to date", target);
    Ok(StepOutput::link(actual.self_link))
}

async fn ensure_service_account(
    ctx: &StepContext,
    target: &ResourceRef,
    desired: &ServiceAccount,
    roles: &BTreeSet<String>,
) -> Result<StepOutput, StepError> {
    let iam = &ctx.clients.iam;
    let project = target.project.as_str();

    let mut account = match iam.get_service_account(project, &desired.account_id).await? {
        Some(actual) => actual,
        None => match iam.create_service_account(project, desired).await {
            Ok(created) => {
                info!(email = %created.email, "Created {}", target);
                created
            }
            Err(CloudError::AlreadyExists(_)) => iam
                .get_service_account(project, &desired.account_id)
                .await?
                .ok_or_else(|| vanished(target))?,
            Err(e) => return Err(e.into()),
        },
    };
    ctx.check_owner(target, account.owner.as_deref())?;

    let member = account.member();
    let bound = iam.get_roles(project, &member).await?;
    let changes = compare_service_account(desired, roles, &account, &bound);
    if changes.mutable.iter().any(|f| *f != "roles") {
        account = iam.update_service_account(project, desired).await?;
        info!("Updated {}", target);
    }

    let grant: Vec<String> = roles.difference(&bound).cloned().collect();
    if !grant.is_empty() {
        iam.grant_roles(project, &member, &grant).await?;
        info!(roles = ?grant, "Granted roles to {}", target);
    }
    let revoke: Vec<String> = bound.difference(roles).cloned().collect();
    if !revoke.is_empty() {
        iam.revoke_roles(project, &member, &revoke).await?;
        info!(roles = ?revoke, "Revoked roles from {}", target);
    }

    Ok(StepOutput::default().with_attribute(ATTR_EMAIL, account.email))
}

/// Delete the resource if it exists and belongs to this instance
async fn remove(ctx: &StepContext, target: &ResourceRef) -> Result<(), StepError> {
    if !target.managed {
        debug!("Leaving unmanaged {} in place", target);
        return Ok(());
    }

    let Some(actual) = fetch(&ctx.clients, target).await? else {
        debug!("{} is already absent", target);
        return Ok(());
    };
    if target.kind.has_owner_marker()
        && actual.owner() != Some(ctx.instance_id.as_str())
        && !ctx.adopted
    {
        warn!(
            owner = actual.owner().unwrap_or("none"),
            "Not deleting {}: not owned by {}",
            target,
            ctx.instance_id
        );
        return Ok(());
    }

    let project = target.project.as_str();
    let network = &ctx.clients.network;
    let result = match &actual {
        Observed::Network(_) => network.delete_network(project, &target.name).await,
        Observed::Subnet(_) => {
            network
                .delete_subnetwork(project, target.region(), &target.name)
                .await
        }
        Observed::Router(_) => {
            network
                .delete_router(project, target.region(), &target.name)
                .await
        }
        Observed::Nat(_) => {
            network
                .delete_nat(project, target.region(), target.parent(), &target.name)
                .await
        }
        Observed::Firewall(_) => network.delete_firewall(project, &target.name).await,
        Observed::ServiceAccount { account, roles } => {
            if !roles.is_empty() {
                let roles: Vec<String> = roles.iter().cloned().collect();
                ctx.clients
                    .iam
                    .revoke_roles(project, &account.member(), &roles)
                    .await?;
            }
            ctx.clients
                .iam
                .delete_service_account(project, &account.email)
                .await
        }
    };

    match result {
        Ok(()) => info!("Deleted {}", target),
        Err(e) if e.is_not_found() => debug!("{} disappeared during deletion", target),
        Err(e) => return Err(e.into()),
    }
    Ok(())
}
