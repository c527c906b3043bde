use crate::runtime::Runtime;
use anyhow::Context as _;
use colored::Colorize;
use infraflow_core::{InfraSpec, InfrastructureStatus, StateStore};

pub async fn handle(
    runtime: &Runtime,
    spec: &InfraSpec,
    instance_id: &str,
    json: bool,
) -> anyhow::Result<()> {
    let state = runtime
        .store()
        .load(instance_id)
        .await
        .context("Failed to load flow state")?;
    let Some(state) = state else {
        println!("No flow state for {}", instance_id.cyan());
        return Ok(());
    };

    let status = infraflow_core::project(&state, spec);
    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        print_summary(&status);
    }
    Ok(())
}

pub fn print_summary(status: &InfrastructureStatus) {
    let Some(networks) = &status.networks else {
        println!("  (no network resources yet)");
        return;
    };

    if let Some(vpc) = &networks.vpc {
        println!("  VPC: {}", vpc.name.cyan());
        if let Some(router) = &vpc.cloud_router {
            println!("  Cloud Router: {}", router.name.cyan());
        }
    }
    for subnet in &networks.subnets {
        println!("  Subnet: {} ({})", subnet.name.cyan(), subnet.purpose.as_str());
    }
    for nat_ip in &networks.nat_ips {
        println!("  NAT IP: {}", nat_ip.ip);
    }
    for account in &status.service_accounts {
        println!("  Service account: {} ({})", account.name.cyan(), account.email);
    }
}
