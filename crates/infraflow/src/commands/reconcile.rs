use crate::runtime::{self, Runtime};
use colored::Colorize;
use infraflow_core::{InfraSpec, InfrastructureStatus, ReconcileError};

pub async fn handle(
    runtime: &Runtime,
    spec: &InfraSpec,
    instance_id: &str,
    json: bool,
) -> anyhow::Result<()> {
    let reconciler = runtime.reconciler()?;
    let ctx = runtime::interruptible();

    if !json {
        println!("{} {}", "Reconciling".blue(), instance_id.cyan());
    }
    match reconciler.reconcile(&ctx, spec, instance_id).await {
        Ok(status) => {
            if !json {
                println!("{}", "✓ Infrastructure reconciled".green().bold());
            }
            print_status(&status, json)?;
            Ok(())
        }
        Err(e) => {
            if let ReconcileError::PartialFailure { status, .. } = &e {
                print_status(status, json)?;
            }
            runtime::fail("Reconciliation incomplete", &e)
        }
    }
}

fn print_status(status: &InfrastructureStatus, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(status)?);
    } else {
        super::status::print_summary(status);
    }
    Ok(())
}
