use crate::runtime::{self, Runtime};
use colored::Colorize;
use infraflow_core::{InfraSpec, OperationType};

pub async fn handle(
    runtime: &Runtime,
    spec: &InfraSpec,
    instance_id: &str,
    json: bool,
) -> anyhow::Result<()> {
    let reconciler = runtime.reconciler()?;
    let plan = match reconciler.plan(spec, instance_id).await {
        Ok(plan) => plan,
        Err(e) => runtime::fail("Planning failed", &e),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(());
    }

    println!("{} {}", "Plan for".blue(), instance_id.cyan());
    println!();
    for op in &plan.operations {
        let symbol = match op.action {
            OperationType::Create => "+".green(),
            OperationType::Update => "~".yellow(),
            OperationType::Delete => "-".red(),
            OperationType::NoOp => " ".normal(),
        };
        let line = format!("{} {} ({})", symbol, op.step_id, op.name);
        if op.action == OperationType::NoOp {
            println!("  {}", line.dimmed());
        } else if op.changes.is_empty() {
            println!("  {}", line);
        } else {
            println!("  {} [{}]", line, op.changes.join(", "));
        }
    }

    if !plan.issues.is_empty() {
        println!();
        println!("{}", "Blocking issues:".red().bold());
        for issue in &plan.issues {
            println!("  {} {}", issue.step_id.cyan(), issue.code.to_string().yellow());
            println!("    {}", issue.message);
        }
    }

    println!();
    println!("Plan: {}", plan.summary().to_string().bold());
    Ok(())
}
