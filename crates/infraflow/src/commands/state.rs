use crate::runtime::Runtime;
use anyhow::Context as _;
use colored::Colorize;
use infraflow_core::{StateStore, StepStatus};

pub async fn handle(runtime: &Runtime, instance_id: &str, json: bool) -> anyhow::Result<()> {
    let store = runtime.store();
    let state = store
        .load(instance_id)
        .await
        .context("Failed to load flow state")?;
    let Some(state) = state else {
        println!("No flow state for {}", instance_id.cyan());
        return Ok(());
    };

    if json {
        println!("{}", state.to_json()?);
        return Ok(());
    }

    println!(
        "Flow state for {} (updated {})",
        instance_id.cyan(),
        state.updated_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    println!("  {}", store.state_path(instance_id).display().to_string().dimmed());
    println!();
    for (id, record) in &state.steps {
        let status = match record.status {
            StepStatus::Succeeded => record.status.to_string().green(),
            StepStatus::Failed => record.status.to_string().red(),
            StepStatus::Running => record.status.to_string().blue(),
            StepStatus::Pending => record.status.to_string().yellow(),
        };
        println!(
            "  {:<32} {:<10} {} attempts",
            id, status, record.attempts
        );
        if let Some(error) = &record.last_error {
            println!("    {}", error.dimmed());
        }
    }
    Ok(())
}
