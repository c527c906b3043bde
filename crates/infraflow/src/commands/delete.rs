use crate::runtime::{self, Runtime};
use colored::Colorize;

pub async fn handle(runtime: &Runtime, instance_id: &str) -> anyhow::Result<()> {
    let reconciler = runtime.reconciler()?;
    let ctx = runtime::interruptible();

    println!("{} {}", "Deleting".blue(), instance_id.cyan());
    if let Err(e) = reconciler.delete(&ctx, instance_id).await {
        runtime::fail("Deletion incomplete", &e);
    }
    println!("{}", "✓ Infrastructure deleted".green().bold());
    Ok(())
}
