mod commands;
mod runtime;

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "infraflow")]
#[command(
    about = "Reconcile Google Cloud network infrastructure as a checkpointed flow",
    long_about = None
)]
struct Cli {
    /// Verbose logging (debug level)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct InstanceArgs {
    /// Instance identifier (prefix of every provider name)
    #[arg(short, long, env = "INFRAFLOW_INSTANCE", value_parser = parse_instance_id)]
    instance: String,
    /// Flow state directory (overrides settings and INFRAFLOW_STATE_DIR)
    #[arg(long)]
    state_dir: Option<PathBuf>,
}

/// Instance ids name provider resources and state files, so they must be plain labels
fn parse_instance_id(value: &str) -> Result<String, String> {
    if infraflow_core::naming::is_rfc1035(value) {
        Ok(value.to_string())
    } else {
        Err("must be a lowercase RFC 1035 label (letters, digits, hyphens)".to_string())
    }
}

#[derive(Args)]
struct SpecArgs {
    /// Desired-state document (YAML or JSON)
    #[arg(short, long, env = "INFRAFLOW_SPEC")]
    spec: PathBuf,
    #[command(flatten)]
    target: InstanceArgs,
}

#[derive(Subcommand)]
enum Commands {
    /// Show what a reconcile would change
    Plan {
        #[command(flatten)]
        args: SpecArgs,
        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },
    /// Converge the instance towards the spec
    Reconcile {
        #[command(flatten)]
        args: SpecArgs,
        /// Print the resulting status as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete every resource the instance created
    Delete {
        #[command(flatten)]
        target: InstanceArgs,
    },
    /// Show the status projected from the persisted flow state
    Status {
        #[command(flatten)]
        args: SpecArgs,
        #[arg(long)]
        json: bool,
    },
    /// Show the persisted flow state
    State {
        #[command(flatten)]
        target: InstanceArgs,
        #[arg(long)]
        json: bool,
    },
    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so JSON output stays parseable
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Version => {
            println!("infraflow {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Commands::Plan { args, json } => {
            let runtime = runtime::Runtime::load(args.target.state_dir.as_deref())?;
            let spec = runtime::load_spec(&args.spec, &args.target.instance);
            commands::plan::handle(&runtime, &spec, &args.target.instance, json).await
        }
        Commands::Reconcile { args, json } => {
            let runtime = runtime::Runtime::load(args.target.state_dir.as_deref())?;
            let spec = runtime::load_spec(&args.spec, &args.target.instance);
            commands::reconcile::handle(&runtime, &spec, &args.target.instance, json).await
        }
        Commands::Delete { target } => {
            let runtime = runtime::Runtime::load(target.state_dir.as_deref())?;
            commands::delete::handle(&runtime, &target.instance).await
        }
        Commands::Status { args, json } => {
            let runtime = runtime::Runtime::load(args.target.state_dir.as_deref())?;
            let spec = runtime::load_spec(&args.spec, &args.target.instance);
            commands::status::handle(&runtime, &spec, &args.target.instance, json).await
        }
        Commands::State { target, json } => {
            let runtime = runtime::Runtime::load(target.state_dir.as_deref())?;
            commands::state::handle(&runtime, &target.instance, json).await
        }
    }
}
