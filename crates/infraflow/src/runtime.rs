use anyhow::Context as _;
use colored::Colorize;
use infraflow_cloud::RetryConfig;
use infraflow_cloud_gcp::GcpConfig;
use infraflow_config::Settings;
use infraflow_core::{
    Context, ExecutorOptions, FileMigrationGate, FileStateStore, InfraSpec, ReconcileError,
    Reconciler,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Settings resolved for one command invocation
pub struct Runtime {
    pub settings: Settings,
    pub state_dir: PathBuf,
}

impl Runtime {
    pub fn load(state_dir: Option<&Path>) -> anyhow::Result<Self> {
        let mut settings = infraflow_config::load_settings().context("Failed to load settings")?;
        if let Some(dir) = state_dir {
            settings.state_dir = Some(dir.to_path_buf());
        }
        let state_dir = settings.state_dir()?;
        Ok(Self {
            settings,
            state_dir,
        })
    }

    pub fn store(&self) -> FileStateStore {
        FileStateStore::new(&self.state_dir)
    }

    pub fn gate(&self) -> anyhow::Result<FileMigrationGate> {
        Ok(FileMigrationGate::new(self.settings.legacy_dir()?))
    }

    pub fn executor_options(&self) -> ExecutorOptions {
        let retry = &self.settings.retry;
        ExecutorOptions {
            max_concurrency: self.settings.max_concurrency.max(1),
            retry: RetryConfig {
                max_attempts: retry.max_attempts,
                initial_delay: Duration::from_millis(retry.initial_delay_ms),
                max_delay: Duration::from_millis(retry.max_delay_ms),
                backoff_multiplier: retry.multiplier,
            },
            step_timeout: Duration::from_secs(self.settings.step_timeout_secs),
        }
    }

    fn gcp_config(&self) -> anyhow::Result<GcpConfig> {
        let mut config =
            GcpConfig::from_env().context("Google Cloud credentials are not configured")?;
        let gcp = &self.settings.gcp;
        if let Some(endpoint) = &gcp.compute_endpoint {
            config.compute_endpoint = endpoint.clone();
        }
        if let Some(endpoint) = &gcp.iam_endpoint {
            config.iam_endpoint = endpoint.clone();
        }
        if let Some(endpoint) = &gcp.resource_manager_endpoint {
            config.resource_manager_endpoint = endpoint.clone();
        }
        if let Some(secs) = gcp.request_timeout_secs {
            config.request_timeout = Duration::from_secs(secs);
        }
        Ok(config)
    }

    /// Reconciler wired to Google Cloud and the file stores
    pub fn reconciler(&self) -> anyhow::Result<Reconciler> {
        let clients = infraflow_cloud_gcp::clients(&self.gcp_config()?)?;
        let gate = Arc::new(self.gate()?);
        Ok(Reconciler::new(clients, Arc::new(self.store()), gate)
            .with_options(self.executor_options()))
    }
}

/// Load and validate the spec, exiting with a configuration error otherwise
pub fn load_spec(path: &Path, instance_id: &str) -> InfraSpec {
    let result = InfraSpec::load(path).and_then(|spec| {
        spec.validate(instance_id)?;
        Ok(spec)
    });
    match result {
        Ok(spec) => spec,
        Err(e) => fail("Invalid spec", &ReconcileError::Spec(e)),
    }
}

/// Context cancelled on Ctrl-C; in-flight steps stop and keep their checkpoint
pub fn interruptible() -> Context {
    let (ctx, cancel) = Context::with_cancel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("{}", "Interrupted, stopping after the current steps...".yellow());
            cancel.cancel();
        }
    });
    ctx
}

/// Print a reconciliation failure with its error codes and exit non-zero
pub fn fail(title: &str, err: &ReconcileError) -> ! {
    eprintln!();
    eprintln!("{}", format!("✗ {}", title).red().bold());
    eprintln!("  {}", err);

    let failures = err.failures();
    if !failures.is_empty() {
        eprintln!();
        eprintln!("Failed steps:");
        for failure in failures {
            let code = failure
                .code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "-".to_string());
            eprintln!(
                "  {} {} ({} attempts)",
                failure.step_id.cyan(),
                code.yellow(),
                failure.attempts
            );
            eprintln!("    {}", failure.message);
        }
    }

    let codes = err.codes();
    if !codes.is_empty() {
        let codes: Vec<String> = codes.iter().map(|c| c.to_string()).collect();
        eprintln!();
        eprintln!("Error codes: {}", codes.join(", ").yellow());
    }
    std::process::exit(1);
}
