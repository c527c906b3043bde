use async_trait::async_trait;
use infraflow_cloud::{Address, InMemoryCloud, ProviderClients, RetryConfig};
use infraflow_core::{
    Context, ExecutorOptions, FileMigrationGate, FlowState, GateError, InfraSpec,
    InfrastructureStatus, LegacyReconciler, MemoryStateStore, Reconciler, StateStore,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;

pub const PROJECT: &str = "proj";
pub const REGION: &str = "europe-west1";
pub const INSTANCE: &str = "shoot";

pub struct TestEnv {
    pub cloud: Arc<InMemoryCloud>,
    pub store: Arc<MemoryStateStore>,
    pub legacy_dir: TempDir,
}

impl TestEnv {
    pub fn new() -> Self {
        let cloud = Arc::new(InMemoryCloud::new());
        cloud.seed_address(
            PROJECT,
            Address {
                name: "nat-ip".into(),
                region: REGION.into(),
                address: "203.0.113.7".into(),
                self_link: None,
            },
        );
        Self {
            cloud,
            store: Arc::new(MemoryStateStore::new()),
            legacy_dir: tempfile::tempdir().unwrap(),
        }
    }

    pub fn gate(&self) -> FileMigrationGate {
        FileMigrationGate::new(self.legacy_dir.path())
    }

    pub fn reconciler(&self) -> Reconciler {
        Reconciler::new(
            ProviderClients::new(self.cloud.clone(), self.cloud.clone()),
            self.store.clone(),
            Arc::new(self.gate()),
        )
        .with_options(fast_options())
    }

    #[allow(dead_code)]
    pub fn write_legacy_state(&self) {
        std::fs::write(self.gate().state_path(INSTANCE), "{\"version\": 4}").unwrap();
    }

    #[allow(dead_code)]
    pub async fn store_state(&self) -> FlowState {
        self.store.load(INSTANCE).await.unwrap().unwrap()
    }

    #[allow(dead_code)]
    pub async fn reconcile(
        &self,
        spec: &InfraSpec,
    ) -> infraflow_core::Result<InfrastructureStatus> {
        self.reconciler()
            .reconcile(&Context::background(), spec, INSTANCE)
            .await
    }
}

pub fn fast_options() -> ExecutorOptions {
    ExecutorOptions {
        max_concurrency: 4,
        retry: RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            backoff_multiplier: 2.0,
        },
        step_timeout: Duration::from_secs(5),
    }
}

pub fn spec(yaml: &str) -> InfraSpec {
    let header = format!("project: {}\nregion: {}\n", PROJECT, REGION);
    InfraSpec::from_yaml_str(&format!("{}{}", header, yaml)).unwrap()
}

/// Legacy path stand-in that only counts calls
#[derive(Default)]
#[allow(dead_code)]
pub struct RecordingLegacy {
    pub reconciles: AtomicUsize,
    pub deletes: AtomicUsize,
}

#[async_trait]
impl LegacyReconciler for RecordingLegacy {
    async fn reconcile(
        &self,
        _ctx: &Context,
        _spec: &InfraSpec,
        _instance_id: &str,
    ) -> Result<InfrastructureStatus, GateError> {
        self.reconciles.fetch_add(1, Ordering::SeqCst);
        Ok(InfrastructureStatus::default())
    }

    async fn delete(&self, _ctx: &Context, _instance_id: &str) -> Result<(), GateError> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
