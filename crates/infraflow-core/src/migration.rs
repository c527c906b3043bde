//! Migration gate between the legacy path and the flow path
//!
//! The policy is owned by a [`MigrationGate`]; the reconciler only honours its
//! answer. Before the flow path takes over an instance, the legacy
//! bookkeeping is removed so both paths never manage the same resources. The
//! cloud resources it describes are left untouched.

use crate::context::Context;
use crate::error::GateError;
use crate::spec::InfraSpec;
use crate::state::FlowState;
use crate::status::InfrastructureStatus;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;

/// Spec annotation that forces the flow path
pub const USE_FLOW_ANNOTATION: &str = "infraflow.io/use-flow";

const LEGACY_STATE_EXTENSION: &str = "tfstate";
const LEGACY_VARS_EXTENSION: &str = "tfvars";

#[async_trait]
pub trait MigrationGate: Send + Sync {
    /// Whether this reconciliation must use the flow path
    async fn should_use_flow(
        &self,
        instance_id: &str,
        prior: Option<&FlowState>,
        spec: &InfraSpec,
    ) -> Result<bool, GateError>;

    async fn has_legacy_state(&self, instance_id: &str) -> Result<bool, GateError>;

    /// Remove legacy bookkeeping objects; never the resources they describe
    async fn cleanup_legacy_state(&self, instance_id: &str) -> Result<(), GateError>;
}

/// The opaque legacy provisioning path
#[async_trait]
pub trait LegacyReconciler: Send + Sync {
    async fn reconcile(
        &self,
        ctx: &Context,
        spec: &InfraSpec,
        instance_id: &str,
    ) -> Result<InfrastructureStatus, GateError>;

    async fn delete(&self, ctx: &Context, instance_id: &str) -> Result<(), GateError>;
}

/// Gate backed by legacy state files under one directory
///
/// The flow path is used when the spec is annotated with
/// `infraflow.io/use-flow: "true"`, when flow state already exists, or when
/// there is no legacy state to honour.
#[derive(Debug, Clone)]
pub struct FileMigrationGate {
    dir: PathBuf,
}

impl FileMigrationGate {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn state_path(&self, instance_id: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{}", instance_id, LEGACY_STATE_EXTENSION))
    }

    fn vars_path(&self, instance_id: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{}", instance_id, LEGACY_VARS_EXTENSION))
    }
}

fn annotated_for_flow(spec: &InfraSpec) -> bool {
    spec.annotations
        .get(USE_FLOW_ANNOTATION)
        .is_some_and(|v| v.eq_ignore_ascii_case("true"))
}

#[async_trait]
impl MigrationGate for FileMigrationGate {
    async fn should_use_flow(
        &self,
        instance_id: &str,
        prior: Option<&FlowState>,
        spec: &InfraSpec,
    ) -> Result<bool, GateError> {
        if annotated_for_flow(spec) || prior.is_some() {
            return Ok(true);
        }
        Ok(!self.has_legacy_state(instance_id).await?)
    }

    async fn has_legacy_state(&self, instance_id: &str) -> Result<bool, GateError> {
        Ok(fs::try_exists(self.state_path(instance_id)).await?)
    }

    async fn cleanup_legacy_state(&self, instance_id: &str) -> Result<(), GateError> {
        for path in [self.state_path(instance_id), self.vars_path(instance_id)] {
            match fs::remove_file(&path).await {
                Ok(()) => tracing::info!("Removed legacy bookkeeping {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn spec(annotated: bool) -> InfraSpec {
        let mut spec = InfraSpec::from_yaml_str(
            "project: proj\nregion: europe-west1\nnetwork: {name: net-1}\n",
        )
        .unwrap();
        if annotated {
            spec.annotations
                .insert(USE_FLOW_ANNOTATION.to_string(), "true".to_string());
        }
        spec
    }

    #[tokio::test]
    async fn test_gate_policy() {
        let temp_dir = tempdir().unwrap();
        let gate = FileMigrationGate::new(temp_dir.path());

        // Fresh instance: nothing legacy to honour
        assert!(gate.should_use_flow("shoot", None, &spec(false)).await.unwrap());

        std::fs::write(gate.state_path("shoot"), "{}").unwrap();
        assert!(!gate.should_use_flow("shoot", None, &spec(false)).await.unwrap());
        assert!(gate.should_use_flow("shoot", None, &spec(true)).await.unwrap());

        let prior = FlowState::new("shoot");
        assert!(
            gate.should_use_flow("shoot", Some(&prior), &spec(false))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_cleanup_removes_bookkeeping_only() {
        let temp_dir = tempdir().unwrap();
        let gate = FileMigrationGate::new(temp_dir.path());
        std::fs::write(gate.state_path("shoot"), "{}").unwrap();
        std::fs::write(temp_dir.path().join("shoot.tfvars"), "").unwrap();
        std::fs::write(temp_dir.path().join("other.tfstate"), "{}").unwrap();

        assert!(gate.has_legacy_state("shoot").await.unwrap());
        gate.cleanup_legacy_state("shoot").await.unwrap();
        assert!(!gate.has_legacy_state("shoot").await.unwrap());
        assert!(!temp_dir.path().join("shoot.tfvars").exists());
        assert!(gate.has_legacy_state("other").await.unwrap());

        // Idempotent
        gate.cleanup_legacy_state("shoot").await.unwrap();
    }
}
