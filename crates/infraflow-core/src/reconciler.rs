//! Reconciler entry points
//!
//! ```text
//! reconcile: gate ─┬─ legacy path (opaque)
//!                  └─ build graph → cleanup legacy bookkeeping → prune orphans
//!                     → execute with checkpoints → project status
//! delete:    load state → teardown graph → execute → drop state
//! ```

use crate::context::Context;
use crate::diff::{self, Plan};
use crate::error::{FlowError, ReconcileError, Result};
use crate::executor::{ExecutionReport, Executor, ExecutorOptions};
use crate::graph::Graph;
use crate::migration::{LegacyReconciler, MigrationGate};
use crate::spec::InfraSpec;
use crate::state::{FlowState, StateStore};
use crate::status::{self, InfrastructureStatus};
use infraflow_cloud::ProviderClients;
use std::sync::Arc;
use tracing::{debug, info, instrument};

pub struct Reconciler {
    clients: ProviderClients,
    store: Arc<dyn StateStore>,
    gate: Arc<dyn MigrationGate>,
    legacy: Option<Arc<dyn LegacyReconciler>>,
    options: ExecutorOptions,
}

impl Reconciler {
    pub fn new(
        clients: ProviderClients,
        store: Arc<dyn StateStore>,
        gate: Arc<dyn MigrationGate>,
    ) -> Self {
        Self {
            clients,
            store,
            gate,
            legacy: None,
            options: ExecutorOptions::default(),
        }
    }

    pub fn with_legacy(mut self, legacy: Arc<dyn LegacyReconciler>) -> Self {
        self.legacy = Some(legacy);
        self
    }

    pub fn with_options(mut self, options: ExecutorOptions) -> Self {
        self.options = options;
        self
    }

    fn executor(&self) -> Executor {
        Executor::new(self.clients.clone(), self.store.clone()).with_options(self.options.clone())
    }

    fn legacy(&self) -> Result<&Arc<dyn LegacyReconciler>> {
        self.legacy.as_ref().ok_or(ReconcileError::LegacyUnavailable)
    }

    /// Converge the instance towards `spec`
    ///
    /// On partial failure the error carries the status projected from what
    /// did succeed; the next call retries only the unfinished steps.
    #[instrument(skip_all, fields(instance = %instance_id))]
    pub async fn reconcile(
        &self,
        ctx: &Context,
        spec: &InfraSpec,
        instance_id: &str,
    ) -> Result<InfrastructureStatus> {
        let prior = self.store.load(instance_id).await?;
        if !self
            .gate
            .should_use_flow(instance_id, prior.as_ref(), spec)
            .await?
        {
            info!("Reconciling through the legacy path");
            return Ok(self.legacy()?.reconcile(ctx, spec, instance_id).await?);
        }

        let graph = Graph::build(spec, instance_id)?;
        if self.gate.has_legacy_state(instance_id).await? {
            info!("Taking over from the legacy path");
            self.gate.cleanup_legacy_state(instance_id).await?;
        }

        let mut state = prior.unwrap_or_else(|| FlowState::new(instance_id));
        let graph = self.prune(graph, &mut state, instance_id).await?;

        let result = self.executor().execute(ctx, &graph, &mut state).await;
        let status = status::project(&state, spec);
        match result {
            Ok(report) => {
                log_report(&report);
                Ok(status)
            }
            Err(FlowError::StepsFailed(failures)) => Err(ReconcileError::PartialFailure {
                status: Box::new(status),
                failures,
            }),
            Err(FlowError::Cancelled) => Err(ReconcileError::Cancelled),
            Err(FlowError::Persistence(e)) => Err(ReconcileError::Persistence(e)),
        }
    }

    /// Add removal steps for recorded resources that left the spec
    async fn prune(&self, graph: Graph, state: &mut FlowState, instance_id: &str) -> Result<Graph> {
        let targets: Vec<_> = state
            .steps
            .iter()
            .filter(|(id, record)| {
                !graph.contains(id) && record.target.managed && record.was_attempted()
            })
            .map(|(id, record)| (id.as_str(), &record.target))
            .collect();
        let has_orphans = state.steps.keys().any(|id| !graph.contains(id));
        if !has_orphans {
            return Ok(graph);
        }

        let observed = diff::observe(&self.clients, targets).await?;
        let orphans = diff::orphans(&graph, state, &observed, instance_id);
        for id in &orphans.forget {
            state.remove(id);
        }

        let deletions: Vec<String> = orphans
            .deletions
            .into_iter()
            .map(|op| op.step_id)
            .collect();
        if !deletions.is_empty() {
            info!(steps = ?deletions, "Pruning resources no longer in the spec");
        }
        Ok(graph.with_removals(&deletions, state)?)
    }

    /// Remove every resource this instance created, then its flow state
    #[instrument(skip_all, fields(instance = %instance_id))]
    pub async fn delete(&self, ctx: &Context, instance_id: &str) -> Result<()> {
        let Some(mut state) = self.store.load(instance_id).await? else {
            if self.gate.has_legacy_state(instance_id).await? {
                info!("Deleting through the legacy path");
                self.legacy()?.delete(ctx, instance_id).await?;
            } else {
                debug!("No flow state, nothing to delete");
            }
            return Ok(());
        };

        let graph = Graph::teardown(&state)?;
        match self.executor().execute(ctx, &graph, &mut state).await {
            Ok(report) => log_report(&report),
            Err(FlowError::StepsFailed(failures)) => {
                return Err(ReconcileError::DeletionIncomplete { failures });
            }
            Err(FlowError::Cancelled) => return Err(ReconcileError::Cancelled),
            Err(FlowError::Persistence(e)) => return Err(ReconcileError::Persistence(e)),
        }

        self.store.delete(instance_id).await?;
        info!("Deleted infrastructure and flow state");
        Ok(())
    }

    /// Dry run: what a reconcile would change right now
    pub async fn plan(&self, spec: &InfraSpec, instance_id: &str) -> Result<Plan> {
        let graph = Graph::build(spec, instance_id)?;
        let prior = self.store.load(instance_id).await?;
        let observed = diff::observe_all(&self.clients, &graph, prior.as_ref()).await?;
        Ok(diff::diff(&graph, &observed, prior.as_ref(), instance_id))
    }

    /// Status projected from the persisted state, if any
    pub async fn status(
        &self,
        spec: &InfraSpec,
        instance_id: &str,
    ) -> Result<Option<InfrastructureStatus>> {
        let state = self.store.load(instance_id).await?;
        Ok(state.map(|s| status::project(&s, spec)))
    }

    pub async fn state(&self, instance_id: &str) -> Result<Option<FlowState>> {
        Ok(self.store.load(instance_id).await?)
    }
}

fn log_report(report: &ExecutionReport) {
    info!(
        applied = report.applied.len(),
        removed = report.removed.len(),
        unchanged = report.unchanged,
        duration_ms = report.duration.as_millis() as u64,
        "Flow completed"
    );
}
