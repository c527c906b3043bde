//! Flow executor
//!
//! Walks a [`Graph`], running every step whose dependencies are satisfied on
//! a bounded pool of in-flight futures. The executor is the single writer of
//! the [`FlowState`]: each terminal transition is applied and saved before
//! anything else is scheduled, so a crash never loses a `succeeded` step.
//!
//! A succeeded step whose output changed re-queues the succeeded ensure steps
//! that depend on it, since they resolved their inputs from the old output.
//!
//! A step is ready when
//! - it has not run in this call and is not running,
//! - an ensure step is `pending` or `failed` (a removal step still has a record),
//! - every ensure dependency is `succeeded` and every removal dependency is gone.

use crate::context::Context;
use crate::error::{FlowError, StepError, StepFailure};
use crate::graph::Graph;
use crate::handlers::{self, StepContext};
use crate::state::{FlowState, StateStore, StepStatus};
use crate::step::{Step, StepOutput, StepTask};
use futures_util::stream::{FuturesUnordered, StreamExt};
use infraflow_cloud::{ProviderClients, RetryConfig};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

/// Default number of steps running at once
pub const DEFAULT_MAX_CONCURRENCY: usize = 4;

/// Default bound on a single step invocation
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    pub max_concurrency: usize,
    pub retry: RetryConfig,
    /// Applied to every attempt; exceeding it is a transient failure
    pub step_timeout: Duration,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            retry: RetryConfig::default(),
            step_timeout: DEFAULT_STEP_TIMEOUT,
        }
    }
}

/// What a completed run did
#[derive(Debug, Clone, Default)]
pub struct ExecutionReport {
    /// Ensure steps applied in this call
    pub applied: Vec<String>,
    /// Removal steps completed in this call
    pub removed: Vec<String>,
    /// Ensure steps already succeeded with the same definition
    pub unchanged: usize,
    pub duration: Duration,
}

enum StepResult {
    Succeeded(StepOutput),
    Failed(StepError),
    Cancelled,
}

struct StepOutcome {
    step_id: String,
    remove: bool,
    attempts: u32,
    result: StepResult,
}

pub struct Executor {
    clients: ProviderClients,
    store: Arc<dyn StateStore>,
    options: ExecutorOptions,
}

impl Executor {
    pub fn new(clients: ProviderClients, store: Arc<dyn StateStore>) -> Self {
        Self {
            clients,
            store,
            options: ExecutorOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ExecutorOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &ExecutorOptions {
        &self.options
    }

    /// Run every ready step until none is left
    ///
    /// Step failures do not stop independent branches; they are collected
    /// into [`FlowError::StepsFailed`] once nothing else can run. A failed
    /// save aborts immediately with [`FlowError::Persistence`].
    #[instrument(skip_all, fields(instance = %state.instance_id, steps = graph.len()))]
    pub async fn execute(
        &self,
        ctx: &Context,
        graph: &Graph,
        state: &mut FlowState,
    ) -> Result<ExecutionReport, FlowError> {
        let started = Instant::now();
        state.sync(graph.steps());
        self.store.save(state).await?;

        let mut report = ExecutionReport {
            unchanged: graph
                .ensure_steps()
                .filter(|s| state.status(&s.id) == Some(StepStatus::Succeeded))
                .count(),
            ..Default::default()
        };
        let mut failures = Vec::new();
        let mut visited: HashSet<String> = HashSet::new();
        let mut in_flight = FuturesUnordered::new();
        let mut cancelled = false;
        let mut interrupted = false;
        let limit = self.options.max_concurrency.max(1);

        loop {
            if ctx.is_cancelled() {
                cancelled = true;
            }

            while !cancelled && in_flight.len() < limit {
                let Some(step) = next_ready(graph, state, &visited) else {
                    break;
                };
                visited.insert(step.id.clone());

                // Nothing was ever created for this record
                let attempted = state.get(&step.id).is_some_and(|r| r.was_attempted());
                if step.is_remove() && !attempted {
                    debug!(step = %step.id, "Dropping record of never-created {}", step.target);
                    state.remove(&step.id);
                    self.store.save(state).await?;
                    continue;
                }

                debug!(step = %step.id, "Starting step");
                state.mark_running(&step.id);
                let step_ctx = self.step_context(graph, state, step);
                in_flight.push(self.run_step(ctx, step.clone(), step_ctx));
            }

            let Some(outcome) = in_flight.next().await else {
                break;
            };
            state.clear_running(&outcome.step_id);

            match outcome.result {
                StepResult::Succeeded(output) => {
                    if outcome.remove {
                        info!(step = %outcome.step_id, "Removed");
                        state.remove(&outcome.step_id);
                        report.removed.push(outcome.step_id);
                    } else {
                        info!(
                            step = %outcome.step_id,
                            attempts = outcome.attempts,
                            "Step succeeded"
                        );
                        let changed = state
                            .get(&outcome.step_id)
                            .and_then(|r| r.result.as_ref())
                            != Some(&output);
                        state.record_success(&outcome.step_id, output, outcome.attempts);
                        if changed {
                            requeue_dependents(graph, state, &outcome.step_id);
                        }
                        report.applied.push(outcome.step_id);
                    }
                }
                StepResult::Failed(err) => {
                    warn!(
                        step = %outcome.step_id,
                        attempts = outcome.attempts,
                        error = %err,
                        "Step failed"
                    );
                    state.record_failure(&outcome.step_id, err.to_string(), outcome.attempts);
                    failures.push(StepFailure {
                        step_id: outcome.step_id,
                        message: err.to_string(),
                        code: err.code(),
                        attempts: outcome.attempts,
                    });
                }
                StepResult::Cancelled => {
                    // The persisted status stays at its pre-cancellation value
                    debug!(step = %outcome.step_id, "Step interrupted");
                    cancelled = true;
                    interrupted = true;
                    continue;
                }
            }
            self.store.save(state).await?;
        }

        report.duration = started.elapsed();
        let remaining = blocked(graph, state, &visited);
        if interrupted || (cancelled && !remaining.is_empty()) {
            return Err(FlowError::Cancelled);
        }
        if failures.is_empty() {
            failures = remaining;
        }
        if !failures.is_empty() {
            return Err(FlowError::StepsFailed(failures));
        }
        Ok(report)
    }

    /// Outputs of the ensure dependencies, copied at schedule time
    fn step_context(&self, graph: &Graph, state: &FlowState, step: &Step) -> StepContext {
        let dependencies = step
            .depends_on
            .iter()
            .filter(|dep| graph.get(dep).is_some_and(|d| !d.is_remove()))
            .filter_map(|dep| {
                let record = state.get(dep)?;
                let output = state.output(dep).cloned().unwrap_or_default();
                Some((record.target.clone(), output))
            })
            .collect();
        StepContext {
            clients: self.clients.clone(),
            instance_id: state.instance_id.clone(),
            dependencies,
            adopted: state.get(&step.id).is_some_and(|r| r.adopted()),
        }
    }

    /// One step with bounded retries for transient errors
    async fn run_step(&self, ctx: &Context, step: Step, step_ctx: StepContext) -> StepOutcome {
        let max_attempts = self.options.retry.max_attempts.max(1);
        let timeout = self.options.step_timeout;
        let outcome = |attempts, result| StepOutcome {
            step_id: step.id.clone(),
            remove: step.is_remove(),
            attempts,
            result,
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            let call = tokio::time::timeout(timeout, handlers::apply(&step_ctx, &step));
            let result = tokio::select! {
                _ = ctx.cancelled() => return outcome(attempt, StepResult::Cancelled),
                result = call => result.unwrap_or(Err(StepError::Timeout(timeout))),
            };

            let err = match result {
                Ok(output) => return outcome(attempt, StepResult::Succeeded(output)),
                Err(err) => err,
            };
            if !err.is_transient() || attempt >= max_attempts {
                return outcome(attempt, StepResult::Failed(err));
            }

            let delay = self.options.retry.delay_for_attempt(attempt - 1);
            warn!(
                step = %step.id,
                attempt,
                error = %err,
                "Transient failure, retrying in {:?}",
                delay
            );
            tokio::select! {
                _ = ctx.cancelled() => return outcome(attempt, StepResult::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

fn next_ready<'g>(
    graph: &'g Graph,
    state: &FlowState,
    visited: &HashSet<String>,
) -> Option<&'g Step> {
    graph.steps().iter().find(|step| {
        if visited.contains(&step.id) || state.is_running(&step.id) {
            return false;
        }
        let pending = match step.task {
            StepTask::Ensure(_) => matches!(
                state.status(&step.id),
                Some(StepStatus::Pending | StepStatus::Failed)
            ),
            StepTask::Remove => state.contains(&step.id),
        };
        pending && step.depends_on.iter().all(|dep| satisfied(graph, state, dep))
    })
}

fn requeue_dependents(graph: &Graph, state: &mut FlowState, id: &str) {
    for step in graph.ensure_steps() {
        if step.depends_on.contains(id) && state.status(&step.id) == Some(StepStatus::Succeeded) {
            debug!(step = %step.id, dependency = %id, "Dependency output changed, re-queued");
            state.requeue(&step.id);
        }
    }
}

fn satisfied(graph: &Graph, state: &FlowState, dep: &str) -> bool {
    match graph.get(dep) {
        Some(step) if step.is_remove() => !state.contains(dep),
        Some(_) => state.status(dep) == Some(StepStatus::Succeeded),
        None => false,
    }
}

/// Steps that never became ready although nothing failed in this call
fn blocked(graph: &Graph, state: &FlowState, visited: &HashSet<String>) -> Vec<StepFailure> {
    graph
        .steps()
        .iter()
        .filter(|step| !visited.contains(&step.id))
        .filter(|step| match step.task {
            StepTask::Ensure(_) => state.status(&step.id) != Some(StepStatus::Succeeded),
            StepTask::Remove => state.contains(&step.id),
        })
        .map(|step| StepFailure {
            step_id: step.id.clone(),
            message: "dependencies not satisfied".to_string(),
            code: None,
            attempts: 0,
        })
        .collect()
}
