//! infraflow core
//!
//! A flow-based infrastructure reconciler. The desired state of one instance
//! (VPC network, subnets, router, NAT, firewall rules, service accounts) is
//! turned into a DAG of idempotent steps which are executed against the
//! provider clients with bounded retries and concurrency. Progress is
//! checkpointed after every step so that any later call resumes where the
//! previous one stopped.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                     Reconciler                        │
//! │   reconcile(ctx, spec, id)        delete(ctx, id)     │
//! └──────┬──────────────┬──────────────────┬──────────────┘
//!        │              │                  │
//! ┌──────▼──────┐ ┌─────▼──────┐  ┌────────▼─────────┐
//! │ Migration   │ │   Graph    │  │     Executor     │
//! │   Gate      │ │  + Differ  │  │ (handlers, retry)│
//! └─────────────┘ └────────────┘  └───┬──────────┬───┘
//!                                     │          │
//!                            ┌────────▼───┐ ┌────▼──────────┐
//!                            │ StateStore │ │ProviderClients│
//!                            └────────────┘ └───────────────┘
//! ```

pub mod context;
pub mod diff;
pub mod error;
pub mod executor;
pub mod graph;
pub mod handlers;
pub mod migration;
pub mod naming;
pub mod reconciler;
pub mod spec;
pub mod state;
pub mod status;
pub mod step;

// Re-exports
pub use context::{CancelHandle, Context};
pub use diff::{ObservedState, Operation, OperationType, Plan, PlanSummary};
pub use error::{
    ErrorCode, FlowError, GateError, ReconcileError, Result, SpecError, StateError, StepError,
    StepFailure,
};
pub use executor::{ExecutionReport, Executor, ExecutorOptions};
pub use graph::Graph;
pub use migration::{FileMigrationGate, LegacyReconciler, MigrationGate, USE_FLOW_ANNOTATION};
pub use reconciler::Reconciler;
pub use spec::InfraSpec;
pub use state::{
    FileStateStore, FlowState, MemoryStateStore, STATE_VERSION, StateStore, StepRecord,
    StepStatus,
};
pub use status::{InfrastructureStatus, project};
pub use step::{Intent, ResourceRef, Step, StepOutput, StepTask};
