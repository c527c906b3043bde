//! Error types for the reconciler
//!
//! The layering mirrors the control flow: [`SpecError`] for input problems,
//! [`StepError`] for a single step, [`FlowError`] for an executor run and
//! [`ReconcileError`] at the public entry points.

use crate::status::InfrastructureStatus;
use infraflow_cloud::{CloudError, ErrorClass};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Invalid or unreadable desired-state document
#[derive(Error, Debug)]
pub enum SpecError {
    #[error("Failed to read spec {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse spec: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid spec: {}", .0.join("; "))]
    Invalid(Vec<String>),

    #[error("Step {step} depends on unknown step {dependency}")]
    UnknownDependency { step: String, dependency: String },

    #[error("Duplicate step id: {0}")]
    DuplicateStep(String),

    /// Steps are generated, so a cycle means the graph builder is wrong
    #[error("Dependency cycle detected at step {0}")]
    Cycle(String),
}

/// Flow state persistence failures
#[derive(Error, Debug)]
pub enum StateError {
    #[error("State I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("State encoding error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("State version {found} is newer than supported version {supported}")]
    UnsupportedVersion { found: u32, supported: u32 },

    #[error("State store unavailable: {0}")]
    Unavailable(String),
}

/// Failure of a single step invocation
#[derive(Error, Debug)]
pub enum StepError {
    #[error(transparent)]
    Cloud(#[from] CloudError),

    #[error("Step timed out after {0:?}")]
    Timeout(Duration),

    #[error("Immutable fields changed on {resource}: {}", .fields.join(", "))]
    Drift {
        resource: String,
        fields: Vec<String>,
    },

    #[error("{resource} is owned by {owner}")]
    Ownership { resource: String, owner: String },

    #[error("Required resource not found: {0}")]
    Missing(String),

    #[error("Dependency output unavailable: {0}")]
    Dependency(String),
}

impl StepError {
    pub fn class(&self) -> ErrorClass {
        match self {
            StepError::Cloud(err) => err.class(),
            StepError::Timeout(_) => ErrorClass::Transient,
            StepError::Drift { .. }
            | StepError::Ownership { .. }
            | StepError::Missing(_)
            | StepError::Dependency(_) => ErrorClass::Permanent,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            StepError::Cloud(err) => ErrorCode::for_cloud(err),
            StepError::Timeout(_) => Some(ErrorCode::Unavailable),
            StepError::Drift { .. } => Some(ErrorCode::Drift),
            StepError::Ownership { .. } => Some(ErrorCode::OwnershipConflict),
            StepError::Missing(_) => Some(ErrorCode::ConfigurationProblem),
            StepError::Dependency(_) => None,
        }
    }
}

/// Stable error codes reported to the calling control loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    #[serde(rename = "ERR_INFRA_RATE_LIMIT")]
    RateLimit,
    #[serde(rename = "ERR_INFRA_UNAUTHORIZED")]
    Unauthorized,
    #[serde(rename = "ERR_INFRA_QUOTA_EXCEEDED")]
    QuotaExceeded,
    #[serde(rename = "ERR_INFRA_DRIFT")]
    Drift,
    #[serde(rename = "ERR_INFRA_OWNERSHIP_CONFLICT")]
    OwnershipConflict,
    #[serde(rename = "ERR_INFRA_UNAVAILABLE")]
    Unavailable,
    #[serde(rename = "ERR_CONFIGURATION_PROBLEM")]
    ConfigurationProblem,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::RateLimit => "ERR_INFRA_RATE_LIMIT",
            ErrorCode::Unauthorized => "ERR_INFRA_UNAUTHORIZED",
            ErrorCode::QuotaExceeded => "ERR_INFRA_QUOTA_EXCEEDED",
            ErrorCode::Drift => "ERR_INFRA_DRIFT",
            ErrorCode::OwnershipConflict => "ERR_INFRA_OWNERSHIP_CONFLICT",
            ErrorCode::Unavailable => "ERR_INFRA_UNAVAILABLE",
            ErrorCode::ConfigurationProblem => "ERR_CONFIGURATION_PROBLEM",
        }
    }

    pub fn for_cloud(err: &CloudError) -> Option<Self> {
        match err {
            CloudError::RateLimited(_) => Some(ErrorCode::RateLimit),
            CloudError::PermissionDenied(_) => Some(ErrorCode::Unauthorized),
            CloudError::QuotaExceeded(_) => Some(ErrorCode::QuotaExceeded),
            CloudError::InvalidArgument(_) => Some(ErrorCode::ConfigurationProblem),
            CloudError::Unavailable(_)
            | CloudError::Timeout(_)
            | CloudError::Network(_)
            | CloudError::Conflict(_) => Some(ErrorCode::Unavailable),
            _ => None,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A step that ended the run in `failed`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepFailure {
    pub step_id: String,
    pub message: String,
    pub code: Option<ErrorCode>,
    pub attempts: u32,
}

impl std::fmt::Display for StepFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.step_id, self.message)
    }
}

/// Executor run failures
#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Failed to persist flow state: {0}")]
    Persistence(#[from] StateError),

    #[error("Flow cancelled")]
    Cancelled,

    #[error("{} step(s) failed: {}", .0.len(), summarize(.0))]
    StepsFailed(Vec<StepFailure>),
}

/// Migration gate and legacy path failures
#[derive(Error, Debug)]
pub enum GateError {
    #[error("Legacy bookkeeping I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Legacy reconciliation failed: {0}")]
    Legacy(String),
}

/// Errors returned by [`Reconciler`](crate::Reconciler) entry points
#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error(transparent)]
    Spec(#[from] SpecError),

    #[error("Failed to persist flow state: {0}")]
    Persistence(#[from] StateError),

    #[error("Migration gate error: {0}")]
    Gate(#[from] GateError),

    #[error("Failed to observe resources: {0}")]
    Observe(#[from] CloudError),

    #[error("Legacy path selected but no legacy reconciler is configured")]
    LegacyUnavailable,

    #[error("Reconciliation cancelled")]
    Cancelled,

    #[error(
        "Reconciliation incomplete, {} step(s) failed: {}",
        .failures.len(),
        summarize(.failures)
    )]
    PartialFailure {
        /// Status projected from whatever did succeed
        status: Box<InfrastructureStatus>,
        failures: Vec<StepFailure>,
    },

    #[error("Deletion incomplete, {} step(s) failed: {}", .failures.len(), summarize(.failures))]
    DeletionIncomplete { failures: Vec<StepFailure> },
}

impl ReconcileError {
    /// Error codes summarising this failure, deduplicated and sorted
    pub fn codes(&self) -> Vec<ErrorCode> {
        let mut codes: Vec<ErrorCode> = match self {
            ReconcileError::Spec(_) => vec![ErrorCode::ConfigurationProblem],
            ReconcileError::Observe(err) => ErrorCode::for_cloud(err).into_iter().collect(),
            ReconcileError::PartialFailure { failures, .. }
            | ReconcileError::DeletionIncomplete { failures } => {
                failures.iter().filter_map(|f| f.code).collect()
            }
            _ => Vec::new(),
        };
        codes.sort();
        codes.dedup();
        codes
    }

    pub fn failures(&self) -> &[StepFailure] {
        match self {
            ReconcileError::PartialFailure { failures, .. }
            | ReconcileError::DeletionIncomplete { failures } => failures,
            _ => &[],
        }
    }
}

fn summarize(failures: &[StepFailure]) -> String {
    failures
        .iter()
        .map(|f| f.step_id.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

pub type Result<T> = std::result::Result<T, ReconcileError>;
