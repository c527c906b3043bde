//! infraflow cloud provider abstraction
//!
//! This crate defines the typed client contracts the reconciler depends on.
//! Concrete providers (see `infraflow-cloud-gcp`) implement them; the core
//! never sees transports or wire formats.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │                 infraflow-core                   │
//! │       (graph, executor, flow state, status)      │
//! └─────────────────┬───────────────────────────────┘
//!                   │ ProviderClients
//! ┌─────────────────▼───────────────────────────────┐
//! │               infraflow-cloud                    │
//! │  ┌──────────────────┐  ┌──────────────────────┐ │
//! │  │ trait NetworkClient│ │   trait IamClient    │ │
//! │  └──────────────────┘  └──────────────────────┘ │
//! └───────┬─────────────────┬───────────────────────┘
//!         │                 │
//! ┌───────▼───────┐ ┌───────▼───────┐
//! │  GCP (REST)   │ │   in-memory   │
//! │   provider    │ │ (test-utils)  │
//! └───────────────┘ └───────────────┘
//! ```

pub mod error;
#[cfg(any(test, feature = "test-utils"))]
pub mod memory;
pub mod provider;
pub mod resource;

// Re-exports
pub use error::{CloudError, ErrorClass, Result};
#[cfg(any(test, feature = "test-utils"))]
pub use memory::{Fault, InMemoryCloud};
pub use provider::{IamClient, NetworkClient, ProviderClients, RetryConfig};
pub use resource::{
    Address, Direction, FirewallAllowed, FirewallRule, FlowLogs, Nat, Network, ResourceKind,
    Router, RoutingMode, ServiceAccount, Subnetwork, resource_name, same_resource,
};
