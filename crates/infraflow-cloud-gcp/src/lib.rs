//! Google Cloud provider for infraflow
//!
//! This crate implements the `NetworkClient` and `IamClient` traits from
//! `infraflow-cloud` against the public Google Cloud REST APIs.
//!
//! # Features
//!
//! - VPC networks, subnetworks, Cloud Routers and Cloud NAT (Compute v1)
//! - Firewall rules and static address lookup
//! - Service accounts (IAM v1) and project role bindings (Resource Manager v1)
//!
//! # Requirements
//!
//! - `GOOGLE_CLOUD_ACCESS_TOKEN` env var holding an OAuth2 access token
//!   (e.g. `gcloud auth print-access-token`)
//!
//! # Example
//!
//! ```ignore
//! use infraflow_cloud_gcp::{GcpConfig, clients};
//!
//! let config = GcpConfig::from_env()?;
//! let clients = clients(&config)?;
//!
//! let network = clients.network.get_network("my-project", "shoot--dev--a").await?;
//! ```

pub mod api;
pub mod compute;
pub mod error;
pub mod iam;

pub use api::GcpConfig;
pub use compute::GcpNetworkClient;
pub use error::{GcpError, Result};
pub use iam::GcpIamClient;

use infraflow_cloud::ProviderClients;
use std::sync::Arc;

/// Build the provider client handle for the given configuration
pub fn clients(config: &GcpConfig) -> Result<ProviderClients> {
    Ok(ProviderClients::new(
        Arc::new(GcpNetworkClient::new(config)?),
        Arc::new(GcpIamClient::new(config)?),
    ))
}
