//! GCP provider error types

use infraflow_cloud::CloudError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GcpError {
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Cloud error: {0}")]
    Cloud(#[from] CloudError),
}

pub type Result<T> = std::result::Result<T, GcpError>;

/// Map a transport-level failure onto the provider-neutral taxonomy
pub(crate) fn from_reqwest(err: reqwest::Error) -> CloudError {
    if err.is_timeout() {
        CloudError::Timeout(err.to_string())
    } else if err.is_connect() || err.is_request() {
        CloudError::Network(err.to_string())
    } else if err.is_decode() {
        CloudError::ApiError {
            status: 0,
            message: format!("undecodable response: {}", err),
        }
    } else if let Some(status) = err.status() {
        CloudError::from_status(status.as_u16(), err.to_string())
    } else {
        CloudError::Network(err.to_string())
    }
}
