//! Cloud provider error types

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Cloud provider errors
#[derive(Error, Debug)]
pub enum CloudError {
    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Resource already exists: {0}")]
    AlreadyExists(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimited(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Concurrent modification (etag mismatch, resource not ready)
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("API error ({status}): {message}")]
    ApiError { status: u16, message: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Whether an error may succeed when retried
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Transient,
    Permanent,
}

impl CloudError {
    /// Map an HTTP status code and message onto the error taxonomy
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            400 => CloudError::InvalidArgument(message),
            401 => CloudError::PermissionDenied(message),
            403 if message.to_lowercase().contains("quota") => CloudError::QuotaExceeded(message),
            403 => CloudError::PermissionDenied(message),
            404 => CloudError::NotFound(message),
            409 => CloudError::AlreadyExists(message),
            412 => CloudError::Conflict(message),
            429 => CloudError::RateLimited(message),
            500..=599 => CloudError::Unavailable(message),
            _ => CloudError::ApiError { status, message },
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            CloudError::RateLimited(_)
            | CloudError::Unavailable(_)
            | CloudError::Timeout(_)
            | CloudError::Network(_)
            | CloudError::Conflict(_) => ErrorClass::Transient,
            CloudError::NotFound(_)
            | CloudError::AlreadyExists(_)
            | CloudError::PermissionDenied(_)
            | CloudError::QuotaExceeded(_)
            | CloudError::InvalidArgument(_)
            | CloudError::ApiError { .. }
            | CloudError::Json(_) => ErrorClass::Permanent,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, CloudError::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, CloudError>;
