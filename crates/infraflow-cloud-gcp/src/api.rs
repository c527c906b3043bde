//! Shared REST plumbing for Google Cloud APIs
//!
//! Bearer-token authenticated JSON requests, GCP error-body decoding and the
//! ownership marker stored in resource descriptions.

use crate::error::{GcpError, Result, from_reqwest};
use infraflow_cloud::CloudError;
use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;

pub const COMPUTE_API_BASE: &str = "https://compute.googleapis.com/compute/v1";
pub const IAM_API_BASE: &str = "https://iam.googleapis.com/v1";
pub const RESOURCE_MANAGER_API_BASE: &str = "https://cloudresourcemanager.googleapis.com/v1";

const OWNER_MARKER_PREFIX: &str = "infraflow:owner=";

/// Configuration for the GCP clients
#[derive(Debug, Clone)]
pub struct GcpConfig {
    /// OAuth2 access token; refreshing it is the caller's concern
    pub access_token: String,
    pub compute_endpoint: String,
    pub iam_endpoint: String,
    pub resource_manager_endpoint: String,
    /// Per-request timeout
    pub request_timeout: Duration,
    /// Upper bound for waiting on a long-running compute operation
    pub operation_timeout: Duration,
}

impl GcpConfig {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            compute_endpoint: COMPUTE_API_BASE.to_string(),
            iam_endpoint: IAM_API_BASE.to_string(),
            resource_manager_endpoint: RESOURCE_MANAGER_API_BASE.to_string(),
            request_timeout: Duration::from_secs(30),
            operation_timeout: Duration::from_secs(300),
        }
    }

    /// Create GcpConfig from environment variables
    ///
    /// `GOOGLE_CLOUD_ACCESS_TOKEN` is required; `INFRAFLOW_GCP_COMPUTE_ENDPOINT`,
    /// `INFRAFLOW_GCP_IAM_ENDPOINT` and `INFRAFLOW_GCP_RESOURCE_MANAGER_ENDPOINT`
    /// override the public endpoints.
    pub fn from_env() -> Result<Self> {
        let token = std::env::var("GOOGLE_CLOUD_ACCESS_TOKEN")
            .map_err(|_| GcpError::MissingEnvVar("GOOGLE_CLOUD_ACCESS_TOKEN".to_string()))?;
        if token.trim().is_empty() {
            return Err(GcpError::InvalidConfig(
                "GOOGLE_CLOUD_ACCESS_TOKEN is empty".to_string(),
            ));
        }

        let mut config = Self::new(token.trim());
        if let Ok(endpoint) = std::env::var("INFRAFLOW_GCP_COMPUTE_ENDPOINT") {
            config.compute_endpoint = endpoint;
        }
        if let Ok(endpoint) = std::env::var("INFRAFLOW_GCP_IAM_ENDPOINT") {
            config.iam_endpoint = endpoint;
        }
        if let Ok(endpoint) = std::env::var("INFRAFLOW_GCP_RESOURCE_MANAGER_ENDPOINT") {
            config.resource_manager_endpoint = endpoint;
        }
        Ok(config)
    }
}

/// Description text carrying the ownership marker
pub fn owner_description(owner: Option<&str>) -> Option<String> {
    owner.map(|o| format!("{}{}", OWNER_MARKER_PREFIX, o))
}

/// Extract the ownership marker from a description
pub fn parse_owner(description: Option<&str>) -> Option<String> {
    description?
        .split_whitespace()
        .find_map(|word| word.strip_prefix(OWNER_MARKER_PREFIX))
        .filter(|owner| !owner.is_empty())
        .map(str::to_string)
}

/// Thin authenticated JSON client
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    access_token: String,
}

impl ApiClient {
    pub fn new(config: &GcpConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            http,
            access_token: config.access_token.clone(),
        })
    }

    /// GET a resource; 404 maps to `None`
    pub async fn get<T: DeserializeOwned>(&self, url: &str) -> infraflow_cloud::Result<Option<T>> {
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(from_reqwest)?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Self::decode(response).await.map(Some)
    }

    pub async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        url: &str,
        body: &B,
    ) -> infraflow_cloud::Result<T> {
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.access_token)
            .json(body)
            .send()
            .await
            .map_err(from_reqwest)?;
        Self::decode(response).await
    }

    pub async fn patch<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        url: &str,
        body: &B,
    ) -> infraflow_cloud::Result<T> {
        let response = self
            .http
            .patch(url)
            .bearer_auth(&self.access_token)
            .json(body)
            .send()
            .await
            .map_err(from_reqwest)?;
        Self::decode(response).await
    }

    pub async fn delete<T: DeserializeOwned>(&self, url: &str) -> infraflow_cloud::Result<T> {
        let response = self
            .http
            .delete(url)
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(from_reqwest)?;
        Self::decode(response).await
    }

    async fn decode<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> infraflow_cloud::Result<T> {
        let status = response.status();
        let body = response.text().await.map_err(from_reqwest)?;

        if !status.is_success() {
            return Err(error_from_body(status.as_u16(), &body));
        }
        Ok(serde_json::from_str(&body)?)
    }
}

// ============ Error Body ============

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: Option<String>,
}

/// Decode a GCP error response (`{"error": {"code", "message", "status"}}`)
pub(crate) fn error_from_body(status: u16, body: &str) -> CloudError {
    match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(envelope) => {
            let message = match envelope.error.status {
                Some(code) if !code.is_empty() => format!("{}: {}", code, envelope.error.message),
                _ => envelope.error.message,
            };
            CloudError::from_status(status, message)
        }
        Err(_) => CloudError::from_status(status, body.trim().to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owner_marker_roundtrip() {
        let description = owner_description(Some("shoot--dev--a")).unwrap();
        assert_eq!(description, "infraflow:owner=shoot--dev--a");
        assert_eq!(
            parse_owner(Some(&description)),
            Some("shoot--dev--a".to_string())
        );
        assert_eq!(parse_owner(Some("created by terraform")), None);
        assert_eq!(parse_owner(None), None);
        assert_eq!(parse_owner(Some("infraflow:owner=")), None);
    }

    #[test]
    fn test_error_from_body() {
        let body = r#"{"error":{"code":429,"message":"Rate Limit Exceeded","status":"RESOURCE_EXHAUSTED"}}"#;
        let err = error_from_body(429, body);
        assert!(matches!(err, CloudError::RateLimited(_)));
        assert!(err.to_string().contains("RESOURCE_EXHAUSTED"));

        let err = error_from_body(
            403,
            r#"{"error":{"code":403,"message":"Quota 'SUBNETWORKS' exceeded."}}"#,
        );
        assert!(matches!(err, CloudError::QuotaExceeded(_)));

        let err = error_from_body(502, "<html>bad gateway</html>");
        assert!(err.is_transient());
    }

    #[test]
    fn test_config_from_env() {
        temp_env::with_vars(
            [
                ("GOOGLE_CLOUD_ACCESS_TOKEN", Some("ya29.token")),
                ("INFRAFLOW_GCP_COMPUTE_ENDPOINT", Some("http://localhost:8080")),
            ],
            || {
                let config = GcpConfig::from_env().unwrap();
                assert_eq!(config.access_token, "ya29.token");
                assert_eq!(config.compute_endpoint, "http://localhost:8080");
                assert_eq!(config.iam_endpoint, IAM_API_BASE);
            },
        );

        temp_env::with_var_unset("GOOGLE_CLOUD_ACCESS_TOKEN", || {
            assert!(matches!(
                GcpConfig::from_env(),
                Err(GcpError::MissingEnvVar(_))
            ));
        });
    }
}
