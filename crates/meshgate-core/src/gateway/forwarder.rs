//! Downstream call seam

use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use thiserror::Error;

use super::types::{GatewayRequest, GatewayResponse};
use crate::registry::ServiceInstance;

/// Hop-by-hop headers never copied onto the forwarded request
const SKIPPED_HEADERS: &[&str] = &[
    "connection",
    "content-length",
    "host",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ForwardError {
    /// The instance advertised no host to call
    #[error("Instance '{0}' has no reachable address")]
    NoAddress(String),

    /// The request could not be expressed as an HTTP call
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Downstream call timed out")]
    Timeout,
}

impl From<reqwest::Error> for ForwardError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            Self::Timeout
        } else {
            Self::Network(error.to_string())
        }
    }
}

/// Sends one request to one instance
///
/// Any HTTP status counts as a response; only transport-level failures are errors.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Forwarder: Send + Sync {
    async fn forward(
        &self,
        instance: &ServiceInstance,
        request: &GatewayRequest,
    ) -> Result<GatewayResponse, ForwardError>;
}

/// Forwards over HTTP to `http://host:port` taken from instance metadata
#[derive(Debug, Clone)]
pub struct HttpForwarder {
    client: Client,
}

impl HttpForwarder {
    pub fn new() -> Self {
        let client = Client::builder().build().unwrap_or_default();
        Self { client }
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    fn headers(request: &GatewayRequest) -> Result<HeaderMap, ForwardError> {
        let mut headers = HeaderMap::new();
        for (name, value) in &request.headers {
            if SKIPPED_HEADERS.contains(&name.to_ascii_lowercase().as_str()) {
                continue;
            }
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| ForwardError::InvalidRequest(format!("header '{}': {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| ForwardError::InvalidRequest(format!("header '{}': {}", name, e)))?;
            headers.append(name, value);
        }
        headers.insert(
            HeaderName::from_static("x-request-id"),
            HeaderValue::from_str(&request.request_id)
                .map_err(|e| ForwardError::InvalidRequest(e.to_string()))?,
        );
        Ok(headers)
    }
}

impl Default for HttpForwarder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Forwarder for HttpForwarder {
    async fn forward(
        &self,
        instance: &ServiceInstance,
        request: &GatewayRequest,
    ) -> Result<GatewayResponse, ForwardError> {
        let base = instance
            .base_url()
            .ok_or_else(|| ForwardError::NoAddress(instance.id.clone()))?;
        let url = format!("{}/{}", base, request.path.trim_start_matches('/'));
        let method = reqwest::Method::from_bytes(request.method.to_ascii_uppercase().as_bytes())
            .map_err(|e| ForwardError::InvalidRequest(e.to_string()))?;

        tracing::debug!(instance = %instance.id, method = %method, url = %url, "Forwarding request");

        let response = self
            .client
            .request(method, &url)
            .query(&request.query)
            .headers(Self::headers(request)?)
            .body(request.body.clone())
            .send()
            .await?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_string(), value.to_string()))
            })
            .collect();
        let body = response.bytes().await?.to_vec();

        Ok(GatewayResponse {
            status,
            headers,
            body,
        })
    }
}
