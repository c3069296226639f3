//! Error types for meshgate

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bus::BusError;
use crate::config::ConfigError;
use crate::gateway::ForwardError;

/// Result type alias for node-level operations
pub type MeshResult<T> = Result<T, MeshError>;

/// Errors from starting or running a node
#[derive(Error, Debug, Clone)]
pub enum MeshError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Failure of one routed call, as seen by the caller
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// No healthy instance of the service is known
    #[error("No healthy instance of service '{service}'")]
    NoHealthyInstance { service: String },

    /// The service's circuit breaker is open
    #[error("Circuit open for service '{service}'")]
    CircuitOpen { service: String },

    /// The downstream rejected the request as malformed or unauthorized
    #[error("Client error {status}: {message}")]
    ClientError { status: u16, message: String },

    /// The downstream did not answer within the per-attempt timeout
    #[error("Request to '{service}' timed out after {timeout_ms}ms")]
    RequestTimeout { service: String, timeout_ms: u64 },

    /// Network failure or server error downstream
    #[error("Downstream fault: {message}")]
    DownstreamFault {
        status: Option<u16>,
        message: String,
    },
}

impl GatewayError {
    pub fn no_healthy_instance(service: impl Into<String>) -> Self {
        Self::NoHealthyInstance {
            service: service.into(),
        }
    }

    pub fn circuit_open(service: impl Into<String>) -> Self {
        Self::CircuitOpen {
            service: service.into(),
        }
    }

    pub fn downstream(status: Option<u16>, message: impl Into<String>) -> Self {
        Self::DownstreamFault {
            status,
            message: message.into(),
        }
    }

    /// HTTP status surfaced to the caller
    pub fn status_code(&self) -> u16 {
        match self {
            Self::NoHealthyInstance { .. } | Self::CircuitOpen { .. } => 503,
            Self::ClientError { status, .. } => *status,
            Self::RequestTimeout { .. } | Self::DownstreamFault { .. } => 500,
        }
    }

    /// Whether another attempt may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RequestTimeout { .. } | Self::DownstreamFault { .. }
        )
    }

    /// Stable machine-readable code
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NoHealthyInstance { .. } => "NO_HEALTHY_INSTANCE",
            Self::CircuitOpen { .. } => "CIRCUIT_OPEN",
            Self::ClientError { .. } => "CLIENT_ERROR",
            Self::RequestTimeout { .. } => "REQUEST_TIMEOUT",
            Self::DownstreamFault { .. } => "DOWNSTREAM_FAULT",
        }
    }

    /// Structured body returned to the caller
    pub fn to_response(&self, request_id: &str) -> ErrorResponse {
        ErrorResponse {
            error: self.to_string(),
            code: self.error_code().to_string(),
            request_id: request_id.to_string(),
        }
    }
}

impl From<ForwardError> for GatewayError {
    fn from(error: ForwardError) -> Self {
        match error {
            // The caller's own request could not be expressed; no instance will accept it
            ForwardError::InvalidRequest(message) => Self::ClientError {
                status: 400,
                message,
            },
            other => Self::downstream(None, other.to_string()),
        }
    }
}

/// `{error, code, requestId}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    pub request_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(GatewayError::no_healthy_instance("a").status_code(), 503);
        assert_eq!(GatewayError::circuit_open("a").status_code(), 503);
        assert_eq!(
            GatewayError::ClientError {
                status: 404,
                message: "missing".to_string()
            }
            .status_code(),
            404
        );
        assert_eq!(GatewayError::downstream(Some(502), "bad gateway").status_code(), 500);
        assert_eq!(
            GatewayError::RequestTimeout {
                service: "a".to_string(),
                timeout_ms: 10
            }
            .status_code(),
            500
        );
    }

    #[test]
    fn test_forward_error_mapping() {
        let invalid = GatewayError::from(ForwardError::InvalidRequest("header 'x-bad'".to_string()));
        assert_eq!(invalid.status_code(), 400);
        assert!(!invalid.is_retryable());

        let network = GatewayError::from(ForwardError::Network("reset".to_string()));
        assert_eq!(network.status_code(), 500);
        assert!(network.is_retryable());
    }

    #[test]
    fn test_retryability() {
        assert!(GatewayError::downstream(None, "reset").is_retryable());
        assert!(!GatewayError::circuit_open("a").is_retryable());
        assert!(!GatewayError::no_healthy_instance("a").is_retryable());
    }

    #[test]
    fn test_error_response_shape() {
        let body = GatewayError::circuit_open("search").to_response("req-1");
        let json = serde_json::to_value(&body).unwrap();

        assert_eq!(json["requestId"], "req-1");
        assert_eq!(json["code"], "CIRCUIT_OPEN");
        assert_eq!(json["error"], "Circuit open for service 'search'");
    }
}
