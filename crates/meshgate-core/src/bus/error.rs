//! Message bus errors

use thiserror::Error;

/// Errors raised by the message bus and its transports
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    /// The transport could not be reached or dropped its connection
    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    /// No reply arrived for a request within its deadline
    #[error("Request on '{topic}' timed out after {timeout_ms}ms")]
    Timeout { topic: String, timeout_ms: u64 },

    /// The bus has been shut down
    #[error("Message bus is closed")]
    Closed,

    /// A payload could not be encoded or decoded
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// Another request is already waiting on this correlation id
    #[error("Correlation id '{0}' is already awaiting a reply")]
    DuplicateCorrelation(String),
}

impl BusError {
    /// Check whether this is a request timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl From<serde_json::Error> for BusError {
    fn from(error: serde_json::Error) -> Self {
        Self::InvalidPayload(error.to_string())
    }
}

impl From<redis::RedisError> for BusError {
    fn from(error: redis::RedisError) -> Self {
        Self::TransportUnavailable(error.to_string())
    }
}
