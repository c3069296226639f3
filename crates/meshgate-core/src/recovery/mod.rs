//! Failure recovery primitives
//!
//! - Error classification (transient vs permanent)
//! - Backoff strategies for reconnects and retries
//! - Circuit breaker pattern for failing dependencies

pub mod backoff;
pub mod circuit_breaker;

pub use backoff::{BackoffConfig, BackoffStrategy, ExponentialBackoff, LinearBackoff};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitBreakerStats,
    CircuitState,
};

/// Error classification for recovery decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transient errors that may succeed on retry
    Transient,
    /// Permanent errors that will not succeed on retry
    Permanent,
}

impl ErrorClass {
    pub fn is_retryable(self) -> bool {
        self == Self::Transient
    }
}

/// Classify a downstream HTTP status
///
/// Client errors are the caller's fault and never retried; everything else
/// that is not a success may clear up on another instance.
pub fn classify_status(status: u16) -> ErrorClass {
    match status {
        400..=499 => ErrorClass::Permanent,
        _ => ErrorClass::Transient,
    }
}
