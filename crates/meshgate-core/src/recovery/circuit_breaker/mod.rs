//! Circuit breaker pattern for fault tolerance
//!
//! Isolates a failing dependency: after enough consecutive failures the router
//! stops sending it traffic until a reset timeout has passed.

mod breaker;
mod registry;
mod types;


// Re-export all public items
pub use breaker::CircuitBreaker;
pub use registry::CircuitBreakerRegistry;
pub use types::{CircuitBreakerConfig, CircuitBreakerStats, CircuitState};
