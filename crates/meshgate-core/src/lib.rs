//! Meshgate Core Library
//!
//! Coordination layer for a fleet of backend workers: a pub/sub message bus with
//! correlated requests, a heartbeat-driven service registry, load balancing,
//! per-service circuit breakers and a retrying request router.

pub mod balancer;
pub mod bus;
pub mod config;
pub mod error;
pub mod gateway;
pub mod node;
pub mod protocol;
pub mod recovery;
pub mod registry;
pub mod worker;

// Re-export commonly used types
pub use balancer::{LoadBalancer, LoadBalancerConfig, Strategy};
pub use bus::{BusConfig, BusError, InMemoryTransport, MessageBus, RedisTransport, Transport};
pub use config::{ConfigError, LogFormat, LoggingConfig, MeshConfig};
pub use error::{ErrorResponse, GatewayError, MeshError, MeshResult};
pub use gateway::{
    Forwarder, Gateway, GatewayConfig, GatewayRequest, GatewayResponse, GatewaySnapshot,
    HttpForwarder,
};
pub use node::MeshNode;
pub use protocol::{InstanceMetadata, topics};
pub use recovery::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState};
pub use registry::{InstanceStatus, RegistryConfig, ServiceInstance, ServiceRegistry};
pub use worker::{WorkerAgent, WorkerSettings};
