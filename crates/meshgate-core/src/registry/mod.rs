//! Service registry
//!
//! Tracks which instances of each logical service are alive, from the
//! registration, heartbeat, shutdown and health traffic seen on the bus.

mod config;
mod error;
mod service_registry;
mod types;


pub use config::RegistryConfig;
pub use error::RegistryError;
pub use service_registry::ServiceRegistry;
pub use types::{
    AggregateServiceStats, InstanceStatus, RegistryEvent, RemovalReason, ServiceInstance,
};
