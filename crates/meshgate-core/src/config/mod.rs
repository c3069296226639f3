//! Configuration for a meshgate node
//!
//! Sources, lowest precedence first: built-in defaults, a TOML/YAML/JSON file,
//! then `MESHGATE_*` environment variables. The result is validated before use.

mod env_loader;
mod error;
mod file_loader;
mod logging_config;

use std::path::Path;

use serde::{Deserialize, Serialize};

pub use env_loader::{apply_env_overrides, apply_overrides_from};
pub use error::ConfigError;
pub use file_loader::load_from_file;
pub use logging_config::{LogFormat, LoggingConfig};

use crate::balancer::LoadBalancerConfig;
use crate::bus::{BusConfig, TransportKind};
use crate::gateway::GatewayConfig;
use crate::recovery::CircuitBreakerConfig;
use crate::registry::RegistryConfig;
use crate::worker::WorkerSettings;

/// Complete node configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    pub bus: BusConfig,
    pub registry: RegistryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub load_balancer: LoadBalancerConfig,
    pub gateway: GatewayConfig,
    pub worker: WorkerSettings,
    pub logging: LoggingConfig,
}

impl MeshConfig {
    /// Load from an optional file, apply environment overrides, then validate
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => load_from_file(path)?,
            None => Self::default(),
        };
        apply_env_overrides(&mut config)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the node cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bus.capacity == 0 {
            return Err(ConfigError::validation("bus.capacity must be at least 1"));
        }
        if self.bus.transport == TransportKind::Redis && self.bus.redis_url.trim().is_empty() {
            return Err(ConfigError::validation(
                "bus.redis_url is required for the redis transport",
            ));
        }

        let registry = &self.registry;
        for (name, value) in [
            ("registry.ttl", registry.ttl),
            ("registry.health_check_interval", registry.health_check_interval),
            ("registry.health_check_timeout", registry.health_check_timeout),
            ("registry.cleanup_interval", registry.cleanup_interval),
            ("circuit_breaker.reset_timeout", self.circuit_breaker.reset_timeout),
            ("gateway.request_timeout", self.gateway.request_timeout),
            ("worker.heartbeat_interval", self.worker.heartbeat_interval),
        ] {
            if value.is_zero() {
                return Err(ConfigError::validation(format!("{} must be non-zero", name)));
            }
        }
        if registry.max_failed_health_checks == 0 {
            return Err(ConfigError::validation(
                "registry.max_failed_health_checks must be at least 1",
            ));
        }
        let alpha = registry.response_time_smoothing;
        if !(alpha > 0.0 && alpha <= 1.0) {
            return Err(ConfigError::validation(format!(
                "registry.response_time_smoothing must be in (0, 1], got {}",
                alpha
            )));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(ConfigError::validation(
                "circuit_breaker.failure_threshold must be at least 1",
            ));
        }
        if self.worker.heartbeat_interval > registry.ttl {
            tracing::warn!(
                heartbeat_ms = self.worker.heartbeat_interval.as_millis() as u64,
                ttl_ms = registry.ttl.as_millis() as u64,
                "Worker heartbeat interval exceeds registry TTL; instances may be swept"
            );
        }
        Ok(())
    }
}
