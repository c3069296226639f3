//! A gateway node: bus, registry and router wired together from one config

use std::sync::Arc;

use crate::balancer::LoadBalancer;
use crate::bus::MessageBus;
use crate::config::MeshConfig;
use crate::error::MeshResult;
use crate::gateway::{Forwarder, Gateway};
use crate::recovery::CircuitBreakerRegistry;
use crate::registry::ServiceRegistry;

pub struct MeshNode {
    bus: MessageBus,
    registry: Arc<ServiceRegistry>,
    gateway: Arc<Gateway>,
}

impl MeshNode {
    /// Connect the configured transport and start the registry
    pub async fn start(config: &MeshConfig, forwarder: Arc<dyn Forwarder>) -> MeshResult<Self> {
        config.validate()?;
        let bus = MessageBus::connect(&config.bus).await?;
        Ok(Self::start_on(bus, config, forwarder))
    }

    /// Start on an already connected bus
    pub fn start_on(bus: MessageBus, config: &MeshConfig, forwarder: Arc<dyn Forwarder>) -> Self {
        let registry = Arc::new(ServiceRegistry::new(bus.clone(), config.registry.clone()));
        registry.start();

        let gateway = Gateway::new(registry.clone(), forwarder, config.gateway.clone())
            .with_load_balancer(LoadBalancer::new(config.load_balancer.clone()))
            .with_breakers(CircuitBreakerRegistry::with_config(
                config.circuit_breaker.clone(),
            ));

        tracing::info!(
            transport = bus.transport_name(),
            strategy = %config.load_balancer.strategy,
            "Mesh node started"
        );

        Self {
            bus,
            registry,
            gateway: Arc::new(gateway),
        }
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    /// Stop background work and detach from the transport
    pub async fn shutdown(&self) {
        self.registry.stop();
        self.bus.shutdown().await;
        tracing::info!("Mesh node stopped");
    }
}
