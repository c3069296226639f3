//! Event-driven service registry
//!
//! Each process keeps its own view of the mesh, built entirely from bus traffic.
//! Membership is advisory: two registries may briefly disagree, but an instance
//! that stops heartbeating disappears everywhere within twice the TTL.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{RwLock, broadcast};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::config::RegistryConfig;
use super::error::RegistryError;
use super::types::{
    AggregateServiceStats, InstanceStatus, RegistryEvent, RemovalReason, ServiceInstance,
};
use crate::bus::{MessageBus, SubscriptionId};
use crate::protocol::{
    HealthCheckMessage, HealthResponseMessage, HeartbeatMessage, ServiceRegistered,
    ShutdownMessage, topics,
};

type InstanceKey = (String, String);

fn key(name: &str, id: &str) -> InstanceKey {
    (name.to_string(), id.to_string())
}

#[derive(Default)]
struct RegistryState {
    instances: HashMap<InstanceKey, ServiceInstance>,
    /// Instance ids per service, in registration order
    by_name: HashMap<String, Vec<String>>,
    stats: HashMap<String, AggregateServiceStats>,
}

impl RegistryState {
    fn insert(&mut self, instance: ServiceInstance) -> bool {
        let name = instance.name.clone();
        let id = instance.id.clone();
        let is_new = self
            .instances
            .insert(key(&name, &id), instance)
            .is_none();
        if is_new {
            self.by_name.entry(name.clone()).or_default().push(id);
        }
        self.refresh_counts(&name);
        is_new
    }

    fn remove(&mut self, name: &str, id: &str) -> Option<ServiceInstance> {
        let removed = self.instances.remove(&key(name, id))?;
        if let Some(ids) = self.by_name.get_mut(name) {
            ids.retain(|known| known != id);
            if ids.is_empty() {
                self.by_name.remove(name);
            }
        }
        self.refresh_counts(name);
        Some(removed)
    }

    fn instances_of(&self, name: &str) -> impl Iterator<Item = &ServiceInstance> {
        self.by_name
            .get(name)
            .into_iter()
            .flatten()
            .filter_map(move |id| self.instances.get(&key(name, id)))
    }

    fn refresh_counts(&mut self, name: &str) {
        let (total, healthy) = self
            .instances_of(name)
            .fold((0, 0), |(total, healthy), instance| {
                (total + 1, healthy + usize::from(instance.is_healthy()))
            });

        let stats = self.stats.entry(name.to_string()).or_default();
        stats.total_instances = total;
        stats.healthy_instances = healthy;
        stats.unhealthy_instances = total - healthy;
    }
}

/// Local view of live service instances
pub struct ServiceRegistry {
    bus: MessageBus,
    config: RegistryConfig,
    state: RwLock<RegistryState>,
    events: broadcast::Sender<RegistryEvent>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    subscriptions: Mutex<Vec<SubscriptionId>>,
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("config", &self.config)
            .field("running", &!self.tasks.lock().is_empty())
            .finish()
    }
}

impl ServiceRegistry {
    pub fn new(bus: MessageBus, config: RegistryConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            bus,
            config,
            state: RwLock::new(RegistryState::default()),
            events,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Receive local membership change notifications
    pub fn subscribe_events(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: RegistryEvent) {
        // Nobody listening is fine
        let _ = self.events.send(event);
    }

    /// Subscribe to membership topics and start the probe and sweep loops
    pub fn start(self: &Arc<Self>) {
        if self.shutdown.is_cancelled() {
            tracing::warn!("Registry already stopped; not restarting");
            return;
        }
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }

        let weak = Arc::downgrade(self);
        let mut subscriptions = self.subscriptions.lock();
        subscriptions.push(self.listen(
            &weak,
            topics::SERVICE_REGISTERED,
            |r, msg: ServiceRegistered| Box::pin(async move { r.handle_registered(msg).await }),
        ));
        subscriptions.push(self.listen(
            &weak,
            topics::SERVICE_HEARTBEAT,
            |r, msg: HeartbeatMessage| Box::pin(async move { r.handle_heartbeat(msg).await }),
        ));
        subscriptions.push(self.listen(&weak, topics::SERVICE_SHUTDOWN, |r, msg: ShutdownMessage| {
            Box::pin(async move { r.handle_shutdown(msg).await })
        }));
        subscriptions.push(self.listen(
            &weak,
            topics::HEALTH_RESPONSE,
            |r, msg: HealthResponseMessage| Box::pin(async move { r.handle_health_response(msg).await }),
        ));

        tasks.push(tokio::spawn(probe_loop(
            weak.clone(),
            self.config.health_check_interval,
            self.shutdown.clone(),
        )));
        tasks.push(tokio::spawn(sweep_loop(
            weak,
            self.config.cleanup_interval,
            self.shutdown.clone(),
        )));

        tracing::info!(
            ttl_ms = self.config.ttl.as_millis() as u64,
            probe_interval_ms = self.config.health_check_interval.as_millis() as u64,
            "Service registry started"
        );
    }

    fn listen<M, F>(&self, weak: &Weak<Self>, topic: &'static str, handle: F) -> SubscriptionId
    where
        M: DeserializeOwned + Send + 'static,
        F: Fn(Arc<Self>, M) -> futures::future::BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        let weak = weak.clone();
        let handle = Arc::new(handle);
        self.bus.subscribe(topic, move |payload: Value| {
            let weak = weak.clone();
            let handle = handle.clone();
            async move {
                let Some(registry) = weak.upgrade() else { return };
                match serde_json::from_value::<M>(payload) {
                    Ok(msg) => handle(registry, msg).await,
                    Err(e) => {
                        let error = RegistryError::invalid_event(topic, e.to_string());
                        tracing::warn!(error = %error, "Ignoring malformed event");
                    }
                }
            }
        })
    }

    /// Stop background loops and detach from the bus
    pub fn stop(&self) {
        self.shutdown.cancel();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        for id in self.subscriptions.lock().drain(..) {
            self.bus.unsubscribe(id);
        }
        tracing::info!("Service registry stopped");
    }

    async fn handle_registered(&self, msg: ServiceRegistered) {
        self.register_instance(ServiceInstance::from_registration(msg))
            .await;
    }

    async fn handle_heartbeat(&self, msg: HeartbeatMessage) {
        // Local receipt time keeps staleness immune to worker clock skew
        if let Err(e) = self
            .record_heartbeat(&msg.service_name, &msg.service_id, Utc::now(), msg.metrics)
            .await
        {
            tracing::debug!(error = %e, "Heartbeat from unknown instance");
        }
    }

    async fn handle_shutdown(&self, msg: ShutdownMessage) {
        self.remove(&msg.service_name, &msg.service_id, RemovalReason::Shutdown)
            .await;
    }

    async fn handle_health_response(&self, msg: HealthResponseMessage) {
        if msg.status == InstanceStatus::Healthy {
            self.mark_healthy(&msg.service_name, &msg.service_id).await;
        }
    }

    /// Add or replace an instance
    pub async fn register_instance(&self, instance: ServiceInstance) {
        let name = instance.name.clone();
        let id = instance.id.clone();

        let is_new = self.state.write().await.insert(instance);

        if is_new {
            tracing::info!(service = %name, instance = %id, "Instance registered");
        } else {
            tracing::debug!(service = %name, instance = %id, "Instance re-registered");
        }
        self.emit(RegistryEvent::InstanceRegistered { name, id });
    }

    /// Refresh liveness; any heartbeat restores a failing instance to healthy
    pub async fn record_heartbeat(
        &self,
        name: &str,
        id: &str,
        timestamp: DateTime<Utc>,
        metrics: Option<Value>,
    ) -> Result<(), RegistryError> {
        let recovered = {
            let mut state = self.state.write().await;
            let instance = state
                .instances
                .get_mut(&key(name, id))
                .ok_or_else(|| RegistryError::not_found(name, id))?;

            instance.last_heartbeat = timestamp;
            if metrics.is_some() {
                instance.last_metrics = metrics;
            }
            let recovered = restore(instance);
            if recovered {
                state.refresh_counts(name);
            }
            recovered
        };

        tracing::trace!(service = %name, instance = %id, "Heartbeat");
        if recovered {
            self.announce_recovery(name, id);
        }
        Ok(())
    }

    /// Remove an instance through the API
    pub async fn unregister_instance(&self, name: &str, id: &str) -> Option<ServiceInstance> {
        self.remove(name, id, RemovalReason::Unregistered).await
    }

    async fn remove(
        &self,
        name: &str,
        id: &str,
        reason: RemovalReason,
    ) -> Option<ServiceInstance> {
        let removed = self.state.write().await.remove(name, id)?;
        tracing::info!(service = %name, instance = %id, reason = ?reason, "Instance removed");
        self.emit(RegistryEvent::InstanceRemoved {
            name: name.to_string(),
            id: id.to_string(),
            reason,
        });
        Some(removed)
    }

    /// Healthy instances of a service, in registration order
    pub async fn get_healthy_services(&self, name: &str) -> Vec<ServiceInstance> {
        self.state
            .read()
            .await
            .instances_of(name)
            .filter(|instance| instance.is_healthy())
            .cloned()
            .collect()
    }

    /// Every known instance, optionally restricted to one service
    pub async fn get_services(&self, name: Option<&str>) -> Vec<ServiceInstance> {
        let state = self.state.read().await;
        match name {
            Some(name) => state.instances_of(name).cloned().collect(),
            None => {
                let mut names: Vec<&String> = state.by_name.keys().collect();
                names.sort();
                names
                    .into_iter()
                    .flat_map(|name| state.instances_of(name))
                    .cloned()
                    .collect()
            }
        }
    }

    pub async fn get_instance(&self, name: &str, id: &str) -> Option<ServiceInstance> {
        self.state.read().await.instances.get(&key(name, id)).cloned()
    }

    /// Service names with at least one known instance
    pub async fn service_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.read().await.by_name.keys().cloned().collect();
        names.sort();
        names
    }

    /// Fold a routed request's outcome into the service statistics
    pub async fn record_request_outcome(&self, name: &str, success: bool, response_time_ms: f64) {
        let alpha = self.config.response_time_smoothing;
        self.state
            .write()
            .await
            .stats
            .entry(name.to_string())
            .or_default()
            .record(success, response_time_ms, alpha);
    }

    pub async fn stats(&self, name: &str) -> Option<AggregateServiceStats> {
        self.state.read().await.stats.get(name).cloned()
    }

    /// Statistics for every service seen so far, sorted by name
    pub async fn all_stats(&self) -> Vec<(String, AggregateServiceStats)> {
        let mut all: Vec<_> = self
            .state
            .read()
            .await
            .stats
            .iter()
            .map(|(name, stats)| (name.clone(), stats.clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    /// Drop every instance whose last heartbeat is older than twice the TTL
    pub async fn remove_stale_instances(&self, now: DateTime<Utc>) -> Vec<ServiceInstance> {
        let stale: Vec<InstanceKey> = self
            .state
            .read()
            .await
            .instances
            .iter()
            .filter(|(_, instance)| instance.is_stale(self.config.ttl, now))
            .map(|(key, _)| key.clone())
            .collect();

        let mut removed = Vec::with_capacity(stale.len());
        for (name, id) in stale {
            if let Some(instance) = self.remove(&name, &id, RemovalReason::Stale).await {
                removed.push(instance);
            }
        }
        removed
    }

    /// Probe every known instance once, concurrently
    pub async fn run_health_checks(&self) {
        let targets: Vec<InstanceKey> = self.state.read().await.instances.keys().cloned().collect();
        if targets.is_empty() {
            return;
        }

        tracing::debug!(instances = targets.len(), "Running health checks");
        futures::future::join_all(
            targets
                .iter()
                .map(|(name, id)| self.probe_instance(name, id)),
        )
        .await;
    }

    async fn probe_instance(&self, name: &str, id: &str) {
        let check = HealthCheckMessage::for_instance(name, id);
        let outcome = self
            .bus
            .request(topics::HEALTH_CHECK, &check, self.config.health_check_timeout)
            .await;

        match outcome {
            Ok(reply) => match serde_json::from_value::<HealthResponseMessage>(reply) {
                Ok(response) if response.service_name != name || response.service_id != id => {
                    tracing::debug!(
                        service = %name,
                        instance = %id,
                        answered_by = %format!("{}/{}", response.service_name, response.service_id),
                        "Health check answered by another instance"
                    );
                    self.record_probe_failure(name, id).await
                }
                Ok(response) if response.status == InstanceStatus::Healthy => {
                    self.mark_healthy(name, id).await
                }
                Ok(_) => self.record_probe_failure(name, id).await,
                Err(e) => {
                    tracing::debug!(service = %name, instance = %id, error = %e, "Unreadable health response");
                    self.record_probe_failure(name, id).await
                }
            },
            Err(e) if e.is_timeout() => {
                tracing::debug!(service = %name, instance = %id, "Health check timed out");
                self.record_probe_failure(name, id).await
            }
            Err(e) => {
                tracing::debug!(service = %name, instance = %id, error = %e, "Health check not sent");
            }
        }
    }

    /// Count one failed probe; crossing the limit marks the instance unhealthy
    pub async fn record_probe_failure(&self, name: &str, id: &str) {
        let max = self.config.max_failed_health_checks;
        let flipped = {
            let mut state = self.state.write().await;
            let Some(instance) = state.instances.get_mut(&key(name, id)) else {
                return;
            };
            instance.last_health_check = Some(Utc::now());
            instance.health_check_failures = instance.health_check_failures.saturating_add(1);

            let flipped = instance.is_healthy() && instance.health_check_failures >= max;
            if flipped {
                instance.status = InstanceStatus::Unhealthy;
            }
            let failures = instance.health_check_failures;
            if flipped {
                state.refresh_counts(name);
            }
            flipped.then_some(failures)
        };

        if let Some(failures) = flipped {
            tracing::warn!(service = %name, instance = %id, failures, "Instance marked unhealthy");
            self.emit(RegistryEvent::InstanceUnhealthy {
                name: name.to_string(),
                id: id.to_string(),
                failures,
            });
        }
    }

    async fn mark_healthy(&self, name: &str, id: &str) {
        let recovered = {
            let mut state = self.state.write().await;
            let Some(instance) = state.instances.get_mut(&key(name, id)) else {
                return;
            };
            instance.last_health_check = Some(Utc::now());
            let recovered = restore(instance);
            if recovered {
                state.refresh_counts(name);
            }
            recovered
        };

        if recovered {
            self.announce_recovery(name, id);
        }
    }

    fn announce_recovery(&self, name: &str, id: &str) {
        tracing::info!(service = %name, instance = %id, "Instance recovered");
        self.emit(RegistryEvent::InstanceRecovered {
            name: name.to_string(),
            id: id.to_string(),
        });
    }
}

impl Drop for ServiceRegistry {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Zero the failure counter; returns whether the instance was unhealthy
fn restore(instance: &mut ServiceInstance) -> bool {
    instance.health_check_failures = 0;
    let was_unhealthy = !instance.is_healthy();
    instance.status = InstanceStatus::Healthy;
    was_unhealthy
}

fn ticker(period: std::time::Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn probe_loop(
    registry: Weak<ServiceRegistry>,
    period: std::time::Duration,
    shutdown: CancellationToken,
) {
    let mut interval = ticker(period);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                let Some(registry) = registry.upgrade() else { break };
                registry.run_health_checks().await;
            }
        }
    }
}

async fn sweep_loop(
    registry: Weak<ServiceRegistry>,
    period: std::time::Duration,
    shutdown: CancellationToken,
) {
    let mut interval = ticker(period);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                let Some(registry) = registry.upgrade() else { break };
                let removed = registry.remove_stale_instances(Utc::now()).await;
                if !removed.is_empty() {
                    tracing::info!(removed = removed.len(), "Swept stale instances");
                }
            }
        }
    }
}
