//! Worker side of the membership protocol
//!
//! A backend process announces itself once, heartbeats on an interval, answers
//! health checks addressed to it and says goodbye on shutdown.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::bus::{BusError, MessageBus, SubscriptionId};
use crate::protocol::{
    HealthCheckMessage, HealthResponseMessage, HeartbeatMessage, InstanceMetadata,
    ServiceRegistered, ShutdownMessage, now_millis, topics,
};
use crate::registry::InstanceStatus;

/// Reports the worker's own health when probed
pub type HealthProbe = Arc<dyn Fn() -> InstanceStatus + Send + Sync>;

/// Supplies metrics attached to each heartbeat
pub type MetricsProvider = Arc<dyn Fn() -> Option<Value> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Should stay below the registry TTL
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
        }
    }
}

/// Membership agent for one backend instance
pub struct WorkerAgent {
    bus: MessageBus,
    name: String,
    id: String,
    metadata: InstanceMetadata,
    endpoints: Vec<String>,
    version: String,
    settings: WorkerSettings,
    probe: HealthProbe,
    metrics: Option<MetricsProvider>,
    shutdown: CancellationToken,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
    subscription: Mutex<Option<SubscriptionId>>,
}

impl std::fmt::Debug for WorkerAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerAgent")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("settings", &self.settings)
            .finish()
    }
}

impl WorkerAgent {
    pub fn new(bus: MessageBus, name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            bus,
            name: name.into(),
            id: id.into(),
            metadata: InstanceMetadata::default(),
            endpoints: Vec::new(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            settings: WorkerSettings::default(),
            probe: Arc::new(|| InstanceStatus::Healthy),
            metrics: None,
            shutdown: CancellationToken::new(),
            heartbeat: Mutex::new(None),
            subscription: Mutex::new(None),
        }
    }

    pub fn with_metadata(mut self, metadata: InstanceMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_endpoints(mut self, endpoints: Vec<String>) -> Self {
        self.endpoints = endpoints;
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_settings(mut self, settings: WorkerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_health_probe<F>(mut self, probe: F) -> Self
    where
        F: Fn() -> InstanceStatus + Send + Sync + 'static,
    {
        self.probe = Arc::new(probe);
        self
    }

    pub fn with_metrics<F>(mut self, metrics: F) -> Self
    where
        F: Fn() -> Option<Value> + Send + Sync + 'static,
    {
        self.metrics = Some(Arc::new(metrics));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Answer health checks, announce the instance and start heartbeating
    pub async fn start(&self) -> Result<(), BusError> {
        if self.heartbeat.lock().is_some() {
            return Ok(());
        }

        let subscription = self.answer_health_checks();
        *self.subscription.lock() = Some(subscription);

        let registration = ServiceRegistered {
            id: self.id.clone(),
            name: self.name.clone(),
            metadata: self.metadata.clone(),
            endpoints: self.endpoints.clone(),
            version: self.version.clone(),
            registered_at: now_millis(),
        };
        self.bus
            .publish(topics::SERVICE_REGISTERED, &registration)
            .await?;

        let task = tokio::spawn(heartbeat_loop(
            self.bus.clone(),
            self.name.clone(),
            self.id.clone(),
            self.metrics.clone(),
            self.settings.heartbeat_interval,
            self.shutdown.clone(),
        ));
        *self.heartbeat.lock() = Some(task);

        tracing::info!(service = %self.name, instance = %self.id, "Worker registered");
        Ok(())
    }

    fn answer_health_checks(&self) -> SubscriptionId {
        let bus = self.bus.clone();
        let name = self.name.clone();
        let id = self.id.clone();
        let probe = self.probe.clone();

        self.bus.subscribe(topics::HEALTH_CHECK, move |payload| {
            let bus = bus.clone();
            let name = name.clone();
            let id = id.clone();
            let probe = probe.clone();
            async move {
                let Ok(check) = serde_json::from_value::<HealthCheckMessage>(payload) else {
                    return;
                };
                if !check.targets(&name, &id) {
                    return;
                }

                let response = HealthResponseMessage {
                    service_name: name,
                    service_id: id,
                    status: probe(),
                    correlation_id: check.correlation_id,
                    timestamp: now_millis(),
                };
                if let Err(e) = bus.publish(topics::HEALTH_RESPONSE, &response).await {
                    tracing::warn!(error = %e, "Failed to answer health check");
                }
            }
        })
    }

    /// Stop heartbeating and announce the shutdown
    pub async fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        if let Some(task) = self.heartbeat.lock().take() {
            task.abort();
        }
        if let Some(subscription) = self.subscription.lock().take() {
            self.bus.unsubscribe(subscription);
        }

        let goodbye = ShutdownMessage {
            service_name: self.name.clone(),
            service_id: self.id.clone(),
        };
        match self.bus.publish(topics::SERVICE_SHUTDOWN, &goodbye).await {
            Ok(()) => tracing::info!(service = %self.name, instance = %self.id, "Worker shut down"),
            Err(e) => tracing::warn!(error = %e, "Could not announce worker shutdown"),
        }
    }
}

async fn heartbeat_loop(
    bus: MessageBus,
    name: String,
    id: String,
    metrics: Option<MetricsProvider>,
    period: Duration,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                let heartbeat = HeartbeatMessage {
                    service_name: name.clone(),
                    service_id: id.clone(),
                    timestamp: now_millis(),
                    metrics: metrics.as_ref().and_then(|provide| provide()),
                };
                if let Err(e) = bus.publish(topics::SERVICE_HEARTBEAT, &heartbeat).await {
                    tracing::warn!(service = %name, instance = %id, error = %e, "Heartbeat failed");
                }
            }
        }
    }
}
