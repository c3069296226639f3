//! Registry data model

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::protocol::{InstanceMetadata, ServiceRegistered, from_millis};

/// Liveness of a single instance as seen by this process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Healthy,
    Unhealthy,
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// One running copy of a logical service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInstance {
    pub id: String,
    pub name: String,
    pub status: InstanceStatus,
    pub registered_at: DateTime<Utc>,
    /// Local receipt time of the latest heartbeat
    pub last_heartbeat: DateTime<Utc>,
    pub last_health_check: Option<DateTime<Utc>>,
    pub health_check_failures: u32,
    pub metadata: InstanceMetadata,
    pub endpoints: Vec<String>,
    pub version: String,
    /// Metrics attached to the latest heartbeat
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_metrics: Option<Value>,
}

impl ServiceInstance {
    /// A healthy instance with no metadata, registered now
    pub fn new(name: impl Into<String>, id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            status: InstanceStatus::Healthy,
            registered_at: now,
            last_heartbeat: now,
            last_health_check: None,
            health_check_failures: 0,
            metadata: InstanceMetadata::default(),
            endpoints: Vec::new(),
            version: String::new(),
            last_metrics: None,
        }
    }

    pub fn with_metadata(mut self, metadata: InstanceMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_status(mut self, status: InstanceStatus) -> Self {
        self.status = status;
        self
    }

    /// Build the local record for a registration announcement
    pub fn from_registration(msg: ServiceRegistered) -> Self {
        Self {
            id: msg.id,
            name: msg.name,
            status: InstanceStatus::Healthy,
            registered_at: from_millis(msg.registered_at),
            last_heartbeat: Utc::now(),
            last_health_check: None,
            health_check_failures: 0,
            metadata: msg.metadata,
            endpoints: msg.endpoints,
            version: msg.version,
            last_metrics: None,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == InstanceStatus::Healthy
    }

    /// Whether the last heartbeat is older than twice the TTL
    pub fn is_stale(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        match now.signed_duration_since(self.last_heartbeat).to_std() {
            Ok(elapsed) => elapsed > ttl.saturating_mul(2),
            // Heartbeat in the future
            Err(_) => false,
        }
    }

    /// `http://host:port` when the instance advertised an address
    pub fn base_url(&self) -> Option<String> {
        let host = self.metadata.host.as_deref()?;
        match self.metadata.port {
            Some(port) => Some(format!("http://{}:{}", host, port)),
            None => Some(format!("http://{}", host)),
        }
    }
}

/// Rolling statistics for one logical service
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateServiceStats {
    pub total_instances: usize,
    pub healthy_instances: usize,
    pub unhealthy_instances: usize,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// Exponential moving average, milliseconds
    pub average_response_time_ms: f64,
}

impl AggregateServiceStats {
    /// Fold one request outcome into the totals and the moving average
    pub fn record(&mut self, success: bool, response_time_ms: f64, alpha: f64) {
        if self.total_requests == 0 {
            self.average_response_time_ms = response_time_ms;
        } else {
            self.average_response_time_ms =
                alpha * response_time_ms + (1.0 - alpha) * self.average_response_time_ms;
        }

        self.total_requests += 1;
        if success {
            self.successful_requests += 1;
        } else {
            self.failed_requests += 1;
        }
    }

    /// Fraction of requests that succeeded, 1.0 with no traffic
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            1.0
        } else {
            self.successful_requests as f64 / self.total_requests as f64
        }
    }
}

/// Why an instance left the local view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemovalReason {
    /// The worker announced its own shutdown
    Shutdown,
    /// Removed through the registry API
    Unregistered,
    /// No heartbeat within twice the TTL
    Stale,
}

/// Local membership change notifications
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    InstanceRegistered { name: String, id: String },
    InstanceRemoved { name: String, id: String, reason: RemovalReason },
    InstanceUnhealthy { name: String, id: String, failures: u32 },
    InstanceRecovered { name: String, id: String },
}
