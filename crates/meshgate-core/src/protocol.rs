//! Wire messages exchanged between gateways and workers over the bus
//!
//! Every message is camelCase JSON. Timestamps are epoch milliseconds.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::registry::InstanceStatus;

/// Bus topic names
pub mod topics {
    pub const SERVICE_REGISTERED: &str = "service:registered";
    pub const SERVICE_HEARTBEAT: &str = "service:heartbeat";
    pub const SERVICE_SHUTDOWN: &str = "service:shutdown";
    pub const HEALTH_CHECK: &str = "health:check";
    pub const HEALTH_RESPONSE: &str = "health:response";
}

/// Health check target addressing every worker
pub const BROADCAST_TARGET: &str = "all";

/// Current time as epoch milliseconds
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Convert epoch milliseconds back to a timestamp, clamping garbage to now
pub fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_else(Utc::now)
}

/// Where an instance can be reached, plus free-form tags
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(flatten)]
    pub tags: HashMap<String, Value>,
}

impl InstanceMetadata {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: Some(host.into()),
            port: Some(port),
            tags: HashMap::new(),
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

/// `service:registered`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRegistered {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub metadata: InstanceMetadata,
    #[serde(default)]
    pub endpoints: Vec<String>,
    #[serde(default)]
    pub version: String,
    pub registered_at: i64,
}

/// `service:heartbeat`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatMessage {
    pub service_name: String,
    pub service_id: String,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Value>,
}

/// `service:shutdown`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShutdownMessage {
    pub service_name: String,
    pub service_id: String,
}

/// `health:check`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckMessage {
    pub target_service: String,
    /// Service name the target id belongs to; ids are only unique within a service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_name: Option<String>,
    #[serde(default)]
    pub correlation_id: String,
    pub timestamp: i64,
}

impl HealthCheckMessage {
    /// Probe addressed to one instance of one service
    pub fn for_instance(name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            target_service: id.into(),
            target_name: Some(name.into()),
            correlation_id: String::new(),
            timestamp: now_millis(),
        }
    }

    /// Probe addressed to every instance of `name`, or to everyone with [`BROADCAST_TARGET`]
    pub fn for_service(name: impl Into<String>) -> Self {
        Self {
            target_service: name.into(),
            target_name: None,
            correlation_id: String::new(),
            timestamp: now_millis(),
        }
    }

    /// Whether a worker with this name and id should answer
    pub fn targets(&self, name: &str, id: &str) -> bool {
        if self.target_name.as_deref().is_some_and(|target| target != name) {
            return false;
        }
        self.target_service == id
            || self.target_service == name
            || self.target_service == BROADCAST_TARGET
    }
}

/// `health:response`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponseMessage {
    pub service_name: String,
    pub service_id: String,
    pub status: InstanceStatus,
    pub correlation_id: String,
    pub timestamp: i64,
}
