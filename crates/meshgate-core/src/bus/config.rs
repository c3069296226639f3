//! Message bus configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Which transport the bus runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// In-process broadcast channel
    #[default]
    Memory,
    /// Redis pub/sub
    Redis,
}

impl std::str::FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "redis" => Ok(Self::Redis),
            other => Err(format!("unknown transport '{}'", other)),
        }
    }
}

/// Message bus configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Transport to connect
    pub transport: TransportKind,
    /// Redis connection URL
    pub redis_url: String,
    /// Prefix applied to every channel name on shared transports
    pub channel_prefix: String,
    /// Per-subscriber buffer before slow consumers start dropping messages
    pub capacity: usize,
    /// Connection attempts at startup before giving up
    pub connect_retries: u32,
    /// Initial delay between connection attempts
    #[serde(with = "humantime_serde")]
    pub connect_backoff: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::Memory,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            channel_prefix: "meshgate:".to_string(),
            capacity: 1024,
            connect_retries: 5,
            connect_backoff: Duration::from_millis(500),
        }
    }
}
