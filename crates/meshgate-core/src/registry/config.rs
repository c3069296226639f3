//! Registry timing configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Heartbeat TTL; instances silent for twice this are swept
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    /// Period between health probe rounds
    #[serde(with = "humantime_serde")]
    pub health_check_interval: Duration,
    /// How long a single probe waits for its reply
    #[serde(with = "humantime_serde")]
    pub health_check_timeout: Duration,
    /// Consecutive failed probes before an instance is marked unhealthy
    pub max_failed_health_checks: u32,
    /// Period between stale-instance sweeps
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,
    /// Weight of the newest sample in the response time average (0, 1]
    pub response_time_smoothing: f64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(30),
            health_check_timeout: Duration::from_secs(5),
            max_failed_health_checks: 3,
            cleanup_interval: Duration::from_secs(60),
            response_time_smoothing: 0.2,
        }
    }
}
