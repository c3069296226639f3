//! Router configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Extra attempts after the first one for retryable failures
    pub max_retries: u32,
    /// Base retry delay; retry n waits `retry_delay × n`
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,
    /// Per-attempt deadline for a forwarded call
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Count 4xx responses against the circuit breaker
    pub count_client_errors: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_millis(100),
            request_timeout: Duration::from_secs(30),
            count_client_errors: false,
        }
    }
}
