//! Environment variable overrides
//!
//! Every override uses the `MESHGATE_` prefix. Durations are given in
//! milliseconds (`*_MS`).

use std::env;
use std::str::FromStr;
use std::time::Duration;

use super::MeshConfig;
use super::error::ConfigError;

/// Apply overrides from the process environment
pub fn apply_env_overrides(config: &mut MeshConfig) -> Result<(), ConfigError> {
    apply_overrides_from(config, |key| env::var(key).ok())
}

/// Apply overrides read through `lookup`
pub fn apply_overrides_from<F>(config: &mut MeshConfig, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let env = Overrides { lookup };

    // Bus
    env.parse("MESHGATE_TRANSPORT", &mut config.bus.transport)?;
    env.string("MESHGATE_REDIS_URL", &mut config.bus.redis_url);
    env.string("MESHGATE_CHANNEL_PREFIX", &mut config.bus.channel_prefix);
    env.parse("MESHGATE_BUS_CAPACITY", &mut config.bus.capacity)?;

    // Registry
    env.millis("MESHGATE_REGISTRY_TTL_MS", &mut config.registry.ttl)?;
    env.millis(
        "MESHGATE_HEALTH_CHECK_INTERVAL_MS",
        &mut config.registry.health_check_interval,
    )?;
    env.millis(
        "MESHGATE_HEALTH_CHECK_TIMEOUT_MS",
        &mut config.registry.health_check_timeout,
    )?;
    env.parse(
        "MESHGATE_MAX_FAILED_HEALTH_CHECKS",
        &mut config.registry.max_failed_health_checks,
    )?;
    env.millis(
        "MESHGATE_CLEANUP_INTERVAL_MS",
        &mut config.registry.cleanup_interval,
    )?;
    env.parse(
        "MESHGATE_RESPONSE_TIME_SMOOTHING",
        &mut config.registry.response_time_smoothing,
    )?;

    // Circuit breaker
    env.parse(
        "MESHGATE_CB_FAILURE_THRESHOLD",
        &mut config.circuit_breaker.failure_threshold,
    )?;
    env.millis(
        "MESHGATE_CB_RESET_TIMEOUT_MS",
        &mut config.circuit_breaker.reset_timeout,
    )?;

    // Load balancer
    env.parse("MESHGATE_LB_STRATEGY", &mut config.load_balancer.strategy)?;

    // Gateway
    env.parse("MESHGATE_MAX_RETRIES", &mut config.gateway.max_retries)?;
    env.millis("MESHGATE_RETRY_DELAY_MS", &mut config.gateway.retry_delay)?;
    env.millis(
        "MESHGATE_REQUEST_TIMEOUT_MS",
        &mut config.gateway.request_timeout,
    )?;
    env.parse(
        "MESHGATE_COUNT_CLIENT_ERRORS",
        &mut config.gateway.count_client_errors,
    )?;

    // Worker
    env.millis(
        "MESHGATE_HEARTBEAT_INTERVAL_MS",
        &mut config.worker.heartbeat_interval,
    )?;

    // Logging
    env.string("MESHGATE_LOG_LEVEL", &mut config.logging.level);
    env.parse("MESHGATE_LOG_FORMAT", &mut config.logging.format)?;

    Ok(())
}

struct Overrides<F> {
    lookup: F,
}

impl<F> Overrides<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|value| !value.trim().is_empty())
    }

    fn string(&self, key: &str, target: &mut String) {
        if let Some(value) = self.get(key) {
            *target = value;
        }
    }

    fn parse<T: FromStr>(&self, key: &str, target: &mut T) -> Result<(), ConfigError> {
        if let Some(value) = self.get(key) {
            *target = value
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidValue {
                    key: key.to_string(),
                    value,
                })?;
        }
        Ok(())
    }

    fn millis(&self, key: &str, target: &mut Duration) -> Result<(), ConfigError> {
        let mut millis = target.as_millis() as u64;
        self.parse(key, &mut millis)?;
        *target = Duration::from_millis(millis);
        Ok(())
    }
}
