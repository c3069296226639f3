//! Retry pacing
//!
//! Exponential backoff with jitter paces transport reconnects; the router's
//! per-request retries wait linearly longer each time.

use rand::Rng;
use std::time::Duration;

/// Exponential backoff parameters
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Fraction of each delay randomized in either direction; 0 disables jitter
    pub jitter_ratio: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_ratio: 0.2,
        }
    }
}

impl BackoffConfig {
    /// Reconnect pacing starting at `initial_delay`
    pub fn with_initial_delay(initial_delay: Duration) -> Self {
        Self {
            initial_delay,
            ..Default::default()
        }
    }

    pub fn max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter_ratio = 0.0;
        self
    }
}

pub trait BackoffStrategy: Send + Sync {
    /// Delay before retry number `attempt` (0-indexed)
    fn delay_for_attempt(&self, attempt: u32) -> Duration;
}

/// Doubling delays for reconnect loops, tracking its own attempt count
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
    attempt: u32,
}

impl ExponentialBackoff {
    pub fn with_config(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Delay for the current attempt, then advance
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.delay_for_attempt(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::with_config(BackoffConfig::default())
    }
}

impl BackoffStrategy for ExponentialBackoff {
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let config = &self.config;
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let seconds = (config.initial_delay.as_secs_f64() * config.multiplier.powi(exponent))
            .min(config.max_delay.as_secs_f64());

        if config.jitter_ratio <= 0.0 || seconds <= 0.0 {
            return Duration::from_secs_f64(seconds);
        }
        let spread = seconds * config.jitter_ratio;
        let jittered = seconds + rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_secs_f64(jittered.max(0.0))
    }
}

/// Retry `n` waits `step × (n + 1)`, optionally capped
#[derive(Debug, Clone)]
pub struct LinearBackoff {
    step: Duration,
    max_delay: Duration,
}

impl LinearBackoff {
    pub fn proportional(step: Duration) -> Self {
        Self {
            step,
            max_delay: Duration::MAX,
        }
    }

    pub fn capped(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }
}

impl BackoffStrategy for LinearBackoff {
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.step
            .saturating_mul(attempt.saturating_add(1))
            .min(self.max_delay)
    }
}
