//! Circuit breaker implementation

use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::types::{CircuitBreakerConfig, CircuitBreakerStats, CircuitState};

struct BreakerInner {
    state: CircuitState,
    /// Consecutive failures
    failure_count: u32,
    total_successes: u64,
    total_failures: u64,
    last_failure: Option<DateTime<Utc>>,
    opened_at: Option<Instant>,
    opened_at_wall: Option<DateTime<Utc>>,
    /// Bumped on every open/reset so a stale timer never fires
    generation: u64,
    reset_timer: Option<JoinHandle<()>>,
}

impl BreakerInner {
    fn disarm(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        if let Some(timer) = self.reset_timer.take() {
            timer.abort();
        }
    }
}

/// Circuit breaker for protecting against failing dependencies
///
/// The breaker only tracks outcomes; callers check [`is_open`](Self::is_open)
/// before dispatching and report back with `record_success`/`record_failure`.
pub struct CircuitBreaker {
    /// Component name (for logging and metrics)
    name: String,
    /// Configuration
    config: CircuitBreakerConfig,
    inner: Arc<Mutex<BreakerInner>>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

impl CircuitBreaker {
    /// Create a new circuit breaker with default config
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(name, CircuitBreakerConfig::default())
    }

    /// Create a new circuit breaker with custom config
    pub fn with_config(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Arc::new(Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                total_successes: 0,
                total_failures: 0,
                last_failure: None,
                opened_at: None,
                opened_at_wall: None,
                generation: 0,
                reset_timer: None,
            })),
        }
    }

    /// Get the component name
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Get the current state
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.check_reset_timeout(&mut inner);
        inner.state
    }

    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    pub fn is_closed(&self) -> bool {
        self.state() == CircuitState::Closed
    }

    pub fn is_half_open(&self) -> bool {
        self.state() == CircuitState::HalfOpen
    }

    /// Consecutive failures since the last success or reset
    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    pub fn last_failure_time(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().last_failure
    }

    /// Record a successful operation
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        self.check_reset_timeout(&mut inner);
        inner.total_successes += 1;
        inner.failure_count = 0;

        if inner.state == CircuitState::HalfOpen {
            self.transition_to_closed(&mut inner);
        }
    }

    /// Record a failed operation
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        self.check_reset_timeout(&mut inner);
        inner.total_failures += 1;
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure = Some(Utc::now());

        match inner.state {
            CircuitState::Closed => {
                if inner.failure_count >= self.config.failure_threshold {
                    self.transition_to_open(&mut inner);
                }
            }
            CircuitState::HalfOpen => {
                // The trial request failed
                self.transition_to_open(&mut inner);
            }
            CircuitState::Open => {}
        }
    }

    /// Get circuit breaker statistics
    pub fn stats(&self) -> CircuitBreakerStats {
        let mut inner = self.inner.lock();
        self.check_reset_timeout(&mut inner);
        CircuitBreakerStats {
            state: inner.state,
            failure_count: inner.failure_count,
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
            last_failure: inner.last_failure,
            opened_at: inner.opened_at_wall,
        }
    }

    /// Manually reset the circuit breaker to closed state
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        self.transition_to_closed(&mut inner);
    }

    /// Manually open the circuit breaker
    pub fn trip(&self) {
        let mut inner = self.inner.lock();
        self.transition_to_open(&mut inner);
    }

    /// Fallback for when no runtime was available to arm the timer
    fn check_reset_timeout(&self, inner: &mut BreakerInner) {
        if inner.state != CircuitState::Open {
            return;
        }
        if let Some(opened_at) = inner.opened_at {
            if opened_at.elapsed() >= self.config.reset_timeout {
                self.transition_to_half_open(inner);
            }
        }
    }

    fn transition_to_open(&self, inner: &mut BreakerInner) {
        inner.disarm();
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        inner.opened_at_wall = Some(Utc::now());
        inner.reset_timer = self.arm_reset_timer(inner.generation);

        tracing::warn!(
            circuit = %self.name,
            failures = inner.failure_count,
            reset_timeout_ms = self.config.reset_timeout.as_millis() as u64,
            "Circuit breaker opened"
        );
    }

    fn transition_to_half_open(&self, inner: &mut BreakerInner) {
        inner.disarm();
        inner.state = CircuitState::HalfOpen;

        tracing::info!(
            circuit = %self.name,
            "Circuit breaker transitioning to half-open"
        );
    }

    fn transition_to_closed(&self, inner: &mut BreakerInner) {
        inner.disarm();
        let was = inner.state;
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.opened_at = None;
        inner.opened_at_wall = None;

        if was != CircuitState::Closed {
            tracing::info!(
                circuit = %self.name,
                "Circuit breaker closed"
            );
        }
    }

    fn arm_reset_timer(&self, generation: u64) -> Option<JoinHandle<()>> {
        let runtime = Handle::try_current().ok()?;
        let inner: Weak<Mutex<BreakerInner>> = Arc::downgrade(&self.inner);
        let name = self.name.clone();
        let timeout = self.config.reset_timeout;

        Some(runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(inner) = inner.upgrade() else { return };
            let mut inner = inner.lock();
            if inner.generation == generation && inner.state == CircuitState::Open {
                inner.state = CircuitState::HalfOpen;
                // Our own handle; dropping it detaches this task
                inner.reset_timer = None;
                tracing::info!(
                    circuit = %name,
                    "Circuit breaker transitioning to half-open"
                );
            }
        }))
    }
}

impl Drop for CircuitBreaker {
    fn drop(&mut self) {
        self.inner.lock().disarm();
    }
}
