//! Request router
//!
//! Resolves a logical service to a healthy instance, guards the call with the
//! service's circuit breaker, forwards it and retries transient failures.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use dashmap::DashMap;

use super::config::GatewayConfig;
use super::forwarder::{ForwardError, Forwarder};
use super::types::{GatewayRequest, GatewayResponse};
use crate::balancer::LoadBalancer;
use crate::error::GatewayError;
use crate::recovery::{
    BackoffStrategy, CircuitBreaker, CircuitBreakerRegistry, ErrorClass, LinearBackoff,
    classify_status,
};
use crate::registry::ServiceRegistry;

/// Longest downstream body excerpt carried in an error message
const ERROR_BODY_LIMIT: usize = 512;

/// Front door for routed calls
pub struct Gateway {
    pub(super) registry: Arc<ServiceRegistry>,
    pub(super) balancer: LoadBalancer,
    pub(super) breakers: CircuitBreakerRegistry,
    forwarder: Arc<dyn Forwarder>,
    config: GatewayConfig,
    pub(super) error_counts: DashMap<String, AtomicU64>,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("config", &self.config)
            .field("breakers", &self.breakers.names())
            .finish()
    }
}

impl Gateway {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        forwarder: Arc<dyn Forwarder>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            registry,
            balancer: LoadBalancer::default(),
            breakers: CircuitBreakerRegistry::default(),
            forwarder,
            config,
            error_counts: DashMap::new(),
        }
    }

    pub fn with_load_balancer(mut self, balancer: LoadBalancer) -> Self {
        self.balancer = balancer;
        self
    }

    pub fn with_breakers(mut self, breakers: CircuitBreakerRegistry) -> Self {
        self.breakers = breakers;
        self
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn balancer(&self) -> &LoadBalancer {
        &self.balancer
    }

    /// Breaker guarding `service`, created on first use
    pub fn circuit_breaker(&self, service: &str) -> Arc<CircuitBreaker> {
        self.breakers.get(service)
    }

    /// Route one call, retrying network errors, timeouts and 5xx replies
    #[tracing::instrument(
        name = "route",
        skip(self, request),
        fields(request_id = %request.request_id, method = %request.method, path = %request.path)
    )]
    pub async fn route(
        &self,
        service: &str,
        request: &GatewayRequest,
    ) -> Result<GatewayResponse, GatewayError> {
        let backoff = LinearBackoff::proportional(self.config.retry_delay);
        let mut retries = 0;

        loop {
            match self.attempt(service, request).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() && retries < self.config.max_retries => {
                    let delay = backoff.delay_for_attempt(retries);
                    retries += 1;
                    tracing::debug!(
                        service = %service,
                        retry = retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying request"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    if e.is_retryable() {
                        tracing::warn!(
                            service = %service,
                            attempts = retries + 1,
                            error = %e,
                            "Retries exhausted"
                        );
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn attempt(
        &self,
        service: &str,
        request: &GatewayRequest,
    ) -> Result<GatewayResponse, GatewayError> {
        let candidates = self.registry.get_healthy_services(service).await;
        if candidates.is_empty() {
            return Err(GatewayError::no_healthy_instance(service));
        }

        let instance = self
            .balancer
            .select_instance(service, &candidates, request.client_key.as_deref())
            .ok_or_else(|| GatewayError::no_healthy_instance(service))?;

        let breaker = self.breakers.get(service);
        if breaker.is_open() {
            tracing::debug!(service = %service, "Circuit open; rejecting");
            return Err(GatewayError::circuit_open(service));
        }

        let _connection = self.balancer.acquire(&instance.id);
        let started = Instant::now();
        let outcome = tokio::time::timeout(
            self.config.request_timeout,
            self.forwarder.forward(&instance, request),
        )
        .await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        let result = match outcome {
            Ok(Ok(response)) if response.is_success() => Ok(response),
            Ok(Ok(response)) => Err(status_error(&response)),
            Ok(Err(ForwardError::Timeout)) | Err(_) => Err(GatewayError::RequestTimeout {
                service: service.to_string(),
                timeout_ms: self.config.request_timeout.as_millis() as u64,
            }),
            Ok(Err(e)) => Err(GatewayError::from(e)),
        };

        if let Err(e) = &result {
            tracing::debug!(service = %service, instance = %instance.id, error = %e, "Attempt failed");
        }
        self.record_outcome(service, &breaker, &result, elapsed_ms)
            .await;
        result
    }

    async fn record_outcome(
        &self,
        service: &str,
        breaker: &CircuitBreaker,
        result: &Result<GatewayResponse, GatewayError>,
        elapsed_ms: f64,
    ) {
        match result {
            Ok(_) => {
                breaker.record_success();
                self.registry
                    .record_request_outcome(service, true, elapsed_ms)
                    .await;
            }
            Err(e) => {
                let client_error = matches!(e, GatewayError::ClientError { .. });
                if !client_error || self.config.count_client_errors {
                    breaker.record_failure();
                }
                self.registry
                    .record_request_outcome(service, false, elapsed_ms)
                    .await;
                self.error_counts
                    .entry(service.to_string())
                    .or_insert_with(|| AtomicU64::new(0))
                    .fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Failed attempts recorded for `service`
    pub fn error_count(&self, service: &str) -> u64 {
        self.error_counts
            .get(service)
            .map(|count| count.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

fn status_error(response: &GatewayResponse) -> GatewayError {
    let mut message = response.text();
    if message.len() > ERROR_BODY_LIMIT {
        let cut = (0..=ERROR_BODY_LIMIT)
            .rev()
            .find(|i| message.is_char_boundary(*i))
            .unwrap_or(0);
        message.truncate(cut);
    }

    match classify_status(response.status) {
        ErrorClass::Permanent => GatewayError::ClientError {
            status: response.status,
            message,
        },
        ErrorClass::Transient => GatewayError::downstream(Some(response.status), message),
    }
}
