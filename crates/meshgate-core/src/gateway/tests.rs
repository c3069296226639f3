use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use wiremock::matchers::{body_string, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use super::forwarder::MockForwarder;
use super::*;
use crate::bus::{InMemoryTransport, MessageBus};
use crate::error::GatewayError;
use crate::protocol::InstanceMetadata;
use crate::recovery::{CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState};
use crate::registry::{RegistryConfig, ServiceInstance, ServiceRegistry};

fn fast_config() -> GatewayConfig {
    GatewayConfig {
        max_retries: 3,
        retry_delay: Duration::from_millis(5),
        request_timeout: Duration::from_millis(200),
        count_client_errors: false,
    }
}

async fn registry_with(ids: &[&str]) -> Arc<ServiceRegistry> {
    let bus = MessageBus::new(Arc::new(InMemoryTransport::default()));
    let registry = Arc::new(ServiceRegistry::new(bus, RegistryConfig::default()));
    for id in ids {
        registry
            .register_instance(ServiceInstance::new("search", *id))
            .await;
    }
    registry
}

#[tokio::test]
async fn test_no_instances_fails_without_forwarding() {
    let mut forwarder = MockForwarder::new();
    forwarder.expect_forward().never();

    let gateway = Gateway::new(registry_with(&[]).await, Arc::new(forwarder), fast_config());
    let err = gateway
        .route("search", &GatewayRequest::get("/q"))
        .await
        .unwrap_err();

    assert_eq!(err, GatewayError::no_healthy_instance("search"));
    assert_eq!(err.status_code(), 503);
}

#[tokio::test]
async fn test_retries_server_errors_until_success() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();

    let mut forwarder = MockForwarder::new();
    forwarder.expect_forward().times(4).returning(move |_, _| {
        if counter.fetch_add(1, Ordering::SeqCst) < 3 {
            Ok(GatewayResponse::new(500).with_body("boom"))
        } else {
            Ok(GatewayResponse::new(200).with_body("ok"))
        }
    });

    let registry = registry_with(&["a", "b"]).await;
    let gateway = Gateway::new(registry.clone(), Arc::new(forwarder), fast_config());

    let response = gateway
        .route("search", &GatewayRequest::get("/q"))
        .await
        .unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.text(), "ok");
    assert_eq!(calls.load(Ordering::SeqCst), 4);

    let breaker = gateway.circuit_breaker("search").stats();
    assert_eq!(breaker.total_failures, 3);
    assert_eq!(breaker.failure_count, 0);
    assert_eq!(breaker.state, CircuitState::Closed);

    let stats = registry.stats("search").await.unwrap();
    assert_eq!(stats.total_requests, 4);
    assert_eq!(stats.successful_requests, 1);
    assert_eq!(gateway.error_count("search"), 3);
}

#[tokio::test]
async fn test_exhausted_retries_return_last_error() {
    let mut forwarder = MockForwarder::new();
    forwarder
        .expect_forward()
        .times(3)
        .returning(|_, _| Ok(GatewayResponse::new(503).with_body("overloaded")));

    let config = GatewayConfig {
        max_retries: 2,
        ..fast_config()
    };
    let gateway = Gateway::new(registry_with(&["a"]).await, Arc::new(forwarder), config);

    let err = gateway
        .route("search", &GatewayRequest::get("/q"))
        .await
        .unwrap_err();

    assert_eq!(err, GatewayError::downstream(Some(503), "overloaded"));
    assert_eq!(err.status_code(), 500);
}

#[tokio::test]
async fn test_client_error_is_not_retried_or_counted() {
    let mut forwarder = MockForwarder::new();
    forwarder
        .expect_forward()
        .times(1)
        .returning(|_, _| Ok(GatewayResponse::new(404).with_body("no such thing")));

    let registry = registry_with(&["a"]).await;
    let gateway = Gateway::new(registry.clone(), Arc::new(forwarder), fast_config());

    let err = gateway
        .route("search", &GatewayRequest::get("/missing"))
        .await
        .unwrap_err();

    assert_eq!(
        err,
        GatewayError::ClientError {
            status: 404,
            message: "no such thing".to_string()
        }
    );
    assert_eq!(err.status_code(), 404);
    assert_eq!(gateway.circuit_breaker("search").stats().total_failures, 0);
    assert_eq!(registry.stats("search").await.unwrap().failed_requests, 1);
    assert_eq!(gateway.error_count("search"), 1);
}

#[tokio::test]
async fn test_client_errors_can_trip_breaker() {
    let mut forwarder = MockForwarder::new();
    forwarder
        .expect_forward()
        .returning(|_, _| Ok(GatewayResponse::new(400)));

    let config = GatewayConfig {
        count_client_errors: true,
        ..fast_config()
    };
    let gateway = Gateway::new(registry_with(&["a"]).await, Arc::new(forwarder), config);

    let _ = gateway.route("search", &GatewayRequest::get("/")).await;
    assert_eq!(gateway.circuit_breaker("search").failure_count(), 1);
}

#[tokio::test]
async fn test_open_breaker_short_circuits() {
    let mut forwarder = MockForwarder::new();
    forwarder.expect_forward().never();

    let gateway = Gateway::new(registry_with(&["a"]).await, Arc::new(forwarder), fast_config());
    gateway.circuit_breaker("search").trip();

    let err = gateway
        .route("search", &GatewayRequest::get("/q"))
        .await
        .unwrap_err();

    assert_eq!(err, GatewayError::circuit_open("search"));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_breaker_opens_during_retries() {
    let mut forwarder = MockForwarder::new();
    forwarder
        .expect_forward()
        .times(2)
        .returning(|_, _| Ok(GatewayResponse::new(500)));

    let breakers = CircuitBreakerRegistry::with_config(CircuitBreakerConfig {
        failure_threshold: 2,
        reset_timeout: Duration::from_secs(60),
    });
    let gateway = Gateway::new(registry_with(&["a"]).await, Arc::new(forwarder), fast_config())
        .with_breakers(breakers);

    // Third attempt finds the breaker open and stops
    let err = gateway
        .route("search", &GatewayRequest::get("/q"))
        .await
        .unwrap_err();

    assert_eq!(err, GatewayError::circuit_open("search"));
}

struct SlowForwarder {
    calls: AtomicUsize,
}

#[async_trait]
impl Forwarder for SlowForwarder {
    async fn forward(
        &self,
        _instance: &ServiceInstance,
        _request: &GatewayRequest,
    ) -> Result<GatewayResponse, ForwardError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(GatewayResponse::new(200))
    }
}

#[tokio::test]
async fn test_slow_downstream_times_out() {
    let forwarder = Arc::new(SlowForwarder {
        calls: AtomicUsize::new(0),
    });
    let config = GatewayConfig {
        max_retries: 1,
        request_timeout: Duration::from_millis(50),
        ..fast_config()
    };
    let gateway = Gateway::new(registry_with(&["a"]).await, forwarder.clone(), config);

    let err = gateway
        .route("search", &GatewayRequest::get("/slow"))
        .await
        .unwrap_err();

    assert!(matches!(err, GatewayError::RequestTimeout { .. }));
    assert_eq!(forwarder.calls.load(Ordering::SeqCst), 2);
    assert_eq!(gateway.circuit_breaker("search").stats().total_failures, 2);
    // Connection slots are released even though the futures were dropped
    assert_eq!(gateway.balancer().active_connections("a"), 0);
}

#[tokio::test]
async fn test_network_errors_are_retried() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();

    let mut forwarder = MockForwarder::new();
    forwarder.expect_forward().returning(move |_, _| {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            Err(ForwardError::Network("connection reset".to_string()))
        } else {
            Ok(GatewayResponse::new(204))
        }
    });

    let gateway = Gateway::new(registry_with(&["a"]).await, Arc::new(forwarder), fast_config());
    let response = gateway
        .route("search", &GatewayRequest::get("/q"))
        .await
        .unwrap();

    assert_eq!(response.status, 204);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_snapshot_and_breaker_reset() {
    let mut forwarder = MockForwarder::new();
    forwarder
        .expect_forward()
        .returning(|_, _| Ok(GatewayResponse::new(200)));

    let gateway = Gateway::new(registry_with(&["a", "b"]).await, Arc::new(forwarder), fast_config());
    gateway
        .route("search", &GatewayRequest::get("/q"))
        .await
        .unwrap();

    assert!(!gateway.reset_circuit_breaker("billing"));
    gateway.circuit_breaker("search").trip();
    assert!(gateway.reset_circuit_breaker("search"));
    assert!(gateway.circuit_breaker("search").is_closed());

    let snapshot = gateway.snapshot().await;
    let search = snapshot.service("search").unwrap();
    assert_eq!(search.stats.total_instances, 2);
    assert_eq!(search.stats.successful_requests, 1);
    assert_eq!(search.error_count, 0);
    assert_eq!(search.breaker.as_ref().unwrap().state, CircuitState::Closed);

    let json = serde_json::to_value(&snapshot).unwrap();
    assert_eq!(json["services"][0]["service"], "search");
    assert_eq!(json["services"][0]["errorCount"], 0);
}

#[tokio::test]
async fn test_http_forwarder_passes_request_through() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/translate"))
        .and(query_param("lang", "fr"))
        .and(header("x-trace", "abc"))
        .and(header("x-request-id", "req-42"))
        .and(body_string("{\"text\":\"hello\"}"))
        .respond_with(
            ResponseTemplate::new(201)
                .insert_header("x-served-by", "w-1")
                .set_body_string("bonjour"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let address = server.address();
    let instance = ServiceInstance::new("translate", "w-1").with_metadata(InstanceMetadata::new(
        address.ip().to_string(),
        address.port(),
    ));
    let request = GatewayRequest::post("/translate")
        .with_request_id("req-42")
        .with_query("lang", "fr")
        .with_header("x-trace", "abc")
        .with_header("host", "ignored.example")
        .with_body("{\"text\":\"hello\"}");

    let response = HttpForwarder::new()
        .forward(&instance, &request)
        .await
        .unwrap();

    assert_eq!(response.status, 201);
    assert_eq!(response.text(), "bonjour");
    assert_eq!(response.header("X-Served-By"), Some("w-1"));
}

#[tokio::test]
async fn test_http_forwarder_returns_error_statuses() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(502).set_body_json(serde_json::json!({"error": "upstream down"})),
        )
        .mount(&server)
        .await;

    let address = server.address();
    let instance = ServiceInstance::new("search", "w-1").with_metadata(InstanceMetadata::new(
        address.ip().to_string(),
        address.port(),
    ));

    let response = HttpForwarder::new()
        .forward(&instance, &GatewayRequest::get("/anything"))
        .await
        .unwrap();
    assert_eq!(response.status, 502);
    let body: serde_json::Value = response.json().unwrap();
    assert_eq!(body["error"], "upstream down");
}

#[tokio::test]
async fn test_http_forwarder_requires_address() {
    let instance = ServiceInstance::new("search", "bare");
    let err = HttpForwarder::new()
        .forward(&instance, &GatewayRequest::get("/"))
        .await
        .unwrap_err();

    assert_eq!(err, ForwardError::NoAddress("bare".to_string()));
}

#[tokio::test]
async fn test_unsendable_request_is_a_client_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let address = server.address();
    let bus = MessageBus::new(Arc::new(InMemoryTransport::default()));
    let registry = Arc::new(ServiceRegistry::new(bus, RegistryConfig::default()));
    registry
        .register_instance(ServiceInstance::new("search", "w-1").with_metadata(
            InstanceMetadata::new(address.ip().to_string(), address.port()),
        ))
        .await;

    let breakers = CircuitBreakerRegistry::with_config(CircuitBreakerConfig {
        failure_threshold: 3,
        reset_timeout: Duration::from_secs(60),
    });
    let gateway = Gateway::new(registry, Arc::new(HttpForwarder::new()), fast_config())
        .with_breakers(breakers);
    let request = GatewayRequest::get("/q").with_header("x-bad", "line\nbreak");

    for _ in 0..3 {
        let err = gateway.route("search", &request).await.unwrap_err();
        assert!(matches!(err, GatewayError::ClientError { status: 400, .. }));
        assert_eq!(err.status_code(), 400);
    }

    // One attempt per call and the breaker never sees them
    assert_eq!(gateway.error_count("search"), 3);
    let breaker = gateway.circuit_breaker("search").stats();
    assert_eq!(breaker.state, CircuitState::Closed);
    assert_eq!(breaker.failure_count, 0);
    assert_eq!(breaker.total_failures, 0);
}

#[tokio::test(start_paused = true)]
async fn test_retry_delays_grow_linearly() {
    let calls = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let log = calls.clone();

    let mut forwarder = MockForwarder::new();
    forwarder.expect_forward().times(4).returning(move |_, _| {
        let mut log = log.lock();
        log.push(tokio::time::Instant::now());
        if log.len() < 4 {
            Ok(GatewayResponse::new(500))
        } else {
            Ok(GatewayResponse::new(200))
        }
    });

    let config = GatewayConfig {
        max_retries: 3,
        retry_delay: Duration::from_millis(100),
        request_timeout: Duration::from_secs(30),
        count_client_errors: false,
    };
    let gateway = Gateway::new(registry_with(&["a"]).await, Arc::new(forwarder), config)
        .with_breakers(CircuitBreakerRegistry::with_config(CircuitBreakerConfig {
            failure_threshold: 10,
            reset_timeout: Duration::from_secs(60),
        }));

    let started = tokio::time::Instant::now();
    let response = gateway
        .route("search", &GatewayRequest::get("/q"))
        .await
        .unwrap();
    assert_eq!(response.status, 200);

    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(600), "{:?}", elapsed);
    assert!(elapsed < Duration::from_millis(700), "{:?}", elapsed);

    let calls = calls.lock();
    let gaps: Vec<Duration> = calls.windows(2).map(|pair| pair[1] - pair[0]).collect();
    for (gap, expected) in gaps.iter().zip([100u64, 200, 300]) {
        let expected = Duration::from_millis(expected);
        assert!(*gap >= expected, "{:?} < {:?}", gap, expected);
        assert!(*gap < expected + Duration::from_millis(10), "{:?}", gap);
    }
    assert_eq!(gaps.len(), 3);
}

fn half_open_gateway(forwarder: MockForwarder, registry: Arc<ServiceRegistry>) -> Gateway {
    let config = GatewayConfig {
        max_retries: 0,
        ..fast_config()
    };
    Gateway::new(registry, Arc::new(forwarder), config).with_breakers(
        CircuitBreakerRegistry::with_config(CircuitBreakerConfig {
            failure_threshold: 1,
            reset_timeout: Duration::from_secs(1),
        }),
    )
}

#[tokio::test(start_paused = true)]
async fn test_breaker_lets_trial_through_after_reset_timeout() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();

    let mut forwarder = MockForwarder::new();
    forwarder.expect_forward().returning(move |_, _| {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            Ok(GatewayResponse::new(500))
        } else {
            Ok(GatewayResponse::new(200).with_body("back"))
        }
    });
    let gateway = half_open_gateway(forwarder, registry_with(&["a"]).await);
    let request = GatewayRequest::get("/q");

    let err = gateway.route("search", &request).await.unwrap_err();
    assert_eq!(err, GatewayError::downstream(Some(500), ""));
    assert!(gateway.circuit_breaker("search").is_open());

    let err = gateway.route("search", &request).await.unwrap_err();
    assert_eq!(err, GatewayError::circuit_open("search"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(gateway.circuit_breaker("search").is_half_open());

    let response = gateway.route("search", &request).await.unwrap();
    assert_eq!(response.text(), "back");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(gateway.circuit_breaker("search").is_closed());
}

#[tokio::test(start_paused = true)]
async fn test_failed_trial_reopens_breaker() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();

    let mut forwarder = MockForwarder::new();
    forwarder.expect_forward().returning(move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(GatewayResponse::new(503))
    });
    let gateway = half_open_gateway(forwarder, registry_with(&["a"]).await);
    let request = GatewayRequest::get("/q");

    let _ = gateway.route("search", &request).await;
    assert!(gateway.circuit_breaker("search").is_open());

    tokio::time::sleep(Duration::from_secs(1)).await;
    let err = gateway.route("search", &request).await.unwrap_err();
    assert_eq!(err, GatewayError::downstream(Some(503), ""));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(gateway.circuit_breaker("search").is_open());

    let err = gateway.route("search", &request).await.unwrap_err();
    assert_eq!(err, GatewayError::circuit_open("search"));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}
