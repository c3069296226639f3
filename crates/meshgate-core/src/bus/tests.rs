use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use serde_json::{Value, json};
use tokio::sync::mpsc;

use super::*;

fn memory_bus() -> (MessageBus, InMemoryTransport) {
    let transport = InMemoryTransport::default();
    let bus = MessageBus::new(Arc::new(transport.clone()));
    (bus, transport)
}

#[tokio::test]
async fn test_publish_reaches_every_handler() {
    let (bus, _transport) = memory_bus();
    let (tx, mut rx) = mpsc::unbounded_channel();

    for label in ["first", "second"] {
        let tx = tx.clone();
        bus.subscribe("orders:created", move |payload: Value| {
            let tx = tx.clone();
            async move {
                let _ = tx.send((label, payload));
            }
        });
    }

    bus.publish("orders:created", &json!({"id": 7})).await.unwrap();

    let mut labels = Vec::new();
    for _ in 0..2 {
        let (label, payload) = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(payload["id"], 7);
        labels.push(label);
    }
    assert_eq!(labels, vec!["first", "second"]);
}

#[tokio::test]
async fn test_publish_crosses_attached_buses() {
    let transport = InMemoryTransport::default();
    let sender = MessageBus::new(Arc::new(transport.clone()));
    let receiver = MessageBus::new(Arc::new(transport.clone()));
    let (tx, mut rx) = mpsc::unbounded_channel();

    receiver.subscribe("service:heartbeat", move |payload| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(payload);
        }
    });

    sender
        .publish("service:heartbeat", &json!({"serviceId": "w-1"}))
        .await
        .unwrap();

    let payload = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(payload["serviceId"], "w-1");
}

#[tokio::test]
async fn test_unsubscribe_stops_delivery() {
    let (bus, _transport) = memory_bus();
    let hits = Arc::new(AtomicUsize::new(0));

    let counter = hits.clone();
    let id = bus.subscribe("metrics", move |_| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });
    assert_eq!(bus.subscriber_count("metrics"), 1);

    assert!(bus.unsubscribe(id));
    assert!(!bus.unsubscribe(id));
    assert_eq!(bus.subscriber_count("metrics"), 0);

    bus.publish("metrics", &json!({})).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_request_resolves_with_correlated_reply() {
    let transport = InMemoryTransport::default();
    let requester = MessageBus::new(Arc::new(transport.clone()));
    let responder = MessageBus::new(Arc::new(transport.clone()));

    let replies = responder.clone();
    responder.subscribe("health:check", move |payload| {
        let replies = replies.clone();
        async move {
            // An unrelated reply first; it must not resolve the request
            let _ = replies
                .publish(
                    "health:response",
                    &json!({"correlationId": "someone-else", "status": "unhealthy"}),
                )
                .await;
            let _ = replies
                .publish(
                    "health:response",
                    &json!({"correlationId": payload["correlationId"], "status": "healthy"}),
                )
                .await;
        }
    });

    let reply = requester
        .request(
            "health:check",
            &json!({"targetService": "w-1"}),
            Duration::from_secs(1),
        )
        .await
        .unwrap();

    assert_eq!(reply["status"], "healthy");
    assert_eq!(requester.pending_requests(), 0);
}

#[tokio::test]
async fn test_request_keeps_caller_correlation_id() {
    let (bus, _transport) = memory_bus();

    let replies = bus.clone();
    bus.subscribe("jobs:run", move |payload| {
        let replies = replies.clone();
        async move {
            let _ = replies
                .publish(
                    "jobs:response",
                    &json!({"correlationId": payload["correlationId"], "ok": true}),
                )
                .await;
        }
    });

    let reply = bus
        .request(
            "jobs:run",
            &json!({"correlationId": "fixed-id"}),
            Duration::from_secs(1),
        )
        .await
        .unwrap();

    assert_eq!(reply["correlationId"], "fixed-id");
}

#[tokio::test]
async fn test_request_times_out_without_responder() {
    let (bus, _transport) = memory_bus();
    let timeout = Duration::from_millis(100);

    let started = Instant::now();
    let err = bus
        .request("health:check", &json!({"targetService": "nobody"}), timeout)
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(err.is_timeout());
    assert!(elapsed >= timeout);
    assert!(elapsed < timeout + Duration::from_millis(500));
    assert_eq!(bus.pending_requests(), 0);
}

#[tokio::test]
async fn test_dropped_request_clears_pending_entry() {
    let (bus, _transport) = memory_bus();

    let payload = json!({});
    let request = bus.request("health:check", &payload, Duration::from_secs(10));
    let outcome = tokio::time::timeout(Duration::from_millis(50), request).await;

    assert!(outcome.is_err());
    assert_eq!(bus.pending_requests(), 0);
}

#[tokio::test]
async fn test_request_rejects_non_object_payload() {
    let (bus, _transport) = memory_bus();

    let err = bus
        .request("health:check", &json!([1, 2, 3]), Duration::from_millis(50))
        .await
        .unwrap_err();

    assert!(matches!(err, BusError::InvalidPayload(_)));
}

#[tokio::test]
async fn test_shutdown_closes_bus() {
    let (bus, _transport) = memory_bus();
    assert!(bus.health_check().await);

    bus.shutdown().await;

    assert!(!bus.health_check().await);
    assert_eq!(
        bus.publish("anything", &json!({})).await,
        Err(BusError::Closed)
    );
    assert_eq!(
        bus.request("anything:ping", &json!({}), Duration::from_millis(10))
            .await,
        Err(BusError::Closed)
    );
}

#[tokio::test]
async fn test_shutdown_fails_waiting_request() {
    let (bus, _transport) = memory_bus();

    let waiting = bus.clone();
    let handle = tokio::spawn(async move {
        waiting
            .request("health:check", &json!({}), Duration::from_secs(10))
            .await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(bus.pending_requests(), 1);
    bus.shutdown().await;

    let result = handle.await.unwrap();
    assert_eq!(result, Err(BusError::Closed));
    assert_eq!(bus.pending_requests(), 0);
}

#[test]
fn test_reply_topic_convention() {
    assert_eq!(reply_topic_for("health:check"), "health:response");
    assert_eq!(reply_topic_for("a:b:c"), "a:b:response");
    assert_eq!(reply_topic_for("ping"), "ping:response");
}

#[test]
fn test_transport_kind_parsing() {
    assert_eq!("redis".parse::<TransportKind>(), Ok(TransportKind::Redis));
    assert_eq!("Memory".parse::<TransportKind>(), Ok(TransportKind::Memory));
    assert!("carrier-pigeon".parse::<TransportKind>().is_err());
}

#[tokio::test]
async fn test_duplicate_correlation_id_is_rejected() {
    let (bus, _transport) = memory_bus();

    let waiting = bus.clone();
    let first = tokio::spawn(async move {
        let payload = json!({"correlationId": "dup-id"});
        waiting
            .request("health:check", &payload, Duration::from_secs(5))
            .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(bus.pending_requests(), 1);

    let err = bus
        .request(
            "health:check",
            &json!({"correlationId": "dup-id"}),
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
    assert_eq!(err, BusError::DuplicateCorrelation("dup-id".to_string()));

    // The original request is still waiting and still answerable
    assert_eq!(bus.pending_requests(), 1);
    bus.publish(
        "health:response",
        &json!({"correlationId": "dup-id", "status": "healthy"}),
    )
    .await
    .unwrap();

    let reply = first.await.unwrap().unwrap();
    assert_eq!(reply["status"], "healthy");
    assert_eq!(bus.pending_requests(), 0);
}
