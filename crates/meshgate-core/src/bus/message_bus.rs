//! Topic-based publish/subscribe with request/response correlation

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::config::{BusConfig, TransportKind};
use super::error::BusError;
use super::redis_transport::RedisTransport;
use super::transport::{Envelope, InMemoryTransport, Transport};
use crate::recovery::backoff::{BackoffConfig, ExponentialBackoff};

/// Payload field carrying the correlation identifier
pub const CORRELATION_FIELD: &str = "correlationId";

/// Handler invoked for every message on a subscribed topic
pub type Handler = Arc<dyn Fn(Value) -> BoxFuture<'static, ()> + Send + Sync>;

/// Identifier returned by [`MessageBus::subscribe`]
pub type SubscriptionId = u64;

struct Subscription {
    id: SubscriptionId,
    handler: Handler,
}

struct PendingReply {
    reply_topic: String,
    sender: oneshot::Sender<Value>,
}

/// Removes a pending correlation when the awaiting request finishes for any reason
struct PendingGuard<'a> {
    pending: &'a DashMap<String, PendingReply>,
    correlation_id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(self.correlation_id);
    }
}

struct BusInner {
    transport: Arc<dyn Transport>,
    subscriptions: DashMap<String, Vec<Subscription>>,
    pending: DashMap<String, PendingReply>,
    next_subscription: AtomicU64,
    shutdown: CancellationToken,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl BusInner {
    async fn dispatch(&self, envelope: Envelope) {
        if let Some(correlation_id) = envelope.correlation_id() {
            if let Some((_, reply)) = self
                .pending
                .remove_if(correlation_id, |_, p| p.reply_topic == envelope.topic)
            {
                let _ = reply.sender.send(envelope.payload.clone());
            }
        }

        let handlers: Vec<Handler> = self
            .subscriptions
            .get(&envelope.topic)
            .map(|subs| subs.iter().map(|s| s.handler.clone()).collect())
            .unwrap_or_default();

        tracing::trace!(topic = %envelope.topic, handlers = handlers.len(), "Dispatching message");

        for handler in handlers {
            handler(envelope.payload.clone()).await;
        }
    }
}

/// Message bus over a pluggable [`Transport`]
///
/// Handlers for one bus run sequentially on a single dispatcher task, so a handler
/// must not await a [`request`](Self::request) round trip on the same bus; spawn
/// a task for that instead.
///
/// # Example
///
/// ```rust
/// use meshgate_core::bus::{InMemoryTransport, MessageBus};
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() {
///     let bus = MessageBus::new(Arc::new(InMemoryTransport::default()));
///     bus.subscribe("greetings", |payload| async move {
///         println!("received {payload}");
///     });
///     bus.publish("greetings", &serde_json::json!({"hello": "world"})).await.unwrap();
/// }
/// ```
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus")
            .field("transport", &self.inner.transport.name())
            .field("topics", &self.inner.subscriptions.len())
            .field("pending", &self.inner.pending.len())
            .finish()
    }
}

impl MessageBus {
    /// Attach a bus to a transport and start dispatching
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        let inbound = transport.inbound();
        let inner = Arc::new(BusInner {
            transport,
            subscriptions: DashMap::new(),
            pending: DashMap::new(),
            next_subscription: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
            dispatcher: Mutex::new(None),
        });

        let dispatcher = tokio::spawn(dispatch_loop(
            Arc::downgrade(&inner),
            inbound,
            inner.shutdown.clone(),
        ));
        *inner.dispatcher.lock() = Some(dispatcher);

        Self { inner }
    }

    /// Build the configured transport, retrying with backoff until it connects
    pub async fn connect(config: &BusConfig) -> Result<Self, BusError> {
        let transport: Arc<dyn Transport> = match config.transport {
            TransportKind::Memory => Arc::new(InMemoryTransport::new(config.capacity)),
            TransportKind::Redis => Arc::new(connect_redis_with_retry(config).await?),
        };
        tracing::info!(transport = transport.name(), "Message bus connected");
        Ok(Self::new(transport))
    }

    /// Name of the underlying transport
    pub fn transport_name(&self) -> &'static str {
        self.inner.transport.name()
    }

    /// Publish a payload to every subscriber of `topic`
    pub async fn publish<T: Serialize + ?Sized>(
        &self,
        topic: &str,
        payload: &T,
    ) -> Result<(), BusError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(BusError::Closed);
        }
        let payload = serde_json::to_value(payload)?;
        tracing::debug!(topic = %topic, "Publishing message");
        self.inner.transport.send(Envelope::new(topic, payload)).await
    }

    /// Register a handler for `topic`; every handler on a topic fires
    pub fn subscribe<F, Fut>(&self, topic: &str, handler: F) -> SubscriptionId
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = self.inner.next_subscription.fetch_add(1, Ordering::Relaxed);
        let handler: Handler = Arc::new(move |payload| handler(payload).boxed());

        self.inner
            .subscriptions
            .entry(topic.to_string())
            .or_default()
            .push(Subscription { id, handler });

        tracing::debug!(topic = %topic, subscription = id, "Subscribed");
        id
    }

    /// Remove a handler registered with [`subscribe`](Self::subscribe)
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut removed = false;
        for mut entry in self.inner.subscriptions.iter_mut() {
            let before = entry.value().len();
            entry.value_mut().retain(|s| s.id != id);
            removed |= entry.value().len() != before;
        }
        self.inner.subscriptions.retain(|_, subs| !subs.is_empty());
        removed
    }

    /// Number of handlers registered for `topic`
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner
            .subscriptions
            .get(topic)
            .map(|subs| subs.len())
            .unwrap_or(0)
    }

    /// Publish `payload` and await the correlated reply
    ///
    /// The payload must serialize to a JSON object. Its `correlationId` is used
    /// when present and non-empty, otherwise one is generated and embedded. A
    /// caller-supplied id already awaiting a reply is rejected. The
    /// reply is the first message on [`reply_topic_for`]`(topic)` carrying the
    /// same identifier.
    pub async fn request<T: Serialize + ?Sized>(
        &self,
        topic: &str,
        payload: &T,
        timeout: Duration,
    ) -> Result<Value, BusError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(BusError::Closed);
        }

        let mut payload = serde_json::to_value(payload)?;
        let Value::Object(fields) = &mut payload else {
            return Err(BusError::InvalidPayload(
                "request payload must be a JSON object".to_string(),
            ));
        };

        let correlation_id = match fields.get(CORRELATION_FIELD).and_then(Value::as_str) {
            Some(existing) if !existing.is_empty() => existing.to_string(),
            _ => {
                let generated = Uuid::new_v4().to_string();
                fields.insert(
                    CORRELATION_FIELD.to_string(),
                    Value::String(generated.clone()),
                );
                generated
            }
        };

        let (sender, receiver) = oneshot::channel();
        match self.inner.pending.entry(correlation_id.clone()) {
            Entry::Occupied(_) => return Err(BusError::DuplicateCorrelation(correlation_id)),
            Entry::Vacant(slot) => {
                slot.insert(PendingReply {
                    reply_topic: reply_topic_for(topic),
                    sender,
                });
            }
        }
        let _guard = PendingGuard {
            pending: &self.inner.pending,
            correlation_id: &correlation_id,
        };

        self.inner
            .transport
            .send(Envelope::new(topic, payload))
            .await?;

        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(BusError::Closed),
            Err(_) => Err(BusError::Timeout {
                topic: topic.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// Number of requests still awaiting a reply
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.len()
    }

    /// Whether the transport connection is alive
    pub async fn health_check(&self) -> bool {
        !self.inner.shutdown.is_cancelled() && self.inner.transport.is_connected().await
    }

    /// Stop dispatching, fail every pending request and detach from the transport
    pub async fn shutdown(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        self.inner.shutdown.cancel();
        if let Some(dispatcher) = self.inner.dispatcher.lock().take() {
            dispatcher.abort();
        }
        self.inner.pending.clear();
        self.inner.subscriptions.clear();
        self.inner.transport.close().await;
        tracing::info!(transport = self.inner.transport.name(), "Message bus shut down");
    }
}

/// Reply topic paired with a request topic: `health:check` → `health:response`
pub fn reply_topic_for(topic: &str) -> String {
    match topic.rsplit_once(':') {
        Some((namespace, _)) => format!("{}:response", namespace),
        None => format!("{}:response", topic),
    }
}

async fn dispatch_loop(
    inner: Weak<BusInner>,
    mut inbound: broadcast::Receiver<Envelope>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            received = inbound.recv() => match received {
                Ok(envelope) => {
                    let Some(inner) = inner.upgrade() else { break };
                    inner.dispatch(envelope).await;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Message bus dispatcher lagged; messages dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    tracing::debug!("Message bus dispatcher stopped");
}

async fn connect_redis_with_retry(config: &BusConfig) -> Result<RedisTransport, BusError> {
    let mut backoff =
        ExponentialBackoff::with_config(BackoffConfig::with_initial_delay(config.connect_backoff));
    let attempts = config.connect_retries.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match RedisTransport::connect(&config.redis_url, &config.channel_prefix, config.capacity)
            .await
        {
            Ok(transport) => return Ok(transport),
            Err(e) if attempt < attempts => {
                let delay = backoff.next_delay();
                tracing::warn!(
                    attempt,
                    max_attempts = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transport unavailable, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                tracing::error!(attempts, error = %e, "Giving up on transport connection");
                return Err(e);
            }
        }
    }
}
