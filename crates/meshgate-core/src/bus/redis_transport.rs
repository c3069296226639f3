//! Redis pub/sub transport for multi-process deployments
//!
//! Every topic maps to the channel `<prefix><topic>`. One pattern subscription on
//! `<prefix>*` feeds all inbound traffic into a local broadcast channel.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::error::BusError;
use super::transport::{Envelope, Transport};

/// Transport that publishes through Redis and listens on a pattern subscription
pub struct RedisTransport {
    publisher: ConnectionManager,
    prefix: String,
    inbound: broadcast::Sender<Envelope>,
    connected: Arc<AtomicBool>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for RedisTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisTransport")
            .field("prefix", &self.prefix)
            .field("connected", &self.connected.load(Ordering::Relaxed))
            .finish()
    }
}

impl RedisTransport {
    /// Connect to Redis and start listening on `<prefix>*`
    pub async fn connect(url: &str, prefix: &str, capacity: usize) -> Result<Self, BusError> {
        let client = redis::Client::open(url)?;
        let publisher = ConnectionManager::new(client.clone()).await?;

        let mut pubsub = client.get_async_pubsub().await?;
        pubsub.psubscribe(format!("{}*", prefix)).await?;

        let (inbound, _) = broadcast::channel(capacity.max(1));
        let connected = Arc::new(AtomicBool::new(true));

        let listener = tokio::spawn(listen(
            pubsub,
            prefix.to_string(),
            inbound.clone(),
            connected.clone(),
        ));

        tracing::info!(url = %url, prefix = %prefix, "Connected to Redis transport");

        Ok(Self {
            publisher,
            prefix: prefix.to_string(),
            inbound,
            connected,
            listener: Mutex::new(Some(listener)),
        })
    }

    fn channel(&self, topic: &str) -> String {
        format!("{}{}", self.prefix, topic)
    }
}

async fn listen(
    pubsub: redis::aio::PubSub,
    prefix: String,
    inbound: broadcast::Sender<Envelope>,
    connected: Arc<AtomicBool>,
) {
    let mut messages = pubsub.into_on_message();

    while let Some(message) = messages.next().await {
        let Some(topic) = message.get_channel_name().strip_prefix(prefix.as_str()) else {
            continue;
        };

        let raw: String = match message.get_payload() {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(topic = %topic, error = %e, "Dropping unreadable Redis message");
                continue;
            }
        };

        match serde_json::from_str(&raw) {
            Ok(payload) => {
                let _ = inbound.send(Envelope::new(topic, payload));
            }
            Err(e) => {
                tracing::warn!(topic = %topic, error = %e, "Dropping non-JSON Redis message");
            }
        }
    }

    connected.store(false, Ordering::Release);
    tracing::warn!("Redis subscription stream ended");
}

#[async_trait]
impl Transport for RedisTransport {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn send(&self, envelope: Envelope) -> Result<(), BusError> {
        let raw = serde_json::to_string(&envelope.payload)?;
        let mut conn = self.publisher.clone();
        let _receivers: i64 = conn.publish(self.channel(&envelope.topic), raw).await?;
        Ok(())
    }

    fn inbound(&self) -> broadcast::Receiver<Envelope> {
        self.inbound.subscribe()
    }

    async fn is_connected(&self) -> bool {
        if !self.connected.load(Ordering::Acquire) {
            return false;
        }
        let mut conn = self.publisher.clone();
        let pong: Result<String, redis::RedisError> =
            redis::cmd("PING").query_async(&mut conn).await;
        pong.is_ok()
    }

    async fn close(&self) {
        if let Some(listener) = self.listener.lock().take() {
            listener.abort();
        }
        self.connected.store(false, Ordering::Release);
    }
}
