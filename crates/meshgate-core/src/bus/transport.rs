//! Transport abstraction underneath the message bus
//!
//! A transport moves [`Envelope`]s between every process attached to it. It knows
//! nothing about handlers or correlation; the [`MessageBus`](super::MessageBus)
//! layers those on top of the raw inbound stream.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::error::BusError;

/// A single message as carried by a transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Topic the message was published on
    pub topic: String,
    /// JSON payload
    pub payload: serde_json::Value,
}

impl Envelope {
    pub fn new(topic: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            topic: topic.into(),
            payload,
        }
    }

    /// Correlation identifier embedded in the payload, if any
    pub fn correlation_id(&self) -> Option<&str> {
        self.payload
            .get("correlationId")
            .and_then(serde_json::Value::as_str)
    }
}

/// Broadcast transport shared by every bus attached to it
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Broadcast an envelope to every attached process, including this one
    async fn send(&self, envelope: Envelope) -> Result<(), BusError>;

    /// Stream of every envelope delivered to this process
    fn inbound(&self) -> broadcast::Receiver<Envelope>;

    /// Whether the underlying connection is alive
    async fn is_connected(&self) -> bool;

    /// Detach from the transport
    async fn close(&self);
}

/// In-process transport backed by a tokio broadcast channel
///
/// Cloning a transport attaches another participant to the same channel, which is
/// how tests and single-binary deployments model several processes sharing one
/// network. Closing a handle only detaches that handle.
#[derive(Debug)]
pub struct InMemoryTransport {
    sender: broadcast::Sender<Envelope>,
    closed: Arc<AtomicBool>,
    capacity: usize,
}

impl InMemoryTransport {
    /// Create a new transport with the given per-subscriber buffer
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            closed: Arc::new(AtomicBool::new(false)),
            capacity,
        }
    }

    /// Get the channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl Clone for InMemoryTransport {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            closed: Arc::new(AtomicBool::new(false)),
            capacity: self.capacity,
        }
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn send(&self, envelope: Envelope) -> Result<(), BusError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BusError::Closed);
        }
        // No listeners is not an error for a broadcast
        let _ = self.sender.send(envelope);
        Ok(())
    }

    fn inbound(&self) -> broadcast::Receiver<Envelope> {
        self.sender.subscribe()
    }

    async fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}
