//! Message bus
//!
//! Topic-based publish/subscribe over a pluggable transport, plus a correlated
//! request/response primitive used by the registry's health probes.

mod config;
mod error;
mod message_bus;
mod redis_transport;
mod transport;

#[cfg(test)]
mod tests;

pub use config::{BusConfig, TransportKind};
pub use error::BusError;
pub use message_bus::{
    CORRELATION_FIELD, Handler, MessageBus, SubscriptionId, reply_topic_for,
};
pub use redis_transport::RedisTransport;
pub use transport::{Envelope, InMemoryTransport, Transport};
