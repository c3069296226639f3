//! Request router and its administrative surface

mod admin;
mod config;
mod forwarder;
mod router;
mod types;

#[cfg(test)]
mod tests;

pub use admin::{GatewaySnapshot, ServiceSnapshot};
pub use config::GatewayConfig;
pub use forwarder::{ForwardError, Forwarder, HttpForwarder};
pub use router::Gateway;
pub use types::{GatewayRequest, GatewayResponse};
