//! Load balancing across healthy service instances

mod config;
mod load_balancer;

pub use config::{LoadBalancerConfig, Strategy};
pub use load_balancer::{ConnectionGuard, LoadBalancer, fnv1a_64};
