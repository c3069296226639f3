//! Instance selection over a candidate list

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;

use super::config::{LoadBalancerConfig, Strategy};
use crate::registry::ServiceInstance;

type ConnectionCounts = Arc<DashMap<String, AtomicUsize>>;

/// Picks one healthy instance per call
///
/// Rotation cursors are kept per service name, connection counts per instance id.
#[derive(Debug)]
pub struct LoadBalancer {
    config: LoadBalancerConfig,
    cursors: Mutex<HashMap<String, usize>>,
    connections: ConnectionCounts,
}

impl LoadBalancer {
    pub fn new(config: LoadBalancerConfig) -> Self {
        Self {
            config,
            cursors: Mutex::new(HashMap::new()),
            connections: Arc::new(DashMap::new()),
        }
    }

    /// Balancer using one strategy for every service
    pub fn with_strategy(strategy: Strategy) -> Self {
        Self::new(LoadBalancerConfig {
            strategy,
            ..Default::default()
        })
    }

    pub fn strategy_for(&self, service: &str) -> Strategy {
        self.config
            .services
            .get(service)
            .copied()
            .unwrap_or(self.config.strategy)
    }

    /// Select a healthy instance, or `None` when there is none
    pub fn select_instance(
        &self,
        service: &str,
        instances: &[ServiceInstance],
        client_key: Option<&str>,
    ) -> Option<ServiceInstance> {
        let healthy: Vec<&ServiceInstance> =
            instances.iter().filter(|i| i.is_healthy()).collect();
        if healthy.is_empty() {
            return None;
        }

        let strategy = self.strategy_for(service);
        let index = match strategy {
            Strategy::RoundRobin => self.next_round_robin(service, healthy.len()),
            Strategy::LeastConnections => self.least_connections(&healthy),
            Strategy::Random => random_index(healthy.len()),
            Strategy::IpHash => match client_key {
                Some(key) => (fnv1a_64(key.as_bytes()) % healthy.len() as u64) as usize,
                None => random_index(healthy.len()),
            },
        };

        let selected = healthy[index];
        tracing::debug!(
            service = %service,
            instance = %selected.id,
            strategy = %strategy,
            candidates = healthy.len(),
            "Selected instance"
        );
        Some(selected.clone())
    }

    fn next_round_robin(&self, service: &str, len: usize) -> usize {
        let mut cursors = self.cursors.lock();
        let cursor = cursors.entry(service.to_string()).or_insert(0);
        let index = *cursor % len;
        *cursor = (index + 1) % len;
        index
    }

    fn least_connections(&self, healthy: &[&ServiceInstance]) -> usize {
        healthy
            .iter()
            .enumerate()
            .min_by_key(|(_, instance)| self.active_connections(&instance.id))
            .map(|(index, _)| index)
            .unwrap_or(0)
    }

    /// Count one in-flight request against `instance_id` until the guard drops
    pub fn acquire(&self, instance_id: &str) -> ConnectionGuard {
        self.connections
            .entry(instance_id.to_string())
            .or_insert_with(|| AtomicUsize::new(0))
            .fetch_add(1, Ordering::AcqRel);

        ConnectionGuard {
            connections: self.connections.clone(),
            instance_id: instance_id.to_string(),
        }
    }

    pub fn active_connections(&self, instance_id: &str) -> usize {
        self.connections
            .get(instance_id)
            .map(|count| count.load(Ordering::Acquire))
            .unwrap_or(0)
    }
}

impl Default for LoadBalancer {
    fn default() -> Self {
        Self::new(LoadBalancerConfig::default())
    }
}

/// Releases a connection slot on drop
#[derive(Debug)]
pub struct ConnectionGuard {
    connections: ConnectionCounts,
    instance_id: String,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if let Some(count) = self.connections.get(&self.instance_id) {
            let _ = count.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        }
        // Idle entries are dropped so departed instances do not accumulate
        self.connections
            .remove_if(&self.instance_id, |_, count| count.load(Ordering::Acquire) == 0);
    }
}

fn random_index(len: usize) -> usize {
    rand::thread_rng().gen_range(0..len)
}

/// 64-bit FNV-1a
pub fn fnv1a_64(bytes: &[u8]) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0100_0000_01b3;

    bytes.iter().fold(OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(PRIME)
    })
}
