//! Administrative operations on a running gateway

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::router::Gateway;
use crate::recovery::CircuitBreakerStats;
use crate::registry::AggregateServiceStats;

/// Health and traffic figures for one service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSnapshot {
    pub service: String,
    pub stats: AggregateServiceStats,
    /// Absent until the service has been routed to
    pub breaker: Option<CircuitBreakerStats>,
    pub error_count: u64,
}

/// Point-in-time view of every service the gateway knows about
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewaySnapshot {
    pub taken_at: DateTime<Utc>,
    pub services: Vec<ServiceSnapshot>,
}

impl GatewaySnapshot {
    pub fn service(&self, name: &str) -> Option<&ServiceSnapshot> {
        self.services.iter().find(|s| s.service == name)
    }
}

impl Gateway {
    /// Force a service's breaker closed; false when it has never been used
    pub fn reset_circuit_breaker(&self, service: &str) -> bool {
        let reset = self.breakers.reset(service);
        if reset {
            tracing::info!(service = %service, "Circuit breaker reset by operator");
        }
        reset
    }

    pub async fn snapshot(&self) -> GatewaySnapshot {
        let stats = self.registry.all_stats().await;

        let mut names: BTreeSet<String> = stats.iter().map(|(name, _)| name.clone()).collect();
        names.extend(self.breakers.names());

        let services = names
            .into_iter()
            .map(|service| ServiceSnapshot {
                stats: stats
                    .iter()
                    .find(|(name, _)| *name == service)
                    .map(|(_, stats)| stats.clone())
                    .unwrap_or_default(),
                breaker: self.breakers.find(&service).map(|breaker| breaker.stats()),
                error_count: self.error_count(&service),
                service,
            })
            .collect();

        GatewaySnapshot {
            taken_at: Utc::now(),
            services,
        }
    }
}
