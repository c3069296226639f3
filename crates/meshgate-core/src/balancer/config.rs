//! Load balancing configuration

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Instance selection strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    #[default]
    RoundRobin,
    LeastConnections,
    Random,
    IpHash,
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::RoundRobin => "round-robin",
            Self::LeastConnections => "least-connections",
            Self::Random => "random",
            Self::IpHash => "ip-hash",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "round-robin" => Ok(Self::RoundRobin),
            "least-connections" => Ok(Self::LeastConnections),
            "random" => Ok(Self::Random),
            "ip-hash" => Ok(Self::IpHash),
            other => Err(format!("unknown load balancing strategy '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadBalancerConfig {
    /// Strategy for services without an override
    pub strategy: Strategy,
    /// Per-service strategy overrides
    pub services: HashMap<String, Strategy>,
}
