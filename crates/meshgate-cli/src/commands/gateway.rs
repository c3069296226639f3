//! `meshgate gateway`

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use meshgate_core::{HttpForwarder, MeshConfig, MeshNode};
use tokio::time::{Instant, MissedTickBehavior};

pub async fn execute(config: &MeshConfig, report_interval: Duration) -> Result<()> {
    let node = MeshNode::start(config, Arc::new(HttpForwarder::new()))
        .await
        .context("failed to start gateway node")?;

    let period = report_interval.max(Duration::from_secs(1));
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let shutdown = super::shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = interval.tick() => {
                let snapshot = node.gateway().snapshot().await;
                match serde_json::to_string(&snapshot) {
                    Ok(json) => tracing::info!(
                        services = snapshot.services.len(),
                        snapshot = %json,
                        "Gateway snapshot"
                    ),
                    Err(e) => tracing::warn!(error = %e, "Could not serialize snapshot"),
                }
            }
        }
    }

    tracing::info!("Shutting down gateway");
    node.shutdown().await;
    Ok(())
}
