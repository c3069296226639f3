//! `meshgate worker`

use anyhow::{Context, Result};
use meshgate_core::{InstanceMetadata, MeshConfig, MessageBus, WorkerAgent};

use crate::args::WorkerArgs;

pub async fn execute(config: &MeshConfig, args: WorkerArgs) -> Result<()> {
    let bus = MessageBus::connect(&config.bus)
        .await
        .context("failed to connect message bus")?;

    let mut agent = WorkerAgent::new(bus.clone(), &args.name, &args.id)
        .with_metadata(InstanceMetadata::new(&args.host, args.port))
        .with_endpoints(args.endpoints)
        .with_settings(config.worker.clone());
    if let Some(version) = args.version {
        agent = agent.with_version(version);
    }

    agent
        .start()
        .await
        .with_context(|| format!("failed to register worker {}/{}", args.name, args.id))?;

    super::shutdown_signal().await;

    agent.shutdown().await;
    bus.shutdown().await;
    Ok(())
}
