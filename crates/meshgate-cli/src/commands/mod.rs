//! CLI commands

pub mod config;
pub mod gateway;
pub mod worker;

/// Resolves on Ctrl-C, or at once if the handler cannot be installed
pub async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl-C");
    }
}
