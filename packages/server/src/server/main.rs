// Main entry point for the worker host

use anyhow::{Context, Result};
use server_core::kernel::collaborators;
use server_core::kernel::runtime::Runtime;
use server_core::Config;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,server_core=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting agent-orchestration worker host");

    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;
    tracing::info!(redis_url = %config.redis_url, "Configuration loaded");

    // Assemble the core over the coordination store. Collaborator wiring
    // (LLM, chat provider, execution store) lives in the integration layer;
    // this host boots with the placeholder set from `collaborators`.
    let runtime = Runtime::connect(config, collaborators::placeholders())
        .await
        .context("Failed to assemble runtime")?;

    runtime.start().await.context("Failed to start runtime")?;
    tracing::info!("Workers, scheduler and autoscaler running");

    // Run until interrupted
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutdown signal received");

    runtime.shutdown().await.context("Shutdown failed")?;

    Ok(())
}
