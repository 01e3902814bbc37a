//! Sentinel node binary
//!
//! Runs the p2p layer of a beacon-chain light client together with the
//! health endpoint until Ctrl+C.

mod cli;
mod config;
mod health;

use std::sync::Arc;

use anyhow::Result;
use cli::Cli;
use config::NodeConfig;
use futures::StreamExt;
use health::SentinelHealth;
use sentinel_health::HealthServer;
use sentinel_network::Sentinel;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse_args();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    tracing::info!("Sentinel node starting...");

    let config = NodeConfig::from_cli(&cli)?;
    let chain = Sentinel::static_chain_state(&config.sentinel);
    let sentinel = Arc::new(Sentinel::new(config.sentinel, chain).await?);
    sentinel.start().await?;

    let cancel = CancellationToken::new();

    // Log gossip deliveries
    let mut events = sentinel.gossip_events();
    let gossip_task = tokio::spawn(async move {
        while let Some(message) = events.next().await {
            tracing::debug!(
                "Gossip {} bytes on {} from {}",
                message.data.len(),
                message.topic,
                message.source
            );
        }
    });

    // Start health server if enabled
    let health_task = config.health.map(|health_config| {
        let listen_addr = health_config.listen_addr;
        let server = HealthServer::new(
            health_config,
            Arc::new(SentinelHealth::new(Arc::clone(&sentinel))),
        );
        let shutdown = cancel.clone();
        tracing::info!("Health server starting on {}", listen_addr);
        tokio::spawn(async move {
            if let Err(e) = server.run(async move { shutdown.cancelled().await }).await {
                tracing::error!("Health server error: {}", e);
            }
        })
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");

    cancel.cancel();
    let report = sentinel.shutdown().await;
    tracing::info!(
        "Shutdown finished: {:?}, {} leaked streams, {} topics unsubscribed",
        report.steps,
        report.leaked_streams,
        report.topics_unsubscribed
    );

    if let Some(task) = health_task {
        task.await.ok();
    }
    // the delivery queue is closed, so the stream ends
    gossip_task.await.ok();

    tracing::info!("Sentinel node stopped");

    Ok(())
}
