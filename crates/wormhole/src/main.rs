#![forbid(unsafe_code)]

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use wormhole::config::{Args, ServerConfig};
use wormhole::metrics::{start_metrics_server, HealthState};
use wormhole::{run_with_shutdown, ServerState};

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();
    let config: ServerConfig = args.into();

    if let Err(e) = config.validate() {
        anyhow::bail!("configuration error: {}", e);
    }

    let listener = TcpListener::bind(config.listen).await?;
    info!(
        "bound to {} (path {}, idle timeout {}s, max frame {} chars, duplicate registration: {:?})",
        config.listen,
        config.path,
        config.idle_timeout,
        config.max_frame_chars,
        config.duplicate_registration
    );

    let health_state = HealthState::new();

    tokio::spawn({
        let health_state = health_state.clone();
        let metrics_addr = config.metrics_addr;
        async move {
            if let Err(e) = start_metrics_server(metrics_addr, health_state).await {
                warn!("metrics server error: {}", e);
            }
        }
    });

    let state = Arc::new(ServerState::new(config));

    let shutdown = {
        let health_state = health_state.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
            info!("received shutdown signal");
            health_state.set_ready(false);
        }
    };

    if let Err(e) = run_with_shutdown(listener, state, shutdown).await {
        tracing::error!("server error: {}", e);
    }

    Ok(())
}
