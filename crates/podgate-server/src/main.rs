//! Runs the gateway: the `HTTP` server and the telemetry consumer.

use std::sync::Arc;

use clap::Parser;

use podgate_controller::events::{ConsumerThread, StreamConsumer};
use podgate_controller::mqtt::MqttEventSource;
use podgate_controller::registry::RegistryClient;
use podgate_controller::token::TokenCache;

use podgate_server::config::Cli;
use podgate_server::router;
use podgate_server::state::AppState;

use tokio::net::TcpListener;

use tracing::{error, info, warn};

use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = cli.gateway_config();
    config.validate().inspect_err(|e| error!("Invalid configuration: {e}"))?;

    let tokens = Arc::new(TokenCache::new(&config.registry)?);
    let registry = RegistryClient::new(&config.registry, tokens)?;
    let (state, dispatcher) = AppState::new(registry, cli.pod_map.clone())?;
    info!("{} pods mapped", cli.pod_map.len());

    let source = MqttEventSource::new(&config.stream)?;
    let consumer = ConsumerThread::spawn(Arc::new(StreamConsumer::new(source)))?;

    let listener = TcpListener::bind(cli.address).await?;
    info!("Listening on {}", cli.address);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("HTTP server stopped");

    let _ = consumer.shutdown(cli.grace()).await;

    // The router is gone, so the dispatcher drains the queued jobs and stops.
    if tokio::time::timeout(cli.grace(), dispatcher).await.is_err() {
        warn!("Pending jobs discarded after {:?}", cli.grace());
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Unable to listen for the shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}
