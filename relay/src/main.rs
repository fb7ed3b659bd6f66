//! `VoiceChat` Relay - Main Entry Point

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use vc_relay::{create_router, RelayConfig, RelayState};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vc_relay=debug,tower_http=debug".into()),
        )
        .json()
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = RelayConfig::from_env()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        channels = config.channels.len(),
        stale_after_secs = config.stale_after.as_secs(),
        "Starting VoiceChat Relay"
    );

    let state = Arc::new(RelayState::new(&config));
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    info!(address = %config.bind_address, "Relay listening");

    // Graceful shutdown handler
    let shutdown_signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
        }
        info!("Received shutdown signal");
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    info!("Relay shutdown complete");
    Ok(())
}
