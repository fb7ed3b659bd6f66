//! `VoiceChat` Voice Client - Main Entry Point
//!
//! Joins one voice channel and stays in it until Ctrl+C.

use std::env;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use vc_voice::capture::{AudioSink, CaptureDevice};
use vc_voice::{
    AudioConstraints, RelayClient, SessionController, SessionEvent, SessionParams, VoiceConfig,
    WebRtcEngine,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vc_voice=debug,webrtc=warn".into()),
        )
        .init();

    // TLS for HTTPS relays
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        warn!("A TLS crypto provider was already installed");
    }

    // Load configuration
    dotenvy::dotenv().ok();
    let config = VoiceConfig::from_env()?;
    let channel_id = env::var("VC_CHANNEL_ID").context("VC_CHANNEL_ID must be set")?;
    let user_id = env::var("VC_USER_ID").context("VC_USER_ID must be set")?;

    let mut params = SessionParams::new(channel_id, user_id);
    params.display_name = env::var("VC_DISPLAY_NAME").ok();
    params.constraints = AudioConstraints {
        device: env::var("VC_INPUT_DEVICE").ok(),
        ..AudioConstraints::default()
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        relay = %config.relay_url,
        channel_id = %params.channel_id,
        "Starting voice client"
    );

    let relay = Arc::new(RelayClient::new(&config)?);
    let engine = Arc::new(WebRtcEngine::new(&config.ice_servers)?);
    let (device, sink) = audio_io();

    let (session, mut events) = SessionController::new(params, config, relay, engine, device, sink);

    let event_log = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::PeerJoined {
                    peer_id,
                    display_name,
                } => info!(peer_id = %peer_id, display_name = %display_name, "Peer joined"),
                SessionEvent::PeerLeft { peer_id } => info!(peer_id = %peer_id, "Peer left"),
                SessionEvent::Error { description } => error!("{}", description),
            }
        }
    });

    session.connect().await?;
    info!(peer_id = %session.local_peer_id(), "In voice channel, press Ctrl+C to leave");

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Received shutdown signal");

    session.disconnect().await;
    drop(session);
    event_log.abort();

    info!("Voice client shutdown complete");
    Ok(())
}

#[cfg(feature = "native-audio")]
fn audio_io() -> (Arc<dyn CaptureDevice>, Arc<dyn AudioSink>) {
    use vc_voice::capture::{NativeCaptureDevice, NativePlaybackSink};

    (
        Arc::new(NativeCaptureDevice),
        Arc::new(NativePlaybackSink::new(env::var("VC_OUTPUT_DEVICE").ok())),
    )
}

#[cfg(not(feature = "native-audio"))]
fn audio_io() -> (Arc<dyn CaptureDevice>, Arc<dyn AudioSink>) {
    use vc_voice::{DrainSink, SilenceDevice};

    info!("Built without native-audio, sending silence");
    (Arc::new(SilenceDevice), Arc::new(DrainSink::new()))
}
