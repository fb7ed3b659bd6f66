//! Shared helpers for voice client integration tests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use vc_common::SignalPayload;
use vc_relay::{create_router, RelayConfig, RelayState};
use vc_voice::capture::LocalAudio;
use vc_voice::media::{LinkEvent, MediaEngine, MediaLink, PeerHandshakeError};
use vc_voice::{
    DrainSink, RelayClient, SessionController, SessionEvent, SessionParams, SilenceDevice,
    VoiceConfig,
};

/// Serve a fresh in-memory relay on an ephemeral port and return its URL.
pub async fn spawn_relay() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = create_router(Arc::new(RelayState::new(&RelayConfig::default())));

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    format!("http://{addr}/")
}

/// Create a session against `relay_url` with a fast discovery interval.
pub fn session(
    relay_url: &str,
    user_id: &str,
    name: &str,
) -> (SessionController, mpsc::UnboundedReceiver<SessionEvent>) {
    let config = VoiceConfig::new(relay_url).with_poll_interval(Duration::from_millis(100));
    let relay = Arc::new(RelayClient::new(&config).unwrap());

    SessionController::new(
        SessionParams::new("1", user_id).with_display_name(name),
        config,
        relay,
        Arc::new(LoopbackEngine),
        Arc::new(SilenceDevice),
        Arc::new(DrainSink::new()),
    )
}

/// Media engine that completes the offer/answer exchange without media.
pub struct LoopbackEngine;

#[async_trait]
impl MediaEngine for LoopbackEngine {
    async fn open_link(
        &self,
        _peer_id: &str,
        _local: &LocalAudio,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Arc<dyn MediaLink>, PeerHandshakeError> {
        Ok(Arc::new(LoopbackLink { events }))
    }
}

struct LoopbackLink {
    events: mpsc::UnboundedSender<LinkEvent>,
}

#[async_trait]
impl MediaLink for LoopbackLink {
    async fn create_offer(&self) -> Result<SignalPayload, PeerHandshakeError> {
        Ok(SignalPayload::new(json!({"type": "offer", "sdp": "loopback"})))
    }

    async fn apply_remote(
        &self,
        payload: &SignalPayload,
    ) -> Result<Option<SignalPayload>, PeerHandshakeError> {
        match payload.kind() {
            Some("offer") => {
                let _ = self.events.send(LinkEvent::Connected);
                Ok(Some(SignalPayload::new(json!({"type": "answer", "sdp": "loopback"}))))
            }
            Some("answer") => {
                let _ = self.events.send(LinkEvent::Connected);
                Ok(None)
            }
            other => Err(PeerHandshakeError::UnsupportedPayload(
                other.unwrap_or("missing").to_string(),
            )),
        }
    }

    async fn close(&self) {}
}
