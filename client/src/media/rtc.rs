//! WebRTC Media Engine
//!
//! Peer links over the `webrtc` crate: Opus audio, default interceptors and
//! complete (non-trickled) session descriptions.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use vc_common::SignalPayload;
use webrtc::{
    api::{
        interceptor_registry::register_default_interceptors, media_engine::MediaEngine as RtcMediaEngine,
        APIBuilder, API,
    },
    ice_transport::{ice_candidate::RTCIceCandidateInit, ice_server::RTCIceServer},
    interceptor::registry::Registry,
    peer_connection::{
        configuration::RTCConfiguration, peer_connection_state::RTCPeerConnectionState,
        sdp::{sdp_type::RTCSdpType, session_description::RTCSessionDescription},
        RTCPeerConnection,
    },
    rtp_transceiver::{rtp_codec::RTCRtpCodecParameters, rtp_codec::RTPCodecType},
    track::{track_local::TrackLocal, track_remote::TrackRemote},
};

use super::{LinkEvent, MediaEngine, MediaLink, PeerHandshakeError};
use crate::capture::{opus_capability, LocalAudio};
use crate::config::IceServerConfig;

/// Upper bound on ICE gathering before a description is sent as is.
const GATHER_TIMEOUT: Duration = Duration::from_secs(10);

/// [`MediaEngine`] backed by the `webrtc` crate.
pub struct WebRtcEngine {
    api: Arc<API>,
    rtc_config: RTCConfiguration,
}

impl WebRtcEngine {
    /// Build the engine with the given STUN/TURN servers.
    pub fn new(ice_servers: &[IceServerConfig]) -> Result<Self, PeerHandshakeError> {
        let mut media_engine = RtcMediaEngine::default();

        media_engine
            .register_codec(
                RTCRtpCodecParameters {
                    capability: opus_capability(),
                    payload_type: 111,
                    ..Default::default()
                },
                RTPCodecType::Audio,
            )
            .map_err(|e| PeerHandshakeError::Engine(e.to_string()))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| PeerHandshakeError::Engine(e.to_string()))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        info!(ice_servers = ice_servers.len(), "WebRTC engine initialized");

        Ok(Self {
            api: Arc::new(api),
            rtc_config: create_rtc_config(ice_servers),
        })
    }
}

/// Create `RTCConfiguration` from ICE server config
fn create_rtc_config(ice_servers: &[IceServerConfig]) -> RTCConfiguration {
    let ice_servers: Vec<RTCIceServer> = ice_servers
        .iter()
        .map(|s| RTCIceServer {
            urls: s.urls.clone(),
            username: s.username.clone().unwrap_or_default(),
            credential: s.credential.clone().unwrap_or_default(),
            ..Default::default()
        })
        .collect();

    RTCConfiguration {
        ice_servers,
        ..Default::default()
    }
}

#[async_trait]
impl MediaEngine for WebRtcEngine {
    async fn open_link(
        &self,
        peer_id: &str,
        local: &LocalAudio,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Arc<dyn MediaLink>, PeerHandshakeError> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(self.rtc_config.clone())
                .await
                .map_err(|e| PeerHandshakeError::Engine(e.to_string()))?,
        );

        setup_event_handlers(&pc, peer_id, events);

        let sender = pc
            .add_track(local.track() as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| PeerHandshakeError::Engine(e.to_string()))?;

        // RTCP must be read for the interceptors to work
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while sender.read(&mut rtcp_buf).await.is_ok() {}
        });

        debug!(peer_id = %peer_id, "Peer connection created");
        Ok(Arc::new(WebRtcLink {
            peer_id: peer_id.to_string(),
            pc,
        }))
    }
}

/// Forward connection state and remote tracks as [`LinkEvent`]s.
fn setup_event_handlers(
    pc: &RTCPeerConnection,
    peer_id: &str,
    events: mpsc::UnboundedSender<LinkEvent>,
) {
    let state_events = events.clone();
    let peer = peer_id.to_string();
    pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
        debug!(peer_id = %peer, state = %s, "Peer connection state changed");
        let event = match s {
            RTCPeerConnectionState::Connected => Some(LinkEvent::Connected),
            RTCPeerConnectionState::Failed => {
                Some(LinkEvent::Failed("peer connection failed".to_string()))
            }
            _ => None,
        };
        if let Some(event) = event {
            let _ = state_events.send(event);
        }
        Box::pin(async {})
    }));

    let peer = peer_id.to_string();
    pc.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
        info!(
            peer_id = %peer,
            kind = %track.kind(),
            codec = %track.codec().capability.mime_type,
            "Remote track received"
        );
        let _ = events.send(LinkEvent::RemoteAudio(track));
        Box::pin(async {})
    }));
}

struct WebRtcLink {
    peer_id: String,
    pc: Arc<RTCPeerConnection>,
}

impl WebRtcLink {
    /// Apply a local description and return it once ICE gathering is done.
    async fn complete_local_description(
        &self,
        description: RTCSessionDescription,
    ) -> Result<SignalPayload, PeerHandshakeError> {
        let mut gather = self.pc.gathering_complete_promise().await;

        self.pc
            .set_local_description(description)
            .await
            .map_err(|e| PeerHandshakeError::Sdp(e.to_string()))?;

        if tokio::time::timeout(GATHER_TIMEOUT, gather.recv()).await.is_err() {
            warn!(peer_id = %self.peer_id, "ICE gathering timed out, sending partial description");
        }

        let local = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| PeerHandshakeError::Sdp("no local description".to_string()))?;

        Ok(description_payload(&local))
    }
}

#[async_trait]
impl MediaLink for WebRtcLink {
    async fn create_offer(&self) -> Result<SignalPayload, PeerHandshakeError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| PeerHandshakeError::Sdp(e.to_string()))?;

        let payload = self.complete_local_description(offer).await?;
        debug!(peer_id = %self.peer_id, "Local offer ready");
        Ok(payload)
    }

    async fn apply_remote(
        &self,
        payload: &SignalPayload,
    ) -> Result<Option<SignalPayload>, PeerHandshakeError> {
        match payload.kind() {
            Some("offer" | "answer") => {
                let description = session_description_from_payload(payload)?;
                let is_offer = description.sdp_type == RTCSdpType::Offer;

                self.pc
                    .set_remote_description(description)
                    .await
                    .map_err(|e| PeerHandshakeError::Sdp(e.to_string()))?;
                debug!(peer_id = %self.peer_id, "Remote description set");

                if !is_offer {
                    return Ok(None);
                }

                let answer = self
                    .pc
                    .create_answer(None)
                    .await
                    .map_err(|e| PeerHandshakeError::Sdp(e.to_string()))?;
                let reply = self.complete_local_description(answer).await?;
                debug!(peer_id = %self.peer_id, "Local answer ready");
                Ok(Some(reply))
            }
            Some("candidate") => {
                let candidate = payload
                    .as_json()
                    .get("candidate")
                    .cloned()
                    .ok_or_else(|| PeerHandshakeError::Ice("candidate missing".to_string()))?;
                let candidate: RTCIceCandidateInit = serde_json::from_value(candidate)
                    .map_err(|e| PeerHandshakeError::Ice(e.to_string()))?;

                self.pc
                    .add_ice_candidate(candidate)
                    .await
                    .map_err(|e| PeerHandshakeError::Ice(e.to_string()))?;
                debug!(peer_id = %self.peer_id, "ICE candidate added");
                Ok(None)
            }
            other => Err(PeerHandshakeError::UnsupportedPayload(
                other.unwrap_or("<untyped>").to_string(),
            )),
        }
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            warn!(peer_id = %self.peer_id, "Failed to close peer connection: {}", e);
        }
    }
}

fn description_payload(description: &RTCSessionDescription) -> SignalPayload {
    SignalPayload::new(json!({
        "type": description.sdp_type.to_string(),
        "sdp": description.sdp,
    }))
}

fn session_description_from_payload(
    payload: &SignalPayload,
) -> Result<RTCSessionDescription, PeerHandshakeError> {
    let sdp = payload
        .as_json()
        .get("sdp")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| PeerHandshakeError::Sdp("sdp missing".to_string()))?
        .to_string();

    let result = match payload.kind().map(RTCSdpType::from) {
        Some(RTCSdpType::Offer) => RTCSessionDescription::offer(sdp),
        Some(RTCSdpType::Answer) => RTCSessionDescription::answer(sdp),
        _ => {
            return Err(PeerHandshakeError::UnsupportedPayload(
                payload.kind().unwrap_or("<untyped>").to_string(),
            ))
        }
    };
    result.map_err(|e| PeerHandshakeError::Sdp(e.to_string()))
}
