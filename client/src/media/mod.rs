//! Media Transport
//!
//! The handshake and media engine behind each peer connection, as a pair of
//! traits so that sessions can run on any compliant transport.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use vc_common::SignalPayload;
use webrtc::track::track_remote::TrackRemote;

use crate::capture::LocalAudio;

mod rtc;

pub use rtc::WebRtcEngine;

/// Handshake and transport errors of one peer link
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PeerHandshakeError {
    #[error("Media engine error: {0}")]
    Engine(String),
    #[error("SDP error: {0}")]
    Sdp(String),
    #[error("ICE error: {0}")]
    Ice(String),
    #[error("Unsupported signal payload: {0}")]
    UnsupportedPayload(String),
    #[error("Transport failed: {0}")]
    Transport(String),
    #[error("Handshake timed out")]
    Timeout,
}

/// Transport notifications for one link.
#[derive(Clone)]
pub enum LinkEvent {
    /// Media is flowing.
    Connected,
    /// The transport gave up.
    Failed(String),
    /// The remote side's audio track arrived.
    RemoteAudio(Arc<TrackRemote>),
}

impl std::fmt::Debug for LinkEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connected => f.write_str("Connected"),
            Self::Failed(reason) => f.debug_tuple("Failed").field(reason).finish(),
            Self::RemoteAudio(_) => f.write_str("RemoteAudio(..)"),
        }
    }
}

/// Creates media links to remote peers.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Open a link that sends `local` to `peer_id`. Transport notifications
    /// are delivered on `events`.
    async fn open_link(
        &self,
        peer_id: &str,
        local: &LocalAudio,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Arc<dyn MediaLink>, PeerHandshakeError>;
}

/// One negotiated link. Descriptions are complete; candidates are never
/// trickled.
#[async_trait]
pub trait MediaLink: Send + Sync {
    /// Produce the initial offer.
    async fn create_offer(&self) -> Result<SignalPayload, PeerHandshakeError>;

    /// Apply a payload from the remote side, returning the reply to send
    /// back, if any.
    async fn apply_remote(
        &self,
        payload: &SignalPayload,
    ) -> Result<Option<SignalPayload>, PeerHandshakeError>;

    /// Release transport resources. Idempotent.
    async fn close(&self);
}
