//! `VoiceChat` Voice Client
//!
//! Peer-to-peer voice sessions. Members of a channel find each other through
//! a polling signaling relay, then exchange audio directly over WebRTC.

pub mod capture;
pub mod config;
pub mod discovery;
pub mod error;
pub mod media;
pub mod peer;
pub mod registry;
pub mod relay;
pub mod session;

#[cfg(test)]
mod testing;

pub use capture::{AudioConstraints, AudioSink, CaptureDevice, DeviceError, DrainSink, SilenceDevice};
pub use config::{IceServerConfig, VoiceConfig};
pub use discovery::TieBreak;
pub use error::{JoinError, SessionError};
pub use media::{MediaEngine, PeerHandshakeError, WebRtcEngine};
pub use peer::{PeerState, Role};
pub use relay::{PeerInfo, Relay, RelayClient, RelayError};
pub use session::{SessionController, SessionEvent, SessionParams};
