//! Peer and Signaling Types

use serde::{Deserialize, Serialize};

/// One voice participant as reported by the relay's peer list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerEntry {
    /// Peer id the participant registered with on join.
    pub peer_id: String,
    /// Display name of the user behind the peer.
    #[serde(rename = "name", default)]
    pub display_name: String,
    /// Avatar URL, if the relay knows one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

impl PeerEntry {
    /// Create an entry without an avatar.
    pub fn new(peer_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            display_name: display_name.into(),
            avatar: None,
        }
    }
}

/// Opaque handshake data (offer, answer or candidate blob).
///
/// Relayed verbatim; only the media engine on either end interprets it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SignalPayload(pub serde_json::Value);

impl SignalPayload {
    /// Wrap a JSON value.
    pub const fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    /// Borrow the inner JSON value.
    pub const fn as_json(&self) -> &serde_json::Value {
        &self.0
    }

    /// The `type` field of the payload, if it has one (`offer`, `answer`, ...).
    pub fn kind(&self) -> Option<&str> {
        self.0.get("type").and_then(serde_json::Value::as_str)
    }
}

/// A relayed handshake message between two peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEnvelope {
    /// Sending peer.
    pub from_peer: String,
    /// Receiving peer.
    pub to_peer: String,
    /// Handshake payload.
    #[serde(rename = "signal")]
    pub payload: SignalPayload,
}

impl SignalEnvelope {
    /// Build an envelope.
    pub fn new(
        from_peer: impl Into<String>,
        to_peer: impl Into<String>,
        payload: SignalPayload,
    ) -> Self {
        Self {
            from_peer: from_peer.into(),
            to_peer: to_peer.into(),
            payload,
        }
    }
}
