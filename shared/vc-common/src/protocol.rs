//! Relay Protocol
//!
//! The relay is a single HTTP endpoint. POST bodies are JSON objects tagged
//! with an `action` field; GET requests carry the action as a query parameter.

use serde::{Deserialize, Serialize};

use crate::types::{ChannelSummary, PeerEntry, SignalEnvelope, SignalPayload, WireId};

/// Actions accepted in POST bodies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RelayRequest {
    /// Register a peer in a voice channel.
    Join {
        channel_id: WireId,
        user_id: WireId,
        peer_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        display_name: Option<String>,
    },
    /// Unregister a peer.
    Leave { peer_id: String },
    /// Forward a handshake payload to another peer.
    Signal {
        from_peer: String,
        to_peer: String,
        signal: SignalPayload,
    },
}

impl RelayRequest {
    /// Action name as it appears on the wire.
    pub const fn action(&self) -> RelayAction {
        match self {
            Self::Join { .. } => RelayAction::Join,
            Self::Leave { .. } => RelayAction::Leave,
            Self::Signal { .. } => RelayAction::Signal,
        }
    }
}

impl From<SignalEnvelope> for RelayRequest {
    fn from(envelope: SignalEnvelope) -> Self {
        Self::Signal {
            from_peer: envelope.from_peer,
            to_peer: envelope.to_peer,
            signal: envelope.payload,
        }
    }
}

/// Every action the relay understands, POST and GET alike.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayAction {
    Join,
    Leave,
    Signal,
    /// GET: peers of one channel.
    Peers,
    /// GET: drain the signal inbox of one peer.
    Signals,
    /// GET: voice channels with participant counts.
    List,
}

impl RelayAction {
    /// Wire name of the action.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Join => "join",
            Self::Leave => "leave",
            Self::Signal => "signal",
            Self::Peers => "peers",
            Self::Signals => "signals",
            Self::List => "list",
        }
    }
}

/// Query string of GET requests.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayQuery {
    /// Requested action; the relay defaults to `list`.
    #[serde(default)]
    pub action: Option<String>,
    /// Channel for `peers`.
    #[serde(default)]
    pub channel_id: Option<String>,
    /// Peer for `signals`.
    #[serde(default)]
    pub peer_id: Option<String>,
}

/// Generic acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckResponse {
    pub success: bool,
    /// For `signal`: whether the recipient was known and the payload queued.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered: Option<bool>,
}

impl AckResponse {
    /// Plain success.
    pub const fn ok() -> Self {
        Self {
            success: true,
            delivered: None,
        }
    }
}

/// Response of the `peers` action.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeersResponse {
    pub peers: Vec<PeerEntry>,
}

/// Response of the `signals` action.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SignalsResponse {
    pub signals: Vec<SignalEnvelope>,
}

/// Response of the `list` action.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelsResponse {
    pub channels: Vec<ChannelSummary>,
}

/// Error body returned with non-2xx statuses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_join_accepts_numeric_ids() {
        let request: RelayRequest = serde_json::from_value(json!({
            "action": "join",
            "channel_id": 3,
            "user_id": 17,
            "peer_id": "peer-1-abc"
        }))
        .unwrap();

        assert_eq!(
            request,
            RelayRequest::Join {
                channel_id: WireId::new("3"),
                user_id: WireId::new("17"),
                peer_id: "peer-1-abc".into(),
                display_name: None,
            }
        );
        assert_eq!(request.action(), RelayAction::Join);
    }

    #[test]
    fn test_signal_request_shape() {
        let envelope = SignalEnvelope::new("a", "b", SignalPayload::new(json!({"type": "answer"})));
        let wire = serde_json::to_value(RelayRequest::from(envelope)).unwrap();
        assert_eq!(
            wire,
            json!({"action": "signal", "from_peer": "a", "to_peer": "b", "signal": {"type": "answer"}})
        );
    }

    #[test]
    fn test_unknown_action_is_rejected() {
        let result = serde_json::from_value::<RelayRequest>(json!({"action": "dance"}));
        assert!(result.is_err());
    }

    #[test]
    fn test_action_names() {
        for action in [
            RelayAction::Join,
            RelayAction::Leave,
            RelayAction::Signal,
            RelayAction::Peers,
            RelayAction::Signals,
            RelayAction::List,
        ] {
            let wire = serde_json::to_value(action).unwrap();
            assert_eq!(wire, json!(action.as_str()));
        }
    }
}
