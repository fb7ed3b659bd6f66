//! Relay HTTP Handlers
//!
//! One endpoint: GET dispatches on the `action` query parameter, POST on the
//! `action` field of the JSON body.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    response::{IntoResponse, Response},
    Json,
};
use tracing::debug;
use vc_common::{
    AckResponse, ChannelsResponse, PeersResponse, RelayQuery, RelayRequest, SignalEnvelope,
    SignalsResponse, WireId,
};

use crate::error::RelayServerError;
use crate::state::RelayState;

/// Handle GET requests (`list`, `peers`, `signals`).
pub async fn get_action(
    State(state): State<Arc<RelayState>>,
    Query(query): Query<RelayQuery>,
) -> Result<Response, RelayServerError> {
    let action = query.action.as_deref().unwrap_or("list");

    match action {
        "list" => {
            let channels = state.channels().await;
            Ok(Json(ChannelsResponse { channels }).into_response())
        }
        "peers" => {
            let channel_id = required(query.channel_id, "channel_id")?;
            let peers = state.peers(&WireId::new(channel_id)).await;
            debug!(count = peers.len(), "Listing voice peers");
            Ok(Json(PeersResponse { peers }).into_response())
        }
        "signals" => {
            let peer_id = required(query.peer_id, "peer_id")?;
            let signals = state.drain_signals(&peer_id).await;
            Ok(Json(SignalsResponse { signals }).into_response())
        }
        other => Err(RelayServerError::UnknownAction(other.to_string())),
    }
}

/// Handle POST requests (`join`, `leave`, `signal`).
pub async fn post_action(
    State(state): State<Arc<RelayState>>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<AckResponse>, RelayServerError> {
    let request = parse_request(body)?;

    match request {
        RelayRequest::Join {
            channel_id,
            user_id,
            peer_id,
            display_name,
        } => {
            if channel_id.is_empty() || user_id.is_empty() || peer_id.trim().is_empty() {
                return Err(RelayServerError::MissingField("channel_id, user_id, peer_id"));
            }
            state
                .join(channel_id, user_id, peer_id, display_name)
                .await?;
            Ok(Json(AckResponse::ok()))
        }
        RelayRequest::Leave { peer_id } => {
            let peer_id = required(Some(peer_id), "peer_id")?;
            state.leave(&peer_id).await;
            Ok(Json(AckResponse::ok()))
        }
        RelayRequest::Signal {
            from_peer,
            to_peer,
            signal,
        } => {
            let from_peer = required(Some(from_peer), "from_peer")?;
            let to_peer = required(Some(to_peer), "to_peer")?;
            let delivered = state
                .push_signal(SignalEnvelope::new(from_peer, to_peer, signal))
                .await;
            Ok(Json(AckResponse {
                success: true,
                delivered: Some(delivered),
            }))
        }
    }
}

/// Decode a POST body, telling unknown actions apart from malformed ones.
fn parse_request(body: serde_json::Value) -> Result<RelayRequest, RelayServerError> {
    let action = body
        .get("action")
        .and_then(serde_json::Value::as_str)
        .map(str::to_string)
        .ok_or(RelayServerError::MissingField("action"))?;

    if !matches!(action.as_str(), "join" | "leave" | "signal") {
        return Err(RelayServerError::UnknownAction(action));
    }

    serde_json::from_value(body).map_err(|e| RelayServerError::InvalidRequest(e.to_string()))
}

fn required(value: Option<String>, field: &'static str) -> Result<String, RelayServerError> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or(RelayServerError::MissingField(field))
}
