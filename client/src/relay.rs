//! Relay Client
//!
//! Request/response wrapper around the signaling relay's HTTP actions.

use async_trait::async_trait;
use reqwest::{Client as HttpClient, Response};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;
use vc_common::{
    ChannelId, ChannelSummary, ChannelsResponse, ErrorResponse, PeersResponse, RelayAction,
    RelayRequest, SignalEnvelope, SignalsResponse, UserId,
};

use crate::config::VoiceConfig;

pub use vc_common::PeerEntry as PeerInfo;

/// Relay client errors
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Invalid relay URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("Relay request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("Relay returned {status}: {message}")]
    Status { status: u16, message: String },
}

/// The signaling relay, as seen by a session.
///
/// Every call is a single request; nothing is retried here.
#[async_trait]
pub trait Relay: Send + Sync {
    /// Register `peer_id` as a member of `channel_id`.
    async fn join(
        &self,
        channel_id: &ChannelId,
        user_id: &UserId,
        peer_id: &str,
        display_name: Option<&str>,
    ) -> Result<(), RelayError>;

    /// Unregister `peer_id`.
    async fn leave(&self, peer_id: &str) -> Result<(), RelayError>;

    /// Current members of a channel. May contain stale entries.
    async fn list_peers(&self, channel_id: &ChannelId) -> Result<Vec<PeerInfo>, RelayError>;

    /// Forward one handshake payload.
    async fn send_signal(&self, envelope: &SignalEnvelope) -> Result<(), RelayError>;

    /// Drain the payloads queued for `peer_id`, oldest first.
    async fn fetch_signals(&self, peer_id: &str) -> Result<Vec<SignalEnvelope>, RelayError>;

    /// Voice channels with their participant counts.
    async fn list_channels(&self) -> Result<Vec<ChannelSummary>, RelayError>;
}

/// HTTP implementation of [`Relay`].
#[derive(Debug, Clone)]
pub struct RelayClient {
    http: HttpClient,
    endpoint: Url,
}

impl RelayClient {
    /// Build a client for the configured relay endpoint.
    pub fn new(config: &VoiceConfig) -> Result<Self, RelayError> {
        let endpoint = Url::parse(&config.relay_url)?;
        let http = HttpClient::builder()
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self { http, endpoint })
    }

    /// Relay endpoint requests are sent to.
    pub const fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn action_url(&self, action: RelayAction, params: &[(&str, &str)]) -> Url {
        let mut url = self.endpoint.clone();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("action", action.as_str());
            for (key, value) in params {
                query.append_pair(key, value);
            }
        }
        url
    }

    async fn post(&self, request: &RelayRequest) -> Result<(), RelayError> {
        debug!(action = request.action().as_str(), "Relay POST");

        let response = self
            .http
            .post(self.endpoint.clone())
            .json(request)
            .send()
            .await?;

        check_status(response).await?;
        Ok(())
    }

    async fn get<T: DeserializeOwned>(
        &self,
        action: RelayAction,
        params: &[(&str, &str)],
    ) -> Result<T, RelayError> {
        let response = self
            .http
            .get(self.action_url(action, params))
            .send()
            .await?;

        let response = check_status(response).await?;
        Ok(response.json().await?)
    }
}

/// Turn non-2xx responses into [`RelayError::Status`], keeping the relay's
/// error message when it sent one.
async fn check_status(response: Response) -> Result<Response, RelayError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorResponse>(&body)
        .map(|e| e.error)
        .unwrap_or(body);

    warn!(status = status.as_u16(), error = %message, "Relay rejected request");
    Err(RelayError::Status {
        status: status.as_u16(),
        message,
    })
}

#[async_trait]
impl Relay for RelayClient {
    async fn join(
        &self,
        channel_id: &ChannelId,
        user_id: &UserId,
        peer_id: &str,
        display_name: Option<&str>,
    ) -> Result<(), RelayError> {
        self.post(&RelayRequest::Join {
            channel_id: channel_id.clone(),
            user_id: user_id.clone(),
            peer_id: peer_id.to_string(),
            display_name: display_name.map(str::to_string),
        })
        .await
    }

    async fn leave(&self, peer_id: &str) -> Result<(), RelayError> {
        self.post(&RelayRequest::Leave {
            peer_id: peer_id.to_string(),
        })
        .await
    }

    async fn list_peers(&self, channel_id: &ChannelId) -> Result<Vec<PeerInfo>, RelayError> {
        let response: PeersResponse = self
            .get(RelayAction::Peers, &[("channel_id", channel_id.as_str())])
            .await?;
        Ok(response.peers)
    }

    async fn send_signal(&self, envelope: &SignalEnvelope) -> Result<(), RelayError> {
        self.post(&RelayRequest::from(envelope.clone())).await
    }

    async fn fetch_signals(&self, peer_id: &str) -> Result<Vec<SignalEnvelope>, RelayError> {
        let response: SignalsResponse = self
            .get(RelayAction::Signals, &[("peer_id", peer_id)])
            .await?;
        Ok(response.signals)
    }

    async fn list_channels(&self) -> Result<Vec<ChannelSummary>, RelayError> {
        let response: ChannelsResponse = self.get(RelayAction::List, &[]).await?;
        Ok(response.channels)
    }
}
