//! Session Errors

use thiserror::Error;

use crate::capture::DeviceError;
use crate::relay::RelayError;

/// Failure of [`SessionController::connect`](crate::SessionController::connect).
///
/// Everything that can go wrong after a successful connect is contained and
/// reported through [`SessionEvent::Error`](crate::SessionEvent::Error).
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Join(#[from] JoinError),
}

/// The relay rejected or never answered the join request.
#[derive(Debug, Error)]
#[error("Failed to join voice channel {channel_id}: {source}")]
pub struct JoinError {
    pub channel_id: String,
    #[source]
    pub source: RelayError,
}

/// A discovery tick could not reach the relay.
#[derive(Debug, Error)]
pub enum PollError {
    #[error("Peer list unavailable: {0}")]
    Peers(#[source] RelayError),
    #[error("Signal inbox unavailable: {0}")]
    Inbox(#[source] RelayError),
}

/// An outbound handshake payload could not be handed to the relay.
#[derive(Debug, Error)]
#[error("Failed to deliver signal to {to_peer}: {source}")]
pub struct SignalDeliveryError {
    pub to_peer: String,
    #[source]
    pub source: RelayError,
}
