//! Shared Types

mod channel;
mod id;
mod peer;

pub use channel::ChannelSummary;
pub use id::{ChannelId, UserId, WireId};
pub use peer::{PeerEntry, SignalEnvelope, SignalPayload};
