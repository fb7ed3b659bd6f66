//! Channel Types

use serde::{Deserialize, Serialize};

use super::WireId;

/// Voice channel with its current participant count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSummary {
    /// Channel ID.
    pub id: WireId,
    /// Channel name.
    pub name: String,
    /// Number of peers currently connected.
    pub users: usize,
}
