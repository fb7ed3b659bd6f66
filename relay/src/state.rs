//! Relay State
//!
//! Channel membership and per-peer signal inboxes, kept in memory.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use vc_common::{ChannelSummary, PeerEntry, SignalEnvelope, WireId};

use crate::config::{ChannelDef, RelayConfig};
use crate::error::RelayServerError;

/// Maximum queued envelopes per peer before the oldest are dropped.
const MAX_INBOX_LEN: usize = 256;

/// A registered peer.
#[derive(Debug, Clone)]
struct Member {
    channel_id: WireId,
    user_id: WireId,
    display_name: String,
    /// Join order, used to keep peer lists stable.
    seq: u64,
    last_seen: Instant,
}

#[derive(Debug, Default)]
struct Tables {
    members: HashMap<String, Member>,
    inboxes: HashMap<String, VecDeque<SignalEnvelope>>,
    next_seq: u64,
}

impl Tables {
    /// Drop members idle for longer than `stale_after`, with their inboxes.
    fn expire_stale(&mut self, stale_after: Duration) {
        let stale: Vec<String> = self
            .members
            .iter()
            .filter(|(_, m)| m.last_seen.elapsed() > stale_after)
            .map(|(peer_id, _)| peer_id.clone())
            .collect();

        for peer_id in stale {
            if let Some(member) = self.members.remove(&peer_id) {
                info!(
                    peer_id = %peer_id,
                    channel_id = %member.channel_id,
                    "Expired stale voice member"
                );
            }
            self.inboxes.remove(&peer_id);
        }
    }
}

/// Shared relay state.
pub struct RelayState {
    channels: Vec<ChannelDef>,
    stale_after: Duration,
    tables: RwLock<Tables>,
}

impl RelayState {
    /// Create empty state for the given configuration.
    pub fn new(config: &RelayConfig) -> Self {
        Self {
            channels: config.channels.clone(),
            stale_after: config.stale_after,
            tables: RwLock::new(Tables::default()),
        }
    }

    /// Register a peer in a channel.
    ///
    /// Re-joining with the same peer id in the same channel refreshes the
    /// entry; joining a different channel with a live peer id is rejected.
    pub async fn join(
        &self,
        channel_id: WireId,
        user_id: WireId,
        peer_id: String,
        display_name: Option<String>,
    ) -> Result<(), RelayServerError> {
        let mut tables = self.tables.write().await;
        tables.expire_stale(self.stale_after);

        if let Some(existing) = tables.members.get_mut(&peer_id) {
            if existing.channel_id != channel_id {
                return Err(RelayServerError::AlreadyJoined(peer_id));
            }
            existing.last_seen = Instant::now();
            debug!(peer_id = %peer_id, "Refreshed existing voice member");
            return Ok(());
        }

        let seq = tables.next_seq;
        tables.next_seq += 1;

        let display_name = display_name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| format!("user-{user_id}"));

        info!(
            peer_id = %peer_id,
            channel_id = %channel_id,
            user_id = %user_id,
            "Peer joined voice channel"
        );

        tables.inboxes.insert(peer_id.clone(), VecDeque::new());
        tables.members.insert(
            peer_id,
            Member {
                channel_id,
                user_id,
                display_name,
                seq,
                last_seen: Instant::now(),
            },
        );
        Ok(())
    }

    /// Unregister a peer. Returns whether it was registered.
    pub async fn leave(&self, peer_id: &str) -> bool {
        let mut tables = self.tables.write().await;
        tables.inboxes.remove(peer_id);
        let removed = tables.members.remove(peer_id);

        if let Some(member) = &removed {
            info!(
                peer_id = %peer_id,
                channel_id = %member.channel_id,
                user_id = %member.user_id,
                "Peer left voice channel"
            );
        }
        removed.is_some()
    }

    /// Live peers of a channel, in join order.
    pub async fn peers(&self, channel_id: &WireId) -> Vec<PeerEntry> {
        let mut tables = self.tables.write().await;
        tables.expire_stale(self.stale_after);

        let mut members: Vec<(&String, &Member)> = tables
            .members
            .iter()
            .filter(|(_, m)| &m.channel_id == channel_id)
            .collect();
        members.sort_by_key(|(_, m)| m.seq);

        members
            .into_iter()
            .map(|(peer_id, m)| PeerEntry::new(peer_id.clone(), m.display_name.clone()))
            .collect()
    }

    /// Queue an envelope for its recipient. Returns whether the recipient is
    /// a registered peer.
    pub async fn push_signal(&self, envelope: SignalEnvelope) -> bool {
        let mut tables = self.tables.write().await;
        let Some(inbox) = tables.inboxes.get_mut(&envelope.to_peer) else {
            debug!(
                from_peer = %envelope.from_peer,
                to_peer = %envelope.to_peer,
                "Dropping signal for unknown peer"
            );
            return false;
        };

        if inbox.len() >= MAX_INBOX_LEN {
            warn!(to_peer = %envelope.to_peer, "Signal inbox full, dropping oldest");
            inbox.pop_front();
        }
        inbox.push_back(envelope);
        true
    }

    /// Take every queued envelope for a peer, oldest first.
    ///
    /// Polling the inbox also marks the peer as alive.
    pub async fn drain_signals(&self, peer_id: &str) -> Vec<SignalEnvelope> {
        let mut tables = self.tables.write().await;
        if let Some(member) = tables.members.get_mut(peer_id) {
            member.last_seen = Instant::now();
        }
        tables
            .inboxes
            .get_mut(peer_id)
            .map(|inbox| inbox.drain(..).collect())
            .unwrap_or_default()
    }

    /// Configured voice channels with their live member counts.
    pub async fn channels(&self) -> Vec<ChannelSummary> {
        let mut tables = self.tables.write().await;
        tables.expire_stale(self.stale_after);

        self.channels
            .iter()
            .map(|channel| ChannelSummary {
                id: channel.id.clone(),
                name: channel.name.clone(),
                users: tables
                    .members
                    .values()
                    .filter(|m| m.channel_id == channel.id)
                    .count(),
            })
            .collect()
    }
}
