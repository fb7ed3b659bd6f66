//! Discovery Loop
//!
//! The relay never pushes, so membership changes and inbound handshake
//! payloads are found by polling. Every tick reconciles the relay's peer set
//! against the registry and routes whatever sits in the local inbox.

use std::collections::{HashSet, VecDeque};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use vc_common::SignalEnvelope;

use crate::config::MIN_POLL_INTERVAL;
use crate::error::PollError;
use crate::peer::Role;
use crate::registry::PeerRegistry;
use crate::relay::PeerInfo;
use crate::session::SessionShared;

/// Inbox envelopes held across ticks whose peer list failed.
const MAX_PENDING_SIGNALS: usize = 64;

/// Who opens the handshake when two peers discover each other.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TieBreak {
    /// The lexicographically lower peer id answers; the other side offers.
    #[default]
    LowerIdResponds,
    /// Every peer offers to every peer it discovers.
    AlwaysInitiate,
}

impl TieBreak {
    /// Role the local peer plays towards `remote`.
    pub fn role_for(self, local: &str, remote: &str) -> Role {
        match self {
            Self::AlwaysInitiate => Role::Initiator,
            Self::LowerIdResponds if local < remote => Role::Responder,
            Self::LowerIdResponds => Role::Initiator,
        }
    }
}

#[derive(Debug, Error)]
#[error("Unknown tie-break policy: {0}")]
pub struct ParseTieBreakError(String);

impl FromStr for TieBreak {
    type Err = ParseTieBreakError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lower-id-responds" => Ok(Self::LowerIdResponds),
            "always-initiate" => Ok(Self::AlwaysInitiate),
            other => Err(ParseTieBreakError(other.to_string())),
        }
    }
}

/// Outcome of one reconciliation.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Reconciled {
    pub joined: Vec<String>,
    pub left: Vec<String>,
}

/// Make the registry match a relay snapshot.
///
/// Peers missing from the snapshot are removed and forget any redial
/// backoff, new ones are created with the role `tie_break` assigns. The local
/// peer is ignored and duplicate entries collapse to the first occurrence.
pub async fn reconcile(
    registry: &mut PeerRegistry,
    snapshot: &[PeerInfo],
    tie_break: TieBreak,
) -> Reconciled {
    let local = registry.local_peer_id().to_string();

    let mut seen = HashSet::new();
    let remote: Vec<&PeerInfo> = snapshot
        .iter()
        .filter(|p| p.peer_id != local && seen.insert(p.peer_id.as_str()))
        .collect();

    let mut outcome = Reconciled::default();

    for peer_id in registry.peer_ids() {
        if !seen.contains(peer_id.as_str()) && registry.remove(&peer_id).await {
            outcome.left.push(peer_id);
        }
    }

    registry.retain_redials(|peer_id| seen.contains(peer_id));

    for peer in remote {
        let role = tie_break.role_for(&local, &peer.peer_id);
        if registry.upsert(&peer.peer_id, &peer.display_name, role) {
            outcome.joined.push(peer.peer_id.clone());
        }
    }

    outcome
}

/// Handle to a running discovery task.
pub(crate) struct DiscoveryLoop {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl DiscoveryLoop {
    /// Start polling. The first tick runs immediately.
    pub(crate) fn spawn(shared: Arc<SessionShared>, interval: Duration) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        // `interval` panics on zero
        let interval = interval.max(MIN_POLL_INTERVAL);
        let handle = tokio::spawn(run(shared, interval, shutdown_rx));
        Self {
            shutdown_tx,
            handle,
        }
    }

    /// Stop polling and wait for the task to finish.
    pub(crate) async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.handle.await {
            if e.is_panic() {
                warn!("Discovery task panicked: {}", e);
            }
        }
    }

    /// Stop polling without waiting.
    pub(crate) fn abort(&self) {
        let _ = self.shutdown_tx.send(true);
        self.handle.abort();
    }
}

async fn run(shared: Arc<SessionShared>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    info!(
        channel_id = %shared.channel_id(),
        interval_ms = interval.as_millis() as u64,
        "Discovery started"
    );

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }

        if !tick(&shared, &mut shutdown).await {
            break;
        }
    }

    info!(channel_id = %shared.channel_id(), "Discovery stopped");
}

/// Keep an envelope for the next successful reconcile, dropping the oldest
/// once the buffer is full.
fn hold_signal(pending: &mut VecDeque<SignalEnvelope>, envelope: SignalEnvelope) {
    if pending.len() >= MAX_PENDING_SIGNALS {
        if let Some(dropped) = pending.pop_front() {
            warn!(from_peer = %dropped.from_peer, "Pending signal buffer full, dropping oldest");
        }
    }
    debug!(from_peer = %envelope.from_peer, "Holding signal until the peer list is available");
    pending.push_back(envelope);
}

/// One poll. Returns false once the loop should stop.
pub(crate) async fn tick(shared: &SessionShared, shutdown: &mut watch::Receiver<bool>) -> bool {
    let relay = shared.relay();

    // The inbox is drained before the peer list is fetched, so the sender of
    // every drained payload is already in the snapshot.
    let inbox = tokio::select! {
        _ = shutdown.changed() => return false,
        inbox = relay.fetch_signals(shared.local_peer_id()) => inbox.map_err(PollError::Inbox),
    };
    let snapshot = tokio::select! {
        _ = shutdown.changed() => return false,
        peers = relay.list_peers(shared.channel_id()) => peers.map_err(PollError::Peers),
    };

    let mut core = shared.lock_core().await;
    if !core.connected {
        debug!("Discarding poll result after disconnect");
        return false;
    }

    // A payload from a peer proves it is alive, so it is redialed right away
    if let Ok(envelopes) = &inbox {
        for envelope in envelopes {
            core.registry.clear_redial(&envelope.from_peer);
        }
    }

    let snapshot_ok = match snapshot {
        Ok(snapshot) => {
            let outcome = reconcile(&mut core.registry, &snapshot, shared.tie_break()).await;
            if !outcome.joined.is_empty() || !outcome.left.is_empty() {
                debug!(
                    joined = outcome.joined.len(),
                    left = outcome.left.len(),
                    peers = core.registry.len(),
                    "Peer set reconciled"
                );
            }
            true
        }
        Err(e) => {
            warn!(channel_id = %shared.channel_id(), "{}", e);
            false
        }
    };

    let core = &mut *core;
    if snapshot_ok {
        for envelope in core.pending_signals.drain(..) {
            core.registry.route_signal(envelope);
        }
    }

    match inbox {
        Ok(envelopes) => {
            for envelope in envelopes {
                // The relay never redelivers, so unknown senders wait for a peer list
                if !snapshot_ok && !core.registry.contains(&envelope.from_peer) {
                    hold_signal(&mut core.pending_signals, envelope);
                } else {
                    core.registry.route_signal(envelope);
                }
            }
        }
        Err(e) => warn!(peer_id = %shared.local_peer_id(), "{}", e),
    }

    true
}
