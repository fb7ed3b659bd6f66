//! Peer Registry
//!
//! Map from remote peer id to its connection. The registry owns every
//! connection's lifecycle and raises the join/leave notifications in the same
//! call that changes its contents.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use vc_common::SignalEnvelope;
use webrtc::track::track_remote::TrackRemote;

use crate::capture::{AudioSink, LocalAudio};
use crate::media::{MediaEngine, PeerHandshakeError};
use crate::peer::{PeerConnection, PeerEvent, PeerState, Role};
use crate::session::SessionEvent;

/// Upserts skipped after a peer's first handshake timeout.
const INITIAL_REDIAL_BACKOFF: u32 = 4;

/// Upper bound on upserts skipped between redials.
const MAX_REDIAL_BACKOFF: u32 = 64;

/// Redial backoff of a peer id whose handshakes time out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Redial {
    /// Upserts still to skip.
    skip: u32,
    /// Skip count applied on the next timeout.
    next: u32,
}

pub struct PeerRegistry {
    local_peer_id: String,
    peers: HashMap<String, PeerConnection>,
    redial: HashMap<String, Redial>,
    next_generation: u64,
    local_audio: Option<LocalAudio>,
    engine: Arc<dyn MediaEngine>,
    sink: Arc<dyn AudioSink>,
    peer_events: mpsc::UnboundedSender<PeerEvent>,
    session_events: mpsc::UnboundedSender<SessionEvent>,
}

impl PeerRegistry {
    pub fn new(
        local_peer_id: impl Into<String>,
        engine: Arc<dyn MediaEngine>,
        sink: Arc<dyn AudioSink>,
        peer_events: mpsc::UnboundedSender<PeerEvent>,
        session_events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        Self {
            local_peer_id: local_peer_id.into(),
            peers: HashMap::new(),
            redial: HashMap::new(),
            next_generation: 0,
            local_audio: None,
            engine,
            sink,
            peer_events,
            session_events,
        }
    }

    pub fn local_peer_id(&self) -> &str {
        &self.local_peer_id
    }

    /// Local track attached to connections created from now on.
    pub fn set_local_audio(&mut self, local_audio: Option<LocalAudio>) {
        self.local_audio = local_audio;
    }

    /// Create a connection for a newly seen peer and announce it.
    ///
    /// Returns false if the peer is already known, is the local peer, or
    /// there is no local audio to send. A peer id backing off after a
    /// handshake timeout is skipped too, consuming one step of its backoff.
    pub fn upsert(&mut self, peer_id: &str, display_name: &str, role: Role) -> bool {
        if peer_id == self.local_peer_id || self.peers.contains_key(peer_id) {
            return false;
        }
        if let Some(redial) = self.redial.get_mut(peer_id) {
            if redial.skip > 0 {
                redial.skip -= 1;
                debug!(peer_id = %peer_id, remaining = redial.skip, "Peer backing off, not redialing");
                return false;
            }
        }
        let Some(local_audio) = self.local_audio.clone() else {
            warn!(peer_id = %peer_id, "No local audio, not connecting to peer");
            return false;
        };

        self.next_generation += 1;
        let connection = PeerConnection::spawn(
            peer_id,
            display_name,
            role,
            self.next_generation,
            self.engine.clone(),
            local_audio,
            self.peer_events.clone(),
        );
        self.peers.insert(peer_id.to_string(), connection);

        info!(peer_id = %peer_id, display_name = %display_name, ?role, "Peer joined");
        self.notify(SessionEvent::PeerJoined {
            peer_id: peer_id.to_string(),
            display_name: display_name.to_string(),
        });
        true
    }

    /// Hand an inbound envelope to the connection it belongs to.
    ///
    /// Misaddressed envelopes and envelopes from unknown peers are logged and
    /// dropped. Returns whether the payload was queued.
    pub fn route_signal(&self, envelope: SignalEnvelope) -> bool {
        if envelope.to_peer != self.local_peer_id {
            debug!(
                from_peer = %envelope.from_peer,
                to_peer = %envelope.to_peer,
                "Dropping misaddressed signal"
            );
            return false;
        }

        let Some(connection) = self.peers.get(&envelope.from_peer) else {
            debug!(from_peer = %envelope.from_peer, "Dropping signal from unknown peer");
            return false;
        };

        connection.deliver(envelope.payload)
    }

    /// Destroy a peer's connection and announce its departure. No-op for
    /// unknown ids.
    pub async fn remove(&mut self, peer_id: &str) -> bool {
        let Some(connection) = self.peers.remove(peer_id) else {
            return false;
        };
        self.teardown(&connection).await;

        info!(peer_id = %peer_id, "Peer left");
        self.notify(SessionEvent::PeerLeft {
            peer_id: peer_id.to_string(),
        });
        true
    }

    /// Remove a peer whose connection failed, provided the failure came from
    /// the connection currently registered.
    ///
    /// A handshake timeout is not reported as an error; the peer id backs off
    /// instead, skipping a growing number of upserts before it is redialed.
    pub async fn remove_failed(
        &mut self,
        peer_id: &str,
        generation: u64,
        error: &PeerHandshakeError,
    ) -> bool {
        if !self.is_current(peer_id, generation) {
            debug!(peer_id = %peer_id, generation, "Ignoring failure of stale connection");
            return false;
        }

        if *error == PeerHandshakeError::Timeout {
            let redial = self.redial.entry(peer_id.to_string()).or_insert(Redial {
                skip: 0,
                next: INITIAL_REDIAL_BACKOFF,
            });
            redial.skip = redial.next;
            redial.next = (redial.next * 2).min(MAX_REDIAL_BACKOFF);
            info!(peer_id = %peer_id, skipped_ticks = redial.skip, "Peer did not answer, backing off");
        } else {
            self.notify(SessionEvent::Error {
                description: format!("Connection to {peer_id} failed: {error}"),
            });
        }
        self.remove(peer_id).await
    }

    /// The current connection to `peer_id` is up; its backoff is reset.
    pub fn mark_connected(&mut self, peer_id: &str, generation: u64) {
        if self.is_current(peer_id, generation) {
            self.redial.remove(peer_id);
        }
    }

    /// Drop the backoff of a peer id, e.g. because it sent a payload.
    pub fn clear_redial(&mut self, peer_id: &str) {
        self.redial.remove(peer_id);
    }

    /// Keep backoff state only for peer ids `keep` accepts.
    pub fn retain_redials(&mut self, keep: impl Fn(&str) -> bool) {
        self.redial.retain(|peer_id, _| keep(peer_id));
    }

    /// Whether `peer_id` is currently skipped by [`upsert`](Self::upsert).
    pub fn is_backing_off(&self, peer_id: &str) -> bool {
        self.redial.get(peer_id).is_some_and(|r| r.skip > 0)
    }

    /// Route a remote track from the current connection to the audio sink.
    pub fn attach_audio(&self, peer_id: &str, generation: u64, track: Arc<TrackRemote>) -> bool {
        if !self.is_current(peer_id, generation) {
            return false;
        }
        self.sink.attach(peer_id, track);
        true
    }

    /// Destroy every connection without announcing departures.
    pub async fn clear(&mut self) {
        self.redial.clear();
        let count = self.peers.len();
        for (_, connection) in self.peers.drain() {
            connection.destroy().await;
            self.sink.detach(connection.peer_id());
        }
        if count > 0 {
            info!(count, "Cleared peer registry");
        }
    }

    /// Whether `generation` is the live connection for `peer_id`.
    pub fn is_current(&self, peer_id: &str, generation: u64) -> bool {
        self.peers
            .get(peer_id)
            .is_some_and(|c| c.generation() == generation)
    }

    pub fn get(&self, peer_id: &str) -> Option<&PeerConnection> {
        self.peers.get(peer_id)
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.peers.contains_key(peer_id)
    }

    pub fn state(&self, peer_id: &str) -> Option<PeerState> {
        self.peers.get(peer_id).map(PeerConnection::state)
    }

    /// Registered peer ids, sorted.
    pub fn peer_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.peers.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    async fn teardown(&self, connection: &PeerConnection) {
        connection.destroy().await;
        self.sink.detach(connection.peer_id());
    }

    fn notify(&self, event: SessionEvent) {
        let _ = self.session_events.send(event);
    }
}
