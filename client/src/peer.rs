//! Peer Connection
//!
//! One negotiated audio link to one remote peer. Each connection runs a task
//! that owns the handshake: inbound payloads are applied strictly in arrival
//! order and every outbound payload or transport change is reported to the
//! owner as a [`PeerEvent`].

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use vc_common::SignalPayload;
use webrtc::track::track_remote::TrackRemote;

use crate::capture::LocalAudio;
use crate::media::{LinkEvent, MediaEngine, MediaLink, PeerHandshakeError};

/// How long a connection may stay in `Connecting` before it is failed.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Which side of the pair opens the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Sends the offer as soon as the connection is created.
    Initiator,
    /// Waits for the remote offer and answers it.
    Responder,
}

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerState {
    Connecting,
    Connected,
    Failed,
    /// Terminal.
    Closed,
}

impl PeerState {
    /// Whether `next` is a legal successor of `self`.
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Connecting, Self::Connected | Self::Failed)
                | (Self::Connected, Self::Failed)
                | (Self::Connecting | Self::Connected | Self::Failed, Self::Closed)
        )
    }
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Something a connection needs its owner to act on.
#[derive(Debug)]
pub struct PeerEvent {
    pub peer_id: String,
    /// Generation of the connection that raised the event.
    pub generation: u64,
    pub kind: PeerEventKind,
}

#[derive(Debug)]
pub enum PeerEventKind {
    /// Payload to forward to the remote peer.
    Signal(SignalPayload),
    /// Media is flowing.
    Connected,
    /// The remote audio stream is available.
    RemoteAudio(Arc<TrackRemote>),
    /// The handshake or transport failed; the connection must be torn down.
    Failed(PeerHandshakeError),
}

#[derive(Default)]
struct LinkSlot {
    link: Option<Arc<dyn MediaLink>>,
    closed: bool,
}

/// Handle to a running peer connection.
pub struct PeerConnection {
    peer_id: String,
    display_name: String,
    role: Role,
    generation: u64,
    state: Arc<watch::Sender<PeerState>>,
    inbox: mpsc::UnboundedSender<SignalPayload>,
    shutdown_tx: watch::Sender<bool>,
    slot: Arc<Mutex<LinkSlot>>,
}

/// Everything the connection task needs.
struct PeerTask {
    peer_id: String,
    role: Role,
    generation: u64,
    engine: Arc<dyn MediaEngine>,
    local: LocalAudio,
    state: Arc<watch::Sender<PeerState>>,
    slot: Arc<Mutex<LinkSlot>>,
    events: mpsc::UnboundedSender<PeerEvent>,
}

impl PeerConnection {
    /// Create a connection in `Connecting` and start its handshake task.
    pub fn spawn(
        peer_id: impl Into<String>,
        display_name: impl Into<String>,
        role: Role,
        generation: u64,
        engine: Arc<dyn MediaEngine>,
        local: LocalAudio,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Self {
        let peer_id = peer_id.into();
        let (state, _) = watch::channel(PeerState::Connecting);
        let state = Arc::new(state);
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let slot = Arc::new(Mutex::new(LinkSlot::default()));

        let task = PeerTask {
            peer_id: peer_id.clone(),
            role,
            generation,
            engine,
            local,
            state: state.clone(),
            slot: slot.clone(),
            events,
        };
        tokio::spawn(task.run(inbox_rx, shutdown_rx));

        debug!(peer_id = %peer_id, ?role, generation, "Peer connection spawned");

        Self {
            peer_id,
            display_name: display_name.into(),
            role,
            generation,
            state,
            inbox: inbox_tx,
            shutdown_tx,
            slot,
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub const fn role(&self) -> Role {
        self.role
    }

    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Current lifecycle state.
    pub fn state(&self) -> PeerState {
        *self.state.borrow()
    }

    /// Watch lifecycle changes.
    pub fn subscribe(&self) -> watch::Receiver<PeerState> {
        self.state.subscribe()
    }

    /// Queue an inbound payload. Returns false once the connection is gone.
    pub fn deliver(&self, payload: SignalPayload) -> bool {
        self.state() != PeerState::Closed && self.inbox.send(payload).is_ok()
    }

    /// Tear the connection down and move it to `Closed`. Idempotent.
    pub async fn destroy(&self) {
        if !transition(&self.state, PeerState::Closed) {
            return;
        }

        let _ = self.shutdown_tx.send(true);

        let link = {
            let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
            slot.closed = true;
            slot.link.take()
        };
        if let Some(link) = link {
            link.close().await;
        }

        info!(peer_id = %self.peer_id, generation = self.generation, "Peer connection closed");
    }
}

impl fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerConnection")
            .field("peer_id", &self.peer_id)
            .field("role", &self.role)
            .field("generation", &self.generation)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Apply a state change if it is legal.
fn transition(state: &watch::Sender<PeerState>, next: PeerState) -> bool {
    state.send_if_modified(|current| {
        if current.can_transition_to(next) {
            *current = next;
            true
        } else {
            false
        }
    })
}

impl PeerTask {
    async fn run(
        self,
        mut inbox: mpsc::UnboundedReceiver<SignalPayload>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let (link_tx, mut link_events) = mpsc::unbounded_channel();

        let opened = tokio::select! {
            _ = shutdown.changed() => return,
            opened = self.engine.open_link(&self.peer_id, &self.local, link_tx) => opened,
        };
        let link = match opened {
            Ok(link) => link,
            Err(e) => return self.fail(e),
        };

        if !self.store_link(&link) {
            link.close().await;
            return;
        }

        if self.role == Role::Initiator {
            let offer = tokio::select! {
                _ = shutdown.changed() => return,
                offer = link.create_offer() => offer,
            };
            match offer {
                Ok(offer) => self.emit(PeerEventKind::Signal(offer)),
                Err(e) => return self.fail(e),
            }
        }

        let handshake_deadline = tokio::time::sleep(HANDSHAKE_TIMEOUT);
        tokio::pin!(handshake_deadline);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                () = &mut handshake_deadline, if *self.state.borrow() == PeerState::Connecting => {
                    return self.fail(PeerHandshakeError::Timeout);
                }
                Some(payload) = inbox.recv() => {
                    match link.apply_remote(&payload).await {
                        Ok(Some(reply)) => self.emit(PeerEventKind::Signal(reply)),
                        Ok(None) => {}
                        Err(e) => return self.fail(e),
                    }
                }
                Some(event) = link_events.recv() => match event {
                    LinkEvent::Connected => {
                        if transition(&self.state, PeerState::Connected) {
                            info!(peer_id = %self.peer_id, "Peer connected");
                            self.emit(PeerEventKind::Connected);
                        }
                    }
                    LinkEvent::RemoteAudio(track) => self.emit(PeerEventKind::RemoteAudio(track)),
                    LinkEvent::Failed(reason) => {
                        return self.fail(PeerHandshakeError::Transport(reason));
                    }
                },
                else => break,
            }
        }
    }

    /// Park the link where `destroy` can reach it. False if the connection
    /// was destroyed while the link was being opened.
    fn store_link(&self, link: &Arc<dyn MediaLink>) -> bool {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.closed {
            return false;
        }
        slot.link = Some(link.clone());
        true
    }

    fn emit(&self, kind: PeerEventKind) {
        let _ = self.events.send(PeerEvent {
            peer_id: self.peer_id.clone(),
            generation: self.generation,
            kind,
        });
    }

    fn fail(&self, error: PeerHandshakeError) {
        if transition(&self.state, PeerState::Failed) {
            warn!(peer_id = %self.peer_id, generation = self.generation, "Peer connection failed: {}", error);
            self.emit(PeerEventKind::Failed(error));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_local_audio, FakeEngine};
    use serde_json::json;

    fn spawn(
        engine: &Arc<FakeEngine>,
        role: Role,
    ) -> (PeerConnection, mpsc::UnboundedReceiver<PeerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = PeerConnection::spawn(
            "p2",
            "Bob",
            role,
            7,
            engine.clone(),
            test_local_audio(),
            tx,
        );
        (conn, rx)
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<PeerEvent>) -> PeerEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for peer event")
            .expect("event channel closed")
    }

    #[test]
    fn test_state_transitions() {
        use PeerState::*;
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connecting.can_transition_to(Failed));
        assert!(Connected.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Closed));
        assert!(Connected.can_transition_to(Closed));
        assert!(!Connected.can_transition_to(Connecting));
        assert!(!Failed.can_transition_to(Connected));
        assert!(!Closed.can_transition_to(Connecting));
        assert!(!Closed.can_transition_to(Closed));
    }

    #[tokio::test]
    async fn test_initiator_emits_offer_immediately() {
        let engine = Arc::new(FakeEngine::new());
        let (conn, mut rx) = spawn(&engine, Role::Initiator);

        let event = next_event(&mut rx).await;
        assert_eq!(event.peer_id, "p2");
        assert_eq!(event.generation, 7);
        match event.kind {
            PeerEventKind::Signal(payload) => assert_eq!(payload.kind(), Some("offer")),
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(conn.state(), PeerState::Connecting);
    }

    #[tokio::test]
    async fn test_responder_waits_for_offer() {
        let engine = Arc::new(FakeEngine::new());
        let (conn, mut rx) = spawn(&engine, Role::Responder);

        let quiet = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
        assert!(quiet.is_err());

        assert!(conn.deliver(SignalPayload::new(json!({"type": "offer", "sdp": "remote"}))));

        match next_event(&mut rx).await.kind {
            PeerEventKind::Signal(payload) => assert_eq!(payload.kind(), Some("answer")),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(matches!(next_event(&mut rx).await.kind, PeerEventKind::Connected));
        assert_eq!(conn.state(), PeerState::Connected);
    }

    #[tokio::test]
    async fn test_inbound_payloads_apply_in_order() {
        let engine = Arc::new(FakeEngine::new());
        let (conn, mut rx) = spawn(&engine, Role::Responder);

        for n in 0..5 {
            conn.deliver(SignalPayload::new(json!({"type": "candidate", "n": n})));
        }
        conn.deliver(SignalPayload::new(json!({"type": "offer", "sdp": "x"})));
        next_event(&mut rx).await;

        let applied: Vec<_> = engine
            .applied("p2")
            .iter()
            .filter_map(|p| p.as_json().get("n").and_then(serde_json::Value::as_u64))
            .collect();
        assert_eq!(applied, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_responder_times_out() {
        let engine = Arc::new(FakeEngine::new());
        let (conn, mut rx) = spawn(&engine, Role::Responder);

        let event = tokio::time::timeout(HANDSHAKE_TIMEOUT + Duration::from_secs(1), rx.recv())
            .await
            .expect("handshake deadline never fired")
            .expect("event channel closed");
        assert!(matches!(
            event.kind,
            PeerEventKind::Failed(PeerHandshakeError::Timeout)
        ));
        assert_eq!(conn.state(), PeerState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connected_link_outlives_handshake_deadline() {
        let engine = Arc::new(FakeEngine::new());
        let (conn, mut rx) = spawn(&engine, Role::Responder);

        conn.deliver(SignalPayload::new(json!({"type": "offer", "sdp": "remote"})));
        next_event(&mut rx).await;
        assert!(matches!(next_event(&mut rx).await.kind, PeerEventKind::Connected));

        tokio::time::sleep(HANDSHAKE_TIMEOUT * 2).await;

        assert_eq!(conn.state(), PeerState::Connected);
        while let Ok(event) = rx.try_recv() {
            assert!(!matches!(event.kind, PeerEventKind::Failed(_)), "{event:?}");
        }
    }

    #[tokio::test]
    async fn test_handshake_error_fails_connection() {
        let engine = Arc::new(FakeEngine::new());
        let (conn, mut rx) = spawn(&engine, Role::Responder);

        conn.deliver(SignalPayload::new(json!({"type": "bogus"})));

        match next_event(&mut rx).await.kind {
            PeerEventKind::Failed(PeerHandshakeError::UnsupportedPayload(kind)) => {
                assert_eq!(kind, "bogus");
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(conn.state(), PeerState::Failed);
    }

    #[tokio::test]
    async fn test_open_failure_fails_connection() {
        let engine = Arc::new(FakeEngine::failing_open());
        let (conn, mut rx) = spawn(&engine, Role::Initiator);

        assert!(matches!(next_event(&mut rx).await.kind, PeerEventKind::Failed(_)));
        assert_eq!(conn.state(), PeerState::Failed);
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent_and_closes_link() {
        let engine = Arc::new(FakeEngine::new());
        let (conn, mut rx) = spawn(&engine, Role::Initiator);
        next_event(&mut rx).await;

        conn.destroy().await;
        conn.destroy().await;

        assert_eq!(conn.state(), PeerState::Closed);
        assert_eq!(engine.closed("p2"), 1);
        assert!(!conn.deliver(SignalPayload::new(json!({"type": "answer", "sdp": "x"}))));
    }

    #[tokio::test]
    async fn test_destroy_before_link_opens() {
        let engine = Arc::new(FakeEngine::new());
        let (conn, _rx) = spawn(&engine, Role::Responder);

        conn.destroy().await;
        assert_eq!(conn.state(), PeerState::Closed);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(conn.state(), PeerState::Closed);
    }
}
