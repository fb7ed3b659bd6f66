//! In-process fakes for the relay, the media engine and the capture device.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::{mpsc, Notify};
use vc_common::{ChannelId, ChannelSummary, SignalEnvelope, SignalPayload, UserId};

use crate::capture::{AudioConstraints, CaptureDevice, CaptureStream, DeviceError, LocalAudio};
use crate::media::{LinkEvent, MediaEngine, MediaLink, PeerHandshakeError};
use crate::relay::{PeerInfo, Relay, RelayError};

pub fn test_local_audio() -> LocalAudio {
    LocalAudio::new()
}

async fn wait_until(mut done: impl FnMut() -> bool, what: &str) {
    for _ in 0..200 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

fn unavailable() -> RelayError {
    RelayError::Status {
        status: 503,
        message: "relay unavailable".to_string(),
    }
}

// ---------------------------------------------------------------------------
// Relay
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RelayLog {
    peers: Vec<PeerInfo>,
    inbound: VecDeque<SignalEnvelope>,
    sent: Vec<SignalEnvelope>,
    joins: Vec<(String, String, String)>,
    leaves: Vec<String>,
    failing_polls: usize,
    failing_peer_lists: usize,
    peer_list_gate: Option<Arc<Notify>>,
    fail_join: bool,
    fail_leave: bool,
    polls: usize,
}

/// Scripted relay that records every call.
#[derive(Default)]
pub struct FakeRelay {
    log: Mutex<RelayLog>,
}

impl FakeRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_peers(&self, peers: Vec<PeerInfo>) {
        self.log.lock().unwrap().peers = peers;
    }

    pub fn push_inbound(&self, envelope: SignalEnvelope) {
        self.log.lock().unwrap().inbound.push_back(envelope);
    }

    /// Fail the next `n` polls.
    pub fn fail_polls(&self, n: usize) {
        self.log.lock().unwrap().failing_polls = n;
    }

    /// Fail the next `n` peer list requests only; the inbox keeps working.
    pub fn fail_peer_lists(&self, n: usize) {
        self.log.lock().unwrap().failing_peer_lists = n;
    }

    /// Hold the next peer list request until the returned gate is notified.
    pub fn gate_peer_list(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.log.lock().unwrap().peer_list_gate = Some(gate.clone());
        gate
    }

    pub fn fail_join(&self) {
        self.log.lock().unwrap().fail_join = true;
    }

    pub fn fail_leave(&self) {
        self.log.lock().unwrap().fail_leave = true;
    }

    pub fn joins(&self) -> Vec<(String, String, String)> {
        self.log.lock().unwrap().joins.clone()
    }

    pub fn leaves(&self) -> Vec<String> {
        self.log.lock().unwrap().leaves.clone()
    }

    pub fn sent(&self) -> Vec<SignalEnvelope> {
        self.log.lock().unwrap().sent.clone()
    }

    /// Peer list requests served so far.
    pub fn polls(&self) -> usize {
        self.log.lock().unwrap().polls
    }

    pub async fn wait_for_polls(&self, n: usize) {
        wait_until(|| self.polls() >= n, "relay polls").await;
    }

    pub async fn wait_for_sent(&self, n: usize) -> Vec<SignalEnvelope> {
        wait_until(|| self.sent().len() >= n, "sent signals").await;
        self.sent()
    }
}

#[async_trait]
impl Relay for FakeRelay {
    async fn join(
        &self,
        channel_id: &ChannelId,
        user_id: &UserId,
        peer_id: &str,
        _display_name: Option<&str>,
    ) -> Result<(), RelayError> {
        let mut log = self.log.lock().unwrap();
        if log.fail_join {
            return Err(unavailable());
        }
        log.joins
            .push((channel_id.to_string(), user_id.to_string(), peer_id.to_string()));
        Ok(())
    }

    async fn leave(&self, peer_id: &str) -> Result<(), RelayError> {
        let mut log = self.log.lock().unwrap();
        log.leaves.push(peer_id.to_string());
        if log.fail_leave {
            return Err(unavailable());
        }
        Ok(())
    }

    async fn list_peers(&self, _channel_id: &ChannelId) -> Result<Vec<PeerInfo>, RelayError> {
        let gate = {
            let mut log = self.log.lock().unwrap();
            log.polls += 1;
            log.peer_list_gate.take()
        };
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let mut log = self.log.lock().unwrap();
        if log.failing_polls > 0 {
            log.failing_polls -= 1;
            return Err(unavailable());
        }
        if log.failing_peer_lists > 0 {
            log.failing_peer_lists -= 1;
            return Err(unavailable());
        }
        Ok(log.peers.clone())
    }

    async fn send_signal(&self, envelope: &SignalEnvelope) -> Result<(), RelayError> {
        self.log.lock().unwrap().sent.push(envelope.clone());
        Ok(())
    }

    async fn fetch_signals(&self, _peer_id: &str) -> Result<Vec<SignalEnvelope>, RelayError> {
        let mut log = self.log.lock().unwrap();
        if log.failing_polls > 0 {
            return Err(unavailable());
        }
        Ok(log.inbound.drain(..).collect())
    }

    async fn list_channels(&self) -> Result<Vec<ChannelSummary>, RelayError> {
        Ok(vec![ChannelSummary {
            id: "1".into(),
            name: "General".to_string(),
            users: self.log.lock().unwrap().peers.len(),
        }])
    }
}

// ---------------------------------------------------------------------------
// Media engine
// ---------------------------------------------------------------------------

#[derive(Default)]
struct EngineLog {
    opened: HashMap<String, usize>,
    closed: HashMap<String, usize>,
    applied: HashMap<String, Vec<SignalPayload>>,
    links: HashMap<String, mpsc::UnboundedSender<LinkEvent>>,
}

/// Media engine that completes handshakes without any network.
///
/// An offer is answered and connects immediately, as does an answer.
/// Candidates are accepted silently; any other payload type is rejected.
#[derive(Default)]
pub struct FakeEngine {
    fail_open: bool,
    log: Arc<Mutex<EngineLog>>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_open() -> Self {
        Self {
            fail_open: true,
            ..Self::default()
        }
    }

    pub fn opened(&self, peer_id: &str) -> usize {
        self.log.lock().unwrap().opened.get(peer_id).copied().unwrap_or(0)
    }

    pub fn closed(&self, peer_id: &str) -> usize {
        self.log.lock().unwrap().closed.get(peer_id).copied().unwrap_or(0)
    }

    pub fn applied(&self, peer_id: &str) -> Vec<SignalPayload> {
        self.log
            .lock()
            .unwrap()
            .applied
            .get(peer_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Make the latest link to `peer_id` report a transport failure.
    pub fn fail_link(&self, peer_id: &str) {
        let log = self.log.lock().unwrap();
        let events = log.links.get(peer_id).expect("no link opened for peer");
        let _ = events.send(LinkEvent::Failed("ice failed".to_string()));
    }

    pub async fn wait_for_opened(&self, peer_id: &str, n: usize) {
        wait_until(|| self.opened(peer_id) >= n, "opened links").await;
    }
}

#[async_trait]
impl MediaEngine for FakeEngine {
    async fn open_link(
        &self,
        peer_id: &str,
        _local: &LocalAudio,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Arc<dyn MediaLink>, PeerHandshakeError> {
        if self.fail_open {
            return Err(PeerHandshakeError::Engine("no codecs".to_string()));
        }

        let mut log = self.log.lock().unwrap();
        *log.opened.entry(peer_id.to_string()).or_default() += 1;
        log.links.insert(peer_id.to_string(), events.clone());

        Ok(Arc::new(FakeLink {
            peer_id: peer_id.to_string(),
            events,
            log: self.log.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

struct FakeLink {
    peer_id: String,
    events: mpsc::UnboundedSender<LinkEvent>,
    log: Arc<Mutex<EngineLog>>,
    closed: AtomicBool,
}

#[async_trait]
impl MediaLink for FakeLink {
    async fn create_offer(&self) -> Result<SignalPayload, PeerHandshakeError> {
        Ok(SignalPayload::new(
            json!({"type": "offer", "sdp": format!("offer-for-{}", self.peer_id)}),
        ))
    }

    async fn apply_remote(
        &self,
        payload: &SignalPayload,
    ) -> Result<Option<SignalPayload>, PeerHandshakeError> {
        self.log
            .lock()
            .unwrap()
            .applied
            .entry(self.peer_id.clone())
            .or_default()
            .push(payload.clone());

        match payload.kind() {
            Some("offer") => {
                let _ = self.events.send(LinkEvent::Connected);
                Ok(Some(SignalPayload::new(json!({"type": "answer", "sdp": "fake"}))))
            }
            Some("answer") => {
                let _ = self.events.send(LinkEvent::Connected);
                Ok(None)
            }
            Some("candidate") => Ok(None),
            other => Err(PeerHandshakeError::UnsupportedPayload(
                other.unwrap_or("missing").to_string(),
            )),
        }
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            *self
                .log
                .lock()
                .unwrap()
                .closed
                .entry(self.peer_id.clone())
                .or_default() += 1;
        }
    }
}

// ---------------------------------------------------------------------------
// Capture device
// ---------------------------------------------------------------------------

#[derive(Default)]
struct DeviceLog {
    opened: usize,
    stopped: usize,
    frames: Option<mpsc::Sender<Vec<u8>>>,
}

/// Capture device that only emits the frames a test pushes.
#[derive(Default)]
pub struct FakeDevice {
    failure: Option<DeviceError>,
    log: Arc<Mutex<DeviceLog>>,
}

impl FakeDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(error: DeviceError) -> Self {
        Self {
            failure: Some(error),
            ..Self::default()
        }
    }

    pub fn opened(&self) -> usize {
        self.log.lock().unwrap().opened
    }

    pub fn stopped(&self) -> usize {
        self.log.lock().unwrap().stopped
    }

    /// Push one encoded frame into the current capture.
    pub async fn emit(&self, frame: Vec<u8>) {
        let frames = self.log.lock().unwrap().frames.clone();
        if let Some(frames) = frames {
            let _ = frames.send(frame).await;
        }
    }
}

#[async_trait]
impl CaptureDevice for FakeDevice {
    async fn open(
        &self,
        _constraints: &AudioConstraints,
        _enabled: Arc<AtomicBool>,
        frames: mpsc::Sender<Vec<u8>>,
    ) -> Result<Box<dyn CaptureStream>, DeviceError> {
        if let Some(error) = &self.failure {
            return Err(error.clone());
        }

        let mut log = self.log.lock().unwrap();
        log.opened += 1;
        log.frames = Some(frames);
        Ok(Box::new(FakeStream {
            log: self.log.clone(),
        }))
    }
}

struct FakeStream {
    log: Arc<Mutex<DeviceLog>>,
}

impl CaptureStream for FakeStream {
    fn stop(self: Box<Self>) {
        let mut log = self.log.lock().unwrap();
        log.stopped += 1;
        log.frames = None;
    }
}
