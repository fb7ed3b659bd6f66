//! Session Controller
//!
//! Top-level voice session for one channel: connect and disconnect, the
//! discovery loop, the peer registry and the microphone, behind a single lock.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use tokio::sync::{mpsc, watch, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use vc_common::{ChannelId, ChannelSummary, SignalEnvelope, UserId};

use crate::capture::{AudioConstraints, AudioSink, CaptureDevice, LocalCapture};
use crate::config::VoiceConfig;
use crate::discovery::{DiscoveryLoop, TieBreak};
use crate::error::{JoinError, SessionError, SignalDeliveryError};
use crate::media::MediaEngine;
use crate::peer::{PeerEvent, PeerEventKind, PeerState};
use crate::registry::PeerRegistry;
use crate::relay::{Relay, RelayError};

/// Notifications for the embedding application, in the order raised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    PeerJoined {
        peer_id: String,
        display_name: String,
    },
    PeerLeft {
        peer_id: String,
    },
    Error {
        description: String,
    },
}

/// Who is joining which channel.
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub channel_id: ChannelId,
    pub user_id: UserId,
    /// Name announced to other members; the relay picks one when absent.
    pub display_name: Option<String>,
    pub constraints: AudioConstraints,
}

impl SessionParams {
    pub fn new(channel_id: impl Into<ChannelId>, user_id: impl Into<UserId>) -> Self {
        Self {
            channel_id: channel_id.into(),
            user_id: user_id.into(),
            display_name: None,
            constraints: AudioConstraints::default(),
        }
    }

    #[must_use]
    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = Some(display_name.into());
        self
    }
}

/// Generate a process-unique peer id: `peer-<unix millis>-<9 base36 chars>`.
pub fn generate_peer_id() -> String {
    const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();

    let mut rng = rand::thread_rng();
    let suffix: String = (0..9)
        .map(|_| char::from(ALPHABET[rng.gen_range(0..ALPHABET.len())]))
        .collect();

    format!("peer-{millis}-{suffix}")
}

/// Mutable session state. Every field is guarded by one lock.
pub(crate) struct SessionCore {
    pub(crate) connected: bool,
    pub(crate) registry: PeerRegistry,
    /// Inbox envelopes from senders not yet known, held while the peer list
    /// is unavailable.
    pub(crate) pending_signals: VecDeque<SignalEnvelope>,
    capture: LocalCapture,
    tasks: Option<SessionTasks>,
}

/// Background tasks of a connected session.
struct SessionTasks {
    discovery: DiscoveryLoop,
    pump_shutdown: watch::Sender<bool>,
    pump: JoinHandle<()>,
}

impl SessionTasks {
    async fn stop(self) {
        self.discovery.stop().await;
        let _ = self.pump_shutdown.send(true);
        if let Err(e) = self.pump.await {
            if e.is_panic() {
                error!("Peer event pump panicked: {}", e);
            }
        }
    }

    fn abort(&self) {
        self.discovery.abort();
        let _ = self.pump_shutdown.send(true);
        self.pump.abort();
    }
}

/// State shared between the controller and its background tasks.
pub(crate) struct SessionShared {
    local_peer_id: String,
    params: SessionParams,
    config: VoiceConfig,
    relay: Arc<dyn Relay>,
    events: mpsc::UnboundedSender<SessionEvent>,
    peer_events: Mutex<mpsc::UnboundedReceiver<PeerEvent>>,
    /// Serializes connect and disconnect.
    lifecycle: Mutex<()>,
    core: Mutex<SessionCore>,
}

impl SessionShared {
    pub(crate) fn local_peer_id(&self) -> &str {
        &self.local_peer_id
    }

    pub(crate) const fn channel_id(&self) -> &ChannelId {
        &self.params.channel_id
    }

    pub(crate) fn relay(&self) -> &dyn Relay {
        self.relay.as_ref()
    }

    pub(crate) const fn tie_break(&self) -> TieBreak {
        self.config.tie_break
    }

    pub(crate) async fn lock_core(&self) -> MutexGuard<'_, SessionCore> {
        self.core.lock().await
    }

    fn notify(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}

/// Voice session for one local user in one channel.
pub struct SessionController {
    shared: Arc<SessionShared>,
}

impl SessionController {
    /// Create an idle session. The returned receiver yields its events.
    pub fn new(
        params: SessionParams,
        config: VoiceConfig,
        relay: Arc<dyn Relay>,
        engine: Arc<dyn MediaEngine>,
        device: Arc<dyn CaptureDevice>,
        sink: Arc<dyn AudioSink>,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let local_peer_id = generate_peer_id();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();

        let registry = PeerRegistry::new(
            local_peer_id.clone(),
            engine,
            sink,
            peer_tx,
            events_tx.clone(),
        );

        let shared = Arc::new(SessionShared {
            local_peer_id,
            params,
            config,
            relay,
            events: events_tx,
            peer_events: Mutex::new(peer_rx),
            lifecycle: Mutex::new(()),
            core: Mutex::new(SessionCore {
                connected: false,
                registry,
                pending_signals: VecDeque::new(),
                capture: LocalCapture::new(device),
                tasks: None,
            }),
        });

        debug!(peer_id = %shared.local_peer_id, "Voice session created");
        (Self { shared }, events_rx)
    }

    pub fn local_peer_id(&self) -> &str {
        &self.shared.local_peer_id
    }

    pub fn channel_id(&self) -> &ChannelId {
        &self.shared.params.channel_id
    }

    pub async fn is_connected(&self) -> bool {
        self.shared.core.lock().await.connected
    }

    /// Join the channel.
    ///
    /// Acquires the microphone, registers with the relay and starts
    /// discovery. A session that is already connected is fully disconnected
    /// first. On failure nothing is left running and the error is also
    /// reported as [`SessionEvent::Error`].
    pub async fn connect(&self) -> Result<(), SessionError> {
        let _lifecycle = self.shared.lifecycle.lock().await;
        let shared = &self.shared;

        if shared.core.lock().await.connected {
            info!(peer_id = %shared.local_peer_id, "Already connected, reconnecting");
            self.teardown().await;
        }

        {
            let mut core = shared.core.lock().await;
            match core.capture.acquire(&shared.params.constraints).await {
                Ok(audio) => core.registry.set_local_audio(Some(audio)),
                Err(e) => {
                    error!(channel_id = %shared.params.channel_id, "Microphone unavailable: {}", e);
                    shared.notify(SessionEvent::Error {
                        description: e.to_string(),
                    });
                    return Err(SessionError::Device(e));
                }
            }
        }

        let joined = shared
            .relay
            .join(
                &shared.params.channel_id,
                &shared.params.user_id,
                &shared.local_peer_id,
                shared.params.display_name.as_deref(),
            )
            .await;

        let mut core = shared.core.lock().await;
        if let Err(source) = joined {
            core.registry.set_local_audio(None);
            core.capture.release();
            drop(core);

            let e = JoinError {
                channel_id: shared.params.channel_id.to_string(),
                source,
            };
            error!("{}", e);
            shared.notify(SessionEvent::Error {
                description: e.to_string(),
            });
            return Err(SessionError::Join(e));
        }

        core.connected = true;
        core.tasks = Some(self.start_tasks());

        info!(
            channel_id = %shared.params.channel_id,
            user_id = %shared.params.user_id,
            peer_id = %shared.local_peer_id,
            "Voice session connected"
        );
        Ok(())
    }

    /// Leave the channel.
    ///
    /// Always ends with no peers, no background tasks and the microphone
    /// released. The relay is told last and its answer is ignored.
    pub async fn disconnect(&self) {
        let _lifecycle = self.shared.lifecycle.lock().await;
        self.teardown().await;
    }

    async fn teardown(&self) {
        let shared = &self.shared;

        let (was_connected, tasks) = {
            let mut core = shared.core.lock().await;
            let was_connected = std::mem::replace(&mut core.connected, false);
            (was_connected, core.tasks.take())
        };

        // Tasks take the core lock themselves, so it is released while they stop
        if let Some(tasks) = tasks {
            tasks.stop().await;
        }

        {
            let mut core = shared.core.lock().await;
            core.registry.clear().await;
            core.pending_signals.clear();
            core.registry.set_local_audio(None);
            core.capture.release();
        }

        if was_connected {
            if let Err(e) = shared.relay.leave(&shared.local_peer_id).await {
                warn!(peer_id = %shared.local_peer_id, "Failed to leave voice channel: {}", e);
            }
            info!(peer_id = %shared.local_peer_id, "Voice session disconnected");
        }
    }

    fn start_tasks(&self) -> SessionTasks {
        let discovery = DiscoveryLoop::spawn(self.shared.clone(), self.shared.config.poll_interval);
        let (pump_shutdown, shutdown_rx) = watch::channel(false);
        let pump = tokio::spawn(pump_peer_events(self.shared.clone(), shutdown_rx));

        SessionTasks {
            discovery,
            pump_shutdown,
            pump,
        }
    }

    /// Mute or unmute. Peer connections are untouched.
    pub async fn set_microphone_enabled(&self, enabled: bool) {
        self.shared.core.lock().await.capture.set_enabled(enabled);
    }

    /// False when no microphone is held.
    pub async fn is_microphone_enabled(&self) -> bool {
        self.shared.core.lock().await.capture.is_enabled()
    }

    /// Remote peers currently in the registry, sorted.
    pub async fn list_connected_peer_ids(&self) -> Vec<String> {
        self.shared.core.lock().await.registry.peer_ids()
    }

    pub async fn peer_state(&self, peer_id: &str) -> Option<PeerState> {
        self.shared.core.lock().await.registry.state(peer_id)
    }

    /// Deliver a handshake payload received out of band.
    ///
    /// Payloads for unknown peers, or arriving while disconnected, are
    /// dropped.
    pub async fn route_signal(&self, envelope: SignalEnvelope) {
        let core = self.shared.core.lock().await;
        if !core.connected {
            debug!(from_peer = %envelope.from_peer, "Not connected, dropping signal");
            return;
        }
        core.registry.route_signal(envelope);
    }

    /// Voice channels known to the relay.
    pub async fn list_channels(&self) -> Result<Vec<ChannelSummary>, RelayError> {
        self.shared.relay.list_channels().await
    }

    /// Run one discovery tick now.
    #[cfg(test)]
    pub(crate) async fn poll_once(&self) {
        let (_tx, mut rx) = watch::channel(false);
        crate::discovery::tick(&self.shared, &mut rx).await;
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        if let Ok(mut core) = self.shared.core.try_lock() {
            if let Some(tasks) = core.tasks.take() {
                tasks.abort();
            }
        }
    }
}

/// Act on connection events until shut down.
async fn pump_peer_events(shared: Arc<SessionShared>, mut shutdown: watch::Receiver<bool>) {
    let mut events = shared.peer_events.lock().await;

    loop {
        let event = tokio::select! {
            _ = shutdown.changed() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        tokio::select! {
            _ = shutdown.changed() => break,
            () = handle_peer_event(&shared, event) => {}
        }
    }
}

async fn handle_peer_event(shared: &SessionShared, event: PeerEvent) {
    let PeerEvent {
        peer_id,
        generation,
        kind,
    } = event;

    match kind {
        PeerEventKind::Signal(payload) => {
            {
                let core = shared.core.lock().await;
                if !core.connected || !core.registry.is_current(&peer_id, generation) {
                    debug!(peer_id = %peer_id, generation, "Dropping signal of stale connection");
                    return;
                }
            }

            let envelope = SignalEnvelope::new(shared.local_peer_id.clone(), peer_id.clone(), payload);
            if let Err(source) = shared.relay.send_signal(&envelope).await {
                let e = SignalDeliveryError {
                    to_peer: peer_id,
                    source,
                };
                warn!("{}", e);
            }
        }
        PeerEventKind::Connected => {
            debug!(peer_id = %peer_id, generation, "Peer media flowing");
            let mut core = shared.core.lock().await;
            if core.connected {
                core.registry.mark_connected(&peer_id, generation);
            }
        }
        PeerEventKind::RemoteAudio(track) => {
            let core = shared.core.lock().await;
            if core.connected {
                core.registry.attach_audio(&peer_id, generation, track);
            }
        }
        PeerEventKind::Failed(error) => {
            let mut core = shared.core.lock().await;
            if core.connected {
                core.registry.remove_failed(&peer_id, generation, &error).await;
            }
        }
    }
}
