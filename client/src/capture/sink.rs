//! Remote Audio Sinks

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::JoinHandle;
use tracing::{debug, info};
use webrtc::track::track_remote::TrackRemote;

/// Receives the inbound audio stream of each connected peer.
pub trait AudioSink: Send + Sync {
    /// A peer's remote track became available.
    fn attach(&self, peer_id: &str, track: Arc<TrackRemote>);

    /// The peer is gone; stop consuming its track.
    fn detach(&self, peer_id: &str);
}

/// Reads and discards inbound RTP so remote streams keep flowing.
#[derive(Default)]
pub struct DrainSink {
    readers: Mutex<HashMap<String, JoinHandle<()>>>,
    packets: Arc<AtomicU64>,
}

impl DrainSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Packets read across all peers.
    pub fn packets(&self) -> u64 {
        self.packets.load(Ordering::Relaxed)
    }

    /// Peers currently being drained.
    pub fn attached(&self) -> usize {
        self.readers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl AudioSink for DrainSink {
    fn attach(&self, peer_id: &str, track: Arc<TrackRemote>) {
        info!(
            peer_id = %peer_id,
            codec = %track.codec().capability.mime_type,
            "Draining remote audio"
        );

        let packets = self.packets.clone();
        let peer = peer_id.to_string();
        let reader = tokio::spawn(async move {
            while track.read_rtp().await.is_ok() {
                packets.fetch_add(1, Ordering::Relaxed);
            }
            debug!(peer_id = %peer, "Remote audio ended");
        });

        let previous = self
            .readers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(peer_id.to_string(), reader);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    fn detach(&self, peer_id: &str) {
        let reader = self
            .readers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(peer_id);
        if let Some(reader) = reader {
            reader.abort();
        }
    }
}

impl Drop for DrainSink {
    fn drop(&mut self) {
        let readers = self.readers.get_mut().unwrap_or_else(PoisonError::into_inner);
        for (_, reader) in readers.drain() {
            reader.abort();
        }
    }
}
