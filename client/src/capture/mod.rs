//! Local Media Capture
//!
//! Owns the local microphone capture and the single outbound Opus track every
//! peer connection sends. Muting gates what reaches the track; it never stops
//! the device or touches the peer connections.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

#[cfg(feature = "native-audio")]
mod native;
mod silence;
mod sink;

#[cfg(feature = "native-audio")]
pub use native::{NativeCaptureDevice, NativePlaybackSink};
pub use silence::SilenceDevice;
pub use sink::{AudioSink, DrainSink};

/// Audio configuration constants
pub const SAMPLE_RATE: u32 = 48000;
pub const CHANNELS: u16 = 2;
pub const FRAME_SIZE_MS: usize = 20;
pub const FRAME_SIZE: usize = (SAMPLE_RATE as usize * FRAME_SIZE_MS) / 1000; // 960 samples per channel
pub const FRAME_DURATION: Duration = Duration::from_millis(FRAME_SIZE_MS as u64);

/// Encoded frames buffered between the device and the track.
const FRAME_QUEUE_LEN: usize = 50;

/// Opus codec shared by the local track and the media engine.
pub fn opus_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: "audio/opus".to_string(),
        clock_rate: SAMPLE_RATE,
        channels: CHANNELS,
        sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
        rtcp_feedback: vec![],
    }
}

/// Capture device errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("Microphone access denied")]
    PermissionDenied,
    #[error("No input device available: {0}")]
    Unavailable(String),
    #[error("Device not found: {0}")]
    DeviceNotFound(String),
    #[error("Failed to start capture stream: {0}")]
    Stream(String),
    #[error("Opus encoder error: {0}")]
    Encoder(String),
}

/// Processing requested from the capture device.
///
/// The processing flags are requests. A device applies the ones it supports
/// and ignores the rest; neither [`SilenceDevice`] nor the native device
/// applies any of them. `device` is honored by devices that can pick an input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
    /// Input device name; `None` selects the platform default.
    pub device: Option<String>,
}

impl Default for AudioConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
            device: None,
        }
    }
}

/// A source of encoded Opus frames.
#[async_trait]
pub trait CaptureDevice: Send + Sync {
    /// Start capturing. Frames go to `frames` at a 20 ms cadence; devices may
    /// skip encoding while `enabled` is false. Unsupported processing flags in
    /// `constraints` are ignored, never an error.
    async fn open(
        &self,
        constraints: &AudioConstraints,
        enabled: Arc<AtomicBool>,
        frames: mpsc::Sender<Vec<u8>>,
    ) -> Result<Box<dyn CaptureStream>, DeviceError>;
}

/// A running capture. Dropping the frame sender ends the stream as well.
pub trait CaptureStream: Send {
    fn stop(self: Box<Self>);
}

/// The outbound audio track handed to every peer connection.
#[derive(Clone)]
pub struct LocalAudio {
    track: Arc<TrackLocalStaticSample>,
    frames_written: Arc<AtomicU64>,
}

impl LocalAudio {
    pub(crate) fn new() -> Self {
        Self {
            track: Arc::new(TrackLocalStaticSample::new(
                opus_capability(),
                "audio".to_string(),
                "voice-stream".to_string(),
            )),
            frames_written: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Shared local track.
    pub fn track(&self) -> Arc<TrackLocalStaticSample> {
        self.track.clone()
    }

    /// Frames written to the track since acquisition.
    pub fn frames_written(&self) -> u64 {
        self.frames_written.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for LocalAudio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalAudio")
            .field("frames_written", &self.frames_written())
            .finish_non_exhaustive()
    }
}

struct ActiveCapture {
    audio: LocalAudio,
    enabled: Arc<AtomicBool>,
    stream: Box<dyn CaptureStream>,
    pump: JoinHandle<()>,
}

/// Exclusive owner of one capture session.
pub struct LocalCapture {
    device: Arc<dyn CaptureDevice>,
    active: Option<ActiveCapture>,
}

impl LocalCapture {
    pub fn new(device: Arc<dyn CaptureDevice>) -> Self {
        Self {
            device,
            active: None,
        }
    }

    /// Open the device and start feeding the local track.
    ///
    /// Any capture already held is released first. The new capture starts
    /// enabled.
    pub async fn acquire(&mut self, constraints: &AudioConstraints) -> Result<LocalAudio, DeviceError> {
        self.release();

        let enabled = Arc::new(AtomicBool::new(true));
        let (frames_tx, frames_rx) = mpsc::channel(FRAME_QUEUE_LEN);

        let stream = self
            .device
            .open(constraints, enabled.clone(), frames_tx)
            .await?;

        let audio = LocalAudio::new();
        let pump = tokio::spawn(pump_frames(frames_rx, audio.clone(), enabled.clone()));

        info!(
            echo_cancellation = constraints.echo_cancellation,
            noise_suppression = constraints.noise_suppression,
            auto_gain_control = constraints.auto_gain_control,
            "Local audio capture acquired with requested processing"
        );

        self.active = Some(ActiveCapture {
            audio: audio.clone(),
            enabled,
            stream,
            pump,
        });
        Ok(audio)
    }

    /// Track of the current capture, if any.
    pub fn local_audio(&self) -> Option<LocalAudio> {
        self.active.as_ref().map(|a| a.audio.clone())
    }

    pub const fn is_acquired(&self) -> bool {
        self.active.is_some()
    }

    /// Gate the microphone. No-op when nothing is acquired.
    pub fn set_enabled(&self, enabled: bool) {
        if let Some(active) = &self.active {
            active.enabled.store(enabled, Ordering::Relaxed);
            debug!(enabled, "Microphone toggled");
        }
    }

    /// Whether the microphone is live. False when nothing is acquired.
    pub fn is_enabled(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|a| a.enabled.load(Ordering::Relaxed))
    }

    /// Stop the device and the track pump. Safe to call repeatedly.
    pub fn release(&mut self) {
        if let Some(active) = self.active.take() {
            active.stream.stop();
            active.pump.abort();
            info!("Local audio capture released");
        }
    }
}

impl Drop for LocalCapture {
    fn drop(&mut self) {
        self.release();
    }
}

/// Move encoded frames from the device onto the local track while enabled.
async fn pump_frames(
    mut frames: mpsc::Receiver<Vec<u8>>,
    audio: LocalAudio,
    enabled: Arc<AtomicBool>,
) {
    while let Some(frame) = frames.recv().await {
        if !enabled.load(Ordering::Relaxed) {
            continue;
        }

        let sample = Sample {
            data: frame.into(),
            duration: FRAME_DURATION,
            ..Default::default()
        };
        if let Err(e) = audio.track.write_sample(&sample).await {
            warn!("Failed to write local audio sample: {}", e);
            continue;
        }
        audio.frames_written.fetch_add(1, Ordering::Relaxed);
    }
    debug!("Capture pump finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeDevice;

    async fn wait_for_frames(audio: &LocalAudio, at_least: u64) {
        for _ in 0..100 {
            if audio.frames_written() >= at_least {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("no frames written");
    }

    #[tokio::test]
    async fn test_never_acquired_is_disabled() {
        let capture = LocalCapture::new(Arc::new(FakeDevice::new()));
        assert!(!capture.is_acquired());
        assert!(!capture.is_enabled());
        capture.set_enabled(true);
        assert!(!capture.is_enabled());
    }

    #[tokio::test]
    async fn test_acquire_starts_enabled() {
        let mut capture = LocalCapture::new(Arc::new(FakeDevice::new()));
        capture.acquire(&AudioConstraints::default()).await.unwrap();
        assert!(capture.is_acquired());
        assert!(capture.is_enabled());

        capture.set_enabled(false);
        assert!(!capture.is_enabled());
        capture.set_enabled(true);
        assert!(capture.is_enabled());
    }

    #[tokio::test]
    async fn test_frames_reach_track_only_while_enabled() {
        let device = Arc::new(FakeDevice::new());
        let mut capture = LocalCapture::new(device.clone());
        let audio = capture.acquire(&AudioConstraints::default()).await.unwrap();

        device.emit(vec![0xf8, 0xff, 0xfe]).await;
        wait_for_frames(&audio, 1).await;

        capture.set_enabled(false);
        device.emit(vec![0xf8, 0xff, 0xfe]).await;
        device.emit(vec![0xf8, 0xff, 0xfe]).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(audio.frames_written(), 1);

        capture.set_enabled(true);
        device.emit(vec![0xf8, 0xff, 0xfe]).await;
        wait_for_frames(&audio, 2).await;
    }

    #[tokio::test]
    async fn test_acquire_failure_leaves_nothing_held() {
        let mut capture = LocalCapture::new(Arc::new(FakeDevice::failing(DeviceError::PermissionDenied)));
        let result = capture.acquire(&AudioConstraints::default()).await;
        assert_eq!(result.unwrap_err(), DeviceError::PermissionDenied);
        assert!(!capture.is_acquired());
    }

    #[tokio::test]
    async fn test_reacquire_releases_previous_stream() {
        let device = Arc::new(FakeDevice::new());
        let mut capture = LocalCapture::new(device.clone());

        capture.acquire(&AudioConstraints::default()).await.unwrap();
        capture.acquire(&AudioConstraints::default()).await.unwrap();
        assert_eq!(device.opened(), 2);
        assert_eq!(device.stopped(), 1);

        capture.release();
        capture.release();
        assert_eq!(device.stopped(), 2);
        assert!(!capture.is_acquired());
    }

    #[test]
    fn test_default_constraints_enable_processing() {
        let constraints = AudioConstraints::default();
        assert!(constraints.echo_cancellation);
        assert!(constraints.noise_suppression);
        assert!(constraints.auto_gain_control);
        assert!(constraints.device.is_none());
    }
}
