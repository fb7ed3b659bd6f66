//! Native Audio I/O
//!
//! Microphone capture and speaker playback through cpal, encoded with Opus.
//! `cpal::Stream` is not `Send`, so each stream lives on a blocking task that
//! owns it until told to stop.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, Device, StreamConfig};
use opus::{Channels as OpusChannels, Decoder, Encoder};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use webrtc::track::track_remote::TrackRemote;

use super::{
    AudioConstraints, AudioSink, CaptureDevice, CaptureStream, DeviceError, CHANNELS, FRAME_SIZE,
    SAMPLE_RATE,
};

/// Control messages for the capture and playback tasks
enum StreamControl {
    Stop,
}

fn stream_config() -> StreamConfig {
    StreamConfig {
        channels: CHANNELS,
        sample_rate: SAMPLE_RATE,
        buffer_size: BufferSize::Default,
    }
}

/// Find a device by name, or the platform default.
fn find_device(name: Option<&str>, is_input: bool) -> Result<Device, DeviceError> {
    let host = cpal::default_host();

    match name {
        Some(name) => {
            let mut devices = if is_input {
                host.input_devices()
            } else {
                host.output_devices()
            }
            .map_err(|e| DeviceError::Unavailable(e.to_string()))?;

            devices
                .find(|d| d.description().is_ok_and(|desc| desc.name() == name))
                .ok_or_else(|| DeviceError::DeviceNotFound(name.to_string()))
        }
        None => {
            let device = if is_input {
                host.default_input_device()
            } else {
                host.default_output_device()
            };
            device.ok_or_else(|| {
                DeviceError::Unavailable(if is_input { "no input device" } else { "no output device" }.to_string())
            })
        }
    }
}

/// Microphone capture through the platform audio host.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeCaptureDevice;

struct NativeCaptureStream {
    control: mpsc::Sender<StreamControl>,
}

impl CaptureStream for NativeCaptureStream {
    fn stop(self: Box<Self>) {
        let _ = self.control.try_send(StreamControl::Stop);
        debug!("Native capture stop requested");
    }
}

#[async_trait]
impl CaptureDevice for NativeCaptureDevice {
    async fn open(
        &self,
        constraints: &AudioConstraints,
        enabled: Arc<AtomicBool>,
        frames: mpsc::Sender<Vec<u8>>,
    ) -> Result<Box<dyn CaptureStream>, DeviceError> {
        let device = find_device(constraints.device.as_deref(), true)?;

        let (control_tx, mut control_rx) = mpsc::channel::<StreamControl>(1);
        let (ready_tx, ready_rx) = oneshot::channel();

        tokio::task::spawn_blocking(move || {
            run_capture_task(device, enabled, frames, ready_tx, &mut control_rx);
        });

        ready_rx
            .await
            .map_err(|_| DeviceError::Stream("capture task exited".to_string()))??;

        info!("Audio capture started");
        Ok(Box::new(NativeCaptureStream {
            control: control_tx,
        }))
    }
}

/// Run capture task (owns the Stream)
fn run_capture_task(
    device: Device,
    enabled: Arc<AtomicBool>,
    output_tx: mpsc::Sender<Vec<u8>>,
    ready: oneshot::Sender<Result<(), DeviceError>>,
    control_rx: &mut mpsc::Receiver<StreamControl>,
) {
    let mut encoder = match Encoder::new(SAMPLE_RATE, OpusChannels::Stereo, opus::Application::Voip) {
        Ok(enc) => enc,
        Err(e) => {
            let _ = ready.send(Err(DeviceError::Encoder(e.to_string())));
            return;
        }
    };

    let frame_samples = FRAME_SIZE * CHANNELS as usize;
    let mut buffer: Vec<f32> = Vec::with_capacity(frame_samples * 2);

    let stream = match device.build_input_stream(
        &stream_config(),
        move |data: &[f32], _| {
            if !enabled.load(Ordering::Relaxed) {
                buffer.clear();
                return;
            }

            buffer.extend_from_slice(data);

            while buffer.len() >= frame_samples {
                let samples_i16: Vec<i16> = buffer
                    .drain(..frame_samples)
                    .map(|s| (s * 32767.0).clamp(-32768.0, 32767.0) as i16)
                    .collect();

                let mut encoded = vec![0u8; 4000];
                match encoder.encode(&samples_i16, &mut encoded) {
                    Ok(len) => {
                        encoded.truncate(len);
                        if let Err(e) = output_tx.try_send(encoded) {
                            warn!("Failed to queue encoded audio: {}", e);
                        }
                    }
                    Err(e) => error!("Opus encode error: {}", e),
                }
            }
        },
        |err| {
            error!("Audio capture stream error: {}", err);
        },
        None,
    ) {
        Ok(s) => s,
        Err(e) => {
            let _ = ready.send(Err(DeviceError::Stream(e.to_string())));
            return;
        }
    };

    if let Err(e) = stream.play() {
        let _ = ready.send(Err(DeviceError::Stream(e.to_string())));
        return;
    }
    let _ = ready.send(Ok(()));

    // Block until stop signal or the handle is dropped
    while let Some(msg) = control_rx.blocking_recv() {
        match msg {
            StreamControl::Stop => break,
        }
    }

    drop(stream);
    info!("Capture task stopped");
}

struct PlaybackHandle {
    reader: JoinHandle<()>,
    control: mpsc::Sender<StreamControl>,
}

/// Decodes each peer's inbound Opus stream to the default output device.
#[derive(Default)]
pub struct NativePlaybackSink {
    output_device: Option<String>,
    peers: Mutex<HashMap<String, PlaybackHandle>>,
}

impl NativePlaybackSink {
    pub fn new(output_device: Option<String>) -> Self {
        Self {
            output_device,
            peers: Mutex::new(HashMap::new()),
        }
    }
}

impl AudioSink for NativePlaybackSink {
    fn attach(&self, peer_id: &str, track: Arc<TrackRemote>) {
        let device = match find_device(self.output_device.as_deref(), false) {
            Ok(device) => device,
            Err(e) => {
                warn!(peer_id = %peer_id, "No playback for remote audio: {}", e);
                return;
            }
        };

        let (packet_tx, packet_rx) = mpsc::channel::<Vec<u8>>(100);
        let (control_tx, mut control_rx) = mpsc::channel::<StreamControl>(1);

        tokio::task::spawn_blocking(move || {
            run_playback_task(device, packet_rx, &mut control_rx);
        });

        let reader = tokio::spawn(async move {
            while let Ok((packet, _)) = track.read_rtp().await {
                if packet_tx.send(packet.payload.to_vec()).await.is_err() {
                    break;
                }
            }
        });

        info!(peer_id = %peer_id, "Audio playback started");
        let previous = self
            .peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                peer_id.to_string(),
                PlaybackHandle {
                    reader,
                    control: control_tx,
                },
            );
        if let Some(previous) = previous {
            stop_playback(previous);
        }
    }

    fn detach(&self, peer_id: &str) {
        let handle = self
            .peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(peer_id);
        if let Some(handle) = handle {
            stop_playback(handle);
            debug!(peer_id = %peer_id, "Audio playback stopped");
        }
    }
}

fn stop_playback(handle: PlaybackHandle) {
    handle.reader.abort();
    let _ = handle.control.try_send(StreamControl::Stop);
}

/// Run playback task (owns the Stream)
fn run_playback_task(
    device: Device,
    mut input_rx: mpsc::Receiver<Vec<u8>>,
    control_rx: &mut mpsc::Receiver<StreamControl>,
) {
    let mut decoder = match Decoder::new(SAMPLE_RATE, OpusChannels::Stereo) {
        Ok(dec) => dec,
        Err(e) => {
            error!("Failed to create decoder: {}", e);
            return;
        }
    };

    let playback_buffer = Arc::new(Mutex::new(VecDeque::<f32>::new()));

    // Decode on a plain thread; it ends when the packet sender is dropped
    let decode_buffer = playback_buffer.clone();
    std::thread::spawn(move || {
        let mut decoded = vec![0i16; FRAME_SIZE * CHANNELS as usize * 2];
        while let Some(encoded) = input_rx.blocking_recv() {
            match decoder.decode(&encoded, &mut decoded, false) {
                Ok(len) => {
                    let total = len * CHANNELS as usize;
                    if let Ok(mut buffer) = decode_buffer.lock() {
                        buffer.extend(decoded[..total].iter().map(|&s| f32::from(s) / 32768.0));
                    }
                }
                Err(e) => error!("Opus decode error: {}", e),
            }
        }
    });

    let stream = match device.build_output_stream(
        &stream_config(),
        move |data: &mut [f32], _| {
            if let Ok(mut buffer) = playback_buffer.lock() {
                for sample in data.iter_mut() {
                    *sample = buffer.pop_front().unwrap_or(0.0);
                }
            } else {
                data.fill(0.0);
            }
        },
        |err| {
            error!("Audio playback stream error: {}", err);
        },
        None,
    ) {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to build playback stream: {}", e);
            return;
        }
    };

    if let Err(e) = stream.play() {
        error!("Failed to start playback stream: {}", e);
        return;
    }

    // Block until stop signal
    while let Some(msg) = control_rx.blocking_recv() {
        match msg {
            StreamControl::Stop => break,
        }
    }

    drop(stream);
    info!("Playback task stopped");
}
