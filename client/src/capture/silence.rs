//! Silence Capture Device
//!
//! Emits Opus comfort-silence frames at the normal frame cadence. Used when
//! no audio hardware is available, e.g. headless clients.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use super::{AudioConstraints, CaptureDevice, CaptureStream, DeviceError, FRAME_DURATION};

/// Encoded 20 ms Opus silence frame.
pub const OPUS_SILENCE_FRAME: [u8; 3] = [0xf8, 0xff, 0xfe];

/// Device that produces silence.
#[derive(Debug, Clone, Copy, Default)]
pub struct SilenceDevice;

struct SilenceStream {
    task: JoinHandle<()>,
}

impl CaptureStream for SilenceStream {
    fn stop(self: Box<Self>) {
        self.task.abort();
        debug!("Silence capture stopped");
    }
}

#[async_trait]
impl CaptureDevice for SilenceDevice {
    async fn open(
        &self,
        _constraints: &AudioConstraints,
        enabled: Arc<AtomicBool>,
        frames: mpsc::Sender<Vec<u8>>,
    ) -> Result<Box<dyn CaptureStream>, DeviceError> {
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(FRAME_DURATION);
            loop {
                interval.tick().await;
                if !enabled.load(Ordering::Relaxed) {
                    continue;
                }
                if frames.send(OPUS_SILENCE_FRAME.to_vec()).await.is_err() {
                    break;
                }
            }
        });

        debug!("Silence capture started");
        Ok(Box::new(SilenceStream { task }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_emits_silence_frames() {
        let (tx, mut rx) = mpsc::channel(8);
        let enabled = Arc::new(AtomicBool::new(true));
        let stream = SilenceDevice
            .open(&AudioConstraints::default(), enabled, tx)
            .await
            .unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame, OPUS_SILENCE_FRAME.to_vec());

        stream.stop();
    }

    #[tokio::test]
    async fn test_stop_closes_frame_channel() {
        let (tx, mut rx) = mpsc::channel(8);
        let enabled = Arc::new(AtomicBool::new(false));
        let stream = SilenceDevice
            .open(&AudioConstraints::default(), enabled, tx)
            .await
            .unwrap();

        stream.stop();
        let next = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap();
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn test_processing_flags_do_not_change_output() {
        let constraints = AudioConstraints {
            echo_cancellation: false,
            noise_suppression: false,
            auto_gain_control: false,
            device: Some("any".to_string()),
        };
        let (tx, mut rx) = mpsc::channel(8);
        let stream = SilenceDevice
            .open(&constraints, Arc::new(AtomicBool::new(true)), tx)
            .await
            .unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame, OPUS_SILENCE_FRAME.to_vec());

        stream.stop();
    }
}
