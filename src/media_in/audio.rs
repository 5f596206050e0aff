//! Microphone capture using PulseAudio
//!
//! A dedicated thread owns the blocking record stream and forwards
//! fixed-size frames of `f32` samples until the capture stream is released.
//! Reads are short so the thread notices shutdown within a few tens of
//! milliseconds, and release joins it.

use crate::audio::{AudioError, CaptureStream, Microphone};
use crate::codec::INPUT_SAMPLE_RATE;
use libpulse_binding as pulse;
use libpulse_simple_binding as psimple;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

const CHANNELS: u8 = 1;
/// Samples per frame handed to the session
pub const FRAME_SAMPLES: usize = 4096;
/// Samples per blocking read, 32 ms at 16 kHz
const READ_SAMPLES: usize = 512;
const FRAME_QUEUE: usize = 8;

/// Default PulseAudio source, or a named one.
#[derive(Debug, Clone, Default)]
pub struct PulseMicrophone {
    device: Option<String>,
}

impl PulseMicrophone {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record from a specific source, e.g. one listed by `list_devices`.
    pub fn with_device(name: impl Into<String>) -> Self {
        Self {
            device: Some(name.into()),
        }
    }
}

impl Microphone for PulseMicrophone {
    fn acquire(&mut self) -> impl Future<Output = Result<CaptureStream, AudioError>> + Send {
        let device = self.device.clone();
        async move {
            let (frame_tx, frame_rx) = mpsc::channel(FRAME_QUEUE);
            let (ready_tx, ready_rx) = oneshot::channel();
            let shutdown = Arc::new(AtomicBool::new(false));

            let thread_shutdown = shutdown.clone();
            let thread = std::thread::Builder::new()
                .name("robeen-mic".into())
                .spawn(move || capture_thread(device, frame_tx, ready_tx, thread_shutdown))
                .map_err(|e| AudioError::Device(format!("failed to spawn capture thread: {e}")))?;

            match ready_rx.await {
                Ok(Ok(())) => Ok(CaptureStream::new(frame_rx, shutdown, INPUT_SAMPLE_RATE).with_thread(thread)),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(AudioError::Device("capture thread exited".into())),
            }
        }
    }
}

fn open_record_stream(device: Option<&str>) -> Result<psimple::Simple, AudioError> {
    let spec = pulse::sample::Spec {
        format: pulse::sample::Format::F32le,
        channels: CHANNELS,
        rate: INPUT_SAMPLE_RATE,
    };
    if !spec.is_valid() {
        return Err(AudioError::Device("invalid capture sample spec".into()));
    }

    psimple::Simple::new(
        None,             // Use default server
        "robeen",         // Application name
        pulse::stream::Direction::Record,
        device,           // None means the default source
        "microphone",     // Stream description
        &spec,
        None,             // Use default channel map
        None,             // Use default buffering attributes
    )
    .map_err(|e| classify(format!("{e}")))
}

/// PulseAudio reports a refused client as "Access denied".
fn classify(message: String) -> AudioError {
    if message.to_lowercase().contains("access") {
        AudioError::PermissionDenied(message)
    } else {
        AudioError::Device(message)
    }
}

fn append_samples(frame: &mut Vec<f32>, bytes: &[u8]) {
    frame.extend(
        bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]])),
    );
}

fn capture_thread(
    device: Option<String>,
    frames: mpsc::Sender<Vec<f32>>,
    ready: oneshot::Sender<Result<(), AudioError>>,
    shutdown: Arc<AtomicBool>,
) {
    let capture = match open_record_stream(device.as_deref()) {
        Ok(capture) => capture,
        Err(e) => {
            error!("Failed to open microphone: {}", e);
            let _ = ready.send(Err(e));
            return;
        }
    };
    info!("Microphone capture connected at {}Hz", INPUT_SAMPLE_RATE);
    if ready.send(Ok(())).is_err() {
        return;
    }

    let mut bytes = vec![0u8; READ_SAMPLES * 4];
    let mut frame = Vec::with_capacity(FRAME_SAMPLES);
    while !shutdown.load(Ordering::SeqCst) {
        if let Err(e) = capture.read(&mut bytes) {
            warn!("Failed to read audio: {}", e);
            break;
        }
        append_samples(&mut frame, &bytes);
        if frame.len() < FRAME_SAMPLES {
            continue;
        }

        let full = std::mem::replace(&mut frame, Vec::with_capacity(FRAME_SAMPLES));
        if frames.blocking_send(full).is_err() {
            debug!("Capture stream dropped, exiting");
            break;
        }
    }
    drop(capture);
    info!("Microphone capture stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_errors_map_to_permission() {
        assert_eq!(
            classify("Access denied".into()),
            AudioError::PermissionDenied("Access denied".into())
        );
        assert_eq!(
            classify("Connection refused".into()),
            AudioError::Device("Connection refused".into())
        );
    }

    #[test]
    fn test_short_reads_fill_whole_frames() {
        let mut bytes = Vec::new();
        for i in 0..READ_SAMPLES {
            bytes.extend_from_slice(&(i as f32).to_le_bytes());
        }

        let mut frame = Vec::new();
        for _ in 0..FRAME_SAMPLES / READ_SAMPLES {
            append_samples(&mut frame, &bytes);
        }
        assert_eq!(frame.len(), FRAME_SAMPLES);
        assert_eq!(frame[READ_SAMPLES - 1], (READ_SAMPLES - 1) as f32);
        assert_eq!(frame[READ_SAMPLES], 0.0);
    }
}
