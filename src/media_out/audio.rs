//! Scheduled playback using PulseAudio
//!
//! A mixer thread owns a blocking playback stream and writes fixed 20 ms
//! periods. The output clock is the first frame not yet mixed, so buffers
//! queued with `play_at` land on exact sample offsets and back-to-back
//! buffers play without a gap. The clock runs ahead of what is audible by
//! the few periods queued in the server.

use crate::audio::{AudioError, AudioOutput, OutputDevice, PlaybackHandle};
use crate::codec::AudioBuffer;
use libpulse_binding as pulse;
use libpulse_simple_binding as psimple;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use tracing::{debug, error, info};

const CHANNELS: u8 = 1;
const PERIOD_MS: u32 = 20;
/// Periods kept queued in the server
const TARGET_PERIODS: u32 = 4;

#[derive(Debug, Default)]
struct HandleState {
    stopped: AtomicBool,
    finished: AtomicBool,
}

struct Scheduled {
    start_frame: u64,
    samples: Vec<f32>,
    state: Arc<HandleState>,
}

impl Scheduled {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

struct Shared {
    sample_rate: u32,
    /// First frame the mixer has not produced yet. Only moves while
    /// `pending` is locked.
    next_frame: AtomicU64,
    running: AtomicBool,
    /// Play out the server buffer on shutdown instead of discarding it.
    drain: AtomicBool,
    pending: Mutex<Vec<Scheduled>>,
}

impl Shared {
    fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            next_frame: AtomicU64::new(0),
            running: AtomicBool::new(true),
            drain: AtomicBool::new(false),
            pending: Mutex::new(Vec::new()),
        }
    }

    fn pending(&self) -> MutexGuard<'_, Vec<Scheduled>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn now_frame(&self) -> u64 {
        self.next_frame.load(Ordering::SeqCst)
    }

    /// Queue samples at `requested`, or at the next unmixed frame if that
    /// one has already been mixed.
    fn schedule(&self, requested: u64, samples: Vec<f32>) -> Arc<HandleState> {
        let state = Arc::new(HandleState::default());
        let mut pending = self.pending();
        let start_frame = requested.max(self.now_frame());
        pending.push(Scheduled {
            start_frame,
            samples,
            state: state.clone(),
        });
        state
    }

    /// Mix the next period into `out` and advance the clock past it.
    fn mix_next(&self, out: &mut [f32]) {
        let mut pending = self.pending();
        let base = self.now_frame();
        mix_period(&mut pending, base, out);
        self.next_frame.store(base + out.len() as u64, Ordering::SeqCst);
    }

    fn finish_all(&self) {
        for scheduled in self.pending().drain(..) {
            scheduled.state.finished.store(true, Ordering::SeqCst);
        }
    }
}

/// Opens playback streams on the default sink or a named one.
#[derive(Debug, Clone, Default)]
pub struct PulseOutputDevice {
    device: Option<String>,
}

impl PulseOutputDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_device(name: impl Into<String>) -> Self {
        Self {
            device: Some(name.into()),
        }
    }
}

impl OutputDevice for PulseOutputDevice {
    fn open(&mut self, sample_rate: u32) -> Result<Box<dyn AudioOutput>, AudioError> {
        let shared = Arc::new(Shared::new(sample_rate));

        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let device = self.device.clone();
        let thread_shared = shared.clone();
        let thread = std::thread::Builder::new()
            .name("robeen-playback".into())
            .spawn(move || mixer_thread(device, thread_shared, ready_tx))
            .map_err(|e| AudioError::Device(format!("failed to spawn playback thread: {e}")))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Box::new(PulseOutput {
                shared,
                thread: Some(thread),
                closed: false,
            })),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => Err(AudioError::Device("playback thread exited".into())),
        }
    }
}

/// An open playback stream with a sample-accurate clock.
pub struct PulseOutput {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
    closed: bool,
}

impl AudioOutput for PulseOutput {
    fn resume(&mut self) -> Result<(), AudioError> {
        // The mixer writes silence from the moment the stream opens.
        if self.is_closed() {
            return Err(AudioError::Closed);
        }
        Ok(())
    }

    fn now(&self) -> f64 {
        self.shared.now_frame() as f64 / self.shared.sample_rate as f64
    }

    fn play_at(
        &mut self,
        buffer: AudioBuffer,
        start: f64,
    ) -> Result<Box<dyn PlaybackHandle>, AudioError> {
        if self.is_closed() {
            return Err(AudioError::Closed);
        }
        if buffer.sample_rate() != self.shared.sample_rate {
            return Err(AudioError::Device(format!(
                "buffer rate {} does not match output rate {}",
                buffer.sample_rate(),
                self.shared.sample_rate
            )));
        }

        let requested = (start * self.shared.sample_rate as f64).round().max(0.0) as u64;
        let state = self.shared.schedule(requested, buffer.samples().to_vec());
        Ok(Box::new(PulseHandle { state }))
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Playback thread panicked");
            }
        }
        self.shared.finish_all();
        debug!("Playback stream closed");
    }

    fn drain(&mut self) {
        if !self.closed {
            self.shared.drain.store(true, Ordering::SeqCst);
        }
        self.close();
    }

    fn is_closed(&self) -> bool {
        self.closed || !self.shared.running.load(Ordering::SeqCst)
    }
}

impl Drop for PulseOutput {
    fn drop(&mut self) {
        self.close();
    }
}

struct PulseHandle {
    state: Arc<HandleState>,
}

impl PlaybackHandle for PulseHandle {
    fn stop(&mut self) {
        self.state.stopped.store(true, Ordering::SeqCst);
    }

    fn is_finished(&self) -> bool {
        self.state.finished.load(Ordering::SeqCst) || self.state.stopped.load(Ordering::SeqCst)
    }
}

/// Mix every buffer overlapping `[base, base + out.len())` into `out` and
/// retire the ones that are done or stopped.
fn mix_period(pending: &mut Vec<Scheduled>, base: u64, out: &mut [f32]) {
    out.fill(0.0);
    let period_end = base + out.len() as u64;

    pending.retain(|scheduled| {
        if scheduled.state.stopped.load(Ordering::SeqCst) {
            scheduled.state.finished.store(true, Ordering::SeqCst);
            return false;
        }

        let from = scheduled.start_frame.max(base);
        let to = scheduled.end_frame().min(period_end);
        for frame in from..to {
            out[(frame - base) as usize] += scheduled.samples[(frame - scheduled.start_frame) as usize];
        }

        if scheduled.end_frame() <= period_end {
            scheduled.state.finished.store(true, Ordering::SeqCst);
            return false;
        }
        true
    });
}

fn open_playback_stream(device: Option<&str>, sample_rate: u32) -> Result<psimple::Simple, AudioError> {
    let spec = pulse::sample::Spec {
        format: pulse::sample::Format::F32le,
        channels: CHANNELS,
        rate: sample_rate,
    };
    if !spec.is_valid() {
        return Err(AudioError::Device(format!("invalid playback rate {sample_rate}")));
    }

    let period_bytes = sample_rate * PERIOD_MS / 1000 * 4;
    let attr = pulse::def::BufferAttr {
        maxlength: u32::MAX,
        tlength: period_bytes * TARGET_PERIODS,
        prebuf: u32::MAX,
        minreq: period_bytes,
        fragsize: u32::MAX,
    };

    psimple::Simple::new(
        None,
        "robeen",
        pulse::stream::Direction::Playback,
        device,
        "speech",
        &spec,
        None,
        Some(&attr),
    )
    .map_err(|e| AudioError::Device(format!("{e}")))
}

fn mixer_thread(
    device: Option<String>,
    shared: Arc<Shared>,
    ready: std::sync::mpsc::Sender<Result<(), AudioError>>,
) {
    let playback = match open_playback_stream(device.as_deref(), shared.sample_rate) {
        Ok(playback) => playback,
        Err(e) => {
            error!("Failed to open playback stream: {}", e);
            shared.running.store(false, Ordering::SeqCst);
            let _ = ready.send(Err(e));
            return;
        }
    };
    info!("Playback stream connected at {}Hz", shared.sample_rate);
    if ready.send(Ok(())).is_err() {
        return;
    }

    let period = (shared.sample_rate * PERIOD_MS / 1000) as usize;
    let mut mix = vec![0f32; period];
    let mut bytes = Vec::with_capacity(period * 4);

    while shared.running.load(Ordering::SeqCst) {
        shared.mix_next(&mut mix);

        bytes.clear();
        for sample in &mix {
            bytes.extend_from_slice(&sample.clamp(-1.0, 1.0).to_le_bytes());
        }
        if let Err(e) = playback.write(&bytes) {
            error!("Failed to write audio: {}", e);
            shared.running.store(false, Ordering::SeqCst);
            break;
        }
    }

    let finished = if shared.drain.load(Ordering::SeqCst) {
        playback.drain()
    } else {
        playback.flush()
    };
    if let Err(e) = finished {
        debug!("Playback shutdown: {}", e);
    }
    shared.finish_all();
    info!("Playback thread stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduled(start_frame: u64, samples: Vec<f32>) -> (Scheduled, Arc<HandleState>) {
        let state = Arc::new(HandleState::default());
        (
            Scheduled {
                start_frame,
                samples,
                state: state.clone(),
            },
            state,
        )
    }

    #[test]
    fn test_back_to_back_buffers_fill_period_exactly() {
        let (a, a_state) = scheduled(0, vec![0.25; 3]);
        let (b, b_state) = scheduled(3, vec![0.5; 3]);
        let mut pending = vec![a, b];
        let mut out = vec![0.0; 4];

        mix_period(&mut pending, 0, &mut out);
        assert_eq!(out, vec![0.25, 0.25, 0.25, 0.5]);
        assert!(a_state.finished.load(Ordering::SeqCst));
        assert!(!b_state.finished.load(Ordering::SeqCst));

        mix_period(&mut pending, 4, &mut out);
        assert_eq!(out, vec![0.5, 0.5, 0.0, 0.0]);
        assert!(b_state.finished.load(Ordering::SeqCst));
        assert!(pending.is_empty());
    }

    #[test]
    fn test_future_buffer_waits_for_its_frame() {
        let (a, _) = scheduled(6, vec![1.0; 2]);
        let mut pending = vec![a];
        let mut out = vec![0.0; 4];

        mix_period(&mut pending, 0, &mut out);
        assert_eq!(out, vec![0.0; 4]);
        mix_period(&mut pending, 4, &mut out);
        assert_eq!(out, vec![0.0, 0.0, 1.0, 1.0]);
    }

    #[test]
    fn test_buffer_queued_at_now_starts_with_next_period() {
        let shared = Shared::new(4);
        let mut out = vec![0.0; 4];

        shared.mix_next(&mut out);
        let now = shared.now_frame();
        assert_eq!(now, 4);

        let state = shared.schedule(now, vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6]);
        shared.mix_next(&mut out);
        assert_eq!(out, vec![0.1, 0.2, 0.3, 0.4]);
        shared.mix_next(&mut out);
        assert_eq!(out, vec![0.5, 0.6, 0.0, 0.0]);
        assert!(state.finished.load(Ordering::SeqCst));
    }

    #[test]
    fn test_late_request_is_clamped_to_unmixed_frame() {
        let shared = Shared::new(4);
        let mut out = vec![0.0; 4];
        shared.mix_next(&mut out);
        shared.mix_next(&mut out);

        shared.schedule(2, vec![1.0, 0.5]);
        shared.mix_next(&mut out);
        assert_eq!(out, vec![1.0, 0.5, 0.0, 0.0]);
    }

    #[test]
    fn test_stopped_buffer_is_silenced() {
        let (a, state) = scheduled(0, vec![1.0; 8]);
        let mut pending = vec![a];
        let mut out = vec![0.0; 4];

        mix_period(&mut pending, 0, &mut out);
        state.stopped.store(true, Ordering::SeqCst);
        mix_period(&mut pending, 4, &mut out);

        assert_eq!(out, vec![0.0; 4]);
        assert!(pending.is_empty());
        assert!(state.finished.load(Ordering::SeqCst));
    }
}
