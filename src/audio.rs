//! Audio capabilities
//!
//! The streaming core never talks to a sound server directly. It receives
//! these capabilities instead: an [`OutputDevice`] that opens clocked
//! [`AudioOutput`]s, and a [`Microphone`] that yields a [`CaptureStream`].
//! PulseAudio implementations live in `media_in` and `media_out`; tests use
//! the fakes in `testing`.

use crate::codec::AudioBuffer;
use libpulse_binding::callbacks::ListResult;
use libpulse_binding::context::{Context, FlagSet as ContextFlagSet, State as ContextState};
use libpulse_binding::def::Retval;
use libpulse_binding::mainloop::standard::{IterateResult, Mainloop};
use libpulse_binding::proplist::{properties, Proplist};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tokio::sync::mpsc;
use tracing::{debug, error};

/// Error raised by audio devices
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AudioError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("no audio devices found")]
    NoDevicesFound,

    #[error("audio device error: {0}")]
    Device(String),

    #[error("audio output is closed")]
    Closed,
}

/// A buffer that has been handed to an output and may still be playing.
pub trait PlaybackHandle: Send {
    /// Silence the buffer now, whether or not it has started.
    fn stop(&mut self);

    fn is_finished(&self) -> bool;
}

/// An open output with its own monotonic clock, in seconds.
pub trait AudioOutput: Send {
    /// Make sure the clock is running. Called once before playback begins.
    fn resume(&mut self) -> Result<(), AudioError>;

    /// Current time of the output clock.
    fn now(&self) -> f64;

    /// Queue `buffer` to start at `start` on this output's clock.
    fn play_at(
        &mut self,
        buffer: AudioBuffer,
        start: f64,
    ) -> Result<Box<dyn PlaybackHandle>, AudioError>;

    /// Release the device, dropping anything not yet heard. Must be
    /// idempotent. May block briefly while the device thread exits.
    fn close(&mut self);

    /// Release the device once everything already queued has been heard.
    fn drain(&mut self) {
        self.close();
    }

    fn is_closed(&self) -> bool;
}

/// Opens outputs on demand. Every playback session gets a fresh clock.
///
/// `open` may block until the sound server accepts the stream.
pub trait OutputDevice: Send {
    fn open(&mut self, sample_rate: u32) -> Result<Box<dyn AudioOutput>, AudioError>;
}

/// Source of microphone frames.
pub trait Microphone: Send {
    /// Acquire the microphone. May wait on a permission prompt.
    fn acquire(&mut self) -> impl Future<Output = Result<CaptureStream, AudioError>> + Send;
}

/// Frames of `f32` samples delivered by an acquired microphone.
///
/// Dropping or releasing the stream raises the shared shutdown flag so the
/// producing thread stops reading from the device. When the stream owns
/// that thread, release waits for it, so the device is closed on return.
#[derive(Debug)]
pub struct CaptureStream {
    frames: mpsc::Receiver<Vec<f32>>,
    shutdown: Arc<AtomicBool>,
    sample_rate: u32,
    thread: Option<JoinHandle<()>>,
}

impl CaptureStream {
    pub fn new(frames: mpsc::Receiver<Vec<f32>>, shutdown: Arc<AtomicBool>, sample_rate: u32) -> Self {
        Self {
            frames,
            shutdown,
            sample_rate,
            thread: None,
        }
    }

    /// Join `thread` on release. It must exit soon after the shutdown flag
    /// is raised or its frame channel closes.
    pub fn with_thread(mut self, thread: JoinHandle<()>) -> Self {
        self.thread = Some(thread);
        self
    }

    /// Next captured frame, or `None` once the device went away or the
    /// stream was released.
    pub async fn next_frame(&mut self) -> Option<Vec<f32>> {
        if self.is_released() {
            return None;
        }
        self.frames.recv().await
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn release(&mut self) {
        if !self.shutdown.swap(true, Ordering::SeqCst) {
            debug!("Releasing capture stream");
        }
        self.frames.close();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Capture thread panicked");
            }
        }
    }

    pub fn is_released(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

impl Drop for CaptureStream {
    fn drop(&mut self) {
        self.release();
    }
}

/// Represents an audio device
#[derive(Debug, Clone)]
pub struct AudioDevice {
    /// Device name (PulseAudio source or sink name)
    pub name: String,
    /// Human-readable description
    pub description: String,
    pub sample_rate: u32,
    pub channels: u8,
    /// Monitor of system playback rather than a real microphone
    pub is_monitor: bool,
}

/// Audio device type for easy filtering
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    Microphone,
    Monitor,
    Any,
}

impl DeviceType {
    fn accepts(self, is_monitor: bool) -> bool {
        match self {
            DeviceType::Microphone => !is_monitor,
            DeviceType::Monitor => is_monitor,
            DeviceType::Any => true,
        }
    }
}

/// List the PulseAudio sources matching `device_type`.
pub fn list_devices(device_type: DeviceType) -> Result<Vec<AudioDevice>, AudioError> {
    let devices = Arc::new(Mutex::new(Vec::new()));
    let devices_clone = devices.clone();

    let mut proplist =
        Proplist::new().ok_or_else(|| AudioError::Device("failed to create proplist".into()))?;
    proplist
        .set_str(properties::APPLICATION_NAME, "robeen-device-lister")
        .map_err(|_| AudioError::Device("failed to set application name".into()))?;

    let mut mainloop =
        Mainloop::new().ok_or_else(|| AudioError::Device("failed to create mainloop".into()))?;

    let mut context = Context::new_with_proplist(&mainloop, "robeen-context", &proplist)
        .ok_or_else(|| AudioError::Device("failed to create context".into()))?;

    context
        .connect(None, ContextFlagSet::NOFLAGS, None)
        .map_err(|e| AudioError::Device(format!("failed to connect context: {e}")))?;

    loop {
        if let IterateResult::Quit(_) | IterateResult::Err(_) = mainloop.iterate(false) {
            return Err(AudioError::Device("mainloop iterate failed".into()));
        }
        match context.get_state() {
            ContextState::Ready => break,
            ContextState::Failed | ContextState::Terminated => {
                return Err(AudioError::Device("connection to sound server failed".into()));
            }
            _ => {}
        }
    }

    let done = Arc::new(AtomicBool::new(false));
    let done_clone = done.clone();

    let introspector = context.introspect();
    let _op = introspector.get_source_info_list(move |result| match result {
        ListResult::Item(source) => {
            let is_monitor = source.monitor_of_sink.is_some()
                || source
                    .name
                    .as_ref()
                    .map(|name| name.contains("monitor"))
                    .unwrap_or(false);

            if !device_type.accepts(is_monitor) {
                return;
            }
            if let (Some(name), Some(description)) = (
                source.name.as_ref().map(|s| s.to_string()),
                source.description.as_ref().map(|s| s.to_string()),
            ) {
                if let Ok(mut devices) = devices_clone.lock() {
                    devices.push(AudioDevice {
                        name,
                        description,
                        sample_rate: source.sample_spec.rate,
                        channels: source.sample_spec.channels,
                        is_monitor,
                    });
                }
            }
        }
        ListResult::End => done_clone.store(true, Ordering::SeqCst),
        ListResult::Error => {
            error!("Error listing audio devices");
            done_clone.store(true, Ordering::SeqCst);
        }
    });

    while !done.load(Ordering::SeqCst) {
        if let IterateResult::Quit(_) | IterateResult::Err(_) = mainloop.iterate(false) {
            return Err(AudioError::Device("mainloop iterate failed".into()));
        }
    }

    context.disconnect();
    mainloop.quit(Retval(0));

    let devices = devices
        .lock()
        .map_err(|_| AudioError::Device("device list poisoned".into()))?
        .clone();
    if devices.is_empty() {
        return Err(AudioError::NoDevicesFound);
    }
    Ok(devices)
}
