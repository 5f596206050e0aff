//! Bidirectional live-voice session
//!
//! One [`LiveSession`] owns the microphone, an output clock for responses
//! and the transport to the remote model. Microphone frames are metered and,
//! once the transport is open, encoded and sent. Response audio is decoded
//! and scheduled gaplessly on the session's own cursor.
//!
//! Teardown is idempotent. The `active` guard is cleared before anything
//! is released, so frames or messages that arrive afterwards are ignored.

use crate::audio::{AudioError, AudioOutput, CaptureStream, Microphone, OutputDevice};
use crate::codec::{self, OUTPUT_SAMPLE_RATE};
use crate::events::{SessionEvent, SessionNotice, Speaker};
use crate::scheduler::{GaplessScheduler, PlaybackCursor};
use crate::transport::{
    LiveConfig, LiveConnector, LiveTransport, MediaChunk, ServerEvent, TransportError,
    TransportEvent,
};
use crate::volume::VolumeMeter;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
}

/// Why a session could not be started
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("microphone permission denied: {0}")]
    Permission(String),

    #[error("audio device error: {0}")]
    Device(String),

    #[error("transport error: {0}")]
    Transport(String),
}

impl From<AudioError> for SessionError {
    fn from(e: AudioError) -> Self {
        match e {
            AudioError::PermissionDenied(m) => Self::Permission(m),
            other => Self::Device(other.to_string()),
        }
    }
}

impl From<TransportError> for SessionError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e.to_string())
    }
}

pub struct LiveSession<M, D, C> {
    microphone: M,
    device: D,
    connector: C,
    config: LiveConfig,

    state: SessionState,
    active: bool,
    capture: Option<CaptureStream>,
    output: Option<Box<dyn AudioOutput>>,
    transport: Option<Box<dyn LiveTransport>>,
    events: Option<mpsc::Receiver<TransportEvent>>,
    scheduler: GaplessScheduler,
    meter: VolumeMeter,

    event_tx: broadcast::Sender<SessionEvent>,
    volume_tx: watch::Sender<f32>,
}

impl<M, D, C> LiveSession<M, D, C>
where
    M: Microphone,
    D: OutputDevice,
    C: LiveConnector,
{
    pub fn new(microphone: M, device: D, connector: C, config: LiveConfig) -> Self {
        let (event_tx, _) = broadcast::channel(64);
        let (volume_tx, _) = watch::channel(0.0);
        Self {
            microphone,
            device,
            connector,
            config,
            state: SessionState::Idle,
            active: false,
            capture: None,
            output: None,
            transport: None,
            events: None,
            scheduler: GaplessScheduler::new(),
            meter: VolumeMeter::default(),
            event_tx,
            volume_tx,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Most recent input level, zero when no session is running.
    pub fn volume(&self) -> f32 {
        *self.volume_tx.borrow()
    }

    pub fn watch_volume(&self) -> watch::Receiver<f32> {
        self.volume_tx.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    pub fn cursor(&self) -> PlaybackCursor {
        self.scheduler.cursor()
    }

    /// Response buffers still queued or playing.
    pub fn active_playback_count(&mut self) -> usize {
        self.scheduler.active_count()
    }

    /// Acquire the microphone, open the response output and connect.
    ///
    /// Any session already running is torn down first. On failure every
    /// acquired resource is released, the state returns to `Idle` and a
    /// notice is published.
    pub async fn start(&mut self) -> Result<(), SessionError> {
        if self.active || self.state != SessionState::Idle {
            info!("Restarting live session");
            self.stop();
        }

        self.active = true;
        self.set_state(SessionState::Connecting);
        info!("Starting live session");

        match self.microphone.acquire().await {
            Ok(capture) => self.capture = Some(capture),
            Err(e) => return Err(self.abort(e.into())),
        }

        let mut output = match self.device.open(OUTPUT_SAMPLE_RATE) {
            Ok(output) => output,
            Err(e) => return Err(self.abort(e.into())),
        };
        if let Err(e) = output.resume() {
            output.close();
            return Err(self.abort(e.into()));
        }
        self.scheduler.reset_to(output.now());
        self.output = Some(output);

        match self.connector.connect(&self.config).await {
            Ok(link) => {
                self.transport = Some(link.transport);
                self.events = Some(link.events);
            }
            Err(e) => return Err(self.abort(e.into())),
        }

        debug!("Live session waiting for transport to open");
        Ok(())
    }

    /// Tear everything down. Safe to call repeatedly or when idle.
    pub fn stop(&mut self) {
        let was_active = std::mem::replace(&mut self.active, false);

        self.scheduler.reset();
        if let Some(mut capture) = self.capture.take() {
            capture.release();
        }
        if let Some(mut output) = self.output.take() {
            output.close();
        }
        if let Some(mut transport) = self.transport.take() {
            transport.close();
        }
        self.events = None;

        self.meter.reset();
        self.volume_tx.send_replace(0.0);
        self.set_state(SessionState::Idle);

        if was_active {
            info!("Live session stopped");
        }
    }

    /// Handle one microphone frame.
    pub fn handle_capture_frame(&mut self, frame: &[f32]) {
        if !self.active {
            return;
        }

        let level = self.meter.measure(frame);
        self.volume_tx.send_replace(level);

        if self.state != SessionState::Connected {
            return;
        }
        let Some(transport) = self.transport.as_mut() else {
            return;
        };
        if transport.is_closed() {
            return;
        }

        let pcm = codec::encode(frame);
        if let Err(e) = transport.send_realtime_input(MediaChunk::microphone_pcm(pcm)) {
            warn!("Failed to send microphone audio: {}", e);
        }
    }

    /// Handle one event from the transport.
    pub fn handle_transport_event(&mut self, event: TransportEvent) {
        if !self.active {
            debug!("Ignoring transport event after teardown: {:?}", event);
            return;
        }

        match event {
            TransportEvent::Open => {
                if self.state == SessionState::Connecting {
                    info!("Live session connected");
                    self.set_state(SessionState::Connected);
                }
            }
            TransportEvent::Message(message) => self.handle_server_event(message),
            TransportEvent::Close(reason) => {
                warn!("Transport closed: {:?}", reason);
                self.end_connection(reason);
            }
            TransportEvent::Error(e) => {
                error!("Transport error: {}", e);
                self.end_connection(Some(e));
            }
        }
    }

    /// A transport that ends before `Open` never connected.
    fn end_connection(&mut self, reason: Option<String>) {
        let was_connecting = self.state == SessionState::Connecting;
        self.stop();
        if was_connecting {
            let reason = reason.unwrap_or_else(|| "connection closed during setup".into());
            self.notify(SessionNotice::ConnectFailed(reason));
        } else {
            self.notify(SessionNotice::ConnectionLost(reason));
        }
    }

    /// Drive the session until it ends or `cancel` fires.
    ///
    /// Call after a successful [`start`](Self::start). Cancellation stops
    /// the session before returning.
    pub async fn run(&mut self, cancel: CancellationToken) {
        while self.active {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    info!("Live session cancelled");
                    self.stop();
                }
                event = next_event(&mut self.events) => match event {
                    Some(event) => self.handle_transport_event(event),
                    None => self.handle_transport_event(TransportEvent::Close(None)),
                },
                frame = next_frame(&mut self.capture) => match frame {
                    Some(frame) => self.handle_capture_frame(&frame),
                    None => {
                        warn!("Microphone stream ended");
                        self.stop();
                        self.notify(SessionNotice::DeviceUnavailable("microphone stream ended".into()));
                    }
                },
            }
        }
    }

    fn handle_server_event(&mut self, message: ServerEvent) {
        match message {
            ServerEvent::Audio(bytes) => self.play_response(&bytes),
            ServerEvent::Interrupted => {
                info!("Model interrupted, dropping queued response audio");
                self.scheduler.stop_all();
                if let Some(output) = self.output.as_ref() {
                    self.scheduler.reset_to(output.now());
                }
            }
            ServerEvent::InputTranscription(text) => self.publish(SessionEvent::Transcript {
                speaker: Speaker::User,
                text,
            }),
            ServerEvent::OutputTranscription(text) | ServerEvent::Text(text) => {
                self.publish(SessionEvent::Transcript {
                    speaker: Speaker::Model,
                    text,
                })
            }
            ServerEvent::TurnComplete => self.publish(SessionEvent::TurnComplete),
        }
    }

    fn play_response(&mut self, bytes: &[u8]) {
        let buffer = match codec::decode_to_playable_buffer(bytes, OUTPUT_SAMPLE_RATE) {
            Ok(buffer) => buffer,
            Err(e) => {
                warn!("Skipping malformed response chunk ({} bytes): {}", bytes.len(), e);
                return;
            }
        };
        let Some(output) = self.output.as_mut() else {
            return;
        };
        if let Err(e) = self.scheduler.schedule(output.as_mut(), buffer) {
            warn!("Failed to schedule response audio: {}", e);
        }
    }

    fn abort(&mut self, err: SessionError) -> SessionError {
        error!("Failed to start live session: {}", err);
        self.stop();
        self.notify(SessionNotice::from(&err));
        err
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            debug!("Session state {:?} -> {:?}", self.state, state);
            self.state = state;
            self.publish(SessionEvent::StateChanged(state));
        }
    }

    fn notify(&self, notice: SessionNotice) {
        info!("{}", notice);
        self.publish(SessionEvent::Notice(notice));
    }

    fn publish(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.event_tx.send(event);
    }
}

impl<M, D, C> Drop for LiveSession<M, D, C> {
    fn drop(&mut self) {
        self.active = false;
        self.scheduler.reset();
        if let Some(mut output) = self.output.take() {
            output.close();
        }
        if let Some(mut transport) = self.transport.take() {
            transport.close();
        }
    }
}

async fn next_event(events: &mut Option<mpsc::Receiver<TransportEvent>>) -> Option<TransportEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_frame(capture: &mut Option<CaptureStream>) -> Option<Vec<f32>> {
    match capture {
        Some(stream) => stream.next_frame().await,
        None => std::future::pending().await,
    }
}
