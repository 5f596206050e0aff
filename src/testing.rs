//! In-memory capabilities
//!
//! A settable clock, an output that records what it was asked to play, and
//! scripted microphone, transport and speech sources. Used by the test
//! suites and by anything that wants to drive the pipeline without a sound
//! server.

use crate::audio::{AudioError, AudioOutput, CaptureStream, Microphone, OutputDevice, PlaybackHandle};
use crate::codec::{AudioBuffer, INPUT_SAMPLE_RATE};
use crate::transport::{
    ChunkStream, LiveConfig, LiveConnector, LiveLink, LiveTransport, MediaChunk, SpeechSource,
    TransportError, TransportEvent,
};
use crate::tts::TtsError;
use bytes::Bytes;
use futures_util::stream::{self, StreamExt};
use std::future::{self, Future};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shared output clock, in seconds. Only moves when told to.
#[derive(Debug, Clone, Default)]
pub struct FakeClock(Arc<Mutex<f64>>);

impl FakeClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, seconds: f64) {
        *lock(&self.0) = seconds;
    }

    pub fn advance(&self, seconds: f64) {
        *lock(&self.0) += seconds;
    }

    pub fn now(&self) -> f64 {
        *lock(&self.0)
    }
}

/// One `play_at` call as seen by a [`FakeOutput`].
#[derive(Debug, Clone)]
pub struct ScheduledEntry {
    pub start: f64,
    pub duration: f64,
    pub samples: Vec<f32>,
    stopped: Arc<AtomicBool>,
}

impl ScheduledEntry {
    pub fn stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn end(&self) -> f64 {
        self.start + self.duration
    }
}

struct FakeHandle {
    clock: FakeClock,
    end: f64,
    stopped: Arc<AtomicBool>,
}

impl PlaybackHandle for FakeHandle {
    fn stop(&mut self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn is_finished(&self) -> bool {
        self.stopped.load(Ordering::SeqCst) || self.clock.now() >= self.end
    }
}

#[derive(Debug, Default)]
struct OutputState {
    scheduled: Vec<ScheduledEntry>,
    resumed: usize,
    closed: bool,
    drained: bool,
}

/// Output that records every scheduled buffer. Clones share state, so a
/// test can keep one while the code under test owns another.
#[derive(Debug, Clone, Default)]
pub struct FakeOutput {
    clock: FakeClock,
    state: Arc<Mutex<OutputState>>,
}

impl FakeOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_clock(clock: FakeClock) -> Self {
        Self {
            clock,
            state: Arc::default(),
        }
    }

    pub fn clock(&self) -> FakeClock {
        self.clock.clone()
    }

    pub fn scheduled(&self) -> Vec<ScheduledEntry> {
        lock(&self.state).scheduled.clone()
    }

    /// Start times of every scheduled buffer, in call order.
    pub fn starts(&self) -> Vec<f64> {
        lock(&self.state).scheduled.iter().map(|e| e.start).collect()
    }

    pub fn resume_count(&self) -> usize {
        lock(&self.state).resumed
    }

    /// Closed through [`AudioOutput::drain`] rather than a hard close.
    pub fn was_drained(&self) -> bool {
        lock(&self.state).drained
    }
}

impl AudioOutput for FakeOutput {
    fn resume(&mut self) -> Result<(), AudioError> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(AudioError::Closed);
        }
        state.resumed += 1;
        Ok(())
    }

    fn now(&self) -> f64 {
        self.clock.now()
    }

    fn play_at(
        &mut self,
        buffer: AudioBuffer,
        start: f64,
    ) -> Result<Box<dyn PlaybackHandle>, AudioError> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(AudioError::Closed);
        }
        let stopped = Arc::new(AtomicBool::new(false));
        let entry = ScheduledEntry {
            start,
            duration: buffer.duration(),
            samples: buffer.samples().to_vec(),
            stopped: stopped.clone(),
        };
        let end = entry.end();
        state.scheduled.push(entry);
        Ok(Box::new(FakeHandle {
            clock: self.clock.clone(),
            end,
            stopped,
        }))
    }

    fn close(&mut self) {
        lock(&self.state).closed = true;
    }

    fn drain(&mut self) {
        let mut state = lock(&self.state);
        if !state.closed {
            state.drained = true;
            state.closed = true;
        }
    }

    fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }
}

/// Opens [`FakeOutput`]s on a shared clock and remembers each one.
#[derive(Debug, Clone, Default)]
pub struct FakeOutputDevice {
    clock: FakeClock,
    opened: Arc<Mutex<Vec<FakeOutput>>>,
    failure: Arc<Mutex<Option<AudioError>>>,
}

impl FakeOutputDevice {
    pub fn new(clock: FakeClock) -> Self {
        Self {
            clock,
            ..Self::default()
        }
    }

    /// Make every following `open` fail with `err`.
    pub fn fail_with(&self, err: AudioError) {
        *lock(&self.failure) = Some(err);
    }

    pub fn opened(&self) -> Vec<FakeOutput> {
        lock(&self.opened).clone()
    }

    pub fn last_output(&self) -> Option<FakeOutput> {
        lock(&self.opened).last().cloned()
    }
}

impl OutputDevice for FakeOutputDevice {
    fn open(&mut self, _sample_rate: u32) -> Result<Box<dyn AudioOutput>, AudioError> {
        if let Some(err) = lock(&self.failure).clone() {
            return Err(err);
        }
        let output = FakeOutput::with_clock(self.clock.clone());
        lock(&self.opened).push(output.clone());
        Ok(Box::new(output))
    }
}

#[derive(Debug, Default)]
struct MicState {
    failure: Option<AudioError>,
    frames: Option<mpsc::Sender<Vec<f32>>>,
    shutdown: Option<Arc<AtomicBool>>,
    acquisitions: usize,
}

/// Microphone whose frames are pushed by the test.
#[derive(Debug, Clone, Default)]
pub struct FakeMicrophone {
    state: Arc<Mutex<MicState>>,
}

impl FakeMicrophone {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_with(&self, err: AudioError) {
        lock(&self.state).failure = Some(err);
    }

    /// Sender feeding the most recently acquired stream.
    pub fn frames(&self) -> Option<mpsc::Sender<Vec<f32>>> {
        lock(&self.state).frames.clone()
    }

    /// True when nothing is acquired or the last stream was released.
    pub fn is_released(&self) -> bool {
        lock(&self.state)
            .shutdown
            .as_ref()
            .map_or(true, |flag| flag.load(Ordering::SeqCst))
    }

    pub fn acquisitions(&self) -> usize {
        lock(&self.state).acquisitions
    }
}

impl Microphone for FakeMicrophone {
    fn acquire(&mut self) -> impl Future<Output = Result<CaptureStream, AudioError>> + Send {
        future::ready(self.acquire_now())
    }
}

impl FakeMicrophone {
    fn acquire_now(&self) -> Result<CaptureStream, AudioError> {
        let mut state = lock(&self.state);
        if let Some(err) = state.failure.clone() {
            return Err(err);
        }
        let (tx, rx) = mpsc::channel(16);
        let shutdown = Arc::new(AtomicBool::new(false));
        state.frames = Some(tx);
        state.shutdown = Some(shutdown.clone());
        state.acquisitions += 1;
        Ok(CaptureStream::new(rx, shutdown, INPUT_SAMPLE_RATE))
    }
}

#[derive(Debug, Default)]
struct TransportLog {
    sent: Vec<MediaChunk>,
    closed: bool,
}

struct FakeTransport {
    log: Arc<Mutex<TransportLog>>,
}

impl LiveTransport for FakeTransport {
    fn send_realtime_input(&mut self, chunk: MediaChunk) -> Result<(), TransportError> {
        let mut log = lock(&self.log);
        if log.closed {
            return Err(TransportError::Closed);
        }
        log.sent.push(chunk);
        Ok(())
    }

    fn close(&mut self) {
        lock(&self.log).closed = true;
    }

    fn is_closed(&self) -> bool {
        lock(&self.log).closed
    }
}

#[derive(Debug, Default)]
struct ConnectorState {
    failure: Option<TransportError>,
    events: Option<mpsc::Sender<TransportEvent>>,
    configs: Vec<LiveConfig>,
}

/// Connector handing out transports that record what was sent. The test
/// plays the remote side through [`FakeConnector::events`].
#[derive(Debug, Clone, Default)]
pub struct FakeConnector {
    state: Arc<Mutex<ConnectorState>>,
    log: Arc<Mutex<TransportLog>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_with(&self, err: TransportError) {
        lock(&self.state).failure = Some(err);
    }

    /// Sender for the most recent connection's event feed.
    pub fn events(&self) -> Option<mpsc::Sender<TransportEvent>> {
        lock(&self.state).events.clone()
    }

    pub fn sent(&self) -> Vec<MediaChunk> {
        lock(&self.log).sent.clone()
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.log).closed
    }

    pub fn connects(&self) -> usize {
        lock(&self.state).configs.len()
    }

    pub fn last_config(&self) -> Option<LiveConfig> {
        lock(&self.state).configs.last().cloned()
    }
}

impl LiveConnector for FakeConnector {
    fn connect(
        &mut self,
        config: &LiveConfig,
    ) -> impl Future<Output = Result<LiveLink, TransportError>> + Send {
        future::ready(self.connect_now(config))
    }
}

impl FakeConnector {
    fn connect_now(&self, config: &LiveConfig) -> Result<LiveLink, TransportError> {
        let mut state = lock(&self.state);
        if let Some(err) = state.failure.clone() {
            return Err(err);
        }
        state.configs.push(config.clone());
        let (tx, rx) = mpsc::channel(64);
        state.events = Some(tx);
        *lock(&self.log) = TransportLog::default();
        Ok(LiveLink {
            transport: Box::new(FakeTransport {
                log: self.log.clone(),
            }),
            events: rx,
        })
    }
}

/// Speech source replaying a fixed script, or fed live through a channel.
pub struct FakeSpeech {
    script: Mutex<Option<Script>>,
}

enum Script {
    Fixed(Result<Vec<Result<Bytes, TtsError>>, TtsError>),
    Channel(mpsc::UnboundedReceiver<Result<Bytes, TtsError>>),
}

impl FakeSpeech {
    /// Yield `chunks` in order, then end.
    pub fn scripted(chunks: Vec<Result<Bytes, TtsError>>) -> Self {
        Self {
            script: Mutex::new(Some(Script::Fixed(Ok(chunks)))),
        }
    }

    /// Fail to open with `err`.
    pub fn failing(err: TtsError) -> Self {
        Self {
            script: Mutex::new(Some(Script::Fixed(Err(err)))),
        }
    }

    /// Chunks arrive as the returned sender pushes them; dropping the
    /// sender ends the stream.
    pub fn channel() -> (Self, mpsc::UnboundedSender<Result<Bytes, TtsError>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let speech = Self {
            script: Mutex::new(Some(Script::Channel(rx))),
        };
        (speech, tx)
    }
}

impl SpeechSource for FakeSpeech {
    fn open(&self, _text: &str) -> impl Future<Output = Result<ChunkStream, TtsError>> + Send {
        let script = lock(&self.script).take();
        future::ready(match script {
            Some(Script::Fixed(Ok(chunks))) => Ok(stream::iter(chunks).boxed()),
            Some(Script::Fixed(Err(err))) => Err(err),
            Some(Script::Channel(rx)) => Ok(stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            })
            .boxed()),
            None => Err(TtsError::Stream("speech already consumed".into())),
        })
    }
}

/// Raw PCM bytes holding `millis` of a constant `value` at `sample_rate`.
pub fn pcm_chunk(value: i16, millis: u32, sample_rate: u32) -> Bytes {
    let samples = (sample_rate as u64 * millis as u64 / 1000) as usize;
    let mut bytes = Vec::with_capacity(samples * 2);
    for _ in 0..samples {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    Bytes::from(bytes)
}
