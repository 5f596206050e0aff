//! Prefetch and gapless playback of synthesized speech
//!
//! The speech stream is opened as soon as the text is known. Chunks are
//! held in memory until the listener asks to hear them; going live drains
//! the queue onto the scheduler in one pass and every later chunk is
//! scheduled as it arrives.
//!
//! [`PrefetchStreamer`] is the synchronous core. [`PrefetchPlayer`] runs
//! one in its own task, fed by the producer stream and by play/stop
//! commands, and publishes a [`PrefetchStatus`] for the UI.

use crate::audio::{AudioError, AudioOutput, OutputDevice};
use crate::codec::{self, OUTPUT_SAMPLE_RATE};
use crate::scheduler::{GaplessScheduler, PlaybackCursor};
use crate::transport::{ChunkStream, SpeechSource};
use crate::tts::TtsError;
use bytes::Bytes;
use futures_util::StreamExt;
use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Error returned when playback cannot start
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlaybackError {
    #[error("no audio buffered and the speech stream has ended")]
    NothingToPlay,

    #[error("audio device error: {0}")]
    Device(#[from] AudioError),

    #[error("player stopped")]
    Stopped,
}

/// Where the speech producer is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProducerState {
    Idle,
    Streaming,
    Finished,
    Failed(String),
}

pub struct PrefetchStreamer<D> {
    device: D,
    output: Option<Box<dyn AudioOutput>>,
    scheduler: GaplessScheduler,
    pending: VecDeque<Bytes>,
    live: bool,
    producer: ProducerState,
}

impl<D: OutputDevice> PrefetchStreamer<D> {
    pub fn new(device: D) -> Self {
        Self {
            device,
            output: None,
            scheduler: GaplessScheduler::new(),
            pending: VecDeque::new(),
            live: false,
            producer: ProducerState::Idle,
        }
    }

    /// Prepare for a new producer, dropping anything left from the last one.
    pub fn begin(&mut self) {
        self.stop();
        self.producer = ProducerState::Streaming;
    }

    /// A chunk arrived from the producer.
    pub fn push_chunk(&mut self, chunk: Bytes) {
        if self.live {
            self.schedule_chunk(&chunk);
        } else {
            debug!("Buffered speech chunk of {} bytes", chunk.len());
            self.pending.push_back(chunk);
        }
    }

    /// The producer ended normally.
    pub fn finish(&mut self) {
        if self.producer == ProducerState::Streaming {
            info!("Speech stream complete");
            self.producer = ProducerState::Finished;
        }
    }

    /// The producer failed. Chunks already buffered stay playable.
    pub fn fail(&mut self, err: &TtsError) {
        warn!("Speech stream failed: {}", err);
        self.producer = ProducerState::Failed(err.to_string());
    }

    /// Whether going live now would have anything to play.
    pub fn can_play(&self) -> bool {
        !self.live && (!self.pending.is_empty() || self.producer == ProducerState::Streaming)
    }

    /// Open the output, move the cursor to now and flush the queue.
    ///
    /// Already live is a no-op.
    pub fn go_live(&mut self) -> Result<(), PlaybackError> {
        if self.live {
            return Ok(());
        }
        if !self.can_play() {
            return Err(PlaybackError::NothingToPlay);
        }

        let mut output = self.device.open(OUTPUT_SAMPLE_RATE)?;
        if let Err(e) = output.resume() {
            output.close();
            return Err(e.into());
        }
        self.scheduler.reset_to(output.now());
        self.output = Some(output);
        self.live = true;

        info!("Starting playback with {} buffered chunks", self.pending.len());
        while let Some(chunk) = self.pending.pop_front() {
            self.schedule_chunk(&chunk);
        }
        Ok(())
    }

    /// Silence everything and release the output. Safe to call repeatedly.
    pub fn stop(&mut self) {
        self.scheduler.reset();
        if let Some(mut output) = self.output.take() {
            output.close();
            info!("Playback stopped");
        }
        self.live = false;
        self.pending.clear();
        self.producer = ProducerState::Idle;
    }

    /// Let scheduled audio play out, then release the output.
    pub fn finish_playback(&mut self) {
        self.scheduler.reset();
        if let Some(mut output) = self.output.take() {
            output.drain();
            info!("Playback drained");
        }
        self.live = false;
        self.pending.clear();
        self.producer = ProducerState::Idle;
    }

    pub fn is_live(&self) -> bool {
        self.live
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn producer_state(&self) -> &ProducerState {
        &self.producer
    }

    pub fn cursor(&self) -> PlaybackCursor {
        self.scheduler.cursor()
    }

    /// Live, the producer is done and every scheduled buffer has played.
    pub fn is_playback_complete(&mut self) -> bool {
        self.live
            && matches!(self.producer, ProducerState::Finished | ProducerState::Failed(_))
            && self.scheduler.active_count() == 0
    }

    fn schedule_chunk(&mut self, chunk: &[u8]) {
        let buffer = match codec::decode_to_playable_buffer(chunk, OUTPUT_SAMPLE_RATE) {
            Ok(buffer) => buffer,
            Err(e) => {
                warn!("Skipping malformed speech chunk ({} bytes): {}", chunk.len(), e);
                return;
            }
        };
        let Some(output) = self.output.as_mut() else {
            return;
        };
        if let Err(e) = self.scheduler.schedule(output.as_mut(), buffer) {
            warn!("Failed to schedule speech chunk: {}", e);
        }
    }
}

impl<D> Drop for PrefetchStreamer<D> {
    fn drop(&mut self) {
        self.scheduler.reset();
        if let Some(mut output) = self.output.take() {
            output.close();
        }
    }
}

/// What the play affordance should show.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrefetchStatus {
    /// Producer still running
    Buffering { chunks: usize },
    /// Producer done, audio waiting
    Ready { chunks: usize },
    Playing,
    Finished,
    /// Nothing to play and nothing coming
    Failed(String),
    Stopped,
}

impl PrefetchStatus {
    pub fn can_play(&self) -> bool {
        matches!(self, Self::Buffering { .. } | Self::Ready { .. })
    }
}

fn status_of<D: OutputDevice>(streamer: &mut PrefetchStreamer<D>) -> PrefetchStatus {
    if streamer.is_live() {
        return if streamer.is_playback_complete() {
            PrefetchStatus::Finished
        } else {
            PrefetchStatus::Playing
        };
    }
    let chunks = streamer.pending_len();
    match streamer.producer_state() {
        ProducerState::Idle | ProducerState::Streaming => PrefetchStatus::Buffering { chunks },
        _ if chunks > 0 => PrefetchStatus::Ready { chunks },
        ProducerState::Finished => PrefetchStatus::Failed("speech stream was empty".into()),
        ProducerState::Failed(msg) => PrefetchStatus::Failed(msg.clone()),
    }
}

enum Command {
    Play(oneshot::Sender<Result<(), PlaybackError>>),
    Stop(oneshot::Sender<()>),
}

const COMPLETION_POLL: Duration = Duration::from_millis(100);

/// Handle to a prefetching speech player running in its own task.
pub struct PrefetchPlayer {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<PrefetchStatus>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl PrefetchPlayer {
    /// Start buffering whatever `producer` resolves to.
    pub fn start<D, F>(device: D, producer: F) -> Self
    where
        D: OutputDevice + 'static,
        F: Future<Output = Result<ChunkStream, TtsError>> + Send + 'static,
    {
        let (commands, command_rx) = mpsc::channel(8);
        let (status_tx, status) = watch::channel(PrefetchStatus::Buffering { chunks: 0 });
        let cancel = CancellationToken::new();

        let streamer = PrefetchStreamer::new(device);
        let task = tokio::spawn(drive(streamer, producer, command_rx, status_tx, cancel.clone()));

        Self {
            commands,
            status,
            cancel,
            task: Some(task),
        }
    }

    /// Open `source` for `text` and start buffering it.
    pub fn prefetch<D, S>(device: D, source: S, text: impl Into<String>) -> Self
    where
        D: OutputDevice + 'static,
        S: SpeechSource + 'static,
    {
        let text = text.into();
        Self::start(device, async move { source.open(&text).await })
    }

    /// Go live. Buffered audio starts immediately.
    pub async fn play(&self) -> Result<(), PlaybackError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Play(tx))
            .await
            .map_err(|_| PlaybackError::Stopped)?;
        rx.await.map_err(|_| PlaybackError::Stopped)?
    }

    /// Silence playback and release the output. Returns once the device is
    /// closed; a no-op when the player has already ended.
    pub async fn stop(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Stop(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    pub fn status(&self) -> PrefetchStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PrefetchStatus> {
        self.status.clone()
    }

    /// Wait for the player task to end.
    pub async fn join(mut self) {
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for PrefetchPlayer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn drive<D, F>(
    mut streamer: PrefetchStreamer<D>,
    producer: F,
    mut commands: mpsc::Receiver<Command>,
    status: watch::Sender<PrefetchStatus>,
    cancel: CancellationToken,
) where
    D: OutputDevice,
    F: Future<Output = Result<ChunkStream, TtsError>>,
{
    tokio::pin!(producer);
    streamer.begin();

    let mut opening = true;
    let mut stream: Option<ChunkStream> = None;
    let mut ticker = tokio::time::interval(COMPLETION_POLL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!("Prefetch player cancelled");
                streamer.stop();
                status.send_replace(PrefetchStatus::Stopped);
                return;
            }
            command = commands.recv() => match command {
                Some(Command::Play(reply)) => {
                    let _ = reply.send(streamer.go_live());
                }
                Some(Command::Stop(ack)) => {
                    streamer.stop();
                    status.send_replace(PrefetchStatus::Stopped);
                    let _ = ack.send(());
                    return;
                }
                None => {
                    streamer.stop();
                    status.send_replace(PrefetchStatus::Stopped);
                    return;
                }
            },
            opened = &mut producer, if opening => {
                opening = false;
                match opened {
                    Ok(chunks) => stream = Some(chunks),
                    Err(e) => streamer.fail(&e),
                }
            }
            item = next_chunk(&mut stream) => match item {
                Some(Ok(chunk)) => streamer.push_chunk(chunk),
                Some(Err(e)) => {
                    streamer.fail(&e);
                    stream = None;
                }
                None => {
                    streamer.finish();
                    stream = None;
                }
            },
            _ = ticker.tick(), if streamer.is_live() => {}
        }

        let current = status_of(&mut streamer);
        status.send_if_modified(|s| {
            if *s == current {
                return false;
            }
            *s = current.clone();
            true
        });

        if current == PrefetchStatus::Finished {
            info!("Speech playback finished");
            streamer.finish_playback();
            return;
        }
    }
}

async fn next_chunk(stream: &mut Option<ChunkStream>) -> Option<Result<Bytes, TtsError>> {
    match stream {
        Some(chunks) => chunks.next().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{pcm_chunk, FakeClock, FakeOutputDevice, FakeSpeech};

    fn chunk(millis: u32) -> Bytes {
        pcm_chunk(2000, millis, OUTPUT_SAMPLE_RATE)
    }

    fn streamer() -> (FakeClock, FakeOutputDevice, PrefetchStreamer<FakeOutputDevice>) {
        let clock = FakeClock::new();
        let device = FakeOutputDevice::new(clock.clone());
        let streamer = PrefetchStreamer::new(device.clone());
        (clock, device, streamer)
    }

    #[test]
    fn test_chunks_buffer_until_live() {
        let (_clock, device, mut streamer) = streamer();
        streamer.begin();
        streamer.push_chunk(chunk(100));
        streamer.push_chunk(chunk(100));

        assert_eq!(streamer.pending_len(), 2);
        assert!(device.opened().is_empty());
        assert!(streamer.can_play());
    }

    #[test]
    fn test_go_live_flushes_in_order_from_now() {
        let (clock, device, mut streamer) = streamer();
        streamer.begin();
        streamer.push_chunk(pcm_chunk(1, 100, OUTPUT_SAMPLE_RATE));
        streamer.push_chunk(pcm_chunk(2, 200, OUTPUT_SAMPLE_RATE));
        streamer.push_chunk(pcm_chunk(3, 100, OUTPUT_SAMPLE_RATE));
        clock.set(5.0);

        streamer.go_live().unwrap();
        streamer.push_chunk(pcm_chunk(4, 100, OUTPUT_SAMPLE_RATE));

        let output = device.last_output().unwrap();
        assert_eq!(output.resume_count(), 1);
        let scheduled = output.scheduled();
        let firsts: Vec<f32> = scheduled.iter().map(|e| e.samples[0] * 32768.0).collect();
        assert_eq!(firsts, vec![1.0, 2.0, 3.0, 4.0]);
        for pair in scheduled.windows(2) {
            assert!((pair[1].start - pair[0].end()).abs() < 1e-12);
        }
        assert_eq!(scheduled[0].start, 5.0);
        assert_eq!(streamer.pending_len(), 0);
    }

    #[test]
    fn test_nothing_to_play_after_failed_producer() {
        let (_clock, device, mut streamer) = streamer();
        streamer.begin();
        streamer.fail(&TtsError::Http {
            status: 503,
            message: "overloaded".into(),
        });

        assert!(!streamer.can_play());
        assert_eq!(streamer.go_live(), Err(PlaybackError::NothingToPlay));
        assert!(device.opened().is_empty());
    }

    #[test]
    fn test_failed_producer_keeps_buffered_audio() {
        let (_clock, _device, mut streamer) = streamer();
        streamer.begin();
        streamer.push_chunk(chunk(100));
        streamer.fail(&TtsError::Stream("reset".into()));

        assert!(streamer.can_play());
        assert!(streamer.go_live().is_ok());
    }

    #[test]
    fn test_malformed_chunk_is_skipped() {
        let (_clock, device, mut streamer) = streamer();
        streamer.begin();
        streamer.push_chunk(Bytes::from_static(&[0, 1, 2]));
        streamer.push_chunk(chunk(100));
        streamer.go_live().unwrap();

        assert_eq!(device.last_output().unwrap().scheduled().len(), 1);
    }

    #[test]
    fn test_stop_silences_and_resets() {
        let (clock, device, mut streamer) = streamer();
        streamer.begin();
        streamer.push_chunk(chunk(500));
        clock.set(1.0);
        streamer.go_live().unwrap();
        streamer.push_chunk(chunk(500));

        streamer.stop();
        streamer.stop();

        let output = device.last_output().unwrap();
        assert!(output.is_closed());
        assert!(output.scheduled().iter().all(|e| e.stopped()));
        assert!(!streamer.is_live());
        assert_eq!(streamer.cursor().next_start_time(), 0.0);
        assert_eq!(streamer.producer_state(), &ProducerState::Idle);
    }

    #[test]
    fn test_device_failure_leaves_queue_intact() {
        let (_clock, device, mut streamer) = streamer();
        streamer.begin();
        streamer.push_chunk(chunk(100));
        device.fail_with(AudioError::NoDevicesFound);

        assert_eq!(
            streamer.go_live(),
            Err(PlaybackError::Device(AudioError::NoDevicesFound))
        );
        assert!(!streamer.is_live());
        assert_eq!(streamer.pending_len(), 1);
    }

    #[tokio::test]
    async fn test_player_buffers_then_plays_to_completion() {
        let clock = FakeClock::new();
        let device = FakeOutputDevice::new(clock.clone());
        let speech = FakeSpeech::scripted(vec![Ok(chunk(500)), Ok(chunk(500))]);
        let player = PrefetchPlayer::prefetch(device.clone(), speech, "Your baby may be hungry.");

        let mut status = player.subscribe();
        status
            .wait_for(|s| *s == PrefetchStatus::Ready { chunks: 2 })
            .await
            .unwrap();
        assert!(device.opened().is_empty());

        clock.set(3.0);
        player.play().await.unwrap();
        assert_eq!(device.last_output().unwrap().starts(), vec![3.0, 3.5]);

        clock.set(4.0);
        status
            .wait_for(|s| *s == PrefetchStatus::Finished)
            .await
            .unwrap();
        player.join().await;
        let output = device.last_output().unwrap();
        assert!(output.is_closed());
        assert!(output.was_drained());
    }

    #[tokio::test]
    async fn test_player_reports_unavailable_speech() {
        let device = FakeOutputDevice::new(FakeClock::new());
        let speech = FakeSpeech::failing(TtsError::Http {
            status: 404,
            message: "model not found".into(),
        });
        let player = PrefetchPlayer::prefetch(device.clone(), speech, "hello");

        let mut status = player.subscribe();
        let failed = status
            .wait_for(|s| matches!(s, PrefetchStatus::Failed(_)))
            .await
            .unwrap()
            .clone();
        assert!(!failed.can_play());
        assert_eq!(player.play().await, Err(PlaybackError::NothingToPlay));
        assert!(device.opened().is_empty());
    }

    #[tokio::test]
    async fn test_player_stop_releases_output() {
        let device = FakeOutputDevice::new(FakeClock::new());
        let (speech, tx) = FakeSpeech::channel();
        let player = PrefetchPlayer::prefetch(device.clone(), speech, "hello");

        tx.send(Ok(chunk(500))).unwrap();
        let mut status = player.subscribe();
        status
            .wait_for(|s| *s == PrefetchStatus::Buffering { chunks: 1 })
            .await
            .unwrap();
        player.play().await.unwrap();
        tx.send(Ok(chunk(500))).unwrap();

        player.stop().await;
        player.stop().await;

        let output = device.last_output().unwrap();
        assert!(output.is_closed());
        assert!(output.scheduled().iter().all(|e| e.stopped()));
        assert!(!output.was_drained());
        assert_eq!(player.status(), PrefetchStatus::Stopped);
        assert_eq!(player.play().await, Err(PlaybackError::Stopped));
    }
}
