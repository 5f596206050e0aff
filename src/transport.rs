//! Remote model seams
//!
//! The live session talks to a [`LiveConnector`]; the prefetch player reads
//! from a [`SpeechSource`]. Both are opaque: bytes in, byte chunks or
//! structured events out.

use crate::codec::INPUT_MIME_TYPE;
use crate::tts::TtsError;
use bytes::Bytes;
use futures_util::Stream;
use std::future::Future;
use std::pin::Pin;
use tokio::sync::mpsc;

/// Error raised by a live transport
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("failed to connect: {0}")]
    Connect(String),

    #[error("connection closed")]
    Closed,

    #[error("failed to send: {0}")]
    Send(String),
}

/// Requested response modality
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseModality {
    Audio,
}

impl ResponseModality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "AUDIO",
        }
    }
}

/// What to ask of the remote model when a live session opens.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveConfig {
    pub model: String,
    pub response_modality: ResponseModality,
    pub voice: String,
    pub system_instruction: String,
}

/// A piece of realtime input for the model.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaChunk {
    pub mime_type: String,
    pub data: Bytes,
}

impl MediaChunk {
    /// Encoded microphone audio at the input sample rate.
    pub fn microphone_pcm(data: impl Into<Bytes>) -> Self {
        Self {
            mime_type: INPUT_MIME_TYPE.to_string(),
            data: data.into(),
        }
    }
}

/// Parsed content of a server message.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// Raw 24 kHz PCM response audio
    Audio(Bytes),
    Text(String),
    InputTranscription(String),
    OutputTranscription(String),
    /// The model was interrupted and dropped its current answer
    Interrupted,
    TurnComplete,
}

/// Lifecycle and message notifications from a live transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Open,
    Message(ServerEvent),
    Close(Option<String>),
    Error(String),
}

/// Write half of an established live connection.
pub trait LiveTransport: Send {
    fn send_realtime_input(&mut self, chunk: MediaChunk) -> Result<(), TransportError>;

    /// Close without waiting for the remote side. Idempotent.
    fn close(&mut self);

    fn is_closed(&self) -> bool;
}

/// An established connection: the write half plus its event feed.
pub struct LiveLink {
    pub transport: Box<dyn LiveTransport>,
    pub events: mpsc::Receiver<TransportEvent>,
}

/// Opens live connections to the remote model.
pub trait LiveConnector: Send {
    fn connect(
        &mut self,
        config: &LiveConfig,
    ) -> impl Future<Output = Result<LiveLink, TransportError>> + Send;
}

/// Stream of raw 24 kHz PCM chunks of synthesized speech.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<Bytes, TtsError>> + Send>>;

/// Turns text into a lazily produced stream of speech audio.
pub trait SpeechSource: Send + Sync {
    fn open(&self, text: &str) -> impl Future<Output = Result<ChunkStream, TtsError>> + Send;
}
