//! Streaming text-to-speech producer
//!
//! Calls Gemini's `streamGenerateContent` with the AUDIO modality and turns
//! the SSE response into a stream of raw 24 kHz PCM chunks, one per
//! `inlineData` part.

use crate::retry::{with_backoff, RetryPolicy};
use crate::sse::{SseEvent, SseLineParser};
use crate::transport::{ChunkStream, SpeechSource};
use base64::engine::general_purpose;
use base64::Engine;
use bytes::Bytes;
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use std::collections::VecDeque;
use tracing::{debug, info, warn};

pub const DEFAULT_TTS_MODEL: &str = "gemini-2.5-flash-preview-tts";
pub const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com";

/// Error type for speech synthesis requests
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TtsError {
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("request failed: {0}")]
    Request(String),

    #[error("invalid response: {0}")]
    Decode(String),

    #[error("stream interrupted: {0}")]
    Stream(String),
}

impl TtsError {
    /// Quota exhaustion or an overloaded backend.
    pub fn is_retryable(&self) -> bool {
        match self {
            TtsError::Http { status, message } => {
                matches!(status, 429 | 503)
                    || message.contains("RESOURCE_EXHAUSTED")
                    || message.contains("UNAVAILABLE")
                    || message.to_lowercase().contains("overloaded")
            }
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            TtsError::Http { status, message } => {
                *status == 404 || message.to_lowercase().contains("not found")
            }
            _ => false,
        }
    }
}

/// Configuration for the speech client
#[derive(Debug, Clone)]
pub struct GeminiSpeechConfig {
    pub api_base: String,
    pub api_key: String,
    pub model: String,
    pub voice: String,
    pub retry: RetryPolicy,
}

impl Default for GeminiSpeechConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            api_key: String::new(),
            model: DEFAULT_TTS_MODEL.to_string(),
            voice: "Kore".to_string(),
            retry: RetryPolicy::default(),
        }
    }
}

/// Gemini speech synthesis over streaming HTTP.
#[derive(Debug, Clone)]
pub struct GeminiSpeech {
    client: reqwest::Client,
    config: GeminiSpeechConfig,
}

impl GeminiSpeech {
    pub fn new(config: GeminiSpeechConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/v1beta/models/{}:streamGenerateContent?alt=sse",
            self.config.api_base.trim_end_matches('/'),
            self.config.model.trim_start_matches("models/")
        )
    }

    fn request_body(&self, text: &str) -> serde_json::Value {
        json!({
            "contents": [{ "parts": [{ "text": text }] }],
            "generationConfig": {
                "responseModalities": ["AUDIO"],
                "speechConfig": {
                    "voiceConfig": {
                        "prebuiltVoiceConfig": { "voiceName": self.config.voice }
                    }
                }
            }
        })
    }

    async fn send(&self, body: &serde_json::Value) -> Result<reqwest::Response, TtsError> {
        let response = self
            .client
            .post(self.endpoint())
            .header("x-goog-api-key", &self.config.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| TtsError::Request(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let text = response.text().await.unwrap_or_default();
        let message = match serde_json::from_str::<ErrorEnvelope>(&text) {
            Ok(envelope) => format!("{} {}", envelope.error.status, envelope.error.message),
            Err(_) => text,
        };
        Err(TtsError::Http {
            status: status.as_u16(),
            message,
        })
    }
}

impl SpeechSource for GeminiSpeech {
    async fn open(&self, text: &str) -> Result<ChunkStream, TtsError> {
        info!("Requesting speech for {} characters", text.chars().count());
        let body = self.request_body(text);
        let response = with_backoff(self.config.retry, || self.send(&body)).await?;
        Ok(audio_chunks(response.bytes_stream().boxed()))
    }
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ApiErrorBody,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentChunk {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Default, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
}

#[derive(Debug, Default, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CandidatePart {
    #[serde(default)]
    inline_data: Option<InlineData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    data: String,
    #[serde(default)]
    mime_type: String,
}

struct SseAudio {
    body: BoxStream<'static, reqwest::Result<Bytes>>,
    parser: SseLineParser,
    ready: VecDeque<Result<Bytes, TtsError>>,
    finished: bool,
}

impl SseAudio {
    fn queue_event(&mut self, event: SseEvent) {
        let chunk: GenerateContentChunk = match serde_json::from_str(&event.data) {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!("Skipping unparseable speech event: {}", e);
                return;
            }
        };

        let parts = chunk
            .candidates
            .into_iter()
            .filter_map(|candidate| candidate.content)
            .flat_map(|content| content.parts);
        for part in parts {
            let Some(inline) = part.inline_data else {
                continue;
            };
            match general_purpose::STANDARD.decode(inline.data.as_bytes()) {
                Ok(data) if !data.is_empty() => {
                    debug!("Speech chunk: {} bytes ({})", data.len(), inline.mime_type);
                    self.ready.push_back(Ok(Bytes::from(data)));
                }
                Ok(_) => {}
                Err(e) => warn!("Skipping speech chunk with bad base64: {}", e),
            }
        }
    }
}

/// Adapt an SSE byte stream into PCM chunks.
fn audio_chunks(body: BoxStream<'static, reqwest::Result<Bytes>>) -> ChunkStream {
    let state = SseAudio {
        body,
        parser: SseLineParser::new(),
        ready: VecDeque::new(),
        finished: false,
    };

    Box::pin(stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.ready.pop_front() {
                return Some((item, state));
            }
            if state.finished {
                return None;
            }
            match state.body.next().await {
                Some(Ok(bytes)) => {
                    for event in state.parser.push(&bytes) {
                        state.queue_event(event);
                    }
                }
                Some(Err(e)) => {
                    state.ready.push_back(Err(TtsError::Stream(e.to_string())));
                    state.finished = true;
                }
                None => {
                    if let Some(event) = state.parser.flush() {
                        state.queue_event(event);
                    }
                    state.finished = true;
                }
            }
        }
    }))
}
