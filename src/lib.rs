//! Robeen - streaming speech playback and live voice sessions
//!
//! Two pipelines share the codec and the gapless scheduler: a prefetching
//! player for synthesized speech, and a bidirectional live session with the
//! Gemini Live API. Audio devices, the live transport and the speech source
//! are injected as traits so the core runs against fakes in tests.

#![forbid(unsafe_code)]

/// Audio capability traits and device listing
pub mod audio;
pub mod codec;
pub mod config;
pub mod events;
/// Gemini Live wire types
pub mod gemini;
/// Gemini Live WebSocket client
pub mod gemini_client;
pub mod media_in;
pub mod media_out;
pub mod prefetch;
pub mod retry;
pub mod scheduler;
pub mod session;
pub mod sse;
pub mod testing;
pub mod transport;
/// Streaming text-to-speech
pub mod tts;
pub mod volume;
