//! Gemini Live API wire types
//!
//! Client and server messages exchanged over the BidiGenerateContent
//! WebSocket, and their translation into transport-neutral events.

use crate::transport::{LiveConfig, MediaChunk, ServerEvent, TransportError};
use base64::engine::general_purpose;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::Error as WsError;
use tracing::warn;

/// Error type for Gemini API operations
#[derive(Debug, thiserror::Error)]
pub enum GeminiError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Setup not complete")]
    SetupNotComplete,

    #[error("Timeout")]
    Timeout,
}

impl From<GeminiError> for TransportError {
    fn from(e: GeminiError) -> Self {
        match e {
            GeminiError::ConnectionClosed => TransportError::Closed,
            other => TransportError::Connect(other.to_string()),
        }
    }
}

/// Generation configuration for setup.
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub response_modalities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speech_config: Option<SpeechConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Serialize, Deserialize, Default, Clone)]
pub struct Content {
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<Blob>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    #[serde(default)]
    pub mime_type: String,
    pub data: String,
}

/// Session setup message.
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct BidiGenerateContentSetup {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_audio_transcription: Option<serde_json::Value>,
}

impl BidiGenerateContentSetup {
    pub fn from_config(config: &LiveConfig) -> Self {
        let model = if config.model.starts_with("models/") {
            config.model.clone()
        } else {
            format!("models/{}", config.model)
        };
        let system_instruction = (!config.system_instruction.is_empty()).then(|| Content {
            parts: vec![Part {
                text: Some(config.system_instruction.clone()),
                inline_data: None,
            }],
        });
        Self {
            model,
            generation_config: Some(GenerationConfig {
                response_modalities: vec![config.response_modality.as_str().to_string()],
                speech_config: Some(SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: config.voice.clone(),
                        },
                    },
                }),
            }),
            system_instruction,
            input_audio_transcription: Some(serde_json::json!({})),
            output_audio_transcription: Some(serde_json::json!({})),
        }
    }
}

/// A chunk of realtime input
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<Blob>,
}

impl From<&MediaChunk> for RealtimeInput {
    fn from(chunk: &MediaChunk) -> Self {
        Self {
            audio: Some(Blob {
                mime_type: chunk.mime_type.clone(),
                data: general_purpose::STANDARD.encode(&chunk.data),
            }),
        }
    }
}

/// Message sent from client to server.
#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(BidiGenerateContentSetup),
    RealtimeInput(RealtimeInput),
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct Transcription {
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub model_turn: Option<Content>,
    #[serde(default)]
    pub turn_complete: bool,
    #[serde(default)]
    pub interrupted: bool,
    #[serde(default)]
    pub input_transcription: Option<Transcription>,
    #[serde(default)]
    pub output_transcription: Option<Transcription>,
}

/// Server -> client message. Exactly one field is set per message.
#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default)]
    pub setup_complete: Option<serde_json::Value>,
    #[serde(default)]
    pub server_content: Option<ServerContent>,
    #[serde(default)]
    pub go_away: Option<serde_json::Value>,
}

impl ServerMessage {
    pub fn parse(text: &str) -> Result<Self, GeminiError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn is_setup_complete(&self) -> bool {
        self.setup_complete.is_some()
    }

    pub fn is_go_away(&self) -> bool {
        self.go_away.is_some()
    }

    /// Flatten server content into events, in the order the model sent them.
    ///
    /// Inline audio that is not valid base64 is dropped with a warning.
    pub fn into_events(self) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        let Some(content) = self.server_content else {
            return events;
        };

        if content.interrupted {
            events.push(ServerEvent::Interrupted);
        }
        if let Some(t) = content.input_transcription.filter(|t| !t.text.is_empty()) {
            events.push(ServerEvent::InputTranscription(t.text));
        }
        if let Some(turn) = content.model_turn {
            for part in turn.parts {
                if let Some(text) = part.text.filter(|t| !t.is_empty()) {
                    events.push(ServerEvent::Text(text));
                }
                if let Some(blob) = part.inline_data {
                    match general_purpose::STANDARD.decode(blob.data.as_bytes()) {
                        Ok(data) if !data.is_empty() => events.push(ServerEvent::Audio(Bytes::from(data))),
                        Ok(_) => {}
                        Err(e) => warn!("Failed to decode base64 audio data: {:?}", e),
                    }
                }
            }
        }
        if let Some(t) = content.output_transcription.filter(|t| !t.text.is_empty()) {
            events.push(ServerEvent::OutputTranscription(t.text));
        }
        if content.turn_complete {
            events.push(ServerEvent::TurnComplete);
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ResponseModality;

    fn live_config() -> LiveConfig {
        LiveConfig {
            model: "gemini-live-test".into(),
            response_modality: ResponseModality::Audio,
            voice: "Kore".into(),
            system_instruction: "You are a calm parenting assistant.".into(),
        }
    }

    #[test]
    fn test_setup_message_serialization() {
        let msg = ClientMessage::Setup(BidiGenerateContentSetup::from_config(&live_config()));
        let parsed: serde_json::Value = serde_json::to_value(&msg).unwrap();

        let setup = &parsed["setup"];
        assert_eq!(setup["model"], "models/gemini-live-test");
        assert_eq!(setup["generationConfig"]["responseModalities"][0], "AUDIO");
        assert_eq!(
            setup["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]["voiceName"],
            "Kore"
        );
        assert_eq!(
            setup["systemInstruction"]["parts"][0]["text"],
            "You are a calm parenting assistant."
        );
        assert!(setup.get("inputAudioTranscription").is_some());
    }

    #[test]
    fn test_empty_system_instruction_is_omitted() {
        let mut config = live_config();
        config.system_instruction.clear();
        config.model = "models/already-prefixed".into();
        let setup = BidiGenerateContentSetup::from_config(&config);
        let json = serde_json::to_value(&setup).unwrap();
        assert!(json.get("systemInstruction").is_none());
        assert_eq!(json["model"], "models/already-prefixed");
    }

    #[test]
    fn test_realtime_input_serialization() {
        let chunk = MediaChunk::microphone_pcm(vec![1u8, 2, 3, 4]);
        let msg = ClientMessage::RealtimeInput(RealtimeInput::from(&chunk));
        let parsed = serde_json::to_value(&msg).unwrap();

        assert_eq!(parsed["realtimeInput"]["audio"]["mimeType"], "audio/pcm;rate=16000");
        assert_eq!(
            parsed["realtimeInput"]["audio"]["data"],
            general_purpose::STANDARD.encode([1u8, 2, 3, 4])
        );
    }

    #[test]
    fn test_setup_complete_and_go_away() {
        let msg = ServerMessage::parse(r#"{"setupComplete": {}}"#).unwrap();
        assert!(msg.is_setup_complete());
        assert!(msg.into_events().is_empty());

        let msg = ServerMessage::parse(r#"{"goAway": {"timeLeft": "5s"}}"#).unwrap();
        assert!(msg.is_go_away());
    }

    #[test]
    fn test_server_content_events() {
        let audio = general_purpose::STANDARD.encode([1u8, 0, 2, 0]);
        let text = serde_json::json!({
            "serverContent": {
                "modelTurn": {
                    "parts": [
                        {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": audio}},
                        {"text": "It sounds like a hunger cry."}
                    ]
                },
                "outputTranscription": {"text": "It sounds like"},
                "turnComplete": true
            }
        })
        .to_string();

        let events = ServerMessage::parse(&text).unwrap().into_events();
        assert_eq!(
            events,
            vec![
                ServerEvent::Audio(Bytes::from_static(&[1, 0, 2, 0])),
                ServerEvent::Text("It sounds like a hunger cry.".into()),
                ServerEvent::OutputTranscription("It sounds like".into()),
                ServerEvent::TurnComplete,
            ]
        );
    }

    #[test]
    fn test_interrupted_and_bad_base64() {
        let text = serde_json::json!({
            "serverContent": {
                "interrupted": true,
                "modelTurn": {"parts": [{"inlineData": {"data": "%%%not-base64"}}]}
            }
        })
        .to_string();

        let events = ServerMessage::parse(&text).unwrap().into_events();
        assert_eq!(events, vec![ServerEvent::Interrupted]);
    }
}
