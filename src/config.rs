//! Runtime configuration, read from the environment.

use crate::transport::{LiveConfig, ResponseModality};
use crate::tts::{GeminiSpeechConfig, DEFAULT_TTS_MODEL};

pub const DEFAULT_LIVE_MODEL: &str = "models/gemini-2.5-flash-native-audio-preview-09-2025";
pub const DEFAULT_VOICE: &str = "Kore";
pub const DEFAULT_SYSTEM_INSTRUCTION: &str = "You are Robeen, a calm and supportive assistant for \
new parents. Speak warmly and briefly. Help the parent understand why their baby might be crying \
and suggest gentle, practical next steps. Recommend contacting a doctor when something sounds \
medically concerning.";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("GEMINI_API_KEY is not set")]
    MissingApiKey,
}

#[derive(Debug, Clone)]
pub struct RobeenConfig {
    pub api_key: String,
    pub live_model: String,
    pub tts_model: String,
    pub voice: String,
    pub system_instruction: String,
}

impl Default for RobeenConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            live_model: DEFAULT_LIVE_MODEL.to_string(),
            tts_model: DEFAULT_TTS_MODEL.to_string(),
            voice: DEFAULT_VOICE.to_string(),
            system_instruction: DEFAULT_SYSTEM_INSTRUCTION.to_string(),
        }
    }
}

impl RobeenConfig {
    /// Read `GEMINI_API_KEY` and the optional `ROBEEN_*` overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let api_key = var("GEMINI_API_KEY").ok_or(ConfigError::MissingApiKey)?;
        let defaults = Self::default();
        Ok(Self {
            api_key,
            live_model: var("ROBEEN_LIVE_MODEL").unwrap_or(defaults.live_model),
            tts_model: var("ROBEEN_TTS_MODEL").unwrap_or(defaults.tts_model),
            voice: var("ROBEEN_VOICE").unwrap_or(defaults.voice),
            system_instruction: var("ROBEEN_SYSTEM_INSTRUCTION")
                .unwrap_or(defaults.system_instruction),
        })
    }

    pub fn live_config(&self) -> LiveConfig {
        LiveConfig {
            model: self.live_model.clone(),
            response_modality: ResponseModality::Audio,
            voice: self.voice.clone(),
            system_instruction: self.system_instruction.clone(),
        }
    }

    pub fn speech_config(&self) -> GeminiSpeechConfig {
        GeminiSpeechConfig {
            api_key: self.api_key.clone(),
            model: self.tts_model.clone(),
            voice: self.voice.clone(),
            ..GeminiSpeechConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_api_key_is_required() {
        assert_eq!(
            RobeenConfig::from_lookup(lookup(&[])).unwrap_err(),
            ConfigError::MissingApiKey
        );
        assert_eq!(
            RobeenConfig::from_lookup(lookup(&[("GEMINI_API_KEY", "  ")])).unwrap_err(),
            ConfigError::MissingApiKey
        );
    }

    #[test]
    fn test_defaults_and_overrides() {
        let config = RobeenConfig::from_lookup(lookup(&[
            ("GEMINI_API_KEY", "secret"),
            ("ROBEEN_VOICE", "Puck"),
        ]))
        .unwrap();

        assert_eq!(config.live_model, DEFAULT_LIVE_MODEL);
        assert_eq!(config.tts_model, DEFAULT_TTS_MODEL);

        let live = config.live_config();
        assert_eq!(live.voice, "Puck");
        assert_eq!(live.response_modality, ResponseModality::Audio);
        assert_eq!(live.system_instruction, DEFAULT_SYSTEM_INSTRUCTION);

        let speech = config.speech_config();
        assert_eq!(speech.api_key, "secret");
        assert_eq!(speech.voice, "Puck");
    }
}
