//! ElevenLabs-style speech synthesis adapter.
//!
//! Synthesizes one dialogue line per call, saves the returned audio under
//! the configured media directory, and hands back a serving path. Voice
//! selection is per speaking character with a default fallback.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use storyloom_core::adapter::{AudioAdapter, AudioRef};
use storyloom_core::AdapterError;
use tracing::{debug, warn};

/// Configuration for the synthesis backend.
#[derive(Debug, Clone)]
pub struct TtsEndpoint {
    /// e.g. "https://api.elevenlabs.io/v1"
    pub base_url: String,
    pub api_key: String,
    /// Vendor model, e.g. "eleven_multilingual_v2"
    pub model_id: String,
    /// Voice used when a speaker has no mapping
    pub default_voice_id: String,
    /// Voice stability in [0,1]
    pub stability: f32,
    /// Similarity boost in [0,1]
    pub similarity_boost: f32,
    /// Playback speed multiplier
    pub speed: f32,
}

impl Default for TtsEndpoint {
    fn default() -> Self {
        Self {
            base_url: "https://api.elevenlabs.io/v1".into(),
            api_key: String::new(),
            model_id: "eleven_multilingual_v2".into(),
            default_voice_id: String::new(),
            stability: 0.5,
            similarity_boost: 0.75,
            speed: 1.0,
        }
    }
}

/// ElevenLabs-compatible synthesis adapter.
pub struct ElevenLabsAdapter {
    endpoint: TtsEndpoint,
    /// character name → voice id
    voices: HashMap<String, String>,
    /// Where synthesized clips are written
    media_dir: PathBuf,
    client: reqwest::Client,
}

impl ElevenLabsAdapter {
    pub fn new(endpoint: TtsEndpoint, media_dir: impl Into<PathBuf>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .expect("Failed to create HTTP client");
        Self {
            endpoint,
            voices: HashMap::new(),
            media_dir: media_dir.into(),
            client,
        }
    }

    /// Map a speaking character to a specific voice.
    pub fn with_voice(mut self, character: impl Into<String>, voice_id: impl Into<String>) -> Self {
        self.voices.insert(character.into(), voice_id.into());
        self
    }

    fn voice_for(&self, speaker: &str) -> &str {
        self.voices
            .get(speaker)
            .map(String::as_str)
            .unwrap_or(&self.endpoint.default_voice_id)
    }
}

#[async_trait]
impl AudioAdapter for ElevenLabsAdapter {
    fn name(&self) -> &str {
        "elevenlabs"
    }

    async fn synthesize(
        &self,
        text: &str,
        speaker: &str,
        session_id: &str,
    ) -> std::result::Result<AudioRef, AdapterError> {
        let voice_id = self.voice_for(speaker);
        if voice_id.is_empty() {
            return Err(AdapterError::NotConfigured(format!(
                "No voice configured for '{speaker}' and no default voice set"
            )));
        }

        let url = format!(
            "{}/text-to-speech/{}",
            self.endpoint.base_url.trim_end_matches('/'),
            voice_id
        );

        debug!(speaker, voice = voice_id, text_len = text.len(), "Synthesizing dialogue line");

        let response = self
            .client
            .post(&url)
            .header("xi-api-key", &self.endpoint.api_key)
            .header("Content-Type", "application/json")
            .json(&serde_json::json!({
                "text": text,
                "model_id": self.endpoint.model_id,
                "voice_settings": {
                    "stability": self.endpoint.stability,
                    "similarity_boost": self.endpoint.similarity_boost,
                    "speed": self.endpoint.speed,
                },
            }))
            .send()
            .await
            .map_err(|e| AdapterError::Network(e.to_string()))?;

        let status = response.status().as_u16();
        if status != 200 {
            let body = response.text().await.unwrap_or_default();
            warn!(status, speaker, "Speech synthesis failed");
            return Err(AdapterError::ApiError {
                status_code: status,
                message: body,
            });
        }

        let audio_bytes = response
            .bytes()
            .await
            .map_err(|e| AdapterError::Network(e.to_string()))?;

        let filename = format!("{}.mp3", uuid::Uuid::new_v4());
        let dir = self.media_dir.join(session_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| AdapterError::Network(format!("Failed to create media dir: {e}")))?;
        tokio::fs::write(dir.join(&filename), &audio_bytes)
            .await
            .map_err(|e| AdapterError::Network(format!("Failed to write audio file: {e}")))?;

        Ok(AudioRef {
            speaker: speaker.to_string(),
            emotion: String::new(),
            url: format!("/files/audio/{session_id}/{filename}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn voice_mapping_with_fallback() {
        let endpoint = TtsEndpoint {
            default_voice_id: "default_voice".into(),
            ..TtsEndpoint::default()
        };
        let adapter =
            ElevenLabsAdapter::new(endpoint, "/tmp/media").with_voice("Mira", "mira_voice");

        assert_eq!(adapter.voice_for("Mira"), "mira_voice");
        assert_eq!(adapter.voice_for("Unknown"), "default_voice");
    }

    #[tokio::test]
    async fn missing_voice_is_not_configured() {
        let adapter = ElevenLabsAdapter::new(TtsEndpoint::default(), "/tmp/media");
        let err = adapter.synthesize("line", "Nobody", "session").await.unwrap_err();
        assert!(matches!(err, AdapterError::NotConfigured(_)));
    }

    #[test]
    fn default_endpoint_settings() {
        let endpoint = TtsEndpoint::default();
        assert!((endpoint.stability - 0.5).abs() < f32::EPSILON);
        assert!((endpoint.similarity_boost - 0.75).abs() < f32::EPSILON);
        assert!(endpoint.base_url.contains("elevenlabs"));
    }
}
