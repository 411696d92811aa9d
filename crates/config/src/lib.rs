//! Configuration loading and validation for the Storyloom pipeline.
//!
//! Loads a TOML file describing which endpoints serve each pipeline stage
//! and which optional stages are enabled. Missing director/writer endpoints
//! are reported by `validate()` — the pipeline treats them as precondition
//! failures and never starts a run.

use serde::{Deserialize, Serialize};
use std::path::Path;
use storyloom_core::ModelEndpoint;
use thiserror::Error;

/// Errors from loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// One stage's LLM binding: an endpoint plus the preset shaping its prompt.
#[derive(Clone, Serialize, Deserialize)]
pub struct StageLlmConfig {
    /// The endpoint serving this stage
    #[serde(flatten)]
    pub endpoint: ModelEndpoint,

    /// Preset id resolved by the caller at run time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preset_id: Option<String>,
}

impl std::fmt::Debug for StageLlmConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageLlmConfig")
            .field("endpoint_id", &self.endpoint.id)
            .field("base_url", &self.endpoint.base_url)
            .field("model", &self.endpoint.model)
            .field("api_key", &"[REDACTED]")
            .field("preset_id", &self.preset_id)
            .finish()
    }
}

/// Image backend binding.
#[derive(Clone, Serialize, Deserialize)]
pub struct ImageBackendConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    #[serde(default = "default_image_size")]
    pub size: String,
}

fn default_image_size() -> String {
    "1024x1024".into()
}

impl std::fmt::Debug for ImageBackendConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageBackendConfig")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

/// Speech synthesis backend binding.
#[derive(Clone, Serialize, Deserialize)]
pub struct TtsBackendConfig {
    #[serde(default = "default_tts_url")]
    pub base_url: String,
    pub api_key: String,
    #[serde(default = "default_tts_model")]
    pub model_id: String,
    #[serde(default)]
    pub default_voice_id: String,
    #[serde(default = "default_stability")]
    pub stability: f32,
    #[serde(default = "default_similarity")]
    pub similarity_boost: f32,
    #[serde(default = "default_speed")]
    pub speed: f32,
}

fn default_tts_url() -> String {
    "https://api.elevenlabs.io/v1".into()
}

fn default_tts_model() -> String {
    "eleven_multilingual_v2".into()
}

fn default_stability() -> f32 {
    0.5
}

fn default_similarity() -> f32 {
    0.75
}

fn default_speed() -> f32 {
    1.0
}

impl std::fmt::Debug for TtsBackendConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TtsBackendConfig")
            .field("base_url", &self.base_url)
            .field("model_id", &self.model_id)
            .field("default_voice_id", &self.default_voice_id)
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

/// The root pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Director stage binding (required to run)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub director: Option<StageLlmConfig>,

    /// Writer stage binding (required to run)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub writer: Option<StageLlmConfig>,

    /// Whether the paint-director stage runs at all
    #[serde(default = "default_true")]
    pub enable_paint: bool,

    /// Paint-director stage binding
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub painter: Option<StageLlmConfig>,

    /// Image backend binding
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageBackendConfig>,

    /// Whether the tts stage runs at all
    #[serde(default = "default_true")]
    pub enable_tts: bool,

    /// Speech synthesis binding
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tts: Option<TtsBackendConfig>,

    /// Capacity of the caller-visible event channel
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_true() -> bool {
    true
}

fn default_event_capacity() -> usize {
    256
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            director: None,
            writer: None,
            enable_paint: true,
            painter: None,
            image: None,
            enable_tts: true,
            tts: None,
            event_capacity: default_event_capacity(),
        }
    }
}

impl PipelineConfig {
    /// Parse from a TOML string.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    /// Load from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    /// Collect every problem that would stop a run from starting.
    ///
    /// Missing paint/tts backends are not listed here: those degrade the
    /// affected stage at run time instead of blocking the pipeline.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.director.is_none() {
            problems.push("Director LLM endpoint is not configured".into());
        }
        if self.writer.is_none() {
            problems.push("Writer LLM endpoint is not configured".into());
        }
        if self.event_capacity == 0 {
            problems.push("event_capacity must be at least 1".into());
        }
        problems
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [director]
        id = "dir"
        name = "director"
        base_url = "https://api.example.com/v1"
        api_key = "sk-dir"
        model = "gpt-4o-mini"

        [writer]
        id = "wri"
        name = "writer"
        base_url = "https://api.example.com/v1"
        api_key = "sk-wri"
        model = "gpt-4o"
    "#;

    #[test]
    fn minimal_config_parses_and_validates() {
        let config = PipelineConfig::from_toml_str(MINIMAL).unwrap();
        assert!(config.validate().is_empty());
        assert!(config.enable_paint);
        assert!(config.enable_tts);
        assert_eq!(config.event_capacity, 256);
        assert_eq!(config.director.unwrap().endpoint.model, "gpt-4o-mini");
    }

    #[test]
    fn missing_required_stages_reported() {
        let config = PipelineConfig::from_toml_str("enable_paint = false").unwrap();
        let problems = config.validate();
        assert_eq!(problems.len(), 2);
        assert!(problems[0].contains("Director"));
        assert!(problems[1].contains("Writer"));
    }

    #[test]
    fn zero_capacity_rejected() {
        let mut config = PipelineConfig::from_toml_str(MINIMAL).unwrap();
        config.event_capacity = 0;
        assert_eq!(config.validate().len(), 1);
    }

    #[test]
    fn optional_backends_parse() {
        let raw = format!(
            "{MINIMAL}\n\
             [image]\n\
             base_url = \"https://api.example.com/v1\"\n\
             api_key = \"sk-img\"\n\
             model = \"dall-e-3\"\n\n\
             [tts]\n\
             api_key = \"el-key\"\n\
             default_voice_id = \"voice_1\"\n"
        );
        let config = PipelineConfig::from_toml_str(&raw).unwrap();
        let image = config.image.unwrap();
        assert_eq!(image.size, "1024x1024");
        let tts = config.tts.unwrap();
        assert!((tts.stability - 0.5).abs() < f32::EPSILON);
        assert_eq!(tts.model_id, "eleven_multilingual_v2");
    }

    #[test]
    fn debug_redacts_api_keys() {
        let config = PipelineConfig::from_toml_str(MINIMAL).unwrap();
        let debug = format!("{:?}", config.director.unwrap());
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("sk-dir"));
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.toml");
        std::fs::write(&path, MINIMAL).unwrap();

        let config = PipelineConfig::load(&path).unwrap();
        assert!(config.validate().is_empty());
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = PipelineConfig::load("/nonexistent/pipeline.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
