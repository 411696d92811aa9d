//! Adapter traits — the abstractions over external generation vendors.
//!
//! An LlmAdapter knows how to send a message list to a chat-completion
//! endpoint and stream tokens back. Image and audio adapters turn a prompt
//! or a dialogue line into a hosted artifact reference. The pipeline only
//! ever talks to these traits; vendor specifics live in the providers crate.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::cancel::CancelToken;
use crate::error::AdapterError;
use crate::message::{Message, Role};

/// A resolved LLM endpoint: where to send requests and as whom.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEndpoint {
    /// Stable identifier (referenced from pipeline configuration)
    pub id: String,

    /// Human-readable name
    pub name: String,

    /// Base URL, e.g. "https://api.openai.com/v1"
    pub base_url: String,

    /// Bearer token. Decryption-at-rest is the persistence layer's concern;
    /// by the time an endpoint reaches an adapter the key is plaintext.
    pub api_key: String,

    /// Model to request (e.g. "gpt-4o", "anthropic/claude-sonnet-4")
    pub model: String,
}

/// Sampling parameters for one generation call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f32>,

    /// Ask the model for reasoning/thinking deltas where supported.
    #[serde(default)]
    pub enable_thinking: bool,
}

fn default_temperature() -> f32 {
    0.7
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            max_tokens: None,
            top_p: None,
            frequency_penalty: None,
            presence_penalty: None,
            enable_thinking: false,
        }
    }
}

/// Token usage information.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// A single chunk in a streaming completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChunk {
    /// Partial content delta
    #[serde(default)]
    pub content: Option<String>,

    /// Whether this is the final chunk
    #[serde(default)]
    pub done: bool,

    /// Usage info (typically only in the final chunk)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

/// A simple (role, content) pair for building request message lists without
/// allocating full session `Message` records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
}

impl ChatTurn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

impl From<&Message> for ChatTurn {
    fn from(m: &Message) -> Self {
        Self::new(m.role, m.content.clone())
    }
}

/// The LLM adapter trait.
///
/// Every chat-completion vendor implements this. The pipeline calls
/// `stream()` or `complete()` without knowing which vendor is behind it.
#[async_trait]
pub trait LlmAdapter: Send + Sync {
    /// A human-readable name for this adapter (e.g. "openai-compat").
    fn name(&self) -> &str;

    /// Send a request and get a complete response.
    async fn complete(
        &self,
        messages: &[ChatTurn],
        endpoint: &ModelEndpoint,
        params: &GenerationParams,
    ) -> std::result::Result<String, AdapterError>;

    /// Send a request and get a stream of response chunks.
    ///
    /// The `cancel` token is checked between chunks; once set, the adapter
    /// stops consuming the vendor stream and closes the channel. Callers
    /// treat whatever accumulated as the final output.
    async fn stream(
        &self,
        messages: &[ChatTurn],
        endpoint: &ModelEndpoint,
        params: &GenerationParams,
        cancel: CancelToken,
    ) -> std::result::Result<
        tokio::sync::mpsc::Receiver<std::result::Result<StreamChunk, AdapterError>>,
        AdapterError,
    >;
}

/// Reference to a generated image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    /// URL or path where the image is reachable
    pub url: String,
}

/// The image generation adapter trait.
#[async_trait]
pub trait ImageAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// Generate an image from the given prompt, scoped to a session for
    /// artifact bookkeeping.
    async fn generate(
        &self,
        prompt: &str,
        session_id: &str,
    ) -> std::result::Result<ImageRef, AdapterError>;
}

/// Reference to a synthesized audio clip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioRef {
    /// The speaking character
    pub speaker: String,

    /// Emotion tag carried through from dialogue extraction
    #[serde(default)]
    pub emotion: String,

    /// URL or path where the audio is reachable
    pub url: String,
}

/// The audio synthesis adapter trait.
#[async_trait]
pub trait AudioAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// Synthesize one dialogue line in the given speaker's voice.
    async fn synthesize(
        &self,
        text: &str,
        speaker: &str,
        session_id: &str,
    ) -> std::result::Result<AudioRef, AdapterError>;
}
