//! # Storyloom Providers
//!
//! Vendor adapter implementations for the three generation backends the
//! pipeline consumes: an OpenAI-compatible chat-completion adapter
//! (streaming and non-streaming), an OpenAI-style image generation adapter,
//! and an ElevenLabs-style speech synthesis adapter.
//!
//! All adapters implement the traits defined in `storyloom-core`; the
//! pipeline never sees vendor specifics.

pub mod image;
pub mod openai_compat;
pub mod tts;

pub use image::OpenAiImageAdapter;
pub use openai_compat::OpenAiCompatAdapter;
pub use tts::ElevenLabsAdapter;
