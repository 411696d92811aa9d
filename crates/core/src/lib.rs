//! # Storyloom Core
//!
//! Domain types, traits, and error definitions for the Storyloom narrative
//! pipeline. This crate has **zero framework dependencies** — it defines the
//! domain model that all other crates implement against.
//!
//! ## Design Philosophy
//!
//! Every external collaborator (LLM, image, audio, session persistence) is
//! defined as a trait here. Implementations live in their respective crates.
//! This enables:
//! - Swapping vendors via configuration
//! - Easy testing with mock/stub implementations
//! - Clean dependency graph (all crates depend inward on core)

pub mod adapter;
pub mod cancel;
pub mod character;
pub mod error;
pub mod message;
pub mod store;

// Re-export key types at crate root for ergonomics
pub use adapter::{
    AudioAdapter, AudioRef, GenerationParams, ImageAdapter, ImageRef, LlmAdapter, ModelEndpoint,
    StreamChunk, Usage,
};
pub use cancel::CancelToken;
pub use character::{Character, Persona};
pub use error::{AdapterError, Error, PipelineError, Result};
pub use message::{ChatSession, Message, Role, SessionId};
pub use store::{MemorySessionStore, SessionStore};
