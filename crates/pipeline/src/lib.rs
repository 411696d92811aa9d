//! # Storyloom Pipeline
//!
//! The four-stage generation orchestrator: director → (writer ∥
//! paint-director) → tts. One run turns a single user message into a
//! narrative turn, an optional illustration, and optional dialogue audio,
//! reporting progress through an ordered event stream and recording
//! per-stage telemetry through the `RunSink` collaborator.

pub mod dialogue;
pub mod event;
pub mod orchestrator;

pub use dialogue::{Dialogue, extract_dialogues};
pub use event::PipelineEvent;
pub use orchestrator::{Pipeline, RunRequest};
