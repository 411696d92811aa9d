//! Caller-visible pipeline events.
//!
//! `PipelineEvent` is the produced interface of a run: an ordered stream
//! carrying incremental chunks from the streaming stages, stage lifecycle
//! transitions, artifact references, and exactly one terminal event
//! (`RunComplete` or `Error`) per run.

use serde::{Deserialize, Serialize};
use storyloom_core::AudioRef;
use storyloom_telemetry::StageKind;

/// Events emitted during a pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    /// The run was accepted and recorded.
    RunStarted { run_id: String },

    /// A stage transitioned to running.
    StageStarted { stage: StageKind },

    /// Partial outline token from the director.
    DirectorChunk { content: String },

    /// The director's full outline.
    OutlineComplete { content: String },

    /// Partial narrative token from the writer.
    WriterChunk { content: String },

    /// Partial image-prompt token from the paint-director.
    PaintChunk { content: String },

    /// The generated illustration is available.
    ImageReady { url: String, prompt: String },

    /// Synthesized dialogue audio is available.
    AudioReady { items: Vec<AudioRef> },

    /// A stage reached a terminal state.
    StageComplete { stage: StageKind, duration_ms: u64 },

    /// A stage was skipped without starting.
    StageSkipped { stage: StageKind, reason: String },

    /// A stage failed; the run may still continue.
    StageError { stage: StageKind, message: String },

    /// The display-ready narrative after filtering.
    FinalText { content: String },

    /// Terminal: the run finalized with a usable outcome.
    RunComplete { run_id: String, duration_ms: u64 },

    /// Terminal: fatal failure, nothing usable was produced.
    Error { message: String },
}

impl PipelineEvent {
    /// Wire name for this event kind.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::RunStarted { .. } => "run_started",
            Self::StageStarted { .. } => "stage_started",
            Self::DirectorChunk { .. } => "director_chunk",
            Self::OutlineComplete { .. } => "outline_complete",
            Self::WriterChunk { .. } => "writer_chunk",
            Self::PaintChunk { .. } => "paint_chunk",
            Self::ImageReady { .. } => "image_ready",
            Self::AudioReady { .. } => "audio_ready",
            Self::StageComplete { .. } => "stage_complete",
            Self::StageSkipped { .. } => "stage_skipped",
            Self::StageError { .. } => "stage_error",
            Self::FinalText { .. } => "final_text",
            Self::RunComplete { .. } => "run_complete",
            Self::Error { .. } => "error",
        }
    }

    /// Whether this event ends the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::RunComplete { .. } | Self::Error { .. })
    }
}
