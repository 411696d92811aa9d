//! Data model for pipeline run and stage execution records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Stage ─────────────────────────────────────────────────────────────────

/// The four generation stages of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// Scene outline generation.
    Director,
    /// Narrative generation.
    Writer,
    /// Image prompt generation + image call.
    PaintDirector,
    /// Dialogue audio synthesis.
    Tts,
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Director => write!(f, "director"),
            Self::Writer => write!(f, "writer"),
            Self::PaintDirector => write!(f, "paint_director"),
            Self::Tts => write!(f, "tts"),
        }
    }
}

/// Lifecycle status of one stage.
///
/// Terminal states are `Success`, `Skipped`, and `Error`. `Skipped` is
/// reachable only from `Pending` (the feature was disabled before the stage
/// ever started) and is mutually exclusive with `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Success,
    Skipped,
    Error,
}

impl StageStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Skipped | Self::Error)
    }
}

/// One stage execution within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    /// Unique record id.
    pub id: String,
    /// The run this stage belongs to.
    pub run_id: String,
    /// Which stage.
    pub stage: StageKind,
    /// Current lifecycle status.
    pub status: StageStatus,
    /// When the stage started.
    pub started_at: DateTime<Utc>,
    /// When the stage reached a terminal state.
    pub ended_at: Option<DateTime<Utc>>,
    /// Duration in milliseconds (set on completion).
    pub duration_ms: Option<u64>,
    /// Captured input text (prompt or upstream output).
    pub input: String,
    /// Captured output text.
    pub output: String,
    /// Prompt tokens consumed, best-effort.
    pub tokens_in: u32,
    /// Completion tokens produced, best-effort.
    pub tokens_out: u32,
    /// Error or skip reason, when terminal state is not success.
    pub error_message: Option<String>,
    /// Which endpoint served this stage.
    pub endpoint: Option<String>,
    /// Which preset shaped this stage's prompt.
    pub preset: Option<String>,
}

impl StageRecord {
    /// Create a running stage record.
    pub fn start(run_id: impl Into<String>, stage: StageKind, input: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            run_id: run_id.into(),
            stage,
            status: StageStatus::Running,
            started_at: Utc::now(),
            ended_at: None,
            duration_ms: None,
            input: input.into(),
            output: String::new(),
            tokens_in: 0,
            tokens_out: 0,
            error_message: None,
            endpoint: None,
            preset: None,
        }
    }

    /// Create a terminal skipped record (the stage never ran).
    pub fn skipped(run_id: impl Into<String>, stage: StageKind, reason: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            run_id: run_id.into(),
            stage,
            status: StageStatus::Skipped,
            started_at: now,
            ended_at: Some(now),
            duration_ms: Some(0),
            input: String::new(),
            output: String::new(),
            tokens_in: 0,
            tokens_out: 0,
            error_message: Some(reason.into()),
            endpoint: None,
            preset: None,
        }
    }

    /// Transition to a terminal state with captured output.
    pub fn complete(&mut self, status: StageStatus, output: impl Into<String>) {
        debug_assert!(status.is_terminal());
        let now = Utc::now();
        self.status = status;
        self.output = output.into();
        self.ended_at = Some(now);
        self.duration_ms = Some(
            now.signed_duration_since(self.started_at)
                .num_milliseconds()
                .max(0) as u64,
        );
    }

    /// Record best-effort token usage.
    pub fn record_tokens(&mut self, tokens_in: u32, tokens_out: u32) {
        self.tokens_in = tokens_in;
        self.tokens_out = tokens_out;
    }
}

// ── Run ───────────────────────────────────────────────────────────────────

/// Lifecycle status of a full run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    /// Every stage succeeded or was skipped.
    Success,
    /// A narrative was produced but some stage errored.
    Partial,
    /// Fatal failure before a narrative existed.
    Error,
}

/// One end-to-end pipeline invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    /// Unique run id.
    pub id: String,
    /// The chat session this run served.
    pub session_id: String,
    /// The triggering user message.
    pub user_message: String,
    /// Character in play, if any.
    pub character_id: Option<String>,
    /// Current status.
    pub status: RunStatus,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// Total wall-clock duration (set on finalize).
    pub total_duration_ms: Option<u64>,
    /// Aggregated prompt tokens across stages.
    pub total_tokens_in: u32,
    /// Aggregated completion tokens across stages.
    pub total_tokens_out: u32,
    /// Director outline.
    pub director_output: Option<String>,
    /// Writer narrative.
    pub writer_output: Option<String>,
    /// Generated image, if any.
    pub image_url: Option<String>,
    /// The prompt the image was generated from.
    pub image_prompt: Option<String>,
    /// Synthesized dialogue audio as JSON, if any.
    pub audio: Option<serde_json::Value>,
    /// Fatal error message, if the run errored.
    pub error_message: Option<String>,
}

impl RunRecord {
    /// Create a running run record.
    pub fn start(
        session_id: impl Into<String>,
        user_message: impl Into<String>,
        character_id: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            user_message: user_message.into(),
            character_id,
            status: RunStatus::Running,
            started_at: Utc::now(),
            total_duration_ms: None,
            total_tokens_in: 0,
            total_tokens_out: 0,
            director_output: None,
            writer_output: None,
            image_url: None,
            image_prompt: None,
            audio: None,
            error_message: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_kind_display() {
        assert_eq!(StageKind::Director.to_string(), "director");
        assert_eq!(StageKind::PaintDirector.to_string(), "paint_director");
        assert_eq!(StageKind::Tts.to_string(), "tts");
    }

    #[test]
    fn stage_lifecycle() {
        let mut record = StageRecord::start("run_1", StageKind::Writer, "outline text");
        assert_eq!(record.status, StageStatus::Running);
        assert!(record.ended_at.is_none());

        record.record_tokens(120, 340);
        record.complete(StageStatus::Success, "the narrative");
        assert_eq!(record.status, StageStatus::Success);
        assert_eq!(record.output, "the narrative");
        assert_eq!(record.tokens_out, 340);
        assert!(record.duration_ms.is_some());
    }

    #[test]
    fn skipped_is_terminal_without_running() {
        let record = StageRecord::skipped("run_1", StageKind::Tts, "disabled");
        assert_eq!(record.status, StageStatus::Skipped);
        assert!(record.status.is_terminal());
        assert_eq!(record.error_message.as_deref(), Some("disabled"));
        assert_eq!(record.duration_ms, Some(0));
    }

    #[test]
    fn terminal_states() {
        assert!(StageStatus::Success.is_terminal());
        assert!(StageStatus::Skipped.is_terminal());
        assert!(StageStatus::Error.is_terminal());
        assert!(!StageStatus::Pending.is_terminal());
        assert!(!StageStatus::Running.is_terminal());
    }

    #[test]
    fn run_record_starts_running() {
        let run = RunRecord::start("session_1", "hello", Some("char_1".into()));
        assert_eq!(run.status, RunStatus::Running);
        assert!(run.writer_output.is_none());
        assert!(run.total_duration_ms.is_none());
    }

    #[test]
    fn record_serialization_roundtrip() {
        let mut record = StageRecord::start("run_1", StageKind::Director, "user message");
        record.complete(StageStatus::Error, "boom");
        let json = serde_json::to_string(&record).unwrap();
        let back: StageRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.stage, StageKind::Director);
        assert_eq!(back.status, StageStatus::Error);
        assert_eq!(back.output, "boom");
    }
}
