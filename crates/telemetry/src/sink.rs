//! The `RunSink` collaborator trait and its in-memory implementation.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::model::{RunRecord, RunStatus, StageKind, StageRecord, StageStatus};

/// Boxed error for sink implementations; the orchestrator treats every sink
/// failure as non-fatal and only logs it.
pub type SinkError = Box<dyn std::error::Error + Send + Sync>;
pub type SinkResult<T> = std::result::Result<T, SinkError>;

/// Final payload handed to the sink when a run reaches a terminal state.
#[derive(Debug, Clone, Default)]
pub struct RunOutcome {
    pub director_output: Option<String>,
    pub writer_output: Option<String>,
    pub image_url: Option<String>,
    pub image_prompt: Option<String>,
    pub audio: Option<serde_json::Value>,
    pub error_message: Option<String>,
}

/// Append-only telemetry sink for pipeline runs.
///
/// All methods are fire-and-forget from the orchestrator's perspective:
/// a failure is logged by the caller and never aborts the run.
#[async_trait]
pub trait RunSink: Send + Sync {
    /// Record a new run. Returns the run id.
    async fn create_run(
        &self,
        session_id: &str,
        user_message: &str,
        character_id: Option<&str>,
    ) -> SinkResult<String>;

    /// Record a stage entering `Running`. Returns the stage record id.
    async fn start_stage(
        &self,
        run_id: &str,
        stage: StageKind,
        input: &str,
        endpoint: Option<&str>,
        preset: Option<&str>,
    ) -> SinkResult<String>;

    /// Transition a stage to a terminal state with captured output.
    async fn complete_stage(
        &self,
        stage_id: &str,
        status: StageStatus,
        output: &str,
        tokens_in: u32,
        tokens_out: u32,
        error_message: Option<&str>,
    ) -> SinkResult<()>;

    /// Record a stage as skipped without ever starting it.
    async fn skip_stage(&self, run_id: &str, stage: StageKind, reason: &str) -> SinkResult<()>;

    /// Finalize the run, aggregating per-stage token counts.
    async fn complete_run(
        &self,
        run_id: &str,
        status: RunStatus,
        total_duration_ms: u64,
        outcome: RunOutcome,
    ) -> SinkResult<()>;
}

/// In-memory sink for tests and embedded use.
#[derive(Default)]
pub struct MemorySink {
    runs: Arc<RwLock<HashMap<String, RunRecord>>>,
    stages: Arc<RwLock<Vec<StageRecord>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All runs, newest first.
    pub async fn runs(&self) -> Vec<RunRecord> {
        let mut runs: Vec<RunRecord> = self.runs.read().await.values().cloned().collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs
    }

    /// One run plus its stage records in execution order.
    pub async fn run_details(&self, run_id: &str) -> Option<(RunRecord, Vec<StageRecord>)> {
        let run = self.runs.read().await.get(run_id).cloned()?;
        let stages: Vec<StageRecord> = self
            .stages
            .read()
            .await
            .iter()
            .filter(|s| s.run_id == run_id)
            .cloned()
            .collect();
        Some((run, stages))
    }

    /// Drop all records.
    pub async fn clear(&self) {
        self.runs.write().await.clear();
        self.stages.write().await.clear();
    }
}

#[async_trait]
impl RunSink for MemorySink {
    async fn create_run(
        &self,
        session_id: &str,
        user_message: &str,
        character_id: Option<&str>,
    ) -> SinkResult<String> {
        let run = RunRecord::start(session_id, user_message, character_id.map(String::from));
        let id = run.id.clone();
        self.runs.write().await.insert(id.clone(), run);
        Ok(id)
    }

    async fn start_stage(
        &self,
        run_id: &str,
        stage: StageKind,
        input: &str,
        endpoint: Option<&str>,
        preset: Option<&str>,
    ) -> SinkResult<String> {
        let mut record = StageRecord::start(run_id, stage, input);
        record.endpoint = endpoint.map(String::from);
        record.preset = preset.map(String::from);
        let id = record.id.clone();
        self.stages.write().await.push(record);
        Ok(id)
    }

    async fn complete_stage(
        &self,
        stage_id: &str,
        status: StageStatus,
        output: &str,
        tokens_in: u32,
        tokens_out: u32,
        error_message: Option<&str>,
    ) -> SinkResult<()> {
        let mut stages = self.stages.write().await;
        let Some(record) = stages.iter_mut().find(|s| s.id == stage_id) else {
            return Err(format!("unknown stage record: {stage_id}").into());
        };
        record.record_tokens(tokens_in, tokens_out);
        record.complete(status, output);
        record.error_message = error_message.map(String::from);
        Ok(())
    }

    async fn skip_stage(&self, run_id: &str, stage: StageKind, reason: &str) -> SinkResult<()> {
        self.stages
            .write()
            .await
            .push(StageRecord::skipped(run_id, stage, reason));
        Ok(())
    }

    async fn complete_run(
        &self,
        run_id: &str,
        status: RunStatus,
        total_duration_ms: u64,
        outcome: RunOutcome,
    ) -> SinkResult<()> {
        let (tokens_in, tokens_out) = {
            let stages = self.stages.read().await;
            stages
                .iter()
                .filter(|s| s.run_id == run_id)
                .fold((0u32, 0u32), |(i, o), s| (i + s.tokens_in, o + s.tokens_out))
        };

        let mut runs = self.runs.write().await;
        let Some(run) = runs.get_mut(run_id) else {
            return Err(format!("unknown run: {run_id}").into());
        };
        run.status = status;
        run.total_duration_ms = Some(total_duration_ms);
        run.total_tokens_in = tokens_in;
        run.total_tokens_out = tokens_out;
        run.director_output = outcome.director_output;
        run.writer_output = outcome.writer_output;
        run.image_url = outcome.image_url;
        run.image_prompt = outcome.image_prompt;
        run.audio = outcome.audio;
        run.error_message = outcome.error_message;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_and_stage_lifecycle() {
        let sink = MemorySink::new();
        let run_id = sink.create_run("session_1", "hello", None).await.unwrap();

        let stage_id = sink
            .start_stage(&run_id, StageKind::Director, "hello", Some("main"), None)
            .await
            .unwrap();
        sink.complete_stage(&stage_id, StageStatus::Success, "an outline", 100, 50, None)
            .await
            .unwrap();

        sink.complete_run(
            &run_id,
            RunStatus::Success,
            1234,
            RunOutcome {
                director_output: Some("an outline".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let (run, stages) = sink.run_details(&run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Success);
        assert_eq!(run.total_duration_ms, Some(1234));
        assert_eq!(stages.len(), 1);
        assert_eq!(stages[0].output, "an outline");
    }

    #[tokio::test]
    async fn complete_run_aggregates_tokens() {
        let sink = MemorySink::new();
        let run_id = sink.create_run("s", "msg", None).await.unwrap();

        for (stage, tin, tout) in [
            (StageKind::Director, 100, 50),
            (StageKind::Writer, 200, 400),
        ] {
            let id = sink
                .start_stage(&run_id, stage, "in", None, None)
                .await
                .unwrap();
            sink.complete_stage(&id, StageStatus::Success, "out", tin, tout, None)
                .await
                .unwrap();
        }

        sink.complete_run(&run_id, RunStatus::Success, 10, RunOutcome::default())
            .await
            .unwrap();

        let (run, _) = sink.run_details(&run_id).await.unwrap();
        assert_eq!(run.total_tokens_in, 300);
        assert_eq!(run.total_tokens_out, 450);
    }

    #[tokio::test]
    async fn skip_stage_recorded() {
        let sink = MemorySink::new();
        let run_id = sink.create_run("s", "msg", None).await.unwrap();
        sink.skip_stage(&run_id, StageKind::Tts, "disabled")
            .await
            .unwrap();

        let (_, stages) = sink.run_details(&run_id).await.unwrap();
        assert_eq!(stages.len(), 1);
        assert_eq!(stages[0].status, StageStatus::Skipped);
        assert_eq!(stages[0].error_message.as_deref(), Some("disabled"));
    }

    #[tokio::test]
    async fn unknown_ids_error_without_panicking() {
        let sink = MemorySink::new();
        assert!(
            sink.complete_stage("missing", StageStatus::Success, "", 0, 0, None)
                .await
                .is_err()
        );
        assert!(
            sink.complete_run("missing", RunStatus::Error, 0, RunOutcome::default())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn runs_listed_newest_first() {
        let sink = MemorySink::new();
        let first = sink.create_run("s", "one", None).await.unwrap();
        let second = sink.create_run("s", "two", None).await.unwrap();

        let runs = sink.runs().await;
        assert_eq!(runs.len(), 2);
        // Newest first; ties on timestamp keep both present.
        let ids: Vec<&str> = runs.iter().map(|r| r.id.as_str()).collect();
        assert!(ids.contains(&first.as_str()));
        assert!(ids.contains(&second.as_str()));
    }

    #[tokio::test]
    async fn clear_drops_everything() {
        let sink = MemorySink::new();
        let run_id = sink.create_run("s", "msg", None).await.unwrap();
        sink.skip_stage(&run_id, StageKind::Tts, "disabled")
            .await
            .unwrap();

        sink.clear().await;
        assert!(sink.runs().await.is_empty());
        assert!(sink.run_details(&run_id).await.is_none());
    }
}
