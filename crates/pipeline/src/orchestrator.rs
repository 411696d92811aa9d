//! The pipeline orchestrator.
//!
//! One run moves through a fixed stage topology: the director streams a
//! scene outline, then the writer and the paint-director run concurrently
//! off the (filtered) outline, then tts synthesizes the writer's dialogue
//! lines. Both parallel stages push their chunks into one channel; the
//! orchestrator forwards them in arrival order and the channel closing —
//! both senders dropped — is the drain-completion signal.
//!
//! Failure semantics: a missing director or writer endpoint is a
//! precondition failure reported before anything starts; a director failure
//! is fatal; writer, paint, and tts failures degrade the run to `partial`
//! without cancelling their sibling stages. Telemetry sink and session
//! store failures are logged and never abort the run.

use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use storyloom_config::{PipelineConfig, StageLlmConfig};
use storyloom_core::adapter::{ChatTurn, GenerationParams, StreamChunk, Usage};
use storyloom_core::{
    AdapterError, AudioAdapter, AudioRef, CancelToken, Character, ChatSession, ImageAdapter,
    LlmAdapter, Message, Persona, PipelineError, SessionStore,
};
use storyloom_filter::{ChatRole, FilterStage, RegexRule, Target, apply_for_display, apply_for_stage};
use storyloom_lore::KnowledgeBase;
use storyloom_prompt::{AssembledPrompt, DepthInjection, Preset, assemble, inject_depth_entries};
use storyloom_telemetry::sink::RunOutcome;
use storyloom_telemetry::{RunSink, RunStatus, StageKind, StageStatus};

use crate::dialogue::extract_dialogues;
use crate::event::PipelineEvent;

const DIRECTOR_FALLBACK_PROMPT: &str = "You are a scene director. Create a brief outline for the next scene including:\n\
1. Scene setting/atmosphere changes\n\
2. Character actions and movements\n\
3. Key emotional beats\n\
4. Any important events or reveals\n\n\
Provide a concise scene outline (2-3 paragraphs) that a writer can use to craft the response.";

const PAINT_FALLBACK_PROMPT: &str = "You are an image prompt director. Convert scene descriptions into detailed image generation prompts.\n\
Focus on visual elements: setting, lighting, character appearances, mood, and atmosphere.\n\
Keep it under 200 words. Output ONLY the prompt, no explanations or preamble.";

/// Everything one run needs beyond the pipeline's own configuration.
#[derive(Clone)]
pub struct RunRequest {
    pub user_message: String,
    pub session: ChatSession,
    pub character: Option<Character>,
    pub knowledge_base: Option<KnowledgeBase>,
    pub persona: Persona,
    pub director_preset: Option<Preset>,
    pub writer_preset: Option<Preset>,
    pub painter_preset: Option<Preset>,
}

/// The orchestrator. Cheap to clone; collaborators are shared.
#[derive(Clone)]
pub struct Pipeline {
    llm: Arc<dyn LlmAdapter>,
    image: Arc<dyn ImageAdapter>,
    audio: Arc<dyn AudioAdapter>,
    sink: Arc<dyn RunSink>,
    store: Arc<dyn SessionStore>,
    rules: Vec<RegexRule>,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(
        llm: Arc<dyn LlmAdapter>,
        image: Arc<dyn ImageAdapter>,
        audio: Arc<dyn AudioAdapter>,
        sink: Arc<dyn RunSink>,
        store: Arc<dyn SessionStore>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            llm,
            image,
            audio,
            sink,
            store,
            rules: Vec::new(),
            config,
        }
    }

    /// Install the user's regex rule set.
    pub fn with_rules(mut self, rules: Vec<RegexRule>) -> Self {
        self.rules = rules;
        self
    }

    /// Start a run. Returns the caller-visible event stream; the run itself
    /// executes on a spawned task and survives the receiver being dropped.
    pub fn run(&self, request: RunRequest, cancel: CancelToken) -> mpsc::Receiver<PipelineEvent> {
        let (tx, rx) = mpsc::channel(self.config.event_capacity.max(1));
        let this = self.clone();
        tokio::spawn(async move {
            this.execute(request, cancel, tx).await;
        });
        rx
    }

    async fn execute(
        &self,
        request: RunRequest,
        cancel: CancelToken,
        tx: mpsc::Sender<PipelineEvent>,
    ) {
        // ── Preconditions ──────────────────────────────────────────────────
        let mut missing = Vec::new();
        if self.config.director.is_none() {
            missing.push("Director LLM endpoint");
        }
        if self.config.writer.is_none() {
            missing.push("Writer LLM endpoint");
        }
        if !missing.is_empty() {
            let message = PipelineError::MissingConfig(missing.join(", ")).to_string();
            warn!(%message, "Refusing to start run");
            let _ = tx.send(PipelineEvent::Error { message }).await;
            return;
        }
        let director_cfg = self.config.director.clone().expect("checked above");
        let writer_cfg = self.config.writer.clone().expect("checked above");

        let run_start = Instant::now();
        let session_id = request.session.id.to_string();

        // ── Run record ─────────────────────────────────────────────────────
        let run_id = match self
            .sink
            .create_run(
                &session_id,
                &request.user_message,
                request.character.as_ref().map(|c| c.id.as_str()),
            )
            .await
        {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, "Run sink failed to create run record");
                uuid::Uuid::new_v4().to_string()
            }
        };
        info!(run_id = %run_id, session = %session_id, "Pipeline run started");
        let _ = tx
            .send(PipelineEvent::RunStarted {
                run_id: run_id.clone(),
            })
            .await;

        let history = request.session.messages.clone();

        // ── Stage 1: director ──────────────────────────────────────────────
        let _ = tx
            .send(PipelineEvent::StageStarted {
                stage: StageKind::Director,
            })
            .await;
        let stage_start = Instant::now();

        let (system, injections) = self.stage_system_prompt(
            &request,
            request.director_preset.as_ref(),
            DIRECTOR_FALLBACK_PROMPT,
        );
        let turns = build_turns(&system, &history, &injections, Some(&request.user_message));
        let params = stage_params(
            request.director_preset.as_ref(),
            GenerationParams {
                max_tokens: Some(500),
                ..GenerationParams::default()
            },
        );

        let director_stage_id = self
            .start_stage(
                &run_id,
                StageKind::Director,
                &request.user_message,
                &director_cfg,
                request.director_preset.as_ref(),
            )
            .await;

        let (outline, director_usage, director_error) = stream_collect(
            self.llm.as_ref(),
            &turns,
            &director_cfg,
            &params,
            &cancel,
            &tx,
            |content| PipelineEvent::DirectorChunk { content },
        )
        .await;

        let director_duration = stage_start.elapsed().as_millis() as u64;

        if let Some(error) = director_error {
            // Nothing downstream has valid input — the run is over.
            let message = error.to_string();
            self.complete_stage(
                director_stage_id.as_deref(),
                StageStatus::Error,
                &message,
                director_usage,
                Some(&message),
            )
            .await;
            self.finalize(
                &run_id,
                RunStatus::Error,
                run_start.elapsed().as_millis() as u64,
                RunOutcome {
                    director_output: Some(outline),
                    error_message: Some(message.clone()),
                    ..Default::default()
                },
            )
            .await;
            self.update_session(&request, "", None, None, Vec::new()).await;
            let _ = tx
                .send(PipelineEvent::StageError {
                    stage: StageKind::Director,
                    message: message.clone(),
                })
                .await;
            let _ = tx.send(PipelineEvent::Error { message }).await;
            return;
        }

        self.complete_stage(
            director_stage_id.as_deref(),
            StageStatus::Success,
            &outline,
            director_usage,
            None,
        )
        .await;
        let _ = tx
            .send(PipelineEvent::OutlineComplete {
                content: outline.clone(),
            })
            .await;
        let _ = tx
            .send(PipelineEvent::StageComplete {
                stage: StageKind::Director,
                duration_ms: director_duration,
            })
            .await;

        // The outline feeds two prompts; user rules get a pass at it first.
        let outline = apply_for_stage(&outline, &self.rules, FilterStage::Director, Target::Prompt);

        // ── Stages 2 & 3: writer ∥ paint-director ──────────────────────────
        let paint_enabled = self.config.enable_paint;

        let _ = tx
            .send(PipelineEvent::StageStarted {
                stage: StageKind::Writer,
            })
            .await;
        if paint_enabled {
            let _ = tx
                .send(PipelineEvent::StageStarted {
                    stage: StageKind::PaintDirector,
                })
                .await;
        }

        let writer_stage_id = self
            .start_stage(
                &run_id,
                StageKind::Writer,
                &outline,
                &writer_cfg,
                request.writer_preset.as_ref(),
            )
            .await;
        let paint_stage_id = if paint_enabled {
            match &self.config.painter {
                Some(cfg) => {
                    self.start_stage(
                        &run_id,
                        StageKind::PaintDirector,
                        &outline,
                        cfg,
                        request.painter_preset.as_ref(),
                    )
                    .await
                }
                // Unconfigured but enabled: the stage still gets a record so
                // the error cause lands in telemetry.
                None => self
                    .sink
                    .start_stage(&run_id, StageKind::PaintDirector, &outline, None, None)
                    .await
                    .map_err(|e| warn!(error = %e, "Run sink failed to start paint stage"))
                    .ok(),
            }
        } else {
            None
        };

        let parallel_start = Instant::now();
        let (chunk_tx, mut chunk_rx) = mpsc::channel(self.config.event_capacity.max(1));

        let writer_handle = {
            let this = self.clone();
            let request = request.clone();
            let outline = outline.clone();
            let history = history.clone();
            let cancel = cancel.clone();
            let chunk_tx = chunk_tx.clone();
            tokio::spawn(async move {
                this.run_writer(&request, &writer_cfg, &outline, &history, cancel, chunk_tx)
                    .await
            })
        };

        let paint_handle = if paint_enabled {
            let this = self.clone();
            let request = request.clone();
            let outline = outline.clone();
            let session_id = session_id.clone();
            let cancel = cancel.clone();
            let chunk_tx = chunk_tx.clone();
            Some(tokio::spawn(async move {
                this.run_paint_director(&request, &outline, &session_id, cancel, chunk_tx)
                    .await
            }))
        } else {
            None
        };

        // The orchestrator's own sender must go away for the channel to
        // close once both tasks finish.
        drop(chunk_tx);

        // Forward interleaved chunks in arrival order until both stages
        // drop their senders; every queued event is delivered before the
        // run proceeds to tts.
        while let Some(event) = chunk_rx.recv().await {
            let _ = tx.send(event).await;
        }

        let writer_outcome = match writer_handle.await {
            Ok(outcome) => outcome,
            Err(e) => WriterOutcome {
                narrative: String::new(),
                usage: None,
                error: Some(format!("writer task panicked: {e}")),
            },
        };
        let paint_outcome = match paint_handle {
            Some(handle) => match handle.await {
                Ok(outcome) => Some(outcome),
                Err(e) => Some(PaintOutcome {
                    image_url: None,
                    image_prompt: String::new(),
                    usage: None,
                    error: Some(format!("paint task panicked: {e}")),
                }),
            },
            None => None,
        };

        let parallel_duration = parallel_start.elapsed().as_millis() as u64;
        let narrative = writer_outcome.narrative.clone();

        // Writer completion
        if let Some(error) = &writer_outcome.error {
            self.complete_stage(
                writer_stage_id.as_deref(),
                StageStatus::Error,
                error,
                writer_outcome.usage,
                Some(error),
            )
            .await;
            let _ = tx
                .send(PipelineEvent::StageError {
                    stage: StageKind::Writer,
                    message: error.clone(),
                })
                .await;
        } else {
            self.complete_stage(
                writer_stage_id.as_deref(),
                StageStatus::Success,
                &narrative,
                writer_outcome.usage,
                None,
            )
            .await;
        }
        let _ = tx
            .send(PipelineEvent::StageComplete {
                stage: StageKind::Writer,
                duration_ms: parallel_duration,
            })
            .await;

        // Paint-director completion
        let (image_url, image_prompt) = if let Some(outcome) = &paint_outcome {
            if let Some(error) = &outcome.error {
                self.complete_stage(
                    paint_stage_id.as_deref(),
                    StageStatus::Error,
                    error,
                    outcome.usage,
                    Some(error),
                )
                .await;
                let _ = tx
                    .send(PipelineEvent::StageError {
                        stage: StageKind::PaintDirector,
                        message: error.clone(),
                    })
                    .await;
            } else {
                self.complete_stage(
                    paint_stage_id.as_deref(),
                    StageStatus::Success,
                    &outcome.image_prompt,
                    outcome.usage,
                    None,
                )
                .await;
                if let Some(url) = &outcome.image_url {
                    let _ = tx
                        .send(PipelineEvent::ImageReady {
                            url: url.clone(),
                            prompt: outcome.image_prompt.clone(),
                        })
                        .await;
                }
            }
            let _ = tx
                .send(PipelineEvent::StageComplete {
                    stage: StageKind::PaintDirector,
                    duration_ms: parallel_duration,
                })
                .await;
            (outcome.image_url.clone(), Some(outcome.image_prompt.clone()))
        } else {
            self.skip_stage(&run_id, StageKind::PaintDirector, "disabled", &tx)
                .await;
            (None, None)
        };

        // ── Stage 4: tts ───────────────────────────────────────────────────
        let audio_results = if self.config.enable_tts {
            let _ = tx
                .send(PipelineEvent::StageStarted {
                    stage: StageKind::Tts,
                })
                .await;
            let stage_start = Instant::now();
            let tts_stage_id = self
                .sink
                .start_stage(&run_id, StageKind::Tts, &narrative, None, None)
                .await
                .map_err(|e| warn!(error = %e, "Run sink failed to start tts stage"))
                .ok();

            let results = self.run_tts(&narrative, &session_id).await;

            let duration = stage_start.elapsed().as_millis() as u64;
            self.complete_stage(
                tts_stage_id.as_deref(),
                StageStatus::Success,
                &format!("{} audio files", results.len()),
                None,
                None,
            )
            .await;
            if !results.is_empty() {
                let _ = tx
                    .send(PipelineEvent::AudioReady {
                        items: results.clone(),
                    })
                    .await;
            }
            let _ = tx
                .send(PipelineEvent::StageComplete {
                    stage: StageKind::Tts,
                    duration_ms: duration,
                })
                .await;
            results
        } else {
            self.skip_stage(&run_id, StageKind::Tts, "disabled", &tx).await;
            Vec::new()
        };

        // ── Finalize ───────────────────────────────────────────────────────
        let any_stage_error = writer_outcome.error.is_some()
            || paint_outcome.as_ref().is_some_and(|p| p.error.is_some());
        let status = if narrative.is_empty() && writer_outcome.error.is_some() {
            RunStatus::Error
        } else if any_stage_error {
            RunStatus::Partial
        } else {
            RunStatus::Success
        };

        let total_duration = run_start.elapsed().as_millis() as u64;
        self.finalize(
            &run_id,
            status,
            total_duration,
            RunOutcome {
                director_output: Some(outline.clone()),
                writer_output: Some(narrative.clone()),
                image_url: image_url.clone(),
                image_prompt: image_prompt.clone(),
                audio: if audio_results.is_empty() {
                    None
                } else {
                    serde_json::to_value(&audio_results).ok()
                },
                error_message: writer_outcome.error.clone(),
            },
        )
        .await;

        // Session update + display text
        let display = self
            .update_session(
                &request,
                &narrative,
                image_url.clone(),
                image_prompt,
                audio_results,
            )
            .await;
        if let Some(display) = display {
            let _ = tx.send(PipelineEvent::FinalText { content: display }).await;
        }

        if status == RunStatus::Error {
            let message = writer_outcome
                .error
                .unwrap_or_else(|| "No narrative was produced".into());
            let _ = tx.send(PipelineEvent::Error { message }).await;
        } else {
            info!(run_id = %run_id, ?status, total_duration, "Pipeline run complete");
            let _ = tx
                .send(PipelineEvent::RunComplete {
                    run_id,
                    duration_ms: total_duration,
                })
                .await;
        }
    }

    // ── Stage bodies ──────────────────────────────────────────────────────

    async fn run_writer(
        &self,
        request: &RunRequest,
        writer_cfg: &StageLlmConfig,
        outline: &str,
        history: &[Message],
        cancel: CancelToken,
        chunk_tx: mpsc::Sender<PipelineEvent>,
    ) -> WriterOutcome {
        let char_name = request
            .character
            .as_ref()
            .map(|c| c.name.as_str())
            .unwrap_or("Assistant");
        let fallback = format!(
            "You are a creative writer crafting an immersive roleplay response as {char_name}.\n\
             Be descriptive and immersive. Write dialogue naturally."
        );
        let (system, injections) =
            self.stage_system_prompt(request, request.writer_preset.as_ref(), &fallback);
        let user_turn = format!("Based on this scene outline, write the narrative:\n\n{outline}");
        let turns = build_turns(&system, history, &injections, Some(&user_turn));
        let params = stage_params(
            request.writer_preset.as_ref(),
            GenerationParams {
                temperature: 0.9,
                max_tokens: Some(2048),
                top_p: Some(0.95),
                ..GenerationParams::default()
            },
        );

        let (narrative, usage, error) = stream_collect(
            self.llm.as_ref(),
            &turns,
            writer_cfg,
            &params,
            &cancel,
            &chunk_tx,
            |content| PipelineEvent::WriterChunk { content },
        )
        .await;

        if let Some(e) = &error {
            warn!(error = %e, "Writer stage failed");
        }
        WriterOutcome {
            narrative,
            usage,
            error: error.map(|e| e.to_string()),
        }
    }

    async fn run_paint_director(
        &self,
        request: &RunRequest,
        outline: &str,
        session_id: &str,
        cancel: CancelToken,
        chunk_tx: mpsc::Sender<PipelineEvent>,
    ) -> PaintOutcome {
        let Some(painter_cfg) = self.config.painter.clone() else {
            return PaintOutcome::failed("Paint Director LLM is not configured");
        };
        if self.config.image.is_none() {
            return PaintOutcome::failed("Image backend is not configured");
        }

        let (system, _) = self.stage_system_prompt(
            request,
            request.painter_preset.as_ref(),
            PAINT_FALLBACK_PROMPT,
        );
        // The paint-director sees only the outline, not the chat history.
        let turns = vec![ChatTurn::system(&system), ChatTurn::user(outline)];
        let params = stage_params(
            request.painter_preset.as_ref(),
            GenerationParams {
                max_tokens: Some(250),
                ..GenerationParams::default()
            },
        );

        let (raw_prompt, usage, error) = stream_collect(
            self.llm.as_ref(),
            &turns,
            &painter_cfg,
            &params,
            &cancel,
            &chunk_tx,
            |content| PipelineEvent::PaintChunk { content },
        )
        .await;

        if let Some(e) = error {
            warn!(error = %e, "Paint-director prompt generation failed");
            return PaintOutcome {
                image_url: None,
                image_prompt: raw_prompt,
                usage,
                error: Some(e.to_string()),
            };
        }

        let image_prompt = apply_for_stage(
            &raw_prompt,
            &self.rules,
            FilterStage::PaintDirector,
            Target::Prompt,
        )
        .trim()
        .to_string();

        match self.image.generate(&image_prompt, session_id).await {
            Ok(image) => PaintOutcome {
                image_url: Some(image.url),
                image_prompt,
                usage,
                error: None,
            },
            Err(e) => {
                warn!(error = %e, "Image generation failed");
                PaintOutcome {
                    image_url: None,
                    image_prompt,
                    usage,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    /// Extract deduplicated dialogue lines and synthesize each one.
    /// Per-line failures are logged and dropped; they never fail the stage.
    async fn run_tts(&self, narrative: &str, session_id: &str) -> Vec<AudioRef> {
        let dialogues = extract_dialogues(narrative);
        debug!(count = dialogues.len(), "Extracted dialogue lines for synthesis");

        let mut results = Vec::new();
        for dialogue in dialogues {
            match self
                .audio
                .synthesize(&dialogue.text, &dialogue.speaker, session_id)
                .await
            {
                Ok(mut audio) => {
                    if audio.emotion.is_empty() {
                        audio.emotion = dialogue.emotion;
                    }
                    results.push(audio);
                }
                Err(e) => {
                    warn!(speaker = %dialogue.speaker, error = %e, "Dropping failed dialogue line");
                }
            }
        }
        results
    }

    // ── Helpers ───────────────────────────────────────────────────────────

    fn stage_system_prompt(
        &self,
        request: &RunRequest,
        preset: Option<&Preset>,
        fallback: &str,
    ) -> (String, Vec<DepthInjection>) {
        let assembled: AssembledPrompt = assemble(
            request.character.as_ref(),
            request.knowledge_base.as_ref(),
            preset,
            &request.session.messages,
            &request.persona,
        );
        let system = assembled.system_prompt();
        let system = if system.is_empty() {
            fallback.to_string()
        } else {
            system
        };
        (system, assembled.depth_injections)
    }

    async fn start_stage(
        &self,
        run_id: &str,
        stage: StageKind,
        input: &str,
        cfg: &StageLlmConfig,
        preset: Option<&Preset>,
    ) -> Option<String> {
        match self
            .sink
            .start_stage(
                run_id,
                stage,
                input,
                Some(cfg.endpoint.id.as_str()),
                preset.map(|p| p.id.as_str()),
            )
            .await
        {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(%stage, error = %e, "Run sink failed to start stage");
                None
            }
        }
    }

    async fn complete_stage(
        &self,
        stage_id: Option<&str>,
        status: StageStatus,
        output: &str,
        usage: Option<Usage>,
        error: Option<&str>,
    ) {
        let Some(stage_id) = stage_id else { return };
        let (tokens_in, tokens_out) = usage
            .map(|u| (u.prompt_tokens, u.completion_tokens))
            .unwrap_or((0, 0));
        if let Err(e) = self
            .sink
            .complete_stage(stage_id, status, output, tokens_in, tokens_out, error)
            .await
        {
            warn!(error = %e, "Run sink failed to complete stage");
        }
    }

    async fn skip_stage(
        &self,
        run_id: &str,
        stage: StageKind,
        reason: &str,
        tx: &mpsc::Sender<PipelineEvent>,
    ) {
        if let Err(e) = self.sink.skip_stage(run_id, stage, reason).await {
            warn!(%stage, error = %e, "Run sink failed to record skipped stage");
        }
        let _ = tx
            .send(PipelineEvent::StageSkipped {
                stage,
                reason: reason.to_string(),
            })
            .await;
    }

    async fn finalize(
        &self,
        run_id: &str,
        status: RunStatus,
        total_duration_ms: u64,
        outcome: RunOutcome,
    ) {
        if let Err(e) = self
            .sink
            .complete_run(run_id, status, total_duration_ms, outcome)
            .await
        {
            warn!(error = %e, "Run sink failed to finalize run");
        }
    }

    /// Append the user's message and, when a narrative exists, the
    /// display-filtered assistant turn with its artifact references.
    /// Returns the display text when one was produced.
    async fn update_session(
        &self,
        request: &RunRequest,
        narrative: &str,
        image_url: Option<String>,
        image_prompt: Option<String>,
        audio: Vec<AudioRef>,
    ) -> Option<String> {
        let mut session = request.session.clone();
        session.push(Message::user(request.user_message.clone()));

        let display = if narrative.is_empty() {
            None
        } else {
            let display = apply_for_display(narrative, &self.rules, ChatRole::Assistant, 0);
            let mut message = Message::assistant(display.clone()).with_audio(audio);
            if let Some(url) = image_url {
                message = message.with_image(url, image_prompt);
            }
            session.push(message);
            Some(display)
        };

        if let Err(e) = self.store.save(&session).await {
            warn!(error = %e, "Session store failed to save session");
        }
        display
    }
}

// ── Stage outcomes ────────────────────────────────────────────────────────

struct WriterOutcome {
    narrative: String,
    usage: Option<Usage>,
    error: Option<String>,
}

struct PaintOutcome {
    image_url: Option<String>,
    image_prompt: String,
    usage: Option<Usage>,
    error: Option<String>,
}

impl PaintOutcome {
    fn failed(message: &str) -> Self {
        Self {
            image_url: None,
            image_prompt: String::new(),
            usage: None,
            error: Some(message.to_string()),
        }
    }
}

// ── Free helpers ──────────────────────────────────────────────────────────

/// system → history (with depth injections) → optional trailing user turn.
fn build_turns(
    system: &str,
    history: &[Message],
    injections: &[DepthInjection],
    user: Option<&str>,
) -> Vec<ChatTurn> {
    let mut turns = Vec::new();
    if !system.is_empty() {
        turns.push(ChatTurn::system(system));
    }
    let mut history_turns: Vec<ChatTurn> = history.iter().map(ChatTurn::from).collect();
    inject_depth_entries(&mut history_turns, injections);
    turns.extend(history_turns);
    if let Some(user) = user {
        turns.push(ChatTurn::user(user));
    }
    turns
}

fn stage_params(preset: Option<&Preset>, fallback: GenerationParams) -> GenerationParams {
    preset.map(|p| p.params()).unwrap_or(fallback)
}

/// Consume one streaming LLM call, forwarding each content delta as an
/// event. The cancel token is checked between chunks; once set, the partial
/// accumulation becomes the final output. Returns `(accumulated, usage,
/// error)` — an error after partial output keeps the partial text.
async fn stream_collect(
    llm: &dyn LlmAdapter,
    turns: &[ChatTurn],
    cfg: &StageLlmConfig,
    params: &GenerationParams,
    cancel: &CancelToken,
    events: &mpsc::Sender<PipelineEvent>,
    wrap: fn(String) -> PipelineEvent,
) -> (String, Option<Usage>, Option<AdapterError>) {
    let mut rx = match llm.stream(turns, &cfg.endpoint, params, cancel.clone()).await {
        Ok(rx) => rx,
        Err(e) => return (String::new(), None, Some(e)),
    };

    let mut accumulated = String::new();
    let mut usage = None;
    while let Some(item) = rx.recv().await {
        if cancel.is_cancelled() {
            debug!("Cancellation requested; partial output stands as final");
            break;
        }
        match item {
            Ok(StreamChunk {
                content,
                done,
                usage: chunk_usage,
            }) => {
                if let Some(u) = chunk_usage {
                    usage = Some(u);
                }
                if let Some(content) = content {
                    if !content.is_empty() {
                        accumulated.push_str(&content);
                        let _ = events.send(wrap(content)).await;
                    }
                }
                if done {
                    break;
                }
            }
            Err(e) => return (accumulated, usage, Some(e)),
        }
    }
    (accumulated, usage, None)
}

// ── Tests ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use storyloom_config::ImageBackendConfig;
    use storyloom_core::adapter::{ImageRef, ModelEndpoint};
    use storyloom_core::{MemorySessionStore, Role};
    use storyloom_telemetry::MemorySink;

    // ── Mocks ──────────────────────────────────────────────────────────

    /// Scripted LLM: endpoint id → chunk script, `None` = fail on call.
    struct MockLlm {
        scripts: HashMap<String, Option<Vec<&'static str>>>,
    }

    impl MockLlm {
        fn new(
            director: Option<Vec<&'static str>>,
            writer: Option<Vec<&'static str>>,
            painter: Option<Vec<&'static str>>,
        ) -> Self {
            let mut scripts = HashMap::new();
            scripts.insert("dir".to_string(), director);
            scripts.insert("wri".to_string(), writer);
            scripts.insert("pnt".to_string(), painter);
            Self { scripts }
        }
    }

    #[async_trait]
    impl LlmAdapter for MockLlm {
        fn name(&self) -> &str {
            "mock-llm"
        }

        async fn complete(
            &self,
            _messages: &[ChatTurn],
            endpoint: &ModelEndpoint,
            _params: &GenerationParams,
        ) -> Result<String, AdapterError> {
            match self.scripts.get(&endpoint.id) {
                Some(Some(chunks)) => Ok(chunks.concat()),
                _ => Err(AdapterError::ApiError {
                    status_code: 500,
                    message: "scripted failure".into(),
                }),
            }
        }

        async fn stream(
            &self,
            _messages: &[ChatTurn],
            endpoint: &ModelEndpoint,
            _params: &GenerationParams,
            _cancel: CancelToken,
        ) -> Result<mpsc::Receiver<Result<StreamChunk, AdapterError>>, AdapterError> {
            let script = self.scripts.get(&endpoint.id).cloned().flatten();
            let Some(chunks) = script else {
                return Err(AdapterError::ApiError {
                    status_code: 500,
                    message: "scripted failure".into(),
                });
            };
            let (tx, rx) = mpsc::channel(16);
            tokio::spawn(async move {
                for chunk in chunks {
                    let _ = tx
                        .send(Ok(StreamChunk {
                            content: Some(chunk.to_string()),
                            done: false,
                            usage: None,
                        }))
                        .await;
                    // Let the sibling stage interleave.
                    tokio::task::yield_now().await;
                }
                let _ = tx
                    .send(Ok(StreamChunk {
                        content: None,
                        done: true,
                        usage: Some(Usage {
                            prompt_tokens: 10,
                            completion_tokens: 20,
                            total_tokens: 30,
                        }),
                    }))
                    .await;
            });
            Ok(rx)
        }
    }

    #[derive(Default)]
    struct MockImage {
        fail: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ImageAdapter for MockImage {
        fn name(&self) -> &str {
            "mock-image"
        }

        async fn generate(
            &self,
            _prompt: &str,
            _session_id: &str,
        ) -> Result<ImageRef, AdapterError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(AdapterError::ApiError {
                    status_code: 502,
                    message: "image backend down".into(),
                })
            } else {
                Ok(ImageRef {
                    url: "/files/images/test.png".into(),
                })
            }
        }
    }

    #[derive(Default)]
    struct MockAudio {
        lines: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl AudioAdapter for MockAudio {
        fn name(&self) -> &str {
            "mock-audio"
        }

        async fn synthesize(
            &self,
            text: &str,
            speaker: &str,
            _session_id: &str,
        ) -> Result<AudioRef, AdapterError> {
            let mut lines = self.lines.lock().unwrap();
            lines.push(text.to_string());
            Ok(AudioRef {
                speaker: speaker.to_string(),
                emotion: String::new(),
                url: format!("/files/audio/{}.mp3", lines.len()),
            })
        }
    }

    // ── Fixtures ───────────────────────────────────────────────────────

    fn stage_cfg(id: &str) -> StageLlmConfig {
        StageLlmConfig {
            endpoint: ModelEndpoint {
                id: id.into(),
                name: id.into(),
                base_url: "http://mock".into(),
                api_key: "key".into(),
                model: "mock-model".into(),
            },
            preset_id: None,
        }
    }

    fn full_config() -> PipelineConfig {
        PipelineConfig {
            director: Some(stage_cfg("dir")),
            writer: Some(stage_cfg("wri")),
            enable_paint: true,
            painter: Some(stage_cfg("pnt")),
            image: Some(ImageBackendConfig {
                base_url: "http://mock".into(),
                api_key: "key".into(),
                model: "mock-image-model".into(),
                size: "1024x1024".into(),
            }),
            enable_tts: true,
            tts: None,
            event_capacity: 1024,
        }
    }

    struct Harness {
        pipeline: Pipeline,
        sink: Arc<MemorySink>,
        store: Arc<MemorySessionStore>,
        audio: Arc<MockAudio>,
        image: Arc<MockImage>,
    }

    fn harness(llm: MockLlm, image: MockImage, config: PipelineConfig) -> Harness {
        let sink = Arc::new(MemorySink::new());
        let store = Arc::new(MemorySessionStore::new());
        let audio = Arc::new(MockAudio::default());
        let image = Arc::new(image);
        let pipeline = Pipeline::new(
            Arc::new(llm),
            image.clone(),
            audio.clone(),
            sink.clone(),
            store.clone(),
            config,
        );
        Harness {
            pipeline,
            sink,
            store,
            audio,
            image,
        }
    }

    fn request() -> RunRequest {
        let mut session = ChatSession::new();
        session.push(Message::assistant("The market hums around you."));
        RunRequest {
            user_message: "I walk toward the fountain.".into(),
            session,
            character: None,
            knowledge_base: None,
            persona: Persona::default(),
            director_preset: None,
            writer_preset: None,
            painter_preset: None,
        }
    }

    async fn collect(mut rx: mpsc::Receiver<PipelineEvent>) -> Vec<PipelineEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    fn concat_chunks(events: &[PipelineEvent], kind: &str) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                PipelineEvent::WriterChunk { content } if kind == "writer" => Some(content.clone()),
                PipelineEvent::PaintChunk { content } if kind == "paint" => Some(content.clone()),
                PipelineEvent::DirectorChunk { content } if kind == "director" => {
                    Some(content.clone())
                }
                _ => None,
            })
            .collect()
    }

    const WRITER_DIALOGUE: [&str; 3] = [
        "Mira: \"Hello there.\"\n",
        "Joren: \"A fine day.\"\n",
        "Mira: \"Hello there.\"",
    ];

    // ── Scenarios ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn full_run_produces_all_artifacts() {
        let llm = MockLlm::new(
            Some(vec!["Outline ", "part"]),
            Some(vec!["W1", "W2", "W3"]),
            Some(vec!["P1", "P2"]),
        );
        let h = harness(llm, MockImage::default(), full_config());
        let req = request();
        let session_id = req.session.id.clone();

        let events = collect(h.pipeline.run(req, CancelToken::new())).await;

        // Exactly one terminal event, and it is last.
        let terminals: Vec<_> = events.iter().filter(|e| e.is_terminal()).collect();
        assert_eq!(terminals.len(), 1);
        assert!(matches!(
            events.last().unwrap(),
            PipelineEvent::RunComplete { .. }
        ));

        assert_eq!(concat_chunks(&events, "director"), "Outline part");
        assert!(events.iter().any(|e| matches!(
            e,
            PipelineEvent::OutlineComplete { content } if content == "Outline part"
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            PipelineEvent::ImageReady { url, .. } if url == "/files/images/test.png"
        )));

        // Telemetry: run succeeded with all four stages recorded.
        let runs = h.sink.runs().await;
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Success);
        assert_eq!(runs[0].writer_output.as_deref(), Some("W1W2W3"));
        let (_, stages) = h.sink.run_details(&runs[0].id).await.unwrap();
        assert_eq!(stages.len(), 4);
        assert!(stages.iter().all(|s| s.status == StageStatus::Success));

        // Session updated with the user turn and the assistant turn.
        let session = h.store.load(&session_id).await.unwrap().unwrap();
        assert_eq!(session.messages.len(), 3);
        let assistant = session.messages.last().unwrap();
        assert_eq!(assistant.content, "W1W2W3");
        assert_eq!(assistant.image_url.as_deref(), Some("/files/images/test.png"));
    }

    #[tokio::test]
    async fn missing_director_is_precondition_failure() {
        let mut config = full_config();
        config.director = None;
        let h = harness(
            MockLlm::new(None, None, None),
            MockImage::default(),
            config,
        );

        let events = collect(h.pipeline.run(request(), CancelToken::new())).await;
        assert_eq!(events.len(), 1);
        match &events[0] {
            PipelineEvent::Error { message } => {
                assert!(message.contains("Director LLM endpoint"));
            }
            other => panic!("Expected error event, got {other:?}"),
        }
        // The run never started: no record, no session write.
        assert!(h.sink.runs().await.is_empty());
        assert!(h.store.is_empty().await);
    }

    #[tokio::test]
    async fn director_failure_is_fatal() {
        let llm = MockLlm::new(None, Some(vec!["W1"]), Some(vec!["P1"]));
        let h = harness(llm, MockImage::default(), full_config());
        let req = request();
        let session_id = req.session.id.clone();

        let events = collect(h.pipeline.run(req, CancelToken::new())).await;

        assert!(matches!(events.last().unwrap(), PipelineEvent::Error { .. }));
        // Writer and paint-director never start.
        assert!(!events.iter().any(|e| matches!(
            e,
            PipelineEvent::StageStarted { stage: StageKind::Writer }
                | PipelineEvent::StageStarted { stage: StageKind::PaintDirector }
        )));
        assert!(concat_chunks(&events, "writer").is_empty());
        assert!(concat_chunks(&events, "paint").is_empty());

        let runs = h.sink.runs().await;
        assert_eq!(runs[0].status, RunStatus::Error);
        let (_, stages) = h.sink.run_details(&runs[0].id).await.unwrap();
        assert_eq!(stages.len(), 1);
        assert_eq!(stages[0].stage, StageKind::Director);
        assert_eq!(stages[0].status, StageStatus::Error);

        // The user's message is still recorded, with no assistant turn.
        let session = h.store.load(&session_id).await.unwrap().unwrap();
        assert_eq!(session.messages.len(), 2);
        assert_eq!(session.messages.last().unwrap().role, Role::User);
    }

    #[tokio::test]
    async fn image_failure_degrades_to_partial() {
        let llm = MockLlm::new(
            Some(vec!["Outline"]),
            Some(vec!["W1", "W2"]),
            Some(vec!["P1"]),
        );
        let h = harness(
            llm,
            MockImage {
                fail: true,
                ..Default::default()
            },
            full_config(),
        );

        let events = collect(h.pipeline.run(request(), CancelToken::new())).await;

        assert!(matches!(
            events.last().unwrap(),
            PipelineEvent::RunComplete { .. }
        ));
        assert!(!events.iter().any(|e| matches!(e, PipelineEvent::ImageReady { .. })));
        assert!(events.iter().any(|e| matches!(
            e,
            PipelineEvent::StageError { stage: StageKind::PaintDirector, .. }
        )));
        // The narrative survived.
        assert!(events.iter().any(|e| matches!(
            e,
            PipelineEvent::FinalText { content } if content == "W1W2"
        )));

        let runs = h.sink.runs().await;
        assert_eq!(runs[0].status, RunStatus::Partial);
        assert!(runs[0].image_url.is_none());
        assert_eq!(runs[0].writer_output.as_deref(), Some("W1W2"));
        assert_eq!(h.image.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn writer_failure_does_not_abort_paint() {
        let llm = MockLlm::new(Some(vec!["Outline"]), None, Some(vec!["P1"]));
        let h = harness(llm, MockImage::default(), full_config());

        let events = collect(h.pipeline.run(request(), CancelToken::new())).await;

        assert!(events.iter().any(|e| matches!(
            e,
            PipelineEvent::StageError { stage: StageKind::Writer, .. }
        )));
        // Paint still ran to completion and produced its image.
        assert!(events.iter().any(|e| matches!(e, PipelineEvent::ImageReady { .. })));
        assert_eq!(h.image.calls.load(Ordering::SeqCst), 1);

        // No narrative at all → the run is an error.
        assert!(matches!(events.last().unwrap(), PipelineEvent::Error { .. }));
        let runs = h.sink.runs().await;
        assert_eq!(runs[0].status, RunStatus::Error);
    }

    #[tokio::test]
    async fn parallel_chunks_all_delivered() {
        let llm = MockLlm::new(
            Some(vec!["Outline"]),
            Some(vec!["W1", "W2", "W3"]),
            Some(vec!["P1", "P2"]),
        );
        let h = harness(llm, MockImage::default(), full_config());

        let events = collect(h.pipeline.run(request(), CancelToken::new())).await;

        // No events lost: chunk concatenations equal each stage's full text.
        assert_eq!(concat_chunks(&events, "writer"), "W1W2W3");
        assert_eq!(concat_chunks(&events, "paint"), "P1P2");

        // At least one of each chunk kind precedes the single terminal event.
        let terminal_idx = events.iter().position(|e| e.is_terminal()).unwrap();
        let first_writer = events
            .iter()
            .position(|e| matches!(e, PipelineEvent::WriterChunk { .. }))
            .unwrap();
        let first_paint = events
            .iter()
            .position(|e| matches!(e, PipelineEvent::PaintChunk { .. }))
            .unwrap();
        assert!(first_writer < terminal_idx);
        assert!(first_paint < terminal_idx);
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    }

    #[tokio::test]
    async fn paint_disabled_is_skipped() {
        let mut config = full_config();
        config.enable_paint = false;
        let llm = MockLlm::new(Some(vec!["Outline"]), Some(vec!["W1"]), Some(vec!["P1"]));
        let h = harness(llm, MockImage::default(), config);

        let events = collect(h.pipeline.run(request(), CancelToken::new())).await;

        assert!(events.iter().any(|e| matches!(
            e,
            PipelineEvent::StageSkipped { stage: StageKind::PaintDirector, .. }
        )));
        assert!(concat_chunks(&events, "paint").is_empty());
        assert_eq!(h.image.calls.load(Ordering::SeqCst), 0);

        let runs = h.sink.runs().await;
        assert_eq!(runs[0].status, RunStatus::Success);
        let (_, stages) = h.sink.run_details(&runs[0].id).await.unwrap();
        let paint = stages
            .iter()
            .find(|s| s.stage == StageKind::PaintDirector)
            .unwrap();
        assert_eq!(paint.status, StageStatus::Skipped);
    }

    #[tokio::test]
    async fn unconfigured_painter_errors_without_aborting() {
        let mut config = full_config();
        config.painter = None;
        let llm = MockLlm::new(Some(vec!["Outline"]), Some(vec!["W1"]), None);
        let h = harness(llm, MockImage::default(), config);

        let events = collect(h.pipeline.run(request(), CancelToken::new())).await;

        assert!(events.iter().any(|e| matches!(
            e,
            PipelineEvent::StageError { stage: StageKind::PaintDirector, message }
                if message.contains("not configured")
        )));
        assert!(matches!(
            events.last().unwrap(),
            PipelineEvent::RunComplete { .. }
        ));
        let runs = h.sink.runs().await;
        assert_eq!(runs[0].status, RunStatus::Partial);
    }

    #[tokio::test]
    async fn tts_deduplicates_dialogue_lines() {
        let llm = MockLlm::new(
            Some(vec!["Outline"]),
            Some(WRITER_DIALOGUE.to_vec()),
            Some(vec!["P1"]),
        );
        let h = harness(llm, MockImage::default(), full_config());
        let req = request();
        let session_id = req.session.id.clone();

        let events = collect(h.pipeline.run(req, CancelToken::new())).await;

        // Two distinct lines, one duplicate → exactly two synthesis calls.
        assert_eq!(h.audio.lines.lock().unwrap().len(), 2);
        let audio_items = events
            .iter()
            .find_map(|e| match e {
                PipelineEvent::AudioReady { items } => Some(items.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(audio_items.len(), 2);
        assert_eq!(audio_items[0].speaker, "Mira");
        assert_eq!(audio_items[1].speaker, "Joren");

        let session = h.store.load(&session_id).await.unwrap().unwrap();
        assert_eq!(session.messages.last().unwrap().audio.len(), 2);
    }

    #[tokio::test]
    async fn tts_disabled_is_skipped() {
        let mut config = full_config();
        config.enable_tts = false;
        let llm = MockLlm::new(
            Some(vec!["Outline"]),
            Some(WRITER_DIALOGUE.to_vec()),
            Some(vec!["P1"]),
        );
        let h = harness(llm, MockImage::default(), config);

        let events = collect(h.pipeline.run(request(), CancelToken::new())).await;

        assert!(events.iter().any(|e| matches!(
            e,
            PipelineEvent::StageSkipped { stage: StageKind::Tts, .. }
        )));
        assert!(h.audio.lines.lock().unwrap().is_empty());
        assert!(!events.iter().any(|e| matches!(e, PipelineEvent::AudioReady { .. })));
    }

    #[tokio::test]
    async fn display_rules_shape_final_text_only() {
        let llm = MockLlm::new(Some(vec!["Outline"]), Some(vec!["W1", "W2"]), Some(vec!["P1"]));
        let h = harness(llm, MockImage::default(), full_config());
        // Defaults apply the rule to assistant display text only.
        let pipeline = h
            .pipeline
            .clone()
            .with_rules(vec![RegexRule::new("r1", "W1", "X1")]);

        let req = request();
        let session_id = req.session.id.clone();
        let events = collect(pipeline.run(req, CancelToken::new())).await;

        assert!(events.iter().any(|e| matches!(
            e,
            PipelineEvent::FinalText { content } if content == "X1W2"
        )));
        // The raw narrative in telemetry is untouched.
        let runs = h.sink.runs().await;
        assert_eq!(runs[0].writer_output.as_deref(), Some("W1W2"));
        let session = h.store.load(&session_id).await.unwrap().unwrap();
        assert_eq!(session.messages.last().unwrap().content, "X1W2");
    }

    #[tokio::test]
    async fn cancelled_run_still_finalizes() {
        let llm = MockLlm::new(
            Some(vec!["Outline"]),
            Some(vec!["W1", "W2"]),
            Some(vec!["P1"]),
        );
        let h = harness(llm, MockImage::default(), full_config());
        let cancel = CancelToken::new();
        cancel.cancel();

        let events = collect(h.pipeline.run(request(), cancel)).await;

        // Partial (here: empty) output stands as final; exactly one terminal.
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
        assert!(events.last().unwrap().is_terminal());
    }
}
