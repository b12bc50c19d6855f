//! The turn driver: one committed user utterance to one `turn_end`.
//!
//! The driver owns everything between an STT commit and the end of the
//! assistant's reply: the reasoning call (or a speculative replay), the
//! lead filter, sanitizer and prosody planner on the text path, and the
//! per-turn TTS stream on the audio path. First-text and first-audio
//! latency are the design constraints: TTS starts concurrently with
//! reasoning, and pre-fetched results replay without touching the
//! adapter at all.

pub mod tts_stream;

use crate::brain::{
    stream_with_first_delta_retry, BrainRequest, BrainResponse, ReasoningAdapter,
};
use crate::config::CompanionConfig;
use crate::error::{CompanionError, Result};
use crate::memory::{MemoryStore, TurnRole};
use crate::messages::{ErrorSource, OutboundMessage, TurnEndReason};
use crate::metrics::{stage, Metrics};
use crate::outbound::OutboundScheduler;
use crate::policy;
use crate::session::SessionSnapshot;
use crate::speculate::BrainResult;
use crate::speech::{strip_lead_filler, LeadResponseFilter, ProsodyPlanner, SpeechSanitizer};
use crate::tts::TtsProvider;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tts_stream::{SpeechOutput, TurnAudioContext};

/// Shared collaborators for all turns of a session.
#[derive(Clone)]
pub struct TurnDeps {
    pub brain: Arc<dyn ReasoningAdapter>,
    pub tts: Arc<dyn TtsProvider>,
    pub memory: Option<Arc<dyn MemoryStore>>,
    pub metrics: Arc<Metrics>,
    pub config: Arc<CompanionConfig>,
}

/// Everything one turn starts from.
pub struct TurnInput {
    pub session: SessionSnapshot,
    pub user_text: String,
    pub turn_id: String,
    pub committed_at: Instant,
    /// Memory context fetched while the user was still speaking, if any.
    pub prefetched_memory: Option<Vec<String>>,
    /// A compatible speculative reasoning result, if one was consumed.
    pub prefetched_brain: Option<BrainResult>,
    /// Written when assistant output first reaches the client; the
    /// session loop uses it to classify early interrupts.
    pub output_started: Arc<Mutex<Option<Instant>>>,
}

/// Execute one turn to completion. Cancellation exits quietly; the
/// session loop owns the `turn_end` for cancelled turns.
pub async fn run_turn(
    deps: TurnDeps,
    mut input: TurnInput,
    outbound: OutboundScheduler,
    cancel: CancellationToken,
) {
    let turn_id = input.turn_id.clone();
    info!(
        turn_id = turn_id.as_str(),
        session_id = input.session.id.as_str(),
        "turn started"
    );

    save_turn_best_effort(
        &deps,
        &input.session,
        TurnRole::User,
        input.user_text.clone(),
    );

    let brain_first_delta_at = Arc::new(Mutex::new(None));
    let audio_context = TurnAudioContext {
        outbound: outbound.clone(),
        metrics: Arc::clone(&deps.metrics),
        turn_id: turn_id.clone(),
        committed_at: input.committed_at,
        output_started: Arc::clone(&input.output_started),
        brain_first_delta_at: Arc::clone(&brain_first_delta_at),
        cancel: cancel.clone(),
    };
    let mut speech = SpeechOutput::start(
        Arc::clone(&deps.tts),
        &deps.config.voice,
        input.session.voice_id.clone(),
        audio_context,
    );

    let memory_context = resolve_memory_context(&deps, &input).await;

    // Working watchdog: a long silent gap before the first delta gets an
    // explicit signal so the client can show progress.
    let first_delta_seen = Arc::new(AtomicBool::new(false));
    let watchdog = {
        let outbound = outbound.clone();
        let metrics = Arc::clone(&deps.metrics);
        let seen = Arc::clone(&first_delta_seen);
        let delay = deps.config.turn.assistant_working_delay();
        let committed_at = input.committed_at;
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {}
                () = tokio::time::sleep(delay) => {
                    if !seen.load(Ordering::Relaxed) {
                        metrics.record_latency(stage::ASSISTANT_WORKING, committed_at.elapsed());
                        outbound
                            .send(OutboundMessage::system("assistant_working", ""))
                            .await;
                    }
                }
            }
        })
    };

    let mut pipeline = DeltaPipeline {
        config: Arc::clone(&deps.config),
        outbound: outbound.clone(),
        metrics: Arc::clone(&deps.metrics),
        turn_id: turn_id.clone(),
        committed_at: input.committed_at,
        brain_first_delta_at,
        first_delta_seen: Arc::clone(&first_delta_seen),
        lead_filter: LeadResponseFilter::new(),
        sanitizer: SpeechSanitizer::new(),
        planner: ProsodyPlanner::new(deps.config.prosody.clone()),
        raw_accumulated: String::new(),
        preview_chars_sent: 0,
        assistant_text: String::new(),
        streamed_any: false,
    };

    let result = if let Some(prefetched) = input.prefetched_brain.take() {
        deps.metrics.incr("brain_prefetch_replayed");
        let mut cancelled = false;
        for delta in &prefetched.deltas {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            pipeline.on_delta(delta, &mut speech).await;
        }
        if cancelled {
            Err(CompanionError::Cancelled)
        } else {
            Ok(BrainResponse {
                text: prefetched.final_text,
            })
        }
    } else {
        stream_from_adapter(&deps, &input, memory_context, &mut pipeline, &mut speech, &cancel)
            .await
    };

    watchdog.abort();

    match result {
        Ok(response) => {
            finalize_turn(&deps, &input, &outbound, &mut pipeline, &mut speech, response).await;
        }
        Err(e) if e.is_cancelled() => {
            // The session loop already emitted turn_end with the
            // cancellation reason; tear down quietly.
            debug!(turn_id = turn_id.as_str(), "turn cancelled");
            speech.abandon().await;
        }
        Err(e) => {
            warn!(turn_id = turn_id.as_str(), error = %e, "turn failed");
            deps.metrics.incr("assistant_turn_failed");
            speech.finish(Duration::from_millis(250)).await;
            outbound
                .send(OutboundMessage::error(
                    "assistant_turn_failed",
                    ErrorSource::Orchestrator,
                    false,
                    e.to_string(),
                ))
                .await;
            outbound
                .send(OutboundMessage::AssistantTurnEnd {
                    turn_id,
                    reason: TurnEndReason::Failed,
                })
                .await;
        }
    }
}

/// Run the reasoning adapter, feeding deltas through the pipeline.
async fn stream_from_adapter(
    deps: &TurnDeps,
    input: &TurnInput,
    memory_context: Vec<String>,
    pipeline: &mut DeltaPipeline,
    speech: &mut SpeechOutput,
    cancel: &CancellationToken,
) -> Result<BrainResponse> {
    let request = BrainRequest {
        user_id: input.session.user_id.clone(),
        session_id: input.session.id.clone(),
        turn_id: input.turn_id.clone(),
        input: input.user_text.clone(),
        memory_context,
        persona_id: input.session.persona_id.clone(),
    };

    let (delta_tx, mut delta_rx) = mpsc::channel::<String>(64);
    let call = tokio::spawn(stream_with_first_delta_retry(
        Arc::clone(&deps.brain),
        cancel.clone(),
        request,
        delta_tx,
        deps.config.brain.first_delta_retry_timeout(),
        deps.config.brain.first_delta_retry_max,
        Arc::clone(&deps.metrics),
    ));

    loop {
        let maybe = tokio::select! {
            () = cancel.cancelled() => {
                call.abort();
                return Err(CompanionError::Cancelled);
            }
            maybe = delta_rx.recv() => maybe,
        };
        match maybe {
            Some(delta) => pipeline.on_delta(&delta, speech).await,
            None => break,
        }
    }

    match call.await {
        Ok(result) => result,
        Err(e) if e.is_cancelled() => Err(CompanionError::Cancelled),
        Err(e) => Err(CompanionError::Brain(format!("turn call failed: {e}"))),
    }
}

/// Flush the pipeline, drain TTS, emit `turn_end`, record latencies.
async fn finalize_turn(
    deps: &TurnDeps,
    input: &TurnInput,
    outbound: &OutboundScheduler,
    pipeline: &mut DeltaPipeline,
    speech: &mut SpeechOutput,
    response: BrainResponse,
) {
    // Anything still buffered in the lead filter is real content.
    if let Some(text) = pipeline.lead_filter.flush() {
        pipeline.emit_text(&text, speech).await;
    }

    // Nothing streamed but a final text exists: emit it as one delta.
    if !pipeline.streamed_any && !response.text.trim().is_empty() {
        let text = pipeline.lead_filter.finalize(&response.text);
        if !text.is_empty() {
            pipeline.emit_text(&text, speech).await;
        }
    }

    for segment in pipeline.planner.finalize() {
        speech.speak(segment).await;
    }

    speech.adopt_blocking().await;

    // Spoken fallback when there is text but the synthesis path yielded
    // no audio (e.g. the whole reply sanitized away).
    if speech.is_active()
        && !pipeline.assistant_text.trim().is_empty()
        && speech.audio_chunk_count() == 0
    {
        tokio::time::sleep(Duration::from_millis(20)).await;
        if speech.audio_chunk_count() == 0 {
            speech.speak("I replied on screen.".to_owned()).await;
        }
    }

    speech.finish(deps.config.turn.tts_finalize_timeout()).await;

    outbound
        .send(OutboundMessage::AssistantTurnEnd {
            turn_id: input.turn_id.clone(),
            reason: TurnEndReason::Completed,
        })
        .await;

    let total = input.committed_at.elapsed();
    deps.metrics.record_latency(stage::TURN_TOTAL, total);
    if let Some(slo) = deps.config.turn.first_audio_slo() {
        if let Some(first_audio) = speech.first_audio_at() {
            if first_audio.duration_since(input.committed_at) > slo {
                deps.metrics.incr("first_audio_slo_miss");
            }
        }
    }
    info!(
        turn_id = input.turn_id.as_str(),
        total_ms = total.as_millis() as u64,
        audio_chunks = speech.audio_chunk_count(),
        "turn completed"
    );

    if !pipeline.assistant_text.trim().is_empty() {
        save_turn_best_effort(
            deps,
            &input.session,
            TurnRole::Assistant,
            pipeline.assistant_text.clone(),
        );
    }
}

/// Best-effort, bounded, fire-and-forget memory save.
fn save_turn_best_effort(
    deps: &TurnDeps,
    session: &SessionSnapshot,
    role: TurnRole,
    text: String,
) {
    let Some(store) = deps.memory.clone() else {
        return;
    };
    let metrics = Arc::clone(&deps.metrics);
    let timeout = deps.config.turn.memory_save_timeout();
    let session_id = session.id.clone();
    let user_id = session.user_id.clone();
    tokio::spawn(async move {
        let redacted = policy::redact(&text);
        let save = store.save_turn(&session_id, &user_id, role, &redacted);
        match tokio::time::timeout(timeout, save).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                metrics.incr("memory_save_failed");
                debug!(error = %e, "memory save failed");
            }
            Err(_) => metrics.incr("memory_save_timeout"),
        }
    });
}

/// Resolve memory context with a soft wait: proceed without it rather
/// than hold up the first token.
async fn resolve_memory_context(deps: &TurnDeps, input: &TurnInput) -> Vec<String> {
    if let Some(context) = &input.prefetched_memory {
        return context.clone();
    }
    if input.prefetched_brain.is_some() {
        // A replayed result never reaches the adapter; context is moot.
        return Vec::new();
    }
    let Some(store) = deps.memory.clone() else {
        return Vec::new();
    };

    let user_id = input.session.user_id.clone();
    let limit = deps.config.memory.context_limit;
    let hard_timeout = deps.config.turn.memory_context_timeout();
    let lookup = tokio::spawn(async move {
        tokio::time::timeout(hard_timeout, store.recent_context(&user_id, limit)).await
    });

    match tokio::time::timeout(deps.config.turn.memory_context_soft_wait(), lookup).await {
        Ok(Ok(Ok(Ok(lines)))) => lines,
        _ => {
            deps.metrics.incr("memory_context_skipped");
            Vec::new()
        }
    }
}

/// Per-delta text processing state.
struct DeltaPipeline {
    config: Arc<CompanionConfig>,
    outbound: OutboundScheduler,
    metrics: Arc<Metrics>,
    turn_id: String,
    committed_at: Instant,
    brain_first_delta_at: Arc<Mutex<Option<Instant>>>,
    first_delta_seen: Arc<AtomicBool>,
    lead_filter: LeadResponseFilter,
    sanitizer: SpeechSanitizer,
    planner: ProsodyPlanner,
    raw_accumulated: String,
    preview_chars_sent: usize,
    assistant_text: String,
    streamed_any: bool,
}

impl DeltaPipeline {
    async fn on_delta(&mut self, raw: &str, speech: &mut SpeechOutput) {
        if raw.is_empty() {
            return;
        }
        if !self.first_delta_seen.swap(true, Ordering::Relaxed) {
            let mut at = self
                .brain_first_delta_at
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            *at = Some(Instant::now());
        }

        if !self.lead_filter.is_committed() {
            self.send_thinking_preview(raw).await;
        }

        let released = self.lead_filter.push(raw);
        match released {
            Some(text) => self.emit_text(&text, speech).await,
            None => speech.try_adopt().await,
        }
    }

    /// Emit one committed text delta and feed the speech path.
    async fn emit_text(&mut self, text: &str, speech: &mut SpeechOutput) {
        if text.is_empty() {
            return;
        }
        if !self.streamed_any {
            self.streamed_any = true;
            self.metrics
                .record_latency(stage::COMMIT_TO_FIRST_TEXT, self.committed_at.elapsed());
            self.outbound
                .send(OutboundMessage::system("assistant_first_text", ""))
                .await;
        }
        self.assistant_text.push_str(text);
        self.outbound
            .send(OutboundMessage::AssistantTextDelta {
                turn_id: self.turn_id.clone(),
                text: text.to_owned(),
            })
            .await;

        let sanitized = self.sanitizer.push(text);
        if !sanitized.is_empty() {
            for segment in self.planner.push(&sanitized) {
                speech.speak(segment).await;
            }
        }
        speech.try_adopt().await;
    }

    /// Best-effort preview of what the assistant is composing, shown
    /// before the lead filter commits.
    async fn send_thinking_preview(&mut self, raw: &str) {
        if !self.config.turn.thinking_preview {
            return;
        }
        self.raw_accumulated.push_str(raw);
        let preview: String = strip_lead_filler(self.raw_accumulated.trim())
            .trim()
            .chars()
            .take(self.config.turn.thinking_preview_max_chars)
            .collect();
        let sent = self.preview_chars_sent;
        if preview.chars().count() <= sent {
            return;
        }
        let fresh: String = preview.chars().skip(sent).collect();
        self.preview_chars_sent = preview.chars().count();
        self.outbound
            .send(OutboundMessage::AssistantThinkingDelta {
                turn_id: self.turn_id.clone(),
                text: fresh,
            })
            .await;
    }
}
