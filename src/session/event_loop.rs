//! The per-connection session driver.
//!
//! One task per websocket connection multiplexes four event sources:
//! client messages, STT events, task-runtime events, and cancellation of
//! the session scope. Exactly one event is processed per iteration, so
//! per-session state needs no further synchronization. The loop owns
//! wake-word and partial-transcript state, drives the speculator from
//! partials, and enforces the one-active-turn rule: a commit landing
//! during an active turn cancels it with `barge_in` before the next turn
//! spawns.

use crate::brain::ReasoningAdapter;
use crate::config::CompanionConfig;
use crate::endpoint::{self, EndpointReason, HintDispatcher};
use crate::error::Result;
use crate::memory::{MemoryPrefetch, MemoryStore};
use crate::messages::{ClientMessage, ControlAction, ErrorSource, OutboundMessage, TurnEndReason};
use crate::metrics::{stage, Metrics};
use crate::outbound::OutboundScheduler;
use crate::session::wakeword::{GateDecision, WakeWordGate};
use crate::session::{SessionManager, SessionSnapshot};
use crate::speculate::canonical::canonicalize;
use crate::speculate::{BrainResult, SpeculationIdentity, Speculator};
use crate::stt::{SttEvent, SttProvider, SttSession};
use crate::tasks::{parse_task_voice_command, TaskLifecycleEvent, TaskRuntime, TaskVoiceCommand};
use crate::tts::TtsProvider;
use crate::turn::{run_turn, TurnDeps, TurnInput};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// An interrupt this soon after assistant output started suggests the
/// assistant talked over the user's intended continuation.
const CUTOFF_SUSPECT_WINDOW: Duration = Duration::from_millis(500);

/// How long a prefetched memory context stays usable.
const MEMORY_PREFETCH_FRESH: Duration = Duration::from_secs(10);

/// Shared collaborators for all sessions.
#[derive(Clone)]
pub struct SessionDeps {
    pub stt: Arc<dyn SttProvider>,
    pub tts: Arc<dyn TtsProvider>,
    pub brain: Arc<dyn ReasoningAdapter>,
    pub memory: Option<Arc<dyn MemoryStore>>,
    pub tasks: Option<Arc<dyn TaskRuntime>>,
    pub sessions: SessionManager,
    pub metrics: Arc<Metrics>,
    pub config: Arc<CompanionConfig>,
}

/// The currently running (or most recently spawned) turn.
struct ActiveTurn {
    turn_id: String,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Loop-owned mutable state.
struct LoopState {
    gate: WakeWordGate,
    hints: HintDispatcher,
    utterance_started_at: Option<Instant>,
    stop_requested_at: Option<Instant>,
    last_sample_rate: u32,
    output_started: Arc<Mutex<Option<Instant>>>,
    active_turn: Option<ActiveTurn>,
}

/// Immutable per-session context shared by the handlers.
struct SessionCtx {
    deps: SessionDeps,
    session: SessionSnapshot,
    outbound: OutboundScheduler,
    cancel: CancellationToken,
    speculator: Speculator,
    memory_prefetch: Option<MemoryPrefetch>,
}

/// Drive one connection until the client, the STT stream, or the session
/// scope ends it.
///
/// # Errors
///
/// Returns an error only when the STT session cannot be established;
/// every later failure is reported through outbound events instead.
pub async fn run_session(
    deps: SessionDeps,
    session: SessionSnapshot,
    mut inbound: mpsc::Receiver<ClientMessage>,
    outbound: OutboundScheduler,
    cancel: CancellationToken,
) -> Result<()> {
    let (stt_session, mut stt_events) = match deps
        .stt
        .start_session(cancel.child_token(), &session.id)
        .await
    {
        Ok(started) => started,
        Err(e) => {
            warn!(session_id = session.id.as_str(), error = %e, "stt connect failed");
            deps.metrics.incr("stt_connect_failed");
            outbound
                .send(OutboundMessage::error(
                    "stt_connect_failed",
                    ErrorSource::Stt,
                    false,
                    e.to_string(),
                ))
                .await;
            return Err(e);
        }
    };

    // Task runtime: initial snapshot plus a live event subscription.
    let mut task_events = match (&deps.tasks, deps.config.tasks.enabled) {
        (Some(runtime), true) => {
            match runtime.snapshot(&session.id).await {
                Ok(tasks) => {
                    outbound
                        .send(OutboundMessage::TaskStatusSnapshot { tasks })
                        .await;
                }
                Err(e) => debug!(error = %e, "task snapshot failed"),
            }
            match runtime.subscribe(&session.id).await {
                Ok(rx) => Some(rx),
                Err(e) => {
                    debug!(error = %e, "task subscription failed");
                    None
                }
            }
        }
        _ => None,
    };

    // Pre-warm the reasoning adapter so the first turn skips connection
    // setup.
    if deps.brain.supports_prewarm() {
        let brain = Arc::clone(&deps.brain);
        let metrics = Arc::clone(&deps.metrics);
        let session_id = session.id.clone();
        let budget = deps.config.brain.warmup_timeout();
        tokio::spawn(async move {
            match tokio::time::timeout(budget, brain.prewarm(&session_id)).await {
                Ok(Ok(())) => metrics.incr("brain_warmup_ok"),
                Ok(Err(_)) => metrics.incr("brain_warmup_failed"),
                Err(_) => metrics.incr("brain_warmup_timeout"),
            }
        });
    }

    let speculator = Speculator::new(
        deps.config.speculator.clone(),
        Arc::clone(&deps.brain),
        Arc::clone(&deps.metrics),
        cancel.clone(),
        SpeculationIdentity {
            user_id: session.user_id.clone(),
            session_id: session.id.clone(),
            persona_id: session.persona_id.clone(),
        },
    );
    let memory_prefetch = deps.memory.clone().map(|store| {
        MemoryPrefetch::new(
            store,
            session.user_id.clone(),
            deps.config.memory.context_limit,
            MEMORY_PREFETCH_FRESH,
        )
    });

    let ctx = SessionCtx {
        deps,
        session,
        outbound,
        cancel: cancel.clone(),
        speculator,
        memory_prefetch,
    };
    let mut state = LoopState {
        gate: WakeWordGate::new(ctx.deps.config.wake_word.clone()),
        hints: HintDispatcher::new(),
        utterance_started_at: None,
        stop_requested_at: None,
        last_sample_rate: 16_000,
        output_started: Arc::new(Mutex::new(None)),
        active_turn: None,
    };
    let mut task_events_open = task_events.is_some();

    info!(session_id = ctx.session.id.as_str(), "session loop started");

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                teardown(&ctx, &mut state, &*stt_session, TurnEndReason::ConnectionClosed).await;
                return Ok(());
            }
            maybe = inbound.recv() => match maybe {
                Some(message) => handle_client(&ctx, &mut state, &*stt_session, message).await,
                None => {
                    teardown(&ctx, &mut state, &*stt_session, TurnEndReason::ConnectionClosed).await;
                    return Ok(());
                }
            },
            maybe = stt_events.recv() => match maybe {
                Some(event) => handle_stt_event(&ctx, &mut state, event).await,
                None => {
                    teardown(&ctx, &mut state, &*stt_session, TurnEndReason::SttClosed).await;
                    return Ok(());
                }
            },
            maybe = recv_task_event(&mut task_events), if task_events_open => match maybe {
                Some(event) => ctx.outbound.send(event.into_outbound()).await,
                None => task_events_open = false,
            },
        }
    }
}

async fn recv_task_event(
    rx: &mut Option<mpsc::Receiver<TaskLifecycleEvent>>,
) -> Option<TaskLifecycleEvent> {
    match rx.as_mut() {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn handle_client(
    ctx: &SessionCtx,
    state: &mut LoopState,
    stt_session: &dyn SttSession,
    message: ClientMessage,
) {
    match message {
        ClientMessage::ClientAudioChunk {
            pcm16_base64,
            sample_rate,
            ..
        } => {
            ctx.deps.sessions.touch(&ctx.session.id);
            state.last_sample_rate = sample_rate;
            if let Err(e) = stt_session
                .send_audio_chunk(&pcm16_base64, sample_rate, false)
                .await
            {
                ctx.deps.metrics.incr("stt_send_audio_failed");
                ctx.outbound
                    .send(OutboundMessage::error(
                        "stt_send_audio_failed",
                        ErrorSource::Stt,
                        true,
                        e.to_string(),
                    ))
                    .await;
            }
        }
        ClientMessage::ClientControl {
            action,
            reason,
            task_id,
            approved,
            ..
        } => {
            handle_control(ctx, state, stt_session, action, reason, task_id, approved).await;
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_control(
    ctx: &SessionCtx,
    state: &mut LoopState,
    stt_session: &dyn SttSession,
    action: ControlAction,
    reason: Option<String>,
    task_id: Option<String>,
    approved: Option<bool>,
) {
    let metrics = &ctx.deps.metrics;
    match action {
        ControlAction::Interrupt => {
            metrics.incr("client_interrupt");
            if let Some(reason) = &reason {
                metrics.incr(&format!("client_interrupt_reason_{reason}"));
            }
            let output_started = *state
                .output_started
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if output_started.is_some_and(|at| at.elapsed() <= CUTOFF_SUSPECT_WINDOW) {
                metrics.incr("cutoff_suspected");
            }
            ctx.deps.sessions.interrupt(&ctx.session.id);
            cancel_active_turn(ctx, state, TurnEndReason::Interrupted).await;
        }
        ControlAction::Stop => {
            metrics.incr("client_stop");
            if let Some(reason) = &reason {
                metrics.incr(&format!("client_stop_reason_{reason}"));
            }
            state.stop_requested_at = Some(Instant::now());
            // An empty committing chunk forces the provider to finalize
            // the current segment.
            if let Err(e) = stt_session
                .send_audio_chunk("", state.last_sample_rate, true)
                .await
            {
                ctx.outbound
                    .send(OutboundMessage::error(
                        "stt_send_audio_failed",
                        ErrorSource::Stt,
                        true,
                        e.to_string(),
                    ))
                    .await;
            }
        }
        ControlAction::Start | ControlAction::Mute | ControlAction::Unmute => {
            ctx.deps.sessions.touch(&ctx.session.id);
            metrics.incr(&format!("client_control_{}", control_name(action)));
        }
        ControlAction::WakewordOn => state.gate.set_enabled(true),
        ControlAction::WakewordOff => state.gate.set_enabled(false),
        ControlAction::ManualArm => state.gate.manual_arm(),
        ControlAction::ApproveTaskStep
        | ControlAction::DenyTaskStep
        | ControlAction::CancelTask
        | ControlAction::PauseTask
        | ControlAction::ResumeTask => {
            forward_task_control(ctx, action, task_id, approved).await;
        }
    }
}

fn control_name(action: ControlAction) -> &'static str {
    match action {
        ControlAction::Start => "start",
        ControlAction::Mute => "mute",
        ControlAction::Unmute => "unmute",
        _ => "other",
    }
}

async fn forward_task_control(
    ctx: &SessionCtx,
    action: ControlAction,
    task_id: Option<String>,
    approved: Option<bool>,
) {
    let Some(runtime) = (ctx.deps.config.tasks.enabled)
        .then(|| ctx.deps.tasks.clone())
        .flatten()
    else {
        ctx.outbound
            .send(OutboundMessage::error(
                "task_runtime_disabled",
                ErrorSource::TaskRuntime,
                false,
                "",
            ))
            .await;
        return;
    };

    let task_id = task_id.unwrap_or_default();
    let session_id = &ctx.session.id;
    let result = match action {
        ControlAction::ApproveTaskStep => {
            runtime
                .respond_to_step(session_id, &task_id, approved.unwrap_or(true))
                .await
        }
        ControlAction::DenyTaskStep => {
            runtime
                .respond_to_step(session_id, &task_id, approved.unwrap_or(false))
                .await
        }
        ControlAction::CancelTask => runtime.cancel(session_id, &task_id).await,
        ControlAction::PauseTask => runtime.pause(session_id, &task_id).await,
        ControlAction::ResumeTask => runtime.resume(session_id, &task_id).await,
        _ => Ok(()),
    };
    if let Err(e) = result {
        ctx.deps.metrics.incr("task_control_failed");
        ctx.outbound
            .send(OutboundMessage::error(
                "task_control_failed",
                ErrorSource::TaskRuntime,
                true,
                e.to_string(),
            ))
            .await;
    }
}

async fn handle_stt_event(ctx: &SessionCtx, state: &mut LoopState, event: SttEvent) {
    match event {
        SttEvent::Partial {
            text,
            confidence,
            ts_ms,
        } => handle_partial(ctx, state, text, confidence, ts_ms).await,
        SttEvent::Committed { text, source, ts_ms } => {
            handle_committed(ctx, state, text, source, ts_ms).await;
        }
        SttEvent::Error {
            code,
            detail,
            retryable,
        } => {
            if code == "commit_throttled" {
                debug!("stt commit throttled, ignoring");
                return;
            }
            ctx.deps.metrics.incr("stt_provider_error");
            ctx.outbound
                .send(OutboundMessage::error(
                    &code,
                    ErrorSource::Stt,
                    retryable,
                    detail,
                ))
                .await;
        }
    }
}

async fn handle_partial(
    ctx: &SessionCtx,
    state: &mut LoopState,
    text: String,
    confidence: f32,
    ts_ms: i64,
) {
    if !text.trim().is_empty() {
        if state.utterance_started_at.is_none() {
            state.utterance_started_at = Some(Instant::now());
        }
        let age = state
            .utterance_started_at
            .map(|at| at.elapsed())
            .unwrap_or_default();

        let hint = endpoint::classify(&text, confidence, age, &ctx.deps.config.semantic);
        let mut terminal_cue = false;
        if let Some(hint) = hint {
            terminal_cue = hint.reason == EndpointReason::Terminal;
            if state
                .hints
                .should_emit(&hint, ctx.deps.config.semantic.emit_refresh())
            {
                ctx.outbound
                    .send(OutboundMessage::SemanticEndpointHint {
                        reason: hint.reason.as_str().to_owned(),
                        confidence: hint.confidence,
                        hold_ms: hint.hold.as_millis() as u64,
                        should_commit: hint.should_commit,
                    })
                    .await;
            }
        }

        if let Some(prefetch) = &ctx.memory_prefetch {
            prefetch.start();
        }

        if state.gate.allows_speculation(&text) {
            let memory_context = ctx
                .memory_prefetch
                .as_ref()
                .and_then(MemoryPrefetch::peek_fresh)
                .unwrap_or_default();
            ctx.speculator
                .on_partial(&text, age, terminal_cue, memory_context);
        }
    }

    ctx.outbound
        .send(OutboundMessage::SttPartial {
            text,
            confidence,
            ts_ms,
        })
        .await;
}

async fn handle_committed(
    ctx: &SessionCtx,
    state: &mut LoopState,
    text: String,
    source: String,
    ts_ms: i64,
) {
    let trimmed = text.trim().to_owned();
    if trimmed.is_empty() {
        return;
    }
    let metrics = &ctx.deps.metrics;

    if let Some(started) = state.utterance_started_at {
        metrics.record_latency(stage::PARTIAL_TO_COMMIT, started.elapsed());
    }
    metrics.incr(&format!("stt_commit_source_{source}"));
    if let Some(stop_at) = state.stop_requested_at.take() {
        metrics.record_latency(stage::STOP_TO_STT_COMMITTED, stop_at.elapsed());
    }

    state.utterance_started_at = None;
    state.hints.reset();
    ctx.speculator.reset_stability();

    // Emitted even when the wake-word gate swallows the commit, so
    // clients can observe what the recognizer heard.
    ctx.outbound
        .send(OutboundMessage::SttCommitted {
            text: trimmed.clone(),
            source,
            ts_ms,
        })
        .await;

    let turn_text = match state.gate.filter_commit(&trimmed) {
        GateDecision::Pass => trimmed,
        GateDecision::Woken { query } => {
            metrics.incr("wake_word_accepted");
            ctx.outbound
                .send(OutboundMessage::system("wake_word", query.clone()))
                .await;
            if query.trim().is_empty() {
                return;
            }
            query
        }
        GateDecision::Ignored => {
            metrics.incr("wake_word_ignored");
            debug!("commit ignored by wake-word gate");
            return;
        }
    };

    if ctx.deps.config.tasks.enabled {
        if let Some(runtime) = &ctx.deps.tasks {
            if let Some(command) = parse_task_voice_command(&turn_text) {
                dispatch_voice_command(ctx, runtime.as_ref(), command).await;
                return;
            }
        }
    }

    let canonical = canonicalize(&turn_text);
    let prefetched_brain = ctx.speculator.consume(&canonical).await;
    let prefetched_memory = ctx
        .memory_prefetch
        .as_ref()
        .and_then(MemoryPrefetch::take_fresh);

    cancel_active_turn(ctx, state, TurnEndReason::BargeIn).await;
    spawn_turn(ctx, state, turn_text, prefetched_brain, prefetched_memory);
}

async fn dispatch_voice_command(
    ctx: &SessionCtx,
    runtime: &dyn TaskRuntime,
    command: TaskVoiceCommand,
) {
    ctx.deps.metrics.incr("task_voice_command");
    let session_id = &ctx.session.id;
    let result = match command {
        TaskVoiceCommand::Approve => runtime.respond_to_step(session_id, "", true).await,
        TaskVoiceCommand::Deny => runtime.respond_to_step(session_id, "", false).await,
        TaskVoiceCommand::Cancel => runtime.cancel(session_id, "").await,
        TaskVoiceCommand::Pause => runtime.pause(session_id, "").await,
        TaskVoiceCommand::Resume => runtime.resume(session_id, "").await,
    };
    if let Err(e) = result {
        ctx.deps.metrics.incr("task_control_failed");
        ctx.outbound
            .send(OutboundMessage::error(
                "task_control_failed",
                ErrorSource::TaskRuntime,
                true,
                e.to_string(),
            ))
            .await;
    }
}

fn spawn_turn(
    ctx: &SessionCtx,
    state: &mut LoopState,
    user_text: String,
    prefetched_brain: Option<BrainResult>,
    prefetched_memory: Option<Vec<String>>,
) {
    ctx.deps.sessions.touch(&ctx.session.id);
    let turn_id = Uuid::new_v4().to_string();
    let turn_cancel = ctx.cancel.child_token();
    {
        let mut output_started = state
            .output_started
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        *output_started = None;
    }

    let deps = TurnDeps {
        brain: Arc::clone(&ctx.deps.brain),
        tts: Arc::clone(&ctx.deps.tts),
        memory: ctx.deps.memory.clone(),
        metrics: Arc::clone(&ctx.deps.metrics),
        config: Arc::clone(&ctx.deps.config),
    };
    let input = TurnInput {
        session: ctx.session.clone(),
        user_text,
        turn_id: turn_id.clone(),
        committed_at: Instant::now(),
        prefetched_memory,
        prefetched_brain,
        output_started: Arc::clone(&state.output_started),
    };
    let outbound = ctx.outbound.clone();
    let handle = tokio::spawn(run_turn(deps, input, outbound, turn_cancel.clone()));
    state.active_turn = Some(ActiveTurn {
        turn_id,
        cancel: turn_cancel,
        handle,
    });
}

/// Cancel the active turn, emitting `turn_end` with `reason` unless the
/// turn already finished (in which case the driver emitted its own).
///
/// The driver task is awaited before `turn_end` goes out so no stray
/// audio chunk of the cancelled turn can land after it.
async fn cancel_active_turn(ctx: &SessionCtx, state: &mut LoopState, reason: TurnEndReason) {
    let Some(turn) = state.active_turn.take() else {
        return;
    };
    if turn.handle.is_finished() {
        return;
    }
    info!(
        turn_id = turn.turn_id.as_str(),
        reason = reason.as_str(),
        "cancelling active turn"
    );
    ctx.deps
        .metrics
        .incr(&format!("turn_cancelled_{}", reason.as_str()));
    turn.cancel.cancel();
    let mut handle = turn.handle;
    if tokio::time::timeout(Duration::from_secs(2), &mut handle)
        .await
        .is_err()
    {
        warn!(turn_id = turn.turn_id.as_str(), "cancelled turn did not exit, aborting");
        handle.abort();
    }
    ctx.outbound
        .send(OutboundMessage::AssistantTurnEnd {
            turn_id: turn.turn_id,
            reason,
        })
        .await;
}

async fn teardown(
    ctx: &SessionCtx,
    state: &mut LoopState,
    stt_session: &dyn SttSession,
    reason: TurnEndReason,
) {
    info!(
        session_id = ctx.session.id.as_str(),
        reason = reason.as_str(),
        "session loop ending"
    );
    cancel_active_turn(ctx, state, reason).await;
    ctx.speculator.cancel_in_flight();
    stt_session.close().await;
    ctx.deps.sessions.end(&ctx.session.id);
}

impl SessionDeps {
    /// Spawn a session loop under `cancel`, returning its join handle.
    pub fn spawn_session(
        &self,
        session: SessionSnapshot,
        inbound: mpsc::Receiver<ClientMessage>,
        outbound: OutboundScheduler,
        cancel: CancellationToken,
    ) -> JoinHandle<Result<()>> {
        let deps = self.clone();
        tokio::spawn(run_session(deps, session, inbound, outbound, cancel))
    }
}
