//! Per-turn speech output: TTS stream ownership and audio forwarding.
//!
//! The TTS stream is started concurrently with the reasoning call so
//! neither waits on the other. Until the start completes, prosody
//! segments are staged in a pending builder; the driver adopts the
//! stream non-blockingly between deltas and blockingly at finalization.
//! A forwarder task drains provider events into outbound audio chunks
//! with monotonically increasing sequence numbers.

use crate::config::VoiceConfig;
use crate::error::Result;
use crate::messages::{ErrorSource, OutboundMessage};
use crate::metrics::{stage, Metrics};
use crate::outbound::OutboundScheduler;
use crate::tts::{TtsEvent, TtsProvider, TtsStream, VoiceSettings};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Everything the forwarder needs to ship audio for one turn.
#[derive(Clone)]
pub struct TurnAudioContext {
    pub outbound: OutboundScheduler,
    pub metrics: Arc<Metrics>,
    pub turn_id: String,
    pub committed_at: Instant,
    /// Set when the first audio chunk goes out; the session loop reads it
    /// to classify early interrupts as suspected cutoffs.
    pub output_started: Arc<Mutex<Option<Instant>>>,
    /// When the first reasoning delta arrived, if it has.
    pub brain_first_delta_at: Arc<Mutex<Option<Instant>>>,
    pub cancel: CancellationToken,
}

/// Speech output for one turn.
pub struct SpeechOutput {
    start: Option<JoinHandle<Result<(Box<dyn TtsStream>, mpsc::Receiver<TtsEvent>)>>>,
    stream: Option<Box<dyn TtsStream>>,
    forwarder: Option<JoinHandle<()>>,
    pending: Vec<String>,
    start_failed: bool,
    start_error_reported: bool,
    audio_chunks: Arc<AtomicU64>,
    first_audio_at: Arc<Mutex<Option<Instant>>>,
    context: TurnAudioContext,
}

impl SpeechOutput {
    /// Kick off the TTS stream start without waiting for it.
    pub fn start(
        provider: Arc<dyn TtsProvider>,
        voice_config: &VoiceConfig,
        voice_id: String,
        context: TurnAudioContext,
    ) -> Self {
        let settings = VoiceSettings {
            stability: voice_config.stability,
            similarity_boost: voice_config.similarity_boost,
            speed: voice_config.speed,
        };
        let model_id = voice_config.model_id.clone();
        let cancel = context.cancel.clone();
        let start = tokio::spawn(async move {
            provider
                .start_stream(cancel, &voice_id, &model_id, settings)
                .await
        });
        Self {
            start: Some(start),
            stream: None,
            forwarder: None,
            pending: Vec::new(),
            start_failed: false,
            start_error_reported: false,
            audio_chunks: Arc::new(AtomicU64::new(0)),
            first_audio_at: Arc::new(Mutex::new(None)),
            context,
        }
    }

    /// Queue a segment, sending immediately when the stream is adopted.
    pub async fn speak(&mut self, segment: String) {
        if segment.trim().is_empty() {
            return;
        }
        if let Some(stream) = &self.stream {
            if let Err(e) = stream.send_text(&segment, true).await {
                warn!(error = %e, "tts send_text failed");
                self.context.metrics.incr("tts_send_failed");
            }
        } else if !self.start_failed {
            self.pending.push(segment);
        }
    }

    /// Adopt the stream if the start already finished. Cheap; called
    /// between deltas.
    pub async fn try_adopt(&mut self) {
        let finished = self.start.as_ref().is_some_and(JoinHandle::is_finished);
        if finished {
            self.adopt().await;
        }
    }

    /// Wait for the start to finish and adopt it; called at finalization.
    pub async fn adopt_blocking(&mut self) {
        if self.start.is_some() {
            self.adopt().await;
        }
    }

    async fn adopt(&mut self) {
        let Some(start) = self.start.take() else {
            return;
        };
        let started = match start.await {
            Ok(result) => result,
            Err(e) => Err(crate::error::CompanionError::Tts(format!(
                "start task failed: {e}"
            ))),
        };
        match started {
            Ok((stream, events)) => {
                self.forwarder = Some(spawn_forwarder(
                    events,
                    self.context.clone(),
                    Arc::clone(&self.audio_chunks),
                    Arc::clone(&self.first_audio_at),
                ));
                self.stream = Some(stream);
                for segment in std::mem::take(&mut self.pending) {
                    if let Some(stream) = &self.stream {
                        if let Err(e) = stream.send_text(&segment, true).await {
                            warn!(error = %e, "tts pending flush failed");
                            self.context.metrics.incr("tts_send_failed");
                        }
                    }
                }
            }
            Err(e) if e.is_cancelled() => {
                self.start_failed = true;
                self.start_error_reported = true;
            }
            Err(e) => {
                self.start_failed = true;
                self.pending.clear();
                if !self.start_error_reported {
                    self.start_error_reported = true;
                    warn!(error = %e, "tts start failed, continuing text-only");
                    self.context.metrics.incr("tts_start_failed");
                    self.context
                        .outbound
                        .send(OutboundMessage::error(
                            "tts_start_failed",
                            ErrorSource::Tts,
                            true,
                            e.to_string(),
                        ))
                        .await;
                }
            }
        }
    }

    /// Whether a live stream exists.
    pub fn is_active(&self) -> bool {
        self.stream.is_some()
    }

    /// Audio chunks shipped so far.
    pub fn audio_chunk_count(&self) -> u64 {
        self.audio_chunks.load(Ordering::Relaxed)
    }

    /// When the first audio chunk went out, if it has.
    pub fn first_audio_at(&self) -> Option<Instant> {
        *self
            .first_audio_at
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Close the input side and wait for the forwarder to drain.
    ///
    /// Returns once the forwarder exits or the timeout elapses.
    pub async fn finish(&mut self, finalize_timeout: Duration) {
        if let Some(stream) = &self.stream {
            if let Err(e) = stream.close_input().await {
                debug!(error = %e, "tts close_input failed");
            }
        }
        if let Some(forwarder) = self.forwarder.take() {
            if tokio::time::timeout(finalize_timeout, forwarder)
                .await
                .is_err()
            {
                warn!("tts forwarder did not drain before finalize timeout");
                self.context.metrics.incr("tts_finalize_timeout");
            }
        }
        if let Some(stream) = self.stream.take() {
            stream.close().await;
        }
    }

    /// Tear down without draining (turn cancelled).
    pub async fn abandon(&mut self) {
        if let Some(start) = self.start.take() {
            start.abort();
        }
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
        if let Some(stream) = self.stream.take() {
            stream.close().await;
        }
    }
}

fn spawn_forwarder(
    mut events: mpsc::Receiver<TtsEvent>,
    context: TurnAudioContext,
    audio_chunks: Arc<AtomicU64>,
    first_audio_at: Arc<Mutex<Option<Instant>>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut seq: u64 = 0;
        loop {
            let event = tokio::select! {
                // Cancelled mid-stream: stop without draining, the client
                // is pivoting to a new turn.
                () = context.cancel.cancelled() => return,
                maybe = events.recv() => maybe,
            };
            match event {
                Some(TtsEvent::Audio {
                    audio_base64,
                    format,
                }) => {
                    seq += 1;
                    if seq == 1 {
                        let now = Instant::now();
                        {
                            let mut started = context
                                .output_started
                                .lock()
                                .unwrap_or_else(|e| e.into_inner());
                            *started = Some(now);
                        }
                        {
                            let mut first = first_audio_at
                                .lock()
                                .unwrap_or_else(|e| e.into_inner());
                            *first = Some(now);
                        }
                        context.metrics.record_latency(
                            stage::COMMIT_TO_FIRST_AUDIO,
                            now.duration_since(context.committed_at),
                        );
                        let brain_first_delta = *context
                            .brain_first_delta_at
                            .lock()
                            .unwrap_or_else(|e| e.into_inner());
                        if let Some(at) = brain_first_delta {
                            context.metrics.record_latency(
                                stage::BRAIN_FIRST_DELTA_TO_FIRST_AUDIO,
                                now.duration_since(at),
                            );
                        }
                        context
                            .outbound
                            .send(OutboundMessage::system("assistant_first_audio", ""))
                            .await;
                    }
                    audio_chunks.fetch_add(1, Ordering::Relaxed);
                    context
                        .outbound
                        .send(OutboundMessage::AssistantAudioChunk {
                            turn_id: context.turn_id.clone(),
                            seq,
                            format,
                            audio_base64,
                        })
                        .await;
                }
                Some(TtsEvent::Error {
                    code,
                    detail,
                    retryable,
                }) => {
                    context.metrics.incr("tts_provider_error");
                    context
                        .outbound
                        .send(OutboundMessage::error(
                            &code,
                            ErrorSource::Tts,
                            retryable,
                            detail,
                        ))
                        .await;
                }
                Some(TtsEvent::Final) | None => return,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::config::OutboundConfig;
    use crate::tts::mock::MockTtsProvider;

    fn context(
        outbound: OutboundScheduler,
        metrics: Arc<Metrics>,
        cancel: CancellationToken,
    ) -> TurnAudioContext {
        TurnAudioContext {
            outbound,
            metrics,
            turn_id: "t1".to_owned(),
            committed_at: Instant::now(),
            output_started: Arc::new(Mutex::new(None)),
            brain_first_delta_at: Arc::new(Mutex::new(None)),
            cancel,
        }
    }

    #[tokio::test]
    async fn pending_segments_flush_on_adoption() {
        let metrics = Arc::new(Metrics::new());
        let (outbound, mut rx) =
            OutboundScheduler::new(&OutboundConfig::default(), Arc::clone(&metrics));
        let provider = Arc::new(MockTtsProvider::new());
        let cancel = CancellationToken::new();

        let mut speech = SpeechOutput::start(
            Arc::clone(&provider) as Arc<dyn TtsProvider>,
            &VoiceConfig::default(),
            "voice-a".to_owned(),
            context(outbound, metrics, cancel),
        );
        speech.speak("First segment.".to_owned()).await;
        speech.adopt_blocking().await;
        speech.speak("Second segment.".to_owned()).await;
        speech.finish(Duration::from_secs(1)).await;

        assert_eq!(
            provider.segments(),
            vec!["First segment.".to_owned(), "Second segment.".to_owned()]
        );
        assert_eq!(speech.audio_chunk_count(), 2);

        // First audio system event precedes the first chunk; sequences
        // increase monotonically from 1.
        let mut seqs = Vec::new();
        while let Ok(message) = rx.try_recv() {
            match message {
                OutboundMessage::AssistantAudioChunk { seq, .. } => seqs.push(seq),
                OutboundMessage::SystemEvent { code, .. } => {
                    assert_eq!(code, "assistant_first_audio");
                    assert!(seqs.is_empty());
                }
                other => panic!("unexpected message {other:?}"),
            }
        }
        assert_eq!(seqs, vec![1, 2]);
    }

    #[tokio::test]
    async fn start_failure_reports_and_degrades() {
        let metrics = Arc::new(Metrics::new());
        let (outbound, mut rx) =
            OutboundScheduler::new(&OutboundConfig::default(), Arc::clone(&metrics));
        let provider = Arc::new(MockTtsProvider::failing_start());
        let cancel = CancellationToken::new();

        let mut speech = SpeechOutput::start(
            provider as Arc<dyn TtsProvider>,
            &VoiceConfig::default(),
            "voice-a".to_owned(),
            context(outbound, Arc::clone(&metrics), cancel),
        );
        speech.adopt_blocking().await;
        speech.speak("never spoken".to_owned()).await;
        speech.finish(Duration::from_millis(100)).await;

        assert!(!speech.is_active());
        assert_eq!(speech.audio_chunk_count(), 0);
        assert_eq!(metrics.counter("tts_start_failed"), 1);
        match rx.try_recv().unwrap() {
            OutboundMessage::ErrorEvent {
                code, retryable, ..
            } => {
                assert_eq!(code, "tts_start_failed");
                assert!(retryable);
            }
            other => panic!("expected error event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn first_audio_latency_is_recorded() {
        let metrics = Arc::new(Metrics::new());
        let (outbound, _rx) =
            OutboundScheduler::new(&OutboundConfig::default(), Arc::clone(&metrics));
        let provider = Arc::new(MockTtsProvider::new());
        let cancel = CancellationToken::new();
        let ctx = context(outbound, Arc::clone(&metrics), cancel);
        let output_started = Arc::clone(&ctx.output_started);

        let mut speech = SpeechOutput::start(
            provider as Arc<dyn TtsProvider>,
            &VoiceConfig::default(),
            "voice-a".to_owned(),
            ctx,
        );
        speech.adopt_blocking().await;
        speech.speak("Hello.".to_owned()).await;
        speech.finish(Duration::from_secs(1)).await;

        assert!(speech.first_audio_at().is_some());
        assert!(output_started.lock().unwrap().is_some());
        assert_eq!(
            metrics
                .latency(stage::COMMIT_TO_FIRST_AUDIO)
                .map(|s| s.count),
            Some(1)
        );
    }
}
