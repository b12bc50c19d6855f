//! Scriptable in-process TTS provider for tests and demos.
//!
//! Each accepted text segment synthesizes to one audio event whose
//! payload encodes the segment text, so tests can assert exactly which
//! speech reached the stream and in what order.

use super::{TtsEvent, TtsProvider, TtsStream, VoiceSettings};
use crate::error::{CompanionError, Result};
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Audio format tag the mock reports.
const MOCK_FORMAT: &str = "pcm_16000";

/// Mock provider.
#[derive(Default)]
pub struct MockTtsProvider {
    fail_start: bool,
    mute: bool,
    segments: Arc<Mutex<Vec<String>>>,
}

impl MockTtsProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// A provider whose `start_stream` always fails.
    pub fn failing_start() -> Self {
        Self {
            fail_start: true,
            ..Self::default()
        }
    }

    /// A provider that accepts text but never produces audio.
    pub fn muted() -> Self {
        Self {
            mute: true,
            ..Self::default()
        }
    }

    /// Every text segment sent to any stream of this provider, in order.
    pub fn segments(&self) -> Vec<String> {
        self.segments.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl TtsProvider for MockTtsProvider {
    async fn start_stream(
        &self,
        _cancel: CancellationToken,
        _voice_id: &str,
        _model_id: &str,
        _settings: VoiceSettings,
    ) -> Result<(Box<dyn TtsStream>, mpsc::Receiver<TtsEvent>)> {
        if self.fail_start {
            return Err(CompanionError::Tts("start refused".to_owned()));
        }
        let (events_tx, events_rx) = mpsc::channel(64);
        let stream = MockTtsStream {
            events: events_tx,
            segments: Arc::clone(&self.segments),
            mute: self.mute,
        };
        Ok((Box::new(stream), events_rx))
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

struct MockTtsStream {
    events: mpsc::Sender<TtsEvent>,
    segments: Arc<Mutex<Vec<String>>>,
    mute: bool,
}

#[async_trait]
impl TtsStream for MockTtsStream {
    async fn send_text(&self, text: &str, _try_trigger: bool) -> Result<()> {
        {
            let mut segments = self.segments.lock().unwrap_or_else(|e| e.into_inner());
            segments.push(text.to_owned());
        }
        if self.mute {
            return Ok(());
        }
        let audio = BASE64.encode(text.as_bytes());
        self.events
            .send(TtsEvent::Audio {
                audio_base64: audio,
                format: MOCK_FORMAT.to_owned(),
            })
            .await
            .map_err(|e| CompanionError::Channel(format!("tts event channel closed: {e}")))
    }

    async fn close_input(&self) -> Result<()> {
        let _ = self.events.send(TtsEvent::Final).await;
        Ok(())
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[tokio::test]
    async fn segments_become_audio_events() {
        let provider = MockTtsProvider::new();
        let (stream, mut events) = provider
            .start_stream(
                CancellationToken::new(),
                "voice",
                "model",
                VoiceSettings::default(),
            )
            .await
            .unwrap();

        stream.send_text("Hello there.", true).await.unwrap();
        stream.close_input().await.unwrap();

        match events.recv().await {
            Some(TtsEvent::Audio {
                audio_base64,
                format,
            }) => {
                assert_eq!(format, MOCK_FORMAT);
                assert_eq!(BASE64.decode(audio_base64).unwrap(), b"Hello there.");
            }
            other => panic!("expected audio event, got {other:?}"),
        }
        assert!(matches!(events.recv().await, Some(TtsEvent::Final)));
        assert_eq!(provider.segments(), vec!["Hello there.".to_owned()]);
    }

    #[tokio::test]
    async fn muted_stream_only_finalizes() {
        let provider = MockTtsProvider::muted();
        let (stream, mut events) = provider
            .start_stream(
                CancellationToken::new(),
                "voice",
                "model",
                VoiceSettings::default(),
            )
            .await
            .unwrap();

        stream.send_text("quiet", true).await.unwrap();
        stream.close_input().await.unwrap();
        assert!(matches!(events.recv().await, Some(TtsEvent::Final)));
    }
}
