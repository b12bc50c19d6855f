//! Text-to-speech provider boundary.
//!
//! One [`TtsStream`] is opened per turn. The turn driver writes prosody
//! segments into it; a forwarder task drains the event channel and ships
//! audio chunks to the client. Audio format is an opaque provider tag
//! passed through unchanged.

pub mod eleven;
pub mod mock;

use crate::error::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Synthesis settings carried per stream.
#[derive(Debug, Clone, Copy)]
pub struct VoiceSettings {
    pub stability: f32,
    pub similarity_boost: f32,
    pub speed: f32,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            stability: 0.5,
            similarity_boost: 0.75,
            speed: 1.0,
        }
    }
}

/// An event from a TTS stream.
#[derive(Debug, Clone)]
pub enum TtsEvent {
    /// A chunk of synthesized audio, base64-encoded, format tagged by the
    /// provider.
    Audio {
        audio_base64: String,
        format: String,
    },
    /// The stream produced all audio for the input sent so far and the
    /// input side is closed.
    Final,
    /// A provider error.
    Error {
        code: String,
        detail: String,
        retryable: bool,
    },
}

/// Starts one TTS stream per turn.
#[async_trait]
pub trait TtsProvider: Send + Sync {
    /// Open a streaming synthesis session for a voice/model pair.
    ///
    /// # Errors
    ///
    /// Returns an error when the stream cannot be established; the turn
    /// continues text-only.
    async fn start_stream(
        &self,
        cancel: CancellationToken,
        voice_id: &str,
        model_id: &str,
        settings: VoiceSettings,
    ) -> Result<(Box<dyn TtsStream>, mpsc::Receiver<TtsEvent>)>;

    fn name(&self) -> &'static str;
}

/// One open synthesis stream.
#[async_trait]
pub trait TtsStream: Send + Sync {
    /// Queue a text segment for synthesis. `try_trigger` asks the
    /// provider to start generating without waiting for more text.
    async fn send_text(&self, text: &str, try_trigger: bool) -> Result<()>;

    /// Signal that no more text is coming; the provider finishes
    /// synthesis and ends the event stream with [`TtsEvent::Final`].
    async fn close_input(&self) -> Result<()>;

    /// Tear the stream down. Idempotent.
    async fn close(&self);
}
