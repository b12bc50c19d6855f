//! Speech-to-text provider boundary.
//!
//! The session event loop only depends on these traits: a provider that
//! opens one streaming session per connection, a session handle that
//! accepts audio chunks (optionally forcing a commit), and an event
//! channel carrying partial/committed/error events in arrival order.

pub mod mock;

use crate::error::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// An event from the STT stream.
#[derive(Debug, Clone)]
pub enum SttEvent {
    /// A preliminary hypothesis for audio received so far.
    Partial {
        text: String,
        confidence: f32,
        ts_ms: i64,
    },
    /// A finalized transcript for a contiguous speech segment.
    Committed {
        text: String,
        /// What finalized the segment (e.g. "endpoint", "stop", "timeout").
        source: String,
        ts_ms: i64,
    },
    /// A provider error.
    Error {
        code: String,
        detail: String,
        retryable: bool,
    },
}

/// Starts one STT session per connection.
#[async_trait]
pub trait SttProvider: Send + Sync {
    /// Open a streaming session. The receiver carries events until the
    /// provider closes the stream.
    ///
    /// # Errors
    ///
    /// Returns an error when the session cannot be established; the
    /// session loop treats that as fatal (`stt_connect_failed`).
    async fn start_session(
        &self,
        cancel: CancellationToken,
        session_id: &str,
    ) -> Result<(Box<dyn SttSession>, mpsc::Receiver<SttEvent>)>;

    fn name(&self) -> &'static str;
}

/// One open STT stream.
#[async_trait]
pub trait SttSession: Send + Sync {
    /// Forward an audio chunk. `commit` forces the provider to finalize
    /// the current segment (used by the client's stop control, with an
    /// empty chunk).
    async fn send_audio_chunk(
        &self,
        pcm16_base64: &str,
        sample_rate: u32,
        commit: bool,
    ) -> Result<()>;

    /// Close the stream. Idempotent.
    async fn close(&self);
}
