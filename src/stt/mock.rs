//! Scriptable in-process STT provider for tests and demos.
//!
//! The provider hands out a [`MockSttHandle`] per session that tests use
//! to inject partial/committed/error events as if a real recognizer had
//! produced them, and to observe the audio chunks the session forwarded.

use super::{SttEvent, SttProvider, SttSession};
use crate::error::{CompanionError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// One audio chunk a session forwarded to the provider.
#[derive(Debug, Clone)]
pub struct SentChunk {
    pub pcm16_base64: String,
    pub sample_rate: u32,
    pub commit: bool,
}

/// Test-side handle for one mock session.
#[derive(Clone)]
pub struct MockSttHandle {
    events: mpsc::Sender<SttEvent>,
    chunks: Arc<Mutex<Vec<SentChunk>>>,
}

impl MockSttHandle {
    /// Inject a partial transcript event.
    pub async fn partial(&self, text: &str, confidence: f32) {
        let _ = self
            .events
            .send(SttEvent::Partial {
                text: text.to_owned(),
                confidence,
                ts_ms: now_ms(),
            })
            .await;
    }

    /// Inject a committed transcript event.
    pub async fn committed(&self, text: &str, source: &str) {
        let _ = self
            .events
            .send(SttEvent::Committed {
                text: text.to_owned(),
                source: source.to_owned(),
                ts_ms: now_ms(),
            })
            .await;
    }

    /// Inject a provider error event.
    pub async fn error(&self, code: &str, detail: &str, retryable: bool) {
        let _ = self
            .events
            .send(SttEvent::Error {
                code: code.to_owned(),
                detail: detail.to_owned(),
                retryable,
            })
            .await;
    }

    /// Audio chunks the session forwarded so far.
    pub fn sent_chunks(&self) -> Vec<SentChunk> {
        self.chunks.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

struct MockSttSession {
    chunks: Arc<Mutex<Vec<SentChunk>>>,
    closed: Arc<Mutex<bool>>,
    fail_sends: bool,
}

#[async_trait]
impl SttSession for MockSttSession {
    async fn send_audio_chunk(
        &self,
        pcm16_base64: &str,
        sample_rate: u32,
        commit: bool,
    ) -> Result<()> {
        if self.fail_sends {
            return Err(CompanionError::Stt("send failed".to_owned()));
        }
        let mut chunks = self.chunks.lock().unwrap_or_else(|e| e.into_inner());
        chunks.push(SentChunk {
            pcm16_base64: pcm16_base64.to_owned(),
            sample_rate,
            commit,
        });
        Ok(())
    }

    async fn close(&self) {
        let mut closed = self.closed.lock().unwrap_or_else(|e| e.into_inner());
        *closed = true;
    }
}

/// Mock provider; registers a handle per started session.
#[derive(Default)]
pub struct MockSttProvider {
    handles: Mutex<HashMap<String, MockSttHandle>>,
    fail_connect: bool,
    fail_sends: bool,
}

impl MockSttProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// A provider whose `start_session` always fails.
    pub fn failing_connect() -> Self {
        Self {
            fail_connect: true,
            ..Self::default()
        }
    }

    /// A provider whose sessions reject every audio send.
    pub fn failing_sends() -> Self {
        Self {
            fail_sends: true,
            ..Self::default()
        }
    }

    /// The handle for a started session.
    pub fn handle(&self, session_id: &str) -> Option<MockSttHandle> {
        self.handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(session_id)
            .cloned()
    }
}

#[async_trait]
impl SttProvider for MockSttProvider {
    async fn start_session(
        &self,
        _cancel: CancellationToken,
        session_id: &str,
    ) -> Result<(Box<dyn SttSession>, mpsc::Receiver<SttEvent>)> {
        if self.fail_connect {
            return Err(CompanionError::Stt("connect refused".to_owned()));
        }
        let (events_tx, events_rx) = mpsc::channel(64);
        let chunks = Arc::new(Mutex::new(Vec::new()));
        let handle = MockSttHandle {
            events: events_tx,
            chunks: Arc::clone(&chunks),
        };
        {
            let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
            handles.insert(session_id.to_owned(), handle);
        }
        let session = MockSttSession {
            chunks,
            closed: Arc::new(Mutex::new(false)),
            fail_sends: self.fail_sends,
        };
        Ok((Box::new(session), events_rx))
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
