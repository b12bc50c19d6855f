//! Deterministic in-process reasoning adapter for tests and demos.

use super::{BrainRequest, BrainResponse, ReasoningAdapter};
use crate::error::{CompanionError, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// One scripted reply.
#[derive(Debug, Clone)]
pub struct MockReply {
    pub deltas: Vec<String>,
    pub final_text: String,
    pub first_delta_delay: Duration,
    pub inter_delta_delay: Duration,
    pub fail: Option<String>,
}

impl MockReply {
    /// A streamed reply whose final text is the concatenated deltas.
    pub fn streamed(deltas: &[&str]) -> Self {
        Self {
            deltas: deltas.iter().map(|d| (*d).to_owned()).collect(),
            final_text: deltas.concat(),
            first_delta_delay: Duration::ZERO,
            inter_delta_delay: Duration::ZERO,
            fail: None,
        }
    }

    /// A reply that streams nothing and only returns final text.
    pub fn final_only(text: &str) -> Self {
        Self {
            deltas: Vec::new(),
            final_text: text.to_owned(),
            first_delta_delay: Duration::ZERO,
            inter_delta_delay: Duration::ZERO,
            fail: None,
        }
    }

    /// A reply that fails with the given message instead of streaming.
    pub fn failing(message: &str) -> Self {
        Self {
            deltas: Vec::new(),
            final_text: String::new(),
            first_delta_delay: Duration::ZERO,
            inter_delta_delay: Duration::ZERO,
            fail: Some(message.to_owned()),
        }
    }

    pub fn with_first_delta_delay(mut self, delay: Duration) -> Self {
        self.first_delta_delay = delay;
        self
    }

    pub fn with_inter_delta_delay(mut self, delay: Duration) -> Self {
        self.inter_delta_delay = delay;
        self
    }
}

/// Scripted mock adapter. Replies are consumed in order; once the script
/// is exhausted every call echoes the request input.
#[derive(Debug, Default)]
pub struct MockBrain {
    script: Mutex<VecDeque<MockReply>>,
    calls: Mutex<Vec<BrainRequest>>,
    prewarms: Mutex<Vec<String>>,
}

impl MockBrain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_replies(replies: Vec<MockReply>) -> Self {
        Self {
            script: Mutex::new(replies.into()),
            calls: Mutex::new(Vec::new()),
            prewarms: Mutex::new(Vec::new()),
        }
    }

    /// Requests observed so far, in call order.
    pub fn calls(&self) -> Vec<BrainRequest> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Session ids passed to `prewarm`.
    pub fn prewarmed_sessions(&self) -> Vec<String> {
        self.prewarms
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn next_reply(&self, request: &BrainRequest) -> MockReply {
        let mut script = self.script.lock().unwrap_or_else(|e| e.into_inner());
        script.pop_front().unwrap_or_else(|| {
            let echo = format!("You said: {}", request.input);
            MockReply {
                deltas: vec![echo.clone()],
                final_text: echo,
                first_delta_delay: Duration::ZERO,
                inter_delta_delay: Duration::ZERO,
                fail: None,
            }
        })
    }
}

#[async_trait]
impl ReasoningAdapter for MockBrain {
    async fn stream(
        &self,
        cancel: CancellationToken,
        request: BrainRequest,
        deltas: mpsc::Sender<String>,
    ) -> Result<BrainResponse> {
        let reply = self.next_reply(&request);
        {
            let mut calls = self.calls.lock().unwrap_or_else(|e| e.into_inner());
            calls.push(request);
        }

        if let Some(message) = reply.fail {
            return Err(CompanionError::Brain(message));
        }

        let mut first = true;
        for delta in reply.deltas {
            let delay = if first {
                reply.first_delta_delay
            } else {
                reply.inter_delta_delay
            };
            first = false;
            if !delay.is_zero() {
                tokio::select! {
                    () = cancel.cancelled() => return Err(CompanionError::Cancelled),
                    () = tokio::time::sleep(delay) => {}
                }
            }
            if cancel.is_cancelled() {
                return Err(CompanionError::Cancelled);
            }
            if deltas.send(delta).await.is_err() {
                return Err(CompanionError::Cancelled);
            }
        }

        // Final-text-only replies still honor the first-delta delay so
        // tests can model a slow adapter.
        if first && !reply.first_delta_delay.is_zero() {
            tokio::select! {
                () = cancel.cancelled() => return Err(CompanionError::Cancelled),
                () = tokio::time::sleep(reply.first_delta_delay) => {}
            }
        }

        Ok(BrainResponse {
            text: reply.final_text,
        })
    }

    async fn prewarm(&self, session_id: &str) -> Result<()> {
        let mut prewarms = self.prewarms.lock().unwrap_or_else(|e| e.into_inner());
        prewarms.push(session_id.to_owned());
        Ok(())
    }

    fn supports_prewarm(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}
