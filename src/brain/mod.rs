//! Reasoning adapter contract.
//!
//! The orchestration core only ever sees a [`ReasoningAdapter`]: one
//! cancellable streaming call plus optional capabilities (pre-warm, a
//! primary half for speculation, self-managed first-delta failover). The
//! transports behind the trait vary; the turn driver adds a first-delta
//! retry wrapper for adapters that do not handle failover themselves.

pub mod fallback;
pub mod http;
pub mod mock;

use crate::error::{CompanionError, Result};
use crate::metrics::Metrics;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// One reasoning request.
#[derive(Debug, Clone)]
pub struct BrainRequest {
    pub user_id: String,
    pub session_id: String,
    pub turn_id: String,
    pub input: String,
    pub memory_context: Vec<String>,
    pub persona_id: String,
}

/// The adapter's final result.
#[derive(Debug, Clone, Default)]
pub struct BrainResponse {
    pub text: String,
}

/// A cancellable streaming reasoning call.
///
/// Streaming adapters invoke the delta channel at least once; final-text
/// adapters may send nothing and only fill [`BrainResponse::text`].
/// Cancellation through the token must stop the call promptly.
#[async_trait]
pub trait ReasoningAdapter: Send + Sync {
    async fn stream(
        &self,
        cancel: CancellationToken,
        request: BrainRequest,
        deltas: mpsc::Sender<String>,
    ) -> Result<BrainResponse>;

    /// Warm any per-session connection state ahead of the first turn.
    async fn prewarm(&self, _session_id: &str) -> Result<()> {
        Ok(())
    }

    /// Whether [`ReasoningAdapter::prewarm`] does anything useful.
    fn supports_prewarm(&self) -> bool {
        false
    }

    /// Whether the adapter already enforces its own first-delta failover,
    /// which disables the turn driver's retry wrapper.
    fn handles_first_delta_failover(&self) -> bool {
        false
    }

    /// The primary half of a composite adapter, used for speculative
    /// pre-fetch so speculation never falls back into a different brain.
    fn primary(&self) -> Option<Arc<dyn ReasoningAdapter>> {
        None
    }

    fn name(&self) -> &'static str;
}

enum AttemptOutcome {
    GotDelta(String),
    Finished,
    TimedOut,
}

/// Run `adapter.stream` with a first-delta deadline.
///
/// If no non-empty delta arrives within `first_delta_timeout`, the attempt
/// is cancelled and retried (with a suffixed turn id) up to `max_retries`
/// times. Disabled when the adapter handles its own failover.
pub async fn stream_with_first_delta_retry(
    adapter: Arc<dyn ReasoningAdapter>,
    cancel: CancellationToken,
    request: BrainRequest,
    deltas: mpsc::Sender<String>,
    first_delta_timeout: Duration,
    max_retries: u32,
    metrics: Arc<Metrics>,
) -> Result<BrainResponse> {
    if adapter.handles_first_delta_failover() {
        return adapter.stream(cancel, request, deltas).await;
    }

    let mut attempt: u32 = 0;
    loop {
        let attempt_request = if attempt == 0 {
            request.clone()
        } else {
            BrainRequest {
                turn_id: format!("{}-r{attempt}", request.turn_id),
                ..request.clone()
            }
        };

        let child = cancel.child_token();
        let (inner_tx, mut inner_rx) = mpsc::channel::<String>(64);
        let call_adapter = Arc::clone(&adapter);
        let call_cancel = child.clone();
        let mut call = tokio::spawn(async move {
            call_adapter.stream(call_cancel, attempt_request, inner_tx).await
        });

        let deadline = tokio::time::sleep(first_delta_timeout);
        tokio::pin!(deadline);

        let outcome = loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    child.cancel();
                    call.abort();
                    return Err(CompanionError::Cancelled);
                }
                () = &mut deadline => break AttemptOutcome::TimedOut,
                maybe = inner_rx.recv() => match maybe {
                    Some(delta) if !delta.trim().is_empty() => {
                        break AttemptOutcome::GotDelta(delta);
                    }
                    Some(_) => continue,
                    // Channel closed without a non-empty delta: the call
                    // finished (final-text-only adapters) or failed.
                    None => break AttemptOutcome::Finished,
                }
            }
        };

        match outcome {
            AttemptOutcome::GotDelta(first) => {
                if deltas.send(first).await.is_err() {
                    child.cancel();
                    call.abort();
                    return Err(CompanionError::Cancelled);
                }
                while let Some(delta) = inner_rx.recv().await {
                    if deltas.send(delta).await.is_err() {
                        child.cancel();
                        break;
                    }
                }
                return join_call(call).await;
            }
            AttemptOutcome::Finished => {
                return join_call(call).await;
            }
            AttemptOutcome::TimedOut => {
                child.cancel();
                let _ = join_call(call).await;
                if attempt >= max_retries {
                    return Err(CompanionError::Brain(
                        "no first delta before deadline, retries exhausted".to_owned(),
                    ));
                }
                attempt += 1;
                metrics.incr("brain_first_delta_retries");
                warn!(
                    adapter = adapter.name(),
                    attempt, "first-delta deadline missed, retrying"
                );
            }
        }
    }
}

async fn join_call(
    call: tokio::task::JoinHandle<Result<BrainResponse>>,
) -> Result<BrainResponse> {
    match call.await {
        Ok(result) => result,
        Err(e) if e.is_cancelled() => Err(CompanionError::Cancelled),
        Err(e) => Err(CompanionError::Brain(format!("adapter task failed: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::mock::{MockBrain, MockReply};
    use super::*;

    #[tokio::test]
    async fn passthrough_when_delta_is_prompt() {
        let adapter: Arc<dyn ReasoningAdapter> = Arc::new(MockBrain::with_replies(vec![
            MockReply::streamed(&["hello", " world"]),
        ]));
        let (tx, mut rx) = mpsc::channel(16);
        let metrics = Arc::new(Metrics::new());

        let response = stream_with_first_delta_retry(
            adapter,
            CancellationToken::new(),
            request(),
            tx,
            Duration::from_millis(500),
            1,
            Arc::clone(&metrics),
        )
        .await
        .unwrap();

        assert_eq!(response.text, "hello world");
        assert_eq!(rx.recv().await.as_deref(), Some("hello"));
        assert_eq!(rx.recv().await.as_deref(), Some(" world"));
        assert_eq!(metrics.counter("brain_first_delta_retries"), 0);
    }

    #[tokio::test]
    async fn slow_first_delta_triggers_retry() {
        let adapter: Arc<dyn ReasoningAdapter> = Arc::new(MockBrain::with_replies(vec![
            MockReply::streamed(&["late"]).with_first_delta_delay(Duration::from_millis(220)),
            MockReply::streamed(&["fast"]),
        ]));
        let (tx, mut rx) = mpsc::channel(16);
        let metrics = Arc::new(Metrics::new());

        let response = stream_with_first_delta_retry(
            adapter,
            CancellationToken::new(),
            request(),
            tx,
            Duration::from_millis(40),
            1,
            Arc::clone(&metrics),
        )
        .await
        .unwrap();

        assert_eq!(response.text, "fast");
        assert_eq!(rx.recv().await.as_deref(), Some("fast"));
        assert_eq!(metrics.counter("brain_first_delta_retries"), 1);
    }

    #[tokio::test]
    async fn retries_exhausted_surfaces_error() {
        let adapter: Arc<dyn ReasoningAdapter> = Arc::new(MockBrain::with_replies(vec![
            MockReply::streamed(&["never"]).with_first_delta_delay(Duration::from_secs(5)),
            MockReply::streamed(&["never"]).with_first_delta_delay(Duration::from_secs(5)),
        ]));
        let (tx, _rx) = mpsc::channel(16);
        let metrics = Arc::new(Metrics::new());

        let err = stream_with_first_delta_retry(
            adapter,
            CancellationToken::new(),
            request(),
            tx,
            Duration::from_millis(30),
            1,
            metrics,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, CompanionError::Brain(_)));
    }

    #[tokio::test]
    async fn final_text_only_adapter_is_accepted() {
        let adapter: Arc<dyn ReasoningAdapter> = Arc::new(MockBrain::with_replies(vec![
            MockReply::final_only("just text"),
        ]));
        let (tx, _rx) = mpsc::channel(16);

        let response = stream_with_first_delta_retry(
            adapter,
            CancellationToken::new(),
            request(),
            tx,
            Duration::from_millis(200),
            1,
            Arc::new(Metrics::new()),
        )
        .await
        .unwrap();

        assert_eq!(response.text, "just text");
    }

    fn request() -> BrainRequest {
        BrainRequest {
            user_id: "u1".to_owned(),
            session_id: "s1".to_owned(),
            turn_id: "t1".to_owned(),
            input: "build api endpoint".to_owned(),
            memory_context: Vec::new(),
            persona_id: "default".to_owned(),
        }
    }
}
