//! Primary/secondary reasoning composite.
//!
//! The composite runs the primary adapter and watches its delta stream.
//! If the primary fails, or yields no non-empty delta before the deadline,
//! it is cancelled and the secondary runs in its place. Once the primary
//! has produced a delta the composite is committed to it: a later primary
//! failure is surfaced rather than silently switching voices mid-turn.

use super::{BrainRequest, BrainResponse, ReasoningAdapter};
use crate::error::{CompanionError, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Fallback-capable composite adapter.
pub struct FallbackBrain {
    primary: Arc<dyn ReasoningAdapter>,
    secondary: Arc<dyn ReasoningAdapter>,
    first_delta_deadline: Duration,
}

impl FallbackBrain {
    pub fn new(
        primary: Arc<dyn ReasoningAdapter>,
        secondary: Arc<dyn ReasoningAdapter>,
        first_delta_deadline: Duration,
    ) -> Self {
        Self {
            primary,
            secondary,
            first_delta_deadline,
        }
    }
}

enum PrimaryOutcome {
    Committed(String),
    Finished(Result<BrainResponse>),
    TimedOut,
}

#[async_trait]
impl ReasoningAdapter for FallbackBrain {
    async fn stream(
        &self,
        cancel: CancellationToken,
        request: BrainRequest,
        deltas: mpsc::Sender<String>,
    ) -> Result<BrainResponse> {
        let child = cancel.child_token();
        let (inner_tx, mut inner_rx) = mpsc::channel::<String>(64);
        let primary = Arc::clone(&self.primary);
        let primary_cancel = child.clone();
        let primary_request = request.clone();
        let mut call = tokio::spawn(async move {
            primary
                .stream(primary_cancel, primary_request, inner_tx)
                .await
        });

        let deadline = tokio::time::sleep(self.first_delta_deadline);
        tokio::pin!(deadline);

        let outcome = loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    child.cancel();
                    call.abort();
                    return Err(CompanionError::Cancelled);
                }
                () = &mut deadline => break PrimaryOutcome::TimedOut,
                maybe = inner_rx.recv() => match maybe {
                    Some(delta) if !delta.trim().is_empty() => {
                        break PrimaryOutcome::Committed(delta);
                    }
                    Some(_) => continue,
                    None => {
                        let result = match (&mut call).await {
                            Ok(result) => result,
                            Err(e) => Err(CompanionError::Brain(format!(
                                "primary task failed: {e}"
                            ))),
                        };
                        break PrimaryOutcome::Finished(result);
                    }
                }
            }
        };

        let primary_error = match outcome {
            PrimaryOutcome::Committed(first) => {
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
                return match (&mut call).await {
                    Ok(result) => result,
                    Err(e) => Err(CompanionError::Brain(format!("primary task failed: {e}"))),
                };
            }
            // A final-text-only primary that succeeded is a valid outcome.
            PrimaryOutcome::Finished(Ok(response)) if !response.text.trim().is_empty() => {
                return Ok(response);
            }
            PrimaryOutcome::Finished(Ok(_)) => {
                CompanionError::Brain("primary produced no output".to_owned())
            }
            PrimaryOutcome::Finished(Err(e)) if e.is_cancelled() => return Err(e),
            PrimaryOutcome::Finished(Err(e)) => e,
            PrimaryOutcome::TimedOut => {
                child.cancel();
                call.abort();
                CompanionError::Brain(format!(
                    "no first delta within {:?}",
                    self.first_delta_deadline
                ))
            }
        };

        if cancel.is_cancelled() {
            return Err(CompanionError::Cancelled);
        }

        warn!(
            primary = self.primary.name(),
            secondary = self.secondary.name(),
            error = %primary_error,
            "primary brain failed, switching to fallback"
        );

        match self.secondary.stream(cancel, request, deltas).await {
            Ok(response) => {
                info!(secondary = self.secondary.name(), "fallback brain succeeded");
                Ok(response)
            }
            Err(e) if e.is_cancelled() => Err(e),
            Err(secondary_error) => Err(CompanionError::Brain(format!(
                "primary: {primary_error}; fallback: {secondary_error}"
            ))),
        }
    }

    fn handles_first_delta_failover(&self) -> bool {
        true
    }

    fn primary(&self) -> Option<Arc<dyn ReasoningAdapter>> {
        Some(Arc::clone(&self.primary))
    }

    fn name(&self) -> &'static str {
        "fallback-composite"
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::super::mock::{MockBrain, MockReply};
    use super::*;

    fn request() -> BrainRequest {
        BrainRequest {
            user_id: "u1".to_owned(),
            session_id: "s1".to_owned(),
            turn_id: "t1".to_owned(),
            input: "hello".to_owned(),
            memory_context: Vec::new(),
            persona_id: "default".to_owned(),
        }
    }

    #[tokio::test]
    async fn primary_streams_normally() {
        let primary = Arc::new(MockBrain::with_replies(vec![MockReply::streamed(&[
            "from", " primary",
        ])]));
        let secondary = Arc::new(MockBrain::new());
        let composite = FallbackBrain::new(
            Arc::clone(&primary) as Arc<dyn ReasoningAdapter>,
            Arc::clone(&secondary) as Arc<dyn ReasoningAdapter>,
            Duration::from_millis(500),
        );

        let (tx, mut rx) = mpsc::channel(8);
        let response = composite
            .stream(CancellationToken::new(), request(), tx)
            .await
            .unwrap();

        assert_eq!(response.text, "from primary");
        assert_eq!(rx.recv().await.as_deref(), Some("from"));
        assert_eq!(secondary.call_count(), 0);
    }

    #[tokio::test]
    async fn slow_primary_fails_over() {
        let primary = Arc::new(MockBrain::with_replies(vec![
            MockReply::streamed(&["late"]).with_first_delta_delay(Duration::from_secs(5)),
        ]));
        let secondary = Arc::new(MockBrain::with_replies(vec![MockReply::streamed(&[
            "from fallback",
        ])]));
        let composite = FallbackBrain::new(
            Arc::clone(&primary) as Arc<dyn ReasoningAdapter>,
            Arc::clone(&secondary) as Arc<dyn ReasoningAdapter>,
            Duration::from_millis(40),
        );

        let (tx, mut rx) = mpsc::channel(8);
        let response = composite
            .stream(CancellationToken::new(), request(), tx)
            .await
            .unwrap();

        assert_eq!(response.text, "from fallback");
        assert_eq!(rx.recv().await.as_deref(), Some("from fallback"));
        assert_eq!(secondary.call_count(), 1);
    }

    #[tokio::test]
    async fn failing_primary_fails_over() {
        let primary = Arc::new(MockBrain::with_replies(vec![MockReply::failing(
            "boom",
        )]));
        let secondary = Arc::new(MockBrain::with_replies(vec![MockReply::streamed(&[
            "recovered",
        ])]));
        let composite = FallbackBrain::new(
            primary as Arc<dyn ReasoningAdapter>,
            secondary as Arc<dyn ReasoningAdapter>,
            Duration::from_millis(500),
        );

        let (tx, _rx) = mpsc::channel(8);
        let response = composite
            .stream(CancellationToken::new(), request(), tx)
            .await
            .unwrap();
        assert_eq!(response.text, "recovered");
    }

    #[tokio::test]
    async fn both_failing_combines_errors() {
        let composite = FallbackBrain::new(
            Arc::new(MockBrain::with_replies(vec![MockReply::failing("p down")]))
                as Arc<dyn ReasoningAdapter>,
            Arc::new(MockBrain::with_replies(vec![MockReply::failing("s down")]))
                as Arc<dyn ReasoningAdapter>,
            Duration::from_millis(500),
        );

        let (tx, _rx) = mpsc::channel(8);
        let err = composite
            .stream(CancellationToken::new(), request(), tx)
            .await
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("p down"));
        assert!(message.contains("s down"));
    }

    #[tokio::test]
    async fn cancellation_skips_secondary() {
        let primary = Arc::new(MockBrain::with_replies(vec![
            MockReply::streamed(&["late"]).with_first_delta_delay(Duration::from_secs(5)),
        ]));
        let secondary = Arc::new(MockBrain::new());
        let composite = FallbackBrain::new(
            primary as Arc<dyn ReasoningAdapter>,
            Arc::clone(&secondary) as Arc<dyn ReasoningAdapter>,
            Duration::from_millis(200),
        );

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let (tx, _rx) = mpsc::channel(8);
        let err = composite.stream(cancel, request(), tx).await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(secondary.call_count(), 0);
    }
}
