//! Outbound delivery discipline.
//!
//! All messages to one client flow through a single bounded queue. The
//! scheduler classifies each message as critical (lifecycle signals the
//! client must not miss) or bulk (streaming data that may be shed) and
//! applies the matching backpressure policy. Slow clients therefore cost
//! dropped deltas, never a stalled session loop.

use crate::config::{BackpressureMode, OutboundConfig};
use crate::messages::OutboundMessage;
use crate::metrics::{DeliveryResult, Metrics};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::warn;

/// Sender half of a session's outbound queue.
#[derive(Clone)]
pub struct OutboundScheduler {
    tx: mpsc::Sender<OutboundMessage>,
    mode: BackpressureMode,
    critical_timeout: Duration,
    bulk_timeout: Duration,
    metrics: Arc<Metrics>,
}

impl OutboundScheduler {
    /// Create a scheduler and the receiver the egress task drains.
    pub fn new(
        config: &OutboundConfig,
        metrics: Arc<Metrics>,
    ) -> (Self, mpsc::Receiver<OutboundMessage>) {
        let (tx, rx) = mpsc::channel(config.queue_size.max(1));
        (
            Self {
                tx,
                mode: config.effective_mode(),
                critical_timeout: config.critical_timeout(),
                bulk_timeout: config.bulk_timeout(),
                metrics,
            },
            rx,
        )
    }

    /// Enqueue one message under the delivery policy for its class.
    pub async fn send(&self, message: OutboundMessage) {
        let kind = message.kind();
        if message.is_critical() {
            self.send_bounded(message, kind, self.critical_timeout, "outbound_timeout_critical")
                .await;
        } else {
            match self.mode {
                BackpressureMode::Drop => self.try_send(message, kind),
                BackpressureMode::Block => {
                    self.send_bounded(message, kind, self.bulk_timeout, "outbound_timeout")
                        .await;
                }
            }
        }
    }

    async fn send_bounded(
        &self,
        message: OutboundMessage,
        kind: &'static str,
        timeout: Duration,
        timeout_counter: &str,
    ) {
        match tokio::time::timeout(timeout, self.tx.send(message)).await {
            Ok(Ok(())) => self.metrics.record_outbound(kind, DeliveryResult::Delivered),
            Ok(Err(_)) => {
                // Receiver gone: the connection is closing.
                self.metrics.record_outbound(kind, DeliveryResult::Dropped);
            }
            Err(_) => {
                warn!(kind, "outbound send timed out, dropping");
                self.metrics.incr(timeout_counter);
                self.metrics.record_outbound(kind, DeliveryResult::Timeout);
            }
        }
    }

    fn try_send(&self, message: OutboundMessage, kind: &'static str) {
        match self.tx.try_send(message) {
            Ok(()) => self.metrics.record_outbound(kind, DeliveryResult::Delivered),
            Err(TrySendError::Full(_)) => {
                self.metrics.incr("outbound_drop");
                self.metrics.record_outbound(kind, DeliveryResult::Dropped);
            }
            Err(TrySendError::Closed(_)) => {
                self.metrics.record_outbound(kind, DeliveryResult::Dropped);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::messages::TurnEndReason;

    fn config(queue: usize, mode: BackpressureMode) -> OutboundConfig {
        OutboundConfig {
            queue_size: queue,
            ws_backpressure_mode: mode,
            bulk_timeout_ms: 50,
            ..OutboundConfig::default()
        }
    }

    fn bulk_message() -> OutboundMessage {
        OutboundMessage::AssistantTextDelta {
            turn_id: "t1".to_owned(),
            text: "delta".to_owned(),
        }
    }

    fn critical_message() -> OutboundMessage {
        OutboundMessage::AssistantTurnEnd {
            turn_id: "t1".to_owned(),
            reason: TurnEndReason::Completed,
        }
    }

    #[tokio::test]
    async fn bulk_drop_mode_sheds_on_full_queue() {
        let metrics = Arc::new(Metrics::new());
        let (scheduler, _rx) = OutboundScheduler::new(
            &config(1, BackpressureMode::Drop),
            Arc::clone(&metrics),
        );

        scheduler.send(bulk_message()).await;
        scheduler.send(bulk_message()).await;

        assert_eq!(metrics.counter("outbound_drop"), 1);
        assert_eq!(
            metrics.counter("outbound_messages_total{type=assistant_text_delta,result=delivered}"),
            1
        );
        assert_eq!(
            metrics.counter("outbound_messages_total{type=assistant_text_delta,result=dropped}"),
            1
        );
    }

    #[tokio::test]
    async fn critical_waits_for_queue_to_drain() {
        let metrics = Arc::new(Metrics::new());
        let (scheduler, mut rx) = OutboundScheduler::new(
            &config(1, BackpressureMode::Drop),
            Arc::clone(&metrics),
        );

        // Fill the queue, then free a slot after 40ms while the critical
        // send is waiting.
        scheduler.send(bulk_message()).await;
        let drain = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(40)).await;
            let first = rx.recv().await;
            (first, rx)
        });

        scheduler.send(critical_message()).await;
        assert_eq!(
            metrics.counter("outbound_messages_total{type=assistant_turn_end,result=delivered}"),
            1
        );

        let (_, mut rx) = drain.await.unwrap();
        match rx.recv().await {
            Some(OutboundMessage::AssistantTurnEnd { reason, .. }) => {
                assert_eq!(reason, TurnEndReason::Completed);
            }
            other => panic!("expected turn end, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn critical_timeout_drops_and_counts() {
        let metrics = Arc::new(Metrics::new());
        let config = OutboundConfig {
            queue_size: 1,
            critical_timeout_ms: 30,
            bulk_timeout_ms: 10,
            ..OutboundConfig::default()
        };
        let (scheduler, _rx) = OutboundScheduler::new(&config, Arc::clone(&metrics));

        scheduler.send(bulk_message()).await;
        scheduler.send(critical_message()).await;

        assert_eq!(metrics.counter("outbound_timeout_critical"), 1);
        assert_eq!(
            metrics.counter("outbound_messages_total{type=assistant_turn_end,result=timeout}"),
            1
        );
    }

    #[tokio::test]
    async fn strict_outbound_forces_block_mode() {
        let metrics = Arc::new(Metrics::new());
        let config = OutboundConfig {
            queue_size: 1,
            strict_outbound: true,
            bulk_timeout_ms: 20,
            ..OutboundConfig::default()
        };
        assert_eq!(config.effective_mode(), BackpressureMode::Block);
        let (scheduler, _rx) = OutboundScheduler::new(&config, Arc::clone(&metrics));

        scheduler.send(bulk_message()).await;
        scheduler.send(bulk_message()).await;

        // Drop mode would count outbound_drop; strict mode blocks then
        // times out instead.
        assert_eq!(metrics.counter("outbound_drop"), 0);
        assert_eq!(metrics.counter("outbound_timeout"), 1);
    }

    #[tokio::test]
    async fn bulk_block_mode_times_out() {
        let metrics = Arc::new(Metrics::new());
        let (scheduler, _rx) = OutboundScheduler::new(
            &config(1, BackpressureMode::Block),
            Arc::clone(&metrics),
        );

        scheduler.send(bulk_message()).await;
        scheduler.send(bulk_message()).await;

        assert_eq!(metrics.counter("outbound_timeout"), 1);
    }
}
