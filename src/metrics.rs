//! Process-wide counters and latency stage accounting.
//!
//! The orchestration core records two kinds of measurements: indicator
//! counters (named events like `stt_commit_source_remote` or
//! `brain_prefetch_hit_exact`) and latency stages (durations between
//! pipeline milestones like `commit_to_first_audio`). Both are cheap
//! enough to record on the hot path; snapshots are exported through the
//! structured log.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::info;

/// Well-known latency stage names.
pub mod stage {
    pub const PARTIAL_TO_COMMIT: &str = "partial_to_commit";
    pub const STOP_TO_STT_COMMITTED: &str = "stop_to_stt_committed";
    pub const COMMIT_TO_FIRST_TEXT: &str = "commit_to_first_text";
    pub const COMMIT_TO_FIRST_AUDIO: &str = "commit_to_first_audio";
    pub const BRAIN_FIRST_DELTA_TO_FIRST_AUDIO: &str = "brain_first_delta_to_first_audio";
    pub const ASSISTANT_WORKING: &str = "assistant_working";
    pub const TURN_TOTAL: &str = "turn_total";
}

/// Delivery outcome of one outbound send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryResult {
    Delivered,
    Dropped,
    Timeout,
}

impl DeliveryResult {
    fn as_str(self) -> &'static str {
        match self {
            Self::Delivered => "delivered",
            Self::Dropped => "dropped",
            Self::Timeout => "timeout",
        }
    }
}

/// Running aggregate for one latency stage.
#[derive(Debug, Clone, Copy, Default)]
pub struct LatencyStat {
    pub count: u64,
    pub total: Duration,
    pub max: Duration,
}

impl LatencyStat {
    fn record(&mut self, elapsed: Duration) {
        self.count += 1;
        self.total += elapsed;
        if elapsed > self.max {
            self.max = elapsed;
        }
    }

    /// Mean latency over all recorded samples.
    pub fn mean(&self) -> Duration {
        if self.count == 0 {
            return Duration::ZERO;
        }
        self.total / u32::try_from(self.count).unwrap_or(u32::MAX)
    }
}

/// Metrics registry shared across sessions.
#[derive(Debug, Default)]
pub struct Metrics {
    counters: Mutex<HashMap<String, u64>>,
    latencies: Mutex<HashMap<&'static str, LatencyStat>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment a named indicator counter by one.
    pub fn incr(&self, name: &str) {
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        *counters.entry(name.to_owned()).or_insert(0) += 1;
    }

    /// Record the outcome of one outbound send, keyed by message type.
    pub fn record_outbound(&self, message_type: &str, result: DeliveryResult) {
        self.incr(&format!(
            "outbound_messages_total{{type={message_type},result={}}}",
            result.as_str()
        ));
    }

    /// Record a latency sample for a pipeline stage.
    pub fn record_latency(&self, stage: &'static str, elapsed: Duration) {
        let mut latencies = self.latencies.lock().unwrap_or_else(|e| e.into_inner());
        latencies.entry(stage).or_default().record(elapsed);
    }

    /// Current value of a counter (0 if never incremented).
    pub fn counter(&self, name: &str) -> u64 {
        let counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        counters.get(name).copied().unwrap_or(0)
    }

    /// Aggregate for one latency stage, if any samples were recorded.
    pub fn latency(&self, stage: &str) -> Option<LatencyStat> {
        let latencies = self.latencies.lock().unwrap_or_else(|e| e.into_inner());
        latencies.get(stage).copied()
    }

    /// Log a snapshot of all counters and latency stages.
    pub fn log_snapshot(&self) {
        let counters = {
            let guard = self.counters.lock().unwrap_or_else(|e| e.into_inner());
            let mut entries: Vec<_> = guard.iter().map(|(k, v)| (k.clone(), *v)).collect();
            entries.sort();
            entries
        };
        for (name, value) in counters {
            info!(counter = name.as_str(), value, "metrics counter");
        }

        let latencies = {
            let guard = self.latencies.lock().unwrap_or_else(|e| e.into_inner());
            let mut entries: Vec<_> = guard.iter().map(|(k, v)| (*k, *v)).collect();
            entries.sort_by_key(|(k, _)| *k);
            entries
        };
        for (stage, stat) in latencies {
            info!(
                stage,
                count = stat.count,
                mean_ms = stat.mean().as_millis() as u64,
                max_ms = stat.max.as_millis() as u64,
                "metrics latency"
            );
        }
    }
}
