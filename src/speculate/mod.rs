//! Speculative reasoning pre-fetch.
//!
//! Once a partial transcript looks stable enough that the final commit is
//! likely to equal it (or progressively continue it), the speculator
//! starts the reasoning call early. When the STT commit lands, the turn
//! driver can often replay an already-finished delta stream instead of
//! paying first-token latency. Results that miss their commit go into a
//! small LRU cache for near-future turns.

pub mod cache;
pub mod canonical;

pub use cache::{BrainResult, PrefetchCache, ProbeHit};

use crate::brain::{BrainRequest, ReasoningAdapter};
use crate::config::SpeculatorConfig;
use crate::metrics::Metrics;
use canonical::{canonicalize, compatible, is_progressive_continuation, word_count};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Who the speculative request is issued for.
#[derive(Debug, Clone)]
pub struct SpeculationIdentity {
    pub user_id: String,
    pub session_id: String,
    pub persona_id: String,
}

/// A launched, not-yet-consumed pre-fetch.
#[derive(Debug)]
struct InFlight {
    canonical: String,
    generation: u64,
    cancel: CancellationToken,
    started_at: Instant,
    done_rx: watch::Receiver<bool>,
}

/// A completed pre-fetch awaiting its commit.
#[derive(Debug)]
struct Ready {
    result: BrainResult,
    ready_at: Instant,
}

#[derive(Debug)]
struct SpeculatorState {
    generation: u64,
    in_flight: Option<InFlight>,
    ready: Option<Ready>,
    cache: PrefetchCache,
    stable_canonical: String,
    stable_repeats: u32,
    last_prefetch_at: Option<Instant>,
}

/// Per-session speculative pre-fetch coordinator.
pub struct Speculator {
    config: SpeculatorConfig,
    adapter: Arc<dyn ReasoningAdapter>,
    metrics: Arc<Metrics>,
    session_cancel: CancellationToken,
    identity: SpeculationIdentity,
    state: Arc<Mutex<SpeculatorState>>,
}

impl Speculator {
    pub fn new(
        config: SpeculatorConfig,
        adapter: Arc<dyn ReasoningAdapter>,
        metrics: Arc<Metrics>,
        session_cancel: CancellationToken,
        identity: SpeculationIdentity,
    ) -> Self {
        let cache = PrefetchCache::new(config.cache_max_entries, config.cache_fresh());
        Self {
            config,
            adapter,
            metrics,
            session_cancel,
            identity,
            state: Arc::new(Mutex::new(SpeculatorState {
                generation: 0,
                in_flight: None,
                ready: None,
                cache,
                stable_canonical: String::new(),
                stable_repeats: 0,
                last_prefetch_at: None,
            })),
        }
    }

    /// Observe a partial transcript; may launch or keep a pre-fetch.
    pub fn on_partial(
        &self,
        text: &str,
        utterance_age: Duration,
        terminal_cue: bool,
        memory_context: Vec<String>,
    ) {
        if !self.config.enabled {
            return;
        }
        let canon = canonicalize(text);
        if canon.is_empty() {
            return;
        }

        let mut state = self.lock_state();

        // Stability tracking: equal or progressive partials accumulate
        // repeats, anything else restarts the count.
        if !state.stable_canonical.is_empty()
            && (canon == state.stable_canonical
                || is_progressive_continuation(&state.stable_canonical, &canon))
        {
            state.stable_repeats += 1;
        } else {
            state.stable_repeats = 1;
        }
        state.stable_canonical = canon.clone();

        if let Some(last) = state.last_prefetch_at {
            if last.elapsed() < self.config.debounce() {
                return;
            }
        }

        let words = word_count(&canon);
        if canon.len() < self.config.min_canonical || words < self.config.min_words {
            return;
        }
        let stable_ok = state.stable_repeats >= self.config.stable_repeats;
        let early_ok = terminal_cue
            || (utterance_age >= self.config.early_age() && words >= 3)
            || words >= self.config.early_min_words.max(self.config.min_words);
        if !(stable_ok || early_ok) {
            return;
        }

        // A compatible in-flight call keeps running; restarting would only
        // throw away progress. Incompatible (or sharply collapsed) input
        // cancels it.
        if let Some(in_flight) = state.in_flight.take() {
            let collapse = word_count(&in_flight.canonical).saturating_sub(words);
            if compatible(&in_flight.canonical, &canon) && collapse <= 1 {
                state.in_flight = Some(in_flight);
                return;
            }
            debug!(
                old = in_flight.canonical.as_str(),
                new = canon.as_str(),
                "cancelling incompatible speculative pre-fetch"
            );
            in_flight.cancel.cancel();
            self.metrics.incr("brain_prefetch_cancelled");
        }

        self.launch(&mut state, text, canon, memory_context);
    }

    fn launch(
        &self,
        state: &mut SpeculatorState,
        text: &str,
        canon: String,
        memory_context: Vec<String>,
    ) {
        state.generation += 1;
        let generation = state.generation;
        let cancel = self.session_cancel.child_token();
        let (done_tx, done_rx) = watch::channel(false);

        state.in_flight = Some(InFlight {
            canonical: canon.clone(),
            generation,
            cancel: cancel.clone(),
            started_at: Instant::now(),
            done_rx,
        });
        state.last_prefetch_at = Some(Instant::now());
        self.metrics.incr("brain_prefetch_launched");

        let mut context = memory_context;
        context.truncate(self.config.memory_ctx_limit);
        let request = BrainRequest {
            user_id: self.identity.user_id.clone(),
            session_id: self.identity.session_id.clone(),
            turn_id: format!("spec-{}", Uuid::new_v4()),
            input: text.trim().to_owned(),
            memory_context: context,
            persona_id: self.identity.persona_id.clone(),
        };

        // Speculate against the primary half of a composite so a fallback
        // brain never answers speculatively in a different voice.
        let adapter = self
            .adapter
            .primary()
            .unwrap_or_else(|| Arc::clone(&self.adapter));
        let shared = Arc::clone(&self.state);
        let metrics = Arc::clone(&self.metrics);

        tokio::spawn(async move {
            let (delta_tx, mut delta_rx) = mpsc::channel::<String>(64);
            let call = adapter.stream(cancel, request, delta_tx);
            tokio::pin!(call);

            let mut deltas: Vec<String> = Vec::new();
            let mut channel_open = true;
            let response = loop {
                tokio::select! {
                    result = &mut call => break result,
                    maybe = delta_rx.recv(), if channel_open => match maybe {
                        Some(delta) => deltas.push(delta),
                        None => channel_open = false,
                    },
                }
            };
            while let Ok(delta) = delta_rx.try_recv() {
                deltas.push(delta);
            }

            match response {
                Ok(brain_response) => {
                    let final_text = if brain_response.text.is_empty() {
                        deltas.concat()
                    } else {
                        brain_response.text
                    };
                    if final_text.trim().is_empty() {
                        debug!("speculative pre-fetch produced empty output, ignoring");
                    } else {
                        let result = BrainResult {
                            canonical: canon,
                            deltas,
                            final_text,
                        };
                        let mut state = shared.lock().unwrap_or_else(|e| e.into_inner());
                        state.cache.store(result.clone());
                        let current = state
                            .in_flight
                            .as_ref()
                            .is_some_and(|f| f.generation == generation);
                        if current {
                            state.in_flight = None;
                            state.ready = Some(Ready {
                                result,
                                ready_at: Instant::now(),
                            });
                        }
                    }
                }
                Err(e) if e.is_cancelled() => {
                    debug!("speculative pre-fetch cancelled");
                }
                Err(e) => {
                    metrics.incr("brain_prefetch_failed");
                    warn!(error = %e, "speculative pre-fetch failed");
                }
            }
            let _ = done_tx.send(true);
        });
    }

    /// Consume any pre-fetched result for a committed canonical.
    ///
    /// Tries the ready slot, then waits a bounded budget on a compatible
    /// in-flight call, then probes the cache. Any surviving in-flight call
    /// is cancelled afterwards: its input is stale once a commit exists.
    pub async fn consume(&self, committed_canonical: &str) -> Option<BrainResult> {
        let mut result = self.take_ready(committed_canonical);

        if result.is_none() {
            if let Some((mut done_rx, budget)) = self.waitable_in_flight(committed_canonical) {
                let waited = tokio::time::timeout(budget, done_rx.wait_for(|done| *done)).await;
                if waited.is_ok() {
                    self.metrics.incr("brain_prefetch_wait_hit");
                } else {
                    self.metrics.incr("brain_prefetch_wait_timeout");
                }
                result = self.take_ready(committed_canonical);
            }
        }

        if result.is_none() {
            let mut state = self.lock_state();
            if let Some(hit) = state.cache.probe(committed_canonical) {
                self.metrics.incr(if hit.exact {
                    "brain_prefetch_cache_hit_exact"
                } else {
                    "brain_prefetch_cache_hit_fuzzy"
                });
                result = Some(hit.result);
            }
        }

        self.cancel_in_flight();
        result
    }

    /// Take the ready result if it is fresh and compatible.
    fn take_ready(&self, committed_canonical: &str) -> Option<BrainResult> {
        let mut state = self.lock_state();
        let fresh = self.config.fresh();
        if state
            .ready
            .as_ref()
            .is_some_and(|r| r.ready_at.elapsed() > fresh)
        {
            state.ready = None;
            return None;
        }
        if !state
            .ready
            .as_ref()
            .is_some_and(|r| compatible(&r.result.canonical, committed_canonical))
        {
            return None;
        }
        let ready = state.ready.take()?;
        self.metrics
            .incr(if ready.result.canonical == committed_canonical {
                "brain_prefetch_hit_exact"
            } else {
                "brain_prefetch_hit_fuzzy"
            });
        Some(ready.result)
    }

    /// Wait handle and budget for a compatible in-flight call.
    fn waitable_in_flight(
        &self,
        committed_canonical: &str,
    ) -> Option<(watch::Receiver<bool>, Duration)> {
        let state = self.lock_state();
        let in_flight = state.in_flight.as_ref()?;
        if !compatible(&in_flight.canonical, committed_canonical) {
            return None;
        }
        let mature = in_flight.started_at.elapsed() >= self.config.wait_mature_after();
        let short = word_count(committed_canonical) <= self.config.short_max_words;
        let budget = match (short, mature) {
            (true, true) => self.config.wait_budget_short_mature(),
            (true, false) => self.config.wait_budget_short(),
            (false, true) => self.config.wait_budget_mature(),
            (false, false) => self.config.wait_budget(),
        };
        Some((in_flight.done_rx.clone(), budget))
    }

    /// Cancel any in-flight pre-fetch.
    pub fn cancel_in_flight(&self) {
        let mut state = self.lock_state();
        if let Some(in_flight) = state.in_flight.take() {
            in_flight.cancel.cancel();
            self.metrics.incr("brain_prefetch_cancelled");
        }
    }

    /// Forget stability tracking; called after each commit.
    pub fn reset_stability(&self) {
        let mut state = self.lock_state();
        state.stable_canonical.clear();
        state.stable_repeats = 0;
    }

    /// Whether a pre-fetch is currently running.
    pub fn has_in_flight(&self) -> bool {
        self.lock_state().in_flight.is_some()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, SpeculatorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::brain::mock::{MockBrain, MockReply};

    fn identity() -> SpeculationIdentity {
        SpeculationIdentity {
            user_id: "u1".to_owned(),
            session_id: "s1".to_owned(),
            persona_id: "default".to_owned(),
        }
    }

    fn fast_config() -> SpeculatorConfig {
        SpeculatorConfig {
            debounce_ms: 0,
            ..SpeculatorConfig::default()
        }
    }

    fn speculator(config: SpeculatorConfig, brain: Arc<MockBrain>) -> Speculator {
        Speculator::new(
            config,
            brain as Arc<dyn ReasoningAdapter>,
            Arc::new(Metrics::new()),
            CancellationToken::new(),
            identity(),
        )
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    #[tokio::test]
    async fn stable_progression_launches_once() {
        let brain = Arc::new(MockBrain::with_replies(vec![
            MockReply::streamed(&["Sure", ", here is a plan"])
                .with_first_delta_delay(Duration::from_millis(150)),
        ]));
        let spec = speculator(fast_config(), Arc::clone(&brain));

        spec.on_partial("build api", Duration::from_millis(900), false, Vec::new());
        spec.on_partial(
            "build api endpoint",
            Duration::from_millis(1_200),
            false,
            Vec::new(),
        );
        spec.on_partial(
            "build api endpoint",
            Duration::from_millis(1_500),
            false,
            Vec::new(),
        );
        settle().await;

        assert_eq!(brain.call_count(), 1);
        let request = &brain.calls()[0];
        assert!(request.turn_id.starts_with("spec-"));
        assert_eq!(request.input, "build api");
    }

    #[tokio::test]
    async fn divergent_partial_cancels_and_restarts() {
        let brain = Arc::new(MockBrain::with_replies(vec![
            MockReply::streamed(&["first"]).with_first_delta_delay(Duration::from_secs(5)),
            MockReply::streamed(&["second"]),
        ]));
        let spec = speculator(fast_config(), Arc::clone(&brain));

        spec.on_partial("build api", Duration::from_secs(1), false, Vec::new());
        settle().await;
        spec.on_partial("design diagram", Duration::from_secs(1), false, Vec::new());
        settle().await;

        assert_eq!(brain.call_count(), 2);
        assert_eq!(brain.calls()[1].input, "design diagram");
    }

    #[tokio::test]
    async fn consume_takes_ready_result() {
        let brain = Arc::new(MockBrain::with_replies(vec![MockReply::streamed(&[
            "the", " answer",
        ])]));
        let spec = speculator(fast_config(), Arc::clone(&brain));

        spec.on_partial("build api endpoint", Duration::from_secs(1), false, Vec::new());
        settle().await;

        let result = spec.consume("build api endpoint").await.unwrap();
        assert_eq!(result.deltas, vec!["the".to_owned(), " answer".to_owned()]);
        assert_eq!(result.final_text, "the answer");
        assert!(!spec.has_in_flight());
    }

    #[tokio::test]
    async fn consume_waits_for_in_flight() {
        let brain = Arc::new(MockBrain::with_replies(vec![
            MockReply::streamed(&["late answer"]).with_first_delta_delay(Duration::from_millis(80)),
        ]));
        let spec = speculator(fast_config(), Arc::clone(&brain));

        spec.on_partial("build api endpoint", Duration::from_secs(1), false, Vec::new());
        // Commit lands before the pre-fetch finishes: the consume path
        // should wait within its budget and still score the hit.
        let result = spec.consume("build api endpoint").await;
        assert!(result.is_some());
    }

    #[tokio::test]
    async fn incompatible_commit_misses_and_cancels() {
        let brain = Arc::new(MockBrain::with_replies(vec![
            MockReply::streamed(&["answer"]).with_first_delta_delay(Duration::from_millis(50)),
        ]));
        let spec = speculator(fast_config(), Arc::clone(&brain));

        spec.on_partial("build api endpoint", Duration::from_secs(1), false, Vec::new());
        let result = spec.consume("play some jazz please").await;
        assert!(result.is_none());
        assert!(!spec.has_in_flight());
    }

    #[tokio::test]
    async fn progressive_continuation_keeps_in_flight() {
        let brain = Arc::new(MockBrain::with_replies(vec![
            MockReply::streamed(&["slow"]).with_first_delta_delay(Duration::from_millis(200)),
        ]));
        let spec = speculator(fast_config(), Arc::clone(&brain));

        spec.on_partial("build api", Duration::from_secs(1), false, Vec::new());
        settle().await;
        spec.on_partial("build api endpoint with auth", Duration::from_secs(1), false, Vec::new());
        settle().await;

        assert_eq!(brain.call_count(), 1);
    }

    #[tokio::test]
    async fn short_partials_are_gated() {
        let brain = Arc::new(MockBrain::new());
        let config = SpeculatorConfig {
            debounce_ms: 0,
            min_words: 2,
            early_min_words: 3,
            stable_repeats: 3,
            ..SpeculatorConfig::default()
        };
        let spec = speculator(config, Arc::clone(&brain));

        // One word, one observation: neither minimums nor stability allow it.
        spec.on_partial("hi", Duration::from_millis(100), false, Vec::new());
        settle().await;
        assert_eq!(brain.call_count(), 0);
    }

    #[tokio::test]
    async fn disabled_speculator_never_launches() {
        let brain = Arc::new(MockBrain::new());
        let config = SpeculatorConfig {
            enabled: false,
            ..fast_config()
        };
        let spec = speculator(config, Arc::clone(&brain));
        spec.on_partial("build api endpoint", Duration::from_secs(2), false, Vec::new());
        settle().await;
        assert_eq!(brain.call_count(), 0);
    }
}
