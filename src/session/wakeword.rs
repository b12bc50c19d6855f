//! Wake-word gating over committed transcripts.
//!
//! In hands-free mode a session only acts on utterances that start with
//! the wake phrase, arrive inside the awake window that follows an
//! accepted utterance, or land while the session is manually armed.
//! Matching is canonical (lowercase alphanumeric words) so STT spelling
//! of the phrase ("hey, Sylph!") still gates correctly.

use crate::config::WakeWordConfig;
use crate::speculate::canonical::canonicalize;
use std::time::Instant;

/// Outcome of filtering one committed transcript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    /// Gating disabled or window open: the full text proceeds.
    Pass,
    /// Wake phrase matched; process the remaining query (may be empty,
    /// in which case the gate waits for the follow-up utterance).
    Woken { query: String },
    /// Gated off: ignore this commit.
    Ignored,
}

/// Per-session wake-word state.
#[derive(Debug)]
pub struct WakeWordGate {
    config: WakeWordConfig,
    enabled: bool,
    awake_until: Option<Instant>,
    manual_arm_until: Option<Instant>,
    awaiting_query_until: Option<Instant>,
}

impl WakeWordGate {
    pub fn new(config: WakeWordConfig) -> Self {
        Self {
            enabled: config.enabled,
            config,
            awake_until: None,
            manual_arm_until: None,
            awaiting_query_until: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Runtime toggle from `client_control`.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if !enabled {
            self.awake_until = None;
            self.manual_arm_until = None;
            self.awaiting_query_until = None;
        }
    }

    /// Open the manual-arm window: the next utterance passes without the
    /// wake phrase.
    pub fn manual_arm(&mut self) {
        self.manual_arm_until = Some(Instant::now() + self.config.manual_arm_window());
    }

    /// Filter one committed transcript.
    pub fn filter_commit(&mut self, text: &str) -> GateDecision {
        if !self.enabled {
            return GateDecision::Pass;
        }

        if let Some(query) = self.strip_wake_phrase(text) {
            self.extend_awake_window();
            if query.trim().is_empty() {
                self.awaiting_query_until =
                    Some(Instant::now() + self.config.awaiting_query_window());
            }
            return GateDecision::Woken { query };
        }

        if self.window_open() {
            self.extend_awake_window();
            self.awaiting_query_until = None;
            return GateDecision::Pass;
        }

        GateDecision::Ignored
    }

    /// Whether partial transcripts may feed the speculator right now.
    pub fn allows_speculation(&self, partial_text: &str) -> bool {
        if !self.enabled {
            return true;
        }
        self.window_open() || self.strip_wake_phrase(partial_text).is_some()
    }

    fn window_open(&self) -> bool {
        let now = Instant::now();
        let open = |deadline: &Option<Instant>| deadline.is_some_and(|d| d > now);
        open(&self.awake_until) || open(&self.manual_arm_until) || open(&self.awaiting_query_until)
    }

    fn extend_awake_window(&mut self) {
        self.awake_until = Some(Instant::now() + self.config.window());
    }

    /// If the canonical text starts with the wake phrase at a word
    /// boundary, return the query after it in its original spelling.
    fn strip_wake_phrase(&self, text: &str) -> Option<String> {
        let canon = canonicalize(text);
        let phrase = canonicalize(&self.config.phrase);
        if phrase.is_empty() {
            return None;
        }
        let boundary_ok = canon == phrase
            || (canon.starts_with(&phrase) && canon.as_bytes().get(phrase.len()) == Some(&b' '));
        if !boundary_ok {
            return None;
        }

        // Walk the original text consuming the phrase's alphanumeric
        // characters, then drop the separators before the query.
        let target: usize = phrase.chars().filter(|c| !c.is_whitespace()).count();
        let mut consumed = 0usize;
        let mut rest: &str = "";
        for (i, c) in text.char_indices() {
            if consumed == target {
                rest = &text[i..];
                break;
            }
            if c.is_alphanumeric() {
                consumed += 1;
            }
        }
        Some(
            rest.trim_start_matches(|c: char| !c.is_alphanumeric())
                .to_owned(),
        )
    }
}
