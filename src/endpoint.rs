//! Semantic endpointing over partial transcripts.
//!
//! While the user is still speaking, the server can often tell from the
//! words alone whether the utterance is mid-thought or winding down. Each
//! partial is classified into a hint {reason, confidence, hold,
//! should_commit} that the client may use to shorten or extend its
//! silence-detection hold. A dispatch state dedups hints so the client is
//! not flooded with identical advice on every partial.

use crate::config::SemanticConfig;
use std::time::{Duration, Instant};

/// Hold-duration bucket width used for dedup.
const HOLD_BUCKET: Duration = Duration::from_millis(80);

/// Confidence bucket width used for dedup.
const CONFIDENCE_BUCKET: f32 = 0.10;

/// Conjunctions that signal the sentence keeps going.
const CONJUNCTIONS: &[&str] = &[
    "and", "but", "because", "so", "then", "which", "that", "if", "when", "while", "as", "to",
    "for",
];

/// Trailing discourse markers that signal more is coming.
const DISCOURSE_MARKERS: &[&str] = &["i mean", "for example", "in order to"];

/// Closing phrases that signal the user is done.
const CLOSERS: &[&str] = &["done", "thanks", "thank you", "that's all", "that is all"];

/// Why a hint was issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointReason {
    Continuation,
    Terminal,
    Neutral,
    ShortUtterance,
    LowConfidence,
    LongUtterance,
}

impl EndpointReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Continuation => "continuation",
            Self::Terminal => "terminal",
            Self::Neutral => "neutral",
            Self::ShortUtterance => "short_utterance",
            Self::LowConfidence => "low_confidence",
            Self::LongUtterance => "long_utterance",
        }
    }
}

/// An endpointing hint for the client.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EndpointHint {
    pub reason: EndpointReason,
    pub confidence: f32,
    pub hold: Duration,
    pub should_commit: bool,
}

/// Classify a partial transcript. Returns `None` for empty input.
pub fn classify(
    partial_text: &str,
    stt_confidence: f32,
    utterance_age: Duration,
    config: &SemanticConfig,
) -> Option<EndpointHint> {
    let text = partial_text.trim().to_lowercase();
    if text.is_empty() {
        return None;
    }

    let mut reason = EndpointReason::Neutral;
    let mut confidence = stt_confidence.max(0.58);
    let mut hold = Duration::from_millis(210);
    let mut should_commit = false;

    if has_continuation_cue(&text) {
        reason = EndpointReason::Continuation;
        confidence = confidence.max(0.86);
        hold = Duration::from_millis(520);
    } else if has_terminal_cue(&text) {
        reason = EndpointReason::Terminal;
        confidence = confidence.max(0.82);
        hold = Duration::from_millis(90);
        should_commit = stt_confidence >= 0.50;
    }

    // Age shaping: a long utterance is probably complete, a very young one
    // deserves extra patience.
    if utterance_age > Duration::from_secs(6) && reason != EndpointReason::Continuation {
        reason = EndpointReason::LongUtterance;
        hold = hold.saturating_sub(Duration::from_millis(70));
    } else if utterance_age < Duration::from_millis(700) {
        hold += Duration::from_millis(110);
        if reason == EndpointReason::Neutral {
            reason = EndpointReason::ShortUtterance;
        }
    }

    if stt_confidence < 0.45 {
        hold += Duration::from_millis(140);
        confidence = confidence.min(0.62);
        should_commit = false;
        if matches!(reason, EndpointReason::Neutral | EndpointReason::Terminal) {
            reason = EndpointReason::LowConfidence;
        }
    }

    hold = hold.clamp(config.hold_min(), config.hold_max());
    confidence = confidence.clamp(0.05, 0.99);

    Some(EndpointHint {
        reason,
        confidence,
        hold,
        should_commit,
    })
}

fn has_continuation_cue(text: &str) -> bool {
    if text.ends_with([',', ';', ':', '-']) || text.ends_with('\u{2026}') || text.ends_with("...") {
        return true;
    }
    let words: Vec<&str> = text.split_whitespace().collect();
    if let Some(last) = words.last() {
        let last = last.trim_matches(|c: char| !c.is_alphanumeric() && c != '\'');
        if CONJUNCTIONS.contains(&last) {
            return true;
        }
    }
    if let Some(first) = words.first() {
        let first = first.trim_matches(|c: char| !c.is_alphanumeric() && c != '\'');
        if CONJUNCTIONS.contains(&first) && words.len() <= 4 {
            return true;
        }
    }
    DISCOURSE_MARKERS.iter().any(|m| text.ends_with(m))
}

fn has_terminal_cue(text: &str) -> bool {
    if text.ends_with(['.', '!', '?']) && !text.ends_with("...") {
        return true;
    }
    let stripped = text.trim_end_matches(|c: char| !c.is_alphanumeric() && c != '\'');
    CLOSERS
        .iter()
        .any(|c| stripped == *c || stripped.ends_with(&format!(" {c}")))
}

/// Dedup key for one hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HintKey {
    reason: EndpointReason,
    hold_bucket: u32,
    should_commit: bool,
    confidence_bucket: u32,
}

impl HintKey {
    fn of(hint: &EndpointHint) -> Self {
        Self {
            reason: hint.reason,
            hold_bucket: (hint.hold.as_millis() as u32) / (HOLD_BUCKET.as_millis() as u32),
            should_commit: hint.should_commit,
            confidence_bucket: (hint.confidence / CONFIDENCE_BUCKET) as u32,
        }
    }
}

/// Emits a hint only when it differs meaningfully from the last one sent,
/// or after the refresh interval elapses.
#[derive(Debug, Default)]
pub struct HintDispatcher {
    last: Option<(HintKey, Instant)>,
}

impl HintDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether this hint should go out now; records it if so.
    pub fn should_emit(&mut self, hint: &EndpointHint, refresh: Duration) -> bool {
        let key = HintKey::of(hint);
        let now = Instant::now();
        match self.last {
            Some((last_key, sent_at)) if last_key == key && now.duration_since(sent_at) < refresh => {
                false
            }
            _ => {
                self.last = Some((key, now));
                true
            }
        }
    }

    /// Forget the last hint; called on each commit.
    pub fn reset(&mut self) {
        self.last = None;
    }
}
