//! Suppresses assistant stalling preamble at the start of a turn.
//!
//! Models often open with "give me a second while I think" or
//! "sure, just a moment" before the actual answer. Speaking that preamble
//! wastes the latency budget and sounds like stalling, so the filter
//! buffers the head of the stream until it can tell whether the opening
//! matches a known filler (or acknowledgement + filler) phrase, strips the
//! match, and releases the remainder.

/// Stalling phrases that never reach the client.
const LEAD_FILLERS: &[&str] = &[
    "give me a second while i think",
    "give me a second",
    "give me a moment",
    "just a second",
    "just a moment",
    "one moment please",
    "one moment",
    "one second",
    "let me think about that",
    "let me think",
    "let me have a look",
    "hold on",
    "hang on",
    "bear with me",
];

/// Acknowledgements that may precede a filler phrase.
const ACKS: &[&str] = &["sure", "okay", "ok", "alright", "right", "of course", "certainly", "no problem"];

/// Stop probing once this much canonical text has accumulated; no filler
/// phrase is longer.
const PROBE_CAP: usize = 96;

/// Filter over the head of one assistant delta stream.
#[derive(Debug, Default)]
pub struct LeadResponseFilter {
    committed: bool,
    buffer: String,
}

impl LeadResponseFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one delta. Returns text to release, or `None` while buffering.
    pub fn push(&mut self, delta: &str) -> Option<String> {
        if self.committed {
            return Some(delta.to_owned());
        }

        self.buffer.push_str(delta);
        let canon = canonical(&self.buffer);
        if canon.len() < PROBE_CAP && is_prefix_of_known_phrase(&canon) {
            return None;
        }

        self.committed = true;
        let released = strip_lead_filler(&self.buffer).trim_start().to_owned();
        self.buffer.clear();
        if released.is_empty() {
            None
        } else {
            Some(released)
        }
    }

    /// Release anything still buffered at end of stream.
    pub fn flush(&mut self) -> Option<String> {
        if self.committed || self.buffer.is_empty() {
            return None;
        }
        self.committed = true;
        let released = strip_lead_filler(&self.buffer).trim_start().to_owned();
        self.buffer.clear();
        if released.is_empty() {
            None
        } else {
            Some(released)
        }
    }

    /// Whether the filter has started passing deltas through.
    pub fn is_committed(&self) -> bool {
        self.committed
    }

    /// Final-text path: when the adapter streamed nothing and only returned
    /// a final text, strip lead filler from that text.
    pub fn finalize(&mut self, fallback: &str) -> String {
        if self.committed {
            return fallback.to_owned();
        }
        self.committed = true;
        strip_lead_filler(fallback).trim_start().to_owned()
    }
}

/// Letters and digits only, lower-cased. Used for phrase comparison so
/// punctuation and spacing differences cannot defeat the match.
fn canonical(text: &str) -> String {
    text.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

/// All phrases the filter recognizes, in canonical form: fillers and
/// acknowledgement+filler combinations.
fn known_phrases() -> Vec<String> {
    let mut phrases = Vec::new();
    for filler in LEAD_FILLERS {
        phrases.push(canonical(filler));
        for ack in ACKS {
            phrases.push(format!("{}{}", canonical(ack), canonical(filler)));
        }
    }
    phrases
}

fn is_prefix_of_known_phrase(canon: &str) -> bool {
    known_phrases().iter().any(|p| p.starts_with(canon))
}

/// Strip the longest known filler (or ack+filler) prefix from `text`,
/// along with any punctuation that trailed it.
pub fn strip_lead_filler(text: &str) -> &str {
    let canon = canonical(text);
    let matched_len = known_phrases()
        .iter()
        .filter(|p| canon.starts_with(p.as_str()))
        .map(String::len)
        .max()
        .unwrap_or(0);
    if matched_len == 0 {
        return text;
    }

    // Walk the original text consuming `matched_len` alphanumeric chars,
    // then eat trailing punctuation and whitespace.
    let mut consumed = 0usize;
    let mut end = 0usize;
    for (i, c) in text.char_indices() {
        if consumed == matched_len {
            if c.is_alphanumeric() {
                break;
            }
            end = i + c.len_utf8();
            continue;
        }
        if c.is_alphanumeric() {
            consumed += 1;
        }
        end = i + c.len_utf8();
    }
    &text[end..]
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn filler_sentence_is_stripped() {
        let mut filter = LeadResponseFilter::new();
        let out = filter.push("Give me a second while I think. We can ship this today.");
        assert_eq!(out.as_deref(), Some("We can ship this today."));
    }

    #[test]
    fn ack_plus_filler_is_stripped() {
        let mut filter = LeadResponseFilter::new();
        let out = filter.push("Sure, just a moment. The answer is four.");
        assert_eq!(out.as_deref(), Some("The answer is four."));
    }

    #[test]
    fn plain_answer_passes_after_probe() {
        let mut filter = LeadResponseFilter::new();
        let out = filter.push("The capital of France is Paris.");
        assert_eq!(out.as_deref(), Some("The capital of France is Paris."));
    }

    #[test]
    fn streaming_filler_buffers_then_releases() {
        let mut filter = LeadResponseFilter::new();
        assert!(filter.push("Give me a ").is_none());
        assert!(filter.push("second while I think").is_none());
        let out = filter.push(". Here is the plan.");
        assert_eq!(out.as_deref(), Some("Here is the plan."));
        // After commit, deltas pass through verbatim.
        assert_eq!(filter.push(" More.").as_deref(), Some(" More."));
    }

    #[test]
    fn ambiguous_short_head_is_buffered() {
        let mut filter = LeadResponseFilter::new();
        // "ok" is a prefix of "okay just a moment", so keep buffering.
        assert!(filter.push("Ok").is_none());
        assert!(!filter.is_committed());
    }

    #[test]
    fn flush_releases_buffered_non_filler() {
        let mut filter = LeadResponseFilter::new();
        assert!(filter.push("Sure").is_none());
        assert_eq!(filter.flush().as_deref(), Some("Sure"));
    }

    #[test]
    fn flush_swallows_pure_filler() {
        let mut filter = LeadResponseFilter::new();
        assert!(filter.push("Hold on").is_none());
        assert!(filter.flush().is_none());
    }

    #[test]
    fn finalize_strips_filler_from_final_text() {
        let mut filter = LeadResponseFilter::new();
        assert_eq!(
            filter.finalize("Let me think. It is forty-two."),
            "It is forty-two."
        );
    }

    #[test]
    fn strip_keeps_text_without_filler() {
        assert_eq!(strip_lead_filler("Nothing to strip here"), "Nothing to strip here");
    }
}
