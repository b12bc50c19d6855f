//! Canonical text forms for speculation equality and progression checks.
//!
//! A canonical form is lowercase letters and digits with single spaces;
//! punctuation, symbols and emoji vanish. Partial transcripts that differ
//! only in casing or punctuation therefore compare equal, which is what
//! the speculator's stability tracking needs.

/// Maximum characters a "progressive continuation" may roll back.
const MAX_ROLLBACK_CHARS: usize = 6;

/// Minimum shared leading words for a fuzzy prefix match.
const FUZZY_MIN_SHARED_WORDS: usize = 4;

/// Maximum trailing word mismatch for a fuzzy prefix match.
const FUZZY_MAX_TRAILING_MISMATCH: usize = 1;

/// Normalize to lowercase alphanumeric words separated by single spaces.
pub fn canonicalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut pending_space = false;
    for c in text.chars() {
        if c.is_alphanumeric() {
            if pending_space && !out.is_empty() {
                out.push(' ');
            }
            pending_space = false;
            for lower in c.to_lowercase() {
                out.push(lower);
            }
        } else {
            pending_space = true;
        }
    }
    out
}

/// Number of words in a canonical string.
pub fn word_count(canonical: &str) -> usize {
    if canonical.is_empty() {
        0
    } else {
        canonical.split(' ').count()
    }
}

/// Whether `newer` progressively continues `older`: it extends it, or
/// rolls back by at most [`MAX_ROLLBACK_CHARS`] characters.
pub fn is_progressive_continuation(older: &str, newer: &str) -> bool {
    if newer.starts_with(older) {
        return true;
    }
    older.starts_with(newer) && older.len() - newer.len() <= MAX_ROLLBACK_CHARS
}

/// Fuzzy prefix match: enough shared leading words and at most one word
/// of trailing disagreement. Catches late STT corrections like a trailing
/// plural without admitting genuinely different utterances.
pub fn fuzzy_prefix_match(a: &str, b: &str) -> bool {
    let shared = shared_word_prefix_len(a, b);
    if shared < FUZZY_MIN_SHARED_WORDS {
        return false;
    }
    let mismatch = word_count(a).max(word_count(b)) - shared;
    mismatch <= FUZZY_MAX_TRAILING_MISMATCH
}

/// Whether a speculative result computed for `speculated` may serve a
/// commit of `committed`.
pub fn compatible(speculated: &str, committed: &str) -> bool {
    speculated == committed
        || is_progressive_continuation(speculated, committed)
        || fuzzy_prefix_match(speculated, committed)
}

/// Number of leading words two canonical strings share.
pub fn shared_word_prefix_len(a: &str, b: &str) -> usize {
    a.split(' ')
        .zip(b.split(' '))
        .take_while(|(x, y)| x == y)
        .count()
}
