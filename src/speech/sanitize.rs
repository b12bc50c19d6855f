//! Sanitizes assistant text deltas into TTS-safe prose.
//!
//! Model output carries markdown, code, URLs and emoji that sound wrong
//! when spoken. The sanitizer is stateful across deltas because a code
//! fence can open in one delta and close several deltas later; everything
//! inside a fence is suppressed, while inline backtick content is kept
//! with the markers removed.

/// Punctuation that reads naturally in speech; everything else becomes a space.
const SPEECH_SAFE: [char; 7] = ['.', ',', '!', '?', '\'', '"', '-'];

/// Streaming sanitizer for one assistant turn.
#[derive(Debug, Default)]
pub struct SpeechSanitizer {
    /// Inside a triple-backtick fence: drop everything until it closes.
    dropping: bool,
    /// Backticks seen at the end of the previous delta (a fence marker may
    /// split across deltas).
    tick_carry: u8,
    /// Whether any sanitized text has been produced this turn.
    sent_any: bool,
    /// Whether the previous delta ended in whitespace the filter dropped.
    prev_trailing_space: bool,
}

impl SpeechSanitizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sanitize one raw delta, returning speech-safe text.
    pub fn push(&mut self, raw: &str) -> String {
        let kept = self.resolve_fences(raw);
        let bridged = self.prev_trailing_space
            || raw.starts_with(char::is_whitespace)
            || kept.starts_with(char::is_whitespace);
        self.prev_trailing_space =
            raw.ends_with(char::is_whitespace) || kept.ends_with(char::is_whitespace);
        let no_links = strip_markdown_links(&kept);
        let no_urls = strip_urls(&no_links);
        let mut out = filter_chars(&no_urls);

        // Bridge rule: whitespace at the delta seam was collapsed away;
        // restore one space so adjacent words do not fuse.
        if self.sent_any && bridged && out.starts_with(|c: char| c.is_alphanumeric()) {
            out.insert(0, ' ');
        }
        if !out.trim().is_empty() {
            self.sent_any = true;
        }
        out
    }

    /// Resolve backtick runs: a run of three toggles fence drop state,
    /// shorter runs are inline markers and vanish.
    fn resolve_fences(&mut self, raw: &str) -> String {
        let mut kept = String::with_capacity(raw.len());
        let mut ticks = usize::from(self.tick_carry);
        for c in raw.chars() {
            if c == '`' {
                ticks += 1;
                if ticks == 3 {
                    self.dropping = !self.dropping;
                    ticks = 0;
                }
                continue;
            }
            ticks = 0;
            if !self.dropping {
                kept.push(c);
            }
        }
        self.tick_carry = ticks as u8;
        kept
    }
}

/// Replace `[label](url)` with `label`.
fn strip_markdown_links(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    loop {
        let Some(open) = rest.find('[') else {
            out.push_str(rest);
            return out;
        };
        let Some(close_rel) = rest[open..].find("](") else {
            out.push_str(rest);
            return out;
        };
        let close = open + close_rel;
        let Some(end_rel) = rest[close + 2..].find(')') else {
            out.push_str(rest);
            return out;
        };
        out.push_str(&rest[..open]);
        out.push_str(&rest[open + 1..close]);
        rest = &rest[close + 2 + end_rel + 1..];
    }
}

/// Delete bare URLs up to the next whitespace.
fn strip_urls(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    loop {
        let hit = ["https://", "http://", "www."]
            .iter()
            .filter_map(|p| rest.find(p))
            .min();
        let Some(start) = hit else {
            out.push_str(rest);
            return out;
        };
        out.push_str(&rest[..start]);
        let tail = &rest[start..];
        let end = tail
            .find(char::is_whitespace)
            .unwrap_or(tail.len());
        out.push(' ');
        rest = &tail[end..];
    }
}

/// Keep letters, digits, speech-safe punctuation, and single spaces.
fn filter_chars(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut pending_space = false;
    for c in text.chars() {
        if is_invisible_or_emoji(c) {
            continue;
        }
        if c.is_alphanumeric() || SPEECH_SAFE.contains(&c) {
            if pending_space && !out.is_empty() {
                out.push(' ');
            }
            pending_space = false;
            out.push(c);
        } else {
            // Whitespace, markup markers (* _ \ / | # ~ < >), and any other
            // punctuation or symbol all read as a word gap.
            pending_space = true;
        }
    }
    out
}

/// Emoji, symbol/modifier glyphs, and invisible joiners.
fn is_invisible_or_emoji(c: char) -> bool {
    matches!(c,
        '\u{200B}'..='\u{200D}'        // zero-width space/non-joiner/joiner
        | '\u{FE00}'..='\u{FE0F}'      // variation selectors
        | '\u{20E3}'                   // keycap combiner
        | '\u{2190}'..='\u{2BFF}'      // arrows, math and misc symbols
        | '\u{1F000}'..='\u{1FAFF}'    // emoji blocks
        | '\u{1F1E6}'..='\u{1F1FF}'    // regional indicators
    )
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    fn sanitize_once(text: &str) -> String {
        SpeechSanitizer::new().push(text)
    }

    #[test]
    fn plain_prose_is_untouched() {
        assert_eq!(
            sanitize_once("Sure, the deploy finished."),
            "Sure, the deploy finished."
        );
    }

    #[test]
    fn markdown_markers_become_spaces() {
        assert_eq!(sanitize_once("this is **bold** and _quiet_"), "this is bold and quiet");
        assert_eq!(sanitize_once("# Heading\ntext"), "Heading text");
    }

    #[test]
    fn inline_backticks_keep_content() {
        assert_eq!(sanitize_once("run `cargo fmt` locally"), "run cargo fmt locally");
    }

    #[test]
    fn fenced_code_is_suppressed() {
        let mut s = SpeechSanitizer::new();
        let mut out = String::new();
        out.push_str(&s.push("Here is the fix: ```rust\n"));
        out.push_str(&s.push("fn main() {}\n"));
        out.push_str(&s.push("``` and that should build."));
        assert_eq!(out.trim(), "Here is the fix and that should build.");
    }

    #[test]
    fn fence_marker_split_across_deltas() {
        let mut s = SpeechSanitizer::new();
        let mut out = String::new();
        out.push_str(&s.push("before `"));
        out.push_str(&s.push("``hidden``"));
        out.push_str(&s.push("` after"));
        assert_eq!(out.trim(), "before after");
    }

    #[test]
    fn links_keep_labels_and_urls_vanish() {
        assert_eq!(
            sanitize_once("see [the docs](https://example.com/a#b) or https://example.com"),
            "see the docs or"
        );
    }

    #[test]
    fn emoji_and_joiners_are_stripped() {
        assert_eq!(sanitize_once("done \u{1F389}\u{FE0F} for today"), "done for today");
        assert_eq!(sanitize_once("a\u{200D}b"), "ab");
    }

    #[test]
    fn speech_safe_punctuation_survives() {
        assert_eq!(
            sanitize_once("Wait - really? Yes, \"done\"!"),
            "Wait - really? Yes, \"done\"!"
        );
    }

    #[test]
    fn bridge_rule_restores_leading_space() {
        let mut s = SpeechSanitizer::new();
        assert_eq!(s.push("Hello"), "Hello");
        // The raw delta starts with whitespace; the filter would otherwise
        // hand back "world" and the client would render "Helloworld".
        assert_eq!(s.push(" world"), " world");
    }

    #[test]
    fn bridge_rule_covers_trailing_space() {
        let mut s = SpeechSanitizer::new();
        // The trailing space of the first delta is trimmed; the next
        // delta must not fuse onto it.
        assert_eq!(s.push("The build is green. "), "The build is green.");
        assert_eq!(s.push("Ship it."), " Ship it.");
    }

    #[test]
    fn no_bridge_before_first_output() {
        let mut s = SpeechSanitizer::new();
        assert_eq!(s.push("  leading"), "leading");
    }

    #[test]
    fn sanitize_is_idempotent() {
        let inputs = [
            "mixed **markup** and `code` with https://x.dev links \u{1F600}",
            "plain words already clean.",
        ];
        for input in inputs {
            let once = sanitize_once(input);
            assert_eq!(sanitize_once(&once), once);
        }
    }
}
