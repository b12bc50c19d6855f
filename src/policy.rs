//! PII redaction applied to text before it is persisted.
//!
//! Redaction is a pure function: it never fails and never touches the
//! live conversation path, only what the memory store writes to disk.

/// Replacement token for redacted spans.
const MASK: &str = "[redacted]";

/// Minimum digit-run length treated as an identifier worth masking.
const DIGIT_RUN_MIN: usize = 7;

/// Redact emails, phone-like numbers, and long digit runs.
pub fn redact(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for token in split_keeping_whitespace(text) {
        if token.chars().all(char::is_whitespace) {
            out.push_str(token);
        } else if is_email(token) || is_phone_like(token) || has_long_digit_run(token) {
            out.push_str(MASK);
        } else {
            out.push_str(token);
        }
    }
    out
}

/// Split into alternating word / whitespace slices so the original
/// spacing survives redaction.
fn split_keeping_whitespace(text: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut in_space = text.starts_with(char::is_whitespace);
    for (i, c) in text.char_indices() {
        if c.is_whitespace() != in_space {
            if i > start {
                parts.push(&text[start..i]);
            }
            start = i;
            in_space = c.is_whitespace();
        }
    }
    if start < text.len() {
        parts.push(&text[start..]);
    }
    parts
}

fn is_email(token: &str) -> bool {
    let trimmed = token.trim_matches(|c: char| !c.is_alphanumeric() && c != '@' && c != '.');
    let Some(at) = trimmed.find('@') else {
        return false;
    };
    let (local, domain) = trimmed.split_at(at);
    let domain = &domain[1..];
    !local.is_empty() && domain.contains('.') && !domain.ends_with('.')
}

/// Phone-shaped: mostly digits with separator punctuation, at least 7 digits.
fn is_phone_like(token: &str) -> bool {
    let digits = token.chars().filter(char::is_ascii_digit).count();
    if digits < DIGIT_RUN_MIN {
        return false;
    }
    token
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, '+' | '-' | '(' | ')' | '.' | ' '))
}

fn has_long_digit_run(token: &str) -> bool {
    let mut run = 0usize;
    for c in token.chars() {
        if c.is_ascii_digit() {
            run += 1;
            if run >= DIGIT_RUN_MIN {
                return true;
            }
        } else {
            run = 0;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn plain_text_passes_through() {
        assert_eq!(redact("remind me to water the plants"), "remind me to water the plants");
    }

    #[test]
    fn emails_are_masked() {
        assert_eq!(
            redact("mail sam@example.com about the demo"),
            "mail [redacted] about the demo"
        );
    }

    #[test]
    fn phone_numbers_are_masked() {
        assert_eq!(redact("call +1-555-867-5309 now"), "call [redacted] now");
        assert_eq!(redact("call (555) 123 at noon"), "call (555) 123 at noon");
    }

    #[test]
    fn long_digit_runs_are_masked() {
        assert_eq!(redact("my id is 123456789"), "my id is [redacted]");
        assert_eq!(redact("room 4021 is free"), "room 4021 is free");
    }

    #[test]
    fn redaction_is_idempotent() {
        let once = redact("reach me at sam@example.com or 5551234567");
        assert_eq!(redact(&once), once);
    }
}
