//! Prosody-aware segmentation of streaming assistant text.
//!
//! The planner accumulates text deltas and cuts speech-ready phrases at
//! natural boundaries so TTS output sounds paced rather than choppy.
//! Sentence terminators always win; commas only count once enough text
//! has accumulated; plain whitespace is a last resort inside a bounded
//! window past the minimum.

use crate::config::ProsodyConfig;

/// Sentence-terminating characters.
const SENTENCE_ENDS: [char; 6] = ['.', '!', '?', ';', ':', '\n'];

/// Streaming text-to-phrase segmenter for one assistant turn.
#[derive(Debug)]
pub struct ProsodyPlanner {
    config: ProsodyConfig,
    buffer: String,
    emitted_any: bool,
}

impl ProsodyPlanner {
    pub fn new(config: ProsodyConfig) -> Self {
        Self {
            config,
            buffer: String::new(),
            emitted_any: false,
        }
    }

    /// Append a delta and drain every segment that became ready.
    pub fn push(&mut self, delta: &str) -> Vec<String> {
        self.buffer.push_str(delta);
        let mut segments = Vec::new();
        while let Some(segment) = self.try_emit() {
            segments.push(segment);
        }
        segments
    }

    /// Force-emit any remainder at end of turn and reset.
    pub fn finalize(&mut self) -> Vec<String> {
        let mut segments = Vec::new();
        while let Some(segment) = self.try_emit() {
            segments.push(segment);
        }
        let rest = normalize_segment(&self.buffer);
        self.buffer.clear();
        self.emitted_any = false;
        if !rest.is_empty() {
            segments.push(rest);
        }
        segments
    }

    /// Characters currently buffered and not yet emitted.
    pub fn pending_len(&self) -> usize {
        self.buffer.chars().count()
    }

    fn min_chars(&self) -> usize {
        if self.emitted_any {
            self.config.next_chunk_min
        } else {
            self.config.first_chunk_min
        }
    }

    fn try_emit(&mut self) -> Option<String> {
        let len = self.buffer.chars().count();
        let min = self.min_chars();
        if len < min {
            return None;
        }

        let cut = self
            .sentence_cut()
            .or_else(|| self.comma_cut(len))
            .or_else(|| self.whitespace_cut(min))?;

        let segment = normalize_segment(&self.buffer[..cut]);
        self.buffer = self.buffer[cut..].trim_start().to_owned();
        if segment.is_empty() {
            // Boundary produced nothing speakable; keep scanning.
            return self.try_emit();
        }
        self.emitted_any = true;
        Some(segment)
    }

    /// Earliest sentence terminator followed by whitespace or end of buffer.
    fn sentence_cut(&self) -> Option<usize> {
        for (i, c) in self.buffer.char_indices() {
            if SENTENCE_ENDS.contains(&c) {
                let rest = &self.buffer[i + c.len_utf8()..];
                if rest.is_empty() || rest.starts_with(char::is_whitespace) {
                    return Some(i + c.len_utf8());
                }
            }
        }
        None
    }

    /// Last comma boundary, admitted only past the comma minimum.
    fn comma_cut(&self, len: usize) -> Option<usize> {
        if len < self.config.comma_chunk_min {
            return None;
        }
        let mut last = None;
        for (i, c) in self.buffer.char_indices() {
            if c == ',' {
                let rest = &self.buffer[i + 1..];
                if rest.is_empty() || rest.starts_with(char::is_whitespace) {
                    last = Some(i + 1);
                }
            }
        }
        last
    }

    /// Last whitespace inside the cut window past the minimum point.
    fn whitespace_cut(&self, min: usize) -> Option<usize> {
        let mut last = None;
        for (count, (i, c)) in self.buffer.char_indices().enumerate() {
            if count < min {
                continue;
            }
            if count >= min + self.config.cut_window {
                break;
            }
            if c.is_whitespace() {
                last = Some(i);
            }
        }
        last
    }
}

/// Collapse whitespace runs to single spaces and trim the edges.
fn normalize_segment(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut pending_space = false;
    for c in text.chars() {
        if c.is_whitespace() {
            pending_space = !out.is_empty();
        } else {
            if pending_space {
                out.push(' ');
                pending_space = false;
            }
            out.push(c);
        }
    }
    out
}
