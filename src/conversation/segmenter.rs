//! Incremental sentence segmentation of a token stream.
//!
//! [`SentenceSegmenter`] keeps one growing buffer.  A sentence ends after a
//! run of `.`, `!` or `?` (plus any closing quotes or brackets) that is
//! followed by whitespace; a terminator at the very end of the buffer waits
//! for the next fragment, so `3.` + `5` or `Wait.` + `..` are never split.
//! [`SentenceSegmenter::flush`] emits whatever is left when the stream ends.
//!
//! Speaker labels echoed by the model (`Ava:`, `**Ben:**`) are stripped from
//! each sentence as it leaves the segmenter, never from the running buffer.
//! A speaker name that contains a terminator (`Dr. K`) is never split.

use regex::Regex;

/// One complete span of text, numbered in emission order within a turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sentence {
    pub index: usize,
    pub text: String,
}

// ---------------------------------------------------------------------------
// LabelCleaner
// ---------------------------------------------------------------------------

/// Strips `Name:` prefixes for a fixed set of speaker names.
///
/// Labels are removed at the start of the text and right after a sentence
/// terminator; a name used mid-sentence (`I told Ava: no`) is left alone.
#[derive(Debug, Clone, Default)]
pub struct LabelCleaner {
    pattern: Option<Regex>,
    /// Names containing a sentence terminator (`Dr. K`), which the
    /// segmenter must not split.
    dotted: Vec<String>,
}

impl LabelCleaner {
    pub fn new<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        let names: Vec<&str> = names
            .into_iter()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .collect();
        if names.is_empty() {
            return Self::default();
        }
        let alternatives: Vec<String> = names.iter().map(|n| regex::escape(n)).collect();
        let dotted: Vec<String> = names
            .iter()
            .filter(|n| n.chars().any(is_terminator))
            .map(|n| n.to_string())
            .collect();

        let pattern = format!(
            r"(?i)(^|[.!?])\s*[*_]*(?:{})[*_]*\s*:[*_]*",
            alternatives.join("|")
        );
        match Regex::new(&pattern) {
            Ok(re) => Self {
                pattern: Some(re),
                dotted,
            },
            Err(e) => {
                log::warn!("segmenter: label pattern rejected ({e}); labels kept");
                Self {
                    pattern: None,
                    dotted,
                }
            }
        }
    }

    /// `true` when byte offset `at` of `text` falls inside a speaker name,
    /// or inside what may still become one once more text arrives.
    fn holds(&self, text: &str, at: usize) -> bool {
        let bytes = text.as_bytes();
        self.dotted.iter().any(|name| {
            let name = name.as_bytes();
            (at.saturating_sub(name.len())..at).any(|start| {
                let rest = &bytes[start..];
                let n = rest.len().min(name.len());
                start + n > at && rest[..n].eq_ignore_ascii_case(&name[..n])
            })
        })
    }

    /// Remove labels and normalise whitespace.
    pub fn clean(&self, text: &str) -> String {
        match &self.pattern {
            Some(re) => collapse_whitespace(&re.replace_all(text, "$1 ")),
            None => collapse_whitespace(text),
        }
    }
}

/// Stateless form of [`LabelCleaner::clean`].
pub fn clean_speaker_labels(text: &str, names: &[&str]) -> String {
    LabelCleaner::new(names.iter().copied()).clean(text)
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ---------------------------------------------------------------------------
// SentenceSegmenter
// ---------------------------------------------------------------------------

/// Owned by exactly one speaking turn; not shared.
#[derive(Debug, Default)]
pub struct SentenceSegmenter {
    buffer: String,
    next_index: usize,
    cleaner: LabelCleaner,
}

impl SentenceSegmenter {
    pub fn new(cleaner: LabelCleaner) -> Self {
        Self {
            buffer: String::new(),
            next_index: 0,
            cleaner,
        }
    }

    /// Append a fragment and return every sentence it completed.
    pub fn feed(&mut self, fragment: &str) -> Vec<Sentence> {
        self.buffer.push_str(fragment);

        let mut sentences = Vec::new();
        let mut from = 0;
        while let Some(at) = boundary(&self.buffer[from..]).map(|at| from + at) {
            if self.cleaner.holds(&self.buffer, at) {
                from = at;
                continue;
            }
            from = 0;
            let rest = self.buffer.split_off(at);
            let piece = std::mem::replace(&mut self.buffer, rest);
            if let Some(sentence) = self.emit(&piece) {
                sentences.push(sentence);
            }
        }
        sentences
    }

    /// Emit the trailing text as a final sentence, if it has any content.
    pub fn flush(&mut self) -> Option<Sentence> {
        let piece = std::mem::take(&mut self.buffer);
        self.emit(&piece)
    }

    /// Text received but not yet part of a sentence.
    pub fn pending(&self) -> &str {
        &self.buffer
    }

    fn emit(&mut self, piece: &str) -> Option<Sentence> {
        let text = self.cleaner.clean(piece);
        if text.is_empty() {
            return None;
        }
        let sentence = Sentence {
            index: self.next_index,
            text,
        };
        self.next_index += 1;
        Some(sentence)
    }
}

fn is_terminator(c: char) -> bool {
    matches!(c, '.' | '!' | '?')
}

fn is_closer(c: char) -> bool {
    matches!(c, '"' | '\'' | ')' | ']' | '\u{201D}' | '\u{2019}')
}

/// Byte offset just past the first complete sentence, if any.
fn boundary(text: &str) -> Option<usize> {
    let chars: Vec<(usize, char)> = text.char_indices().collect();
    let mut i = 0;
    while i < chars.len() {
        if !is_terminator(chars[i].1) {
            i += 1;
            continue;
        }
        let mut j = i + 1;
        while j < chars.len() && (is_terminator(chars[j].1) || is_closer(chars[j].1)) {
            j += 1;
        }
        match chars.get(j) {
            None => return None,
            Some((at, c)) if c.is_whitespace() => return Some(*at),
            Some(_) => i = j,
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
