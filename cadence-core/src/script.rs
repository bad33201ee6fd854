//! Read-only script corpus shared by the matcher and the router.

use std::collections::BTreeSet;
use std::sync::Arc;

/// One line of the script, as supplied by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptLine {
    pub index: usize,
    pub normalized_text: String,
    /// Lines with nothing to speak (blank lines, stage directions). The
    /// matcher never scores them and skips past them on commit.
    pub is_silent: bool,
    tokens: BTreeSet<String>,
}

impl ScriptLine {
    pub fn new(index: usize, text: &str, is_silent: bool) -> Self {
        let tokens: BTreeSet<String> = if is_silent {
            BTreeSet::new()
        } else {
            tokenize(text).collect()
        };
        Self {
            index,
            normalized_text: normalize_text(text),
            is_silent,
            tokens,
        }
    }

    /// Unique normalized words of this line.
    pub fn tokens(&self) -> &BTreeSet<String> {
        &self.tokens
    }

    pub fn word_count(&self) -> usize {
        self.tokens.len()
    }
}

/// Immutable, cheaply cloneable line corpus.
#[derive(Debug, Clone)]
pub struct Script {
    lines: Arc<[ScriptLine]>,
}

impl Default for Script {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl Script {
    pub fn new(lines: Vec<ScriptLine>) -> Self {
        Self {
            lines: lines.into(),
        }
    }

    /// Build a corpus from raw text, one script line per text line.
    ///
    /// Blank lines and lines that are entirely a bracketed cue (`[pause]`,
    /// `(beat)`) are flagged silent.
    pub fn from_text(text: &str) -> Self {
        let lines = text
            .lines()
            .enumerate()
            .map(|(index, raw)| ScriptLine::new(index, raw, is_cue_line(raw)))
            .collect();
        Self::new(lines)
    }

    pub fn lines(&self) -> &[ScriptLine] {
        &self.lines
    }

    pub fn get(&self, index: usize) -> Option<&ScriptLine> {
        self.lines.get(index)
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Mean word count over spoken lines; `None` if nothing is spoken.
    pub fn avg_words_per_line(&self) -> Option<f64> {
        let (lines, words) = self
            .lines
            .iter()
            .filter(|l| !l.is_silent && l.word_count() > 0)
            .fold((0usize, 0usize), |(n, w), l| (n + 1, w + l.word_count()));
        (lines > 0).then(|| words as f64 / lines as f64)
    }
}

/// Lowercase and collapse whitespace, keeping only word characters.
pub fn normalize_text(text: &str) -> String {
    tokenize_ordered(text).collect::<Vec<_>>().join(" ")
}

/// Normalized word tokens, in order, duplicates preserved.
pub fn tokenize_ordered(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| c.is_whitespace() || c == '-' || c == '/')
        .map(|word| {
            word.chars()
                .filter(|c| c.is_alphanumeric() || *c == '\'')
                .flat_map(char::to_lowercase)
                .collect::<String>()
        })
        .map(|word| word.trim_matches('\'').to_string())
        .filter(|word| !word.is_empty())
}

/// Unique normalized word tokens.
pub fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    let mut seen = BTreeSet::new();
    tokenize_ordered(text).filter(move |t| seen.insert(t.clone()))
}

fn is_cue_line(raw: &str) -> bool {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return true;
    }
    let bracketed = (trimmed.starts_with('[') && trimmed.ends_with(']'))
        || (trimmed.starts_with('(') && trimmed.ends_with(')'));
    bracketed || tokenize_ordered(trimmed).next().is_none()
}
