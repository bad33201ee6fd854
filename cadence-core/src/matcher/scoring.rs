//! Coverage scoring of a transcript fragment against the match window.

use std::collections::BTreeSet;

use strsim::normalized_levenshtein;

use crate::config::MatcherConfig;
use crate::script::{Script, ScriptLine};

/// Lines `[start, end)` considered for one fragment. Recomputed per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchWindow {
    pub start: usize,
    pub end: usize,
}

impl MatchWindow {
    pub fn new(current_index: usize, window_size: usize, line_count: usize) -> Self {
        let start = current_index.min(line_count);
        let end = current_index.saturating_add(window_size).min(line_count);
        Self { start, end }
    }

    /// Widen the window backwards to `start` without moving its end.
    pub fn reaching_back_to(self, start: usize) -> Self {
        Self {
            start: start.min(self.start),
            ..self
        }
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn indices(&self) -> std::ops::Range<usize> {
        self.start..self.end
    }
}

/// Best-scoring line for a fragment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub index: usize,
    pub coverage: f64,
    pub score: f64,
}

/// Fraction of the line's words present in the fragment.
///
/// Tokens of at least `fuzzy_min_token_len` characters also match when their
/// normalized Levenshtein similarity reaches `fuzzy_token_similarity`, which
/// absorbs recognizer slips like "organisation"/"organization".
pub fn coverage(line: &ScriptLine, fragment: &BTreeSet<String>, config: &MatcherConfig) -> f64 {
    if line.is_silent || line.word_count() == 0 || fragment.is_empty() {
        return 0.0;
    }
    let hits = line
        .tokens()
        .iter()
        .filter(|token| token_matches(token, fragment, config))
        .count();
    hits as f64 / line.word_count() as f64
}

fn token_matches(token: &str, fragment: &BTreeSet<String>, config: &MatcherConfig) -> bool {
    if fragment.contains(token) {
        return true;
    }
    let min_len = config.fuzzy_min_token_len;
    if token.chars().count() < min_len {
        return false;
    }
    fragment
        .iter()
        .filter(|candidate| candidate.chars().count() >= min_len)
        .any(|candidate| normalized_levenshtein(token, candidate) >= config.fuzzy_token_similarity)
}

/// Score every line in the window and return the best one.
///
/// `score = coverage * confidence`; ties keep the earliest index.
pub fn best_candidate(
    script: &Script,
    window: MatchWindow,
    fragment: &BTreeSet<String>,
    confidence: f64,
    config: &MatcherConfig,
) -> Option<Candidate> {
    let mut best: Option<Candidate> = None;
    for index in window.indices() {
        let Some(line) = script.get(index) else {
            break;
        };
        let cov = coverage(line, fragment, config);
        if cov <= 0.0 {
            continue;
        }
        let score = cov * confidence;
        if best.map_or(true, |b| score > b.score) {
            best = Some(Candidate {
                index,
                coverage: cov,
                score,
            });
        }
    }
    best
}
