//! Shared text measures.
//!
//! Used by quality scoring, the Confidence agreement matrix and attribution,
//! so every component compares text the same way.

use lazy_static::lazy_static;
use regex::Regex;
use std::collections::BTreeSet;

lazy_static! {
    /// A word: starts alphanumeric, may contain apostrophes, hyphens and underscores
    pub static ref WORD_PATTERN: Regex = Regex::new(r"[A-Za-z0-9][A-Za-z0-9'_-]*").unwrap();

    /// Sentence terminator followed by whitespace or end of text
    pub static ref SENTENCE_END: Regex = Regex::new(r"[.!?]+(?:\s+|$)").unwrap();

    /// Collapsible whitespace runs
    pub static ref WHITESPACE: Regex = Regex::new(r"\s+").unwrap();
}

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "are", "but", "not", "you", "all", "any", "can", "had", "her", "was",
    "one", "our", "out", "has", "have", "his", "how", "its", "may", "who", "did", "get", "him",
    "this", "that", "with", "from", "they", "will", "would", "there", "their", "what", "about",
    "which", "when", "were", "been", "than", "then", "them", "these", "those", "into", "also",
    "such", "some", "more", "most", "other", "very", "just", "each", "your", "only",
];

/// Lowercased word tokens in order.
pub fn words(text: &str) -> Vec<String> {
    WORD_PATTERN
        .find_iter(text)
        .map(|m| m.as_str().to_lowercase())
        .collect()
}

/// Distinct lowercased words of three or more letters, stopwords removed.
pub fn content_words(text: &str) -> BTreeSet<String> {
    words(text)
        .into_iter()
        .filter(|w| w.len() >= 3 && !STOPWORDS.contains(&w.as_str()))
        .collect()
}

/// Non-empty sentences, trimmed.
pub fn sentences(text: &str) -> Vec<&str> {
    SENTENCE_END
        .split(text)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

/// Jaccard similarity of two sets; two empty sets are identical.
pub fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count() as f64;
    let union = a.union(b).count() as f64;
    intersection / union
}

/// Fraction of `part` that also appears in `whole`; empty `part` yields 0.
pub fn containment(part: &BTreeSet<String>, whole: &BTreeSet<String>) -> f64 {
    if part.is_empty() {
        return 0.0;
    }
    part.intersection(whole).count() as f64 / part.len() as f64
}

/// Word-set Jaccard similarity of two texts.
pub fn text_similarity(a: &str, b: &str) -> f64 {
    jaccard(&content_words(a), &content_words(b))
}

/// Trim and collapse every whitespace run to a single space.
pub fn collapse_whitespace(text: &str) -> String {
    WHITESPACE.replace_all(text.trim(), " ").into_owned()
}
