//! Heuristic quality scoring and attribution.
//!
//! Scores are purely local: no model is consulted. The runtime wraps these
//! functions in its default evaluator and falls back to them when a judge
//! model cannot produce a grade.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::patterns::PatternStrategy;
use crate::response::Attribution;
use crate::similarity::{containment, content_words, jaccard, sentences, words};

lazy_static! {
    /// Bullet or numbered list items
    static ref LIST_ITEM: Regex = Regex::new(r"(?m)^\s*(?:[-*•]|\d+[.)])\s+\S").unwrap();

    /// Markdown headings
    static ref HEADING: Regex = Regex::new(r"(?m)^\s*#{1,6}\s+\S").unwrap();

    /// Reasoning connectives and concrete detail
    static ref REASONING: Regex = Regex::new(
        r"(?i)\b(because|therefore|however|for example|for instance|as a result|in contrast|which means|specifically)\b"
    ).unwrap();

    static ref NUMBER: Regex = Regex::new(r"\b\d+(?:[.,]\d+)?%?").unwrap();
}

/// Word count at which length stops adding depth.
const DEPTH_SATURATION_WORDS: f64 = 250.0;

/// Relative weight of each quality dimension.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityWeights {
    pub coherence: f64,
    pub depth: f64,
    pub uniqueness: f64,
    pub pattern_fit: f64,
}

impl Default for QualityWeights {
    fn default() -> Self {
        Self {
            coherence: 0.35,
            depth: 0.30,
            uniqueness: 0.20,
            pattern_fit: 0.15,
        }
    }
}

impl QualityWeights {
    /// Weights scaled to sum to 1. Negative or non-finite weights count as 0;
    /// if nothing positive remains the defaults are used.
    pub fn normalized(&self) -> Self {
        let clean = |w: f64| if w.is_finite() && w > 0.0 { w } else { 0.0 };
        let (c, d, u, p) = (
            clean(self.coherence),
            clean(self.depth),
            clean(self.uniqueness),
            clean(self.pattern_fit),
        );
        let total = c + d + u + p;
        if total <= 0.0 {
            return Self::default();
        }
        Self {
            coherence: c / total,
            depth: d / total,
            uniqueness: u / total,
            pattern_fit: p / total,
        }
    }
}

/// Per-dimension scores, each in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct QualityBreakdown {
    pub coherence: f64,
    pub depth: f64,
    pub uniqueness: f64,
    pub pattern_fit: f64,
    pub overall: f64,
}

/// Score `text` against the other responses of the same stage.
pub fn score(
    text: &str,
    peers: &[&str],
    pattern: PatternStrategy,
    weights: &QualityWeights,
) -> QualityBreakdown {
    if text.trim().is_empty() {
        return QualityBreakdown::default();
    }

    let coherence = coherence(text);
    let depth = depth(text);
    let uniqueness = uniqueness(text, peers);
    let pattern_fit = pattern.marker_coverage(text);

    let w = weights.normalized();
    let overall = coherence * w.coherence
        + depth * w.depth
        + uniqueness * w.uniqueness
        + pattern_fit * w.pattern_fit;

    QualityBreakdown {
        coherence,
        depth,
        uniqueness,
        pattern_fit,
        overall: clamp_unit(overall),
    }
}

/// Structural heuristics: sentence length, repetition and visible structure.
pub fn coherence(text: &str) -> f64 {
    let sents = sentences(text);
    if sents.is_empty() {
        return 0.0;
    }

    let word_count = words(text).len() as f64;
    let avg = word_count / sents.len() as f64;
    let length_score = if avg < 8.0 {
        avg / 8.0
    } else if avg > 30.0 {
        30.0 / avg
    } else {
        1.0
    };

    let distinct: BTreeSet<String> = sents.iter().map(|s| s.to_lowercase()).collect();
    let distinct_ratio = distinct.len() as f64 / sents.len() as f64;

    let structured =
        text.contains("\n\n") || LIST_ITEM.is_match(text) || HEADING.is_match(text);
    let structure = if structured { 1.0 } else { 0.7 };

    clamp_unit(0.5 * length_score + 0.3 * distinct_ratio + 0.2 * structure)
}

/// Length-normalized technical depth.
pub fn depth(text: &str) -> f64 {
    let all = words(text);
    if all.is_empty() {
        return 0.0;
    }

    let length = (all.len() as f64 / DEPTH_SATURATION_WORDS).min(1.0);
    let richness = (content_words(text).len() as f64 / all.len() as f64 / 0.5).min(1.0);
    let detail = REASONING.find_iter(text).count() + NUMBER.find_iter(text).count();
    let detail = (detail as f64 / 4.0).min(1.0);

    clamp_unit(0.5 * length + 0.3 * richness + 0.2 * detail)
}

/// One minus the mean similarity to peers; 0.5 when there are no peers.
pub fn uniqueness(text: &str, peers: &[&str]) -> f64 {
    let own = content_words(text);
    let others: Vec<BTreeSet<String>> = peers
        .iter()
        .filter(|p| !p.trim().is_empty())
        .map(|p| content_words(p))
        .collect();
    if others.is_empty() {
        return 0.5;
    }
    let mean = others.iter().map(|p| jaccard(&own, p)).sum::<f64>() / others.len() as f64;
    clamp_unit(1.0 - mean)
}

/// Share of `final_text` traceable to each contributor.
///
/// Each contributor's raw share is the fraction of the final answer's content
/// words it also used. Shares are normalised to sum to 1; when nothing
/// overlaps, contributors share equally. Output is sorted by model name.
pub fn attribution(final_text: &str, contributors: &[(&str, &str)]) -> Vec<Attribution> {
    if contributors.is_empty() {
        return Vec::new();
    }

    let target = content_words(final_text);
    let raw: Vec<f64> = contributors
        .iter()
        .map(|(_, text)| containment(&target, &content_words(text)))
        .collect();
    let total: f64 = raw.iter().sum();

    let mut shares: Vec<Attribution> = contributors
        .iter()
        .zip(raw)
        .map(|((model, _), r)| Attribution {
            model: (*model).to_string(),
            share: if total > 0.0 {
                r / total
            } else {
                1.0 / contributors.len() as f64
            },
        })
        .collect();
    shares.sort_by(|a, b| a.model.cmp(&b.model));
    shares
}

fn clamp_unit(x: f64) -> f64 {
    if x.is_finite() {
        x.clamp(0.0, 1.0)
    } else {
        0.0
    }
}
