//! Pattern-specific combination rules.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::PatternStrategy;
use crate::similarity::{content_words, jaccard};
use crate::types::{Stage, StageResponse};

lazy_static! {
    static ref STRENGTHS: Regex = Regex::new(r"(?i)\bstrengths?\b").unwrap();
    static ref WEAKNESSES: Regex = Regex::new(r"(?i)\bweakness(?:es)?\b").unwrap();

    /// Claim markers are uppercase and start a line: `VERIFIED: ...`
    static ref CLAIM_MARKER: Regex =
        Regex::new(r"(?m)^\s*(?:[-*]\s*)?\[?(VERIFIED|UNVERIFIED|DISPUTED)\]?\s*[:\-]").unwrap();

    static ref PERSPECTIVES: Regex = Regex::new(
        r"(?i)\b(technical|practical|economic|ethical|social|political|environmental|historical|legal|scientific|cultural|user)\s+(?:perspective|viewpoint|lens|view)\b"
    ).unwrap();

    static ref SCENARIOS: Regex = Regex::new(
        r"(?i)\b(best[- ]case|worst[- ]case|most[- ]likely|base[- ]case)\b"
    ).unwrap();

    static ref CONFIDENCE_LABELS: Regex = Regex::new(r"\b(HIGH|MEDIUM|LOW)\b").unwrap();

    static ref HEDGES: Regex = Regex::new(
        r"(?i)\b(maybe|perhaps|possibly|might|i think|not sure|it depends)\b"
    ).unwrap();
}

/// Pairwise lexical agreement between responses.
///
/// Symmetric with a unit diagonal; `scores[i][j]` compares `models[i]` and
/// `models[j]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgreementMatrix {
    pub models: Vec<String>,
    pub scores: Vec<Vec<f64>>,
}

impl AgreementMatrix {
    pub fn from_responses(responses: &[&StageResponse]) -> Self {
        let sets: Vec<BTreeSet<String>> = responses.iter().map(|r| content_words(&r.text)).collect();
        let n = sets.len();
        let mut scores = vec![vec![1.0; n]; n];
        for i in 0..n {
            for j in (i + 1)..n {
                let s = jaccard(&sets[i], &sets[j]);
                scores[i][j] = s;
                scores[j][i] = s;
            }
        }

        Self {
            models: responses.iter().map(|r| r.model.clone()).collect(),
            scores,
        }
    }

    /// Mean off-diagonal agreement; `None` with fewer than two models.
    pub fn consensus(&self) -> Option<f64> {
        let n = self.models.len();
        if n < 2 {
            return None;
        }
        let mut total = 0.0;
        for i in 0..n {
            for j in (i + 1)..n {
                total += self.scores[i][j];
            }
        }
        Some(total / (n * (n - 1) / 2) as f64)
    }

    /// Mean agreement of one model with every other model.
    pub fn mean_agreement(&self, index: usize) -> Option<f64> {
        let n = self.models.len();
        if n < 2 || index >= n {
            return None;
        }
        let sum: f64 = (0..n).filter(|j| *j != index).map(|j| self.scores[index][j]).sum();
        Some(sum / (n - 1) as f64)
    }

    /// The model that agrees least with the rest.
    pub fn outlier(&self) -> Option<(&str, f64)> {
        (0..self.models.len())
            .filter_map(|i| self.mean_agreement(i).map(|s| (i, s)))
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(i, s)| (self.models[i].as_str(), s))
    }
}

/// Output of [`PatternStrategy::combine`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombinedResult {
    pub stage: Stage,
    pub pattern: PatternStrategy,

    /// Successful responses, labelled by model
    pub text: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agreement: Option<AgreementMatrix>,

    /// Mean pairwise agreement in [0, 1]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consensus: Option<f64>,

    /// Pattern observations passed on to the next stage
    #[serde(default)]
    pub notes: Vec<String>,

    /// The stage output needs no further synthesis
    #[serde(default)]
    pub ready_for_final: bool,
}

pub(super) fn combine(
    pattern: PatternStrategy,
    stage: Stage,
    responses: &[StageResponse],
) -> CombinedResult {
    let succeeded: Vec<&StageResponse> = responses.iter().filter(|r| r.succeeded).collect();

    let text = succeeded
        .iter()
        .map(|r| format!("### {}\n{}", r.model, r.text.trim()))
        .collect::<Vec<_>>()
        .join("\n\n");

    let mut result = CombinedResult {
        stage,
        pattern,
        text,
        agreement: None,
        consensus: None,
        notes: Vec::new(),
        ready_for_final: false,
    };

    match pattern {
        PatternStrategy::Gut => {}
        PatternStrategy::Confidence => combine_confidence(&succeeded, &mut result),
        PatternStrategy::Critique => combine_critique(stage, &succeeded, &mut result),
        PatternStrategy::FactCheck => combine_fact_check(stage, &succeeded, &mut result),
        PatternStrategy::Perspective => {
            let found = distinct_matches(&PERSPECTIVES, &succeeded);
            if !found.is_empty() {
                result.notes.push(format!("perspectives: {}", found.join(", ")));
            }
        }
        PatternStrategy::Scenario => {
            let found = distinct_matches(&SCENARIOS, &succeeded);
            if !found.is_empty() {
                result.notes.push(format!("scenarios: {}", found.join(", ")));
            }
        }
    }

    result
}

fn combine_confidence(succeeded: &[&StageResponse], result: &mut CombinedResult) {
    let matrix = AgreementMatrix::from_responses(succeeded);
    result.consensus = matrix.consensus();
    if let Some((model, score)) = matrix.outlier() {
        if succeeded.len() > 2 {
            result
                .notes
                .push(format!("lowest agreement: {} ({:.2})", model, score));
        }
    }
    result.agreement = Some(matrix);
}

fn combine_critique(stage: Stage, succeeded: &[&StageResponse], result: &mut CombinedResult) {
    // Only peer-review output is expected to name strengths and weaknesses.
    if stage != Stage::Meta {
        return;
    }
    for r in succeeded {
        let strengths = STRENGTHS.is_match(&r.text);
        let weaknesses = WEAKNESSES.is_match(&r.text);
        match (strengths, weaknesses) {
            (true, true) => {}
            (false, true) => result.notes.push(format!("{} named no strengths", r.model)),
            (true, false) => result.notes.push(format!("{} named no weaknesses", r.model)),
            (false, false) => result
                .notes
                .push(format!("{} named neither strengths nor weaknesses", r.model)),
        }
    }
}

fn combine_fact_check(stage: Stage, succeeded: &[&StageResponse], result: &mut CombinedResult) {
    let mut verified = 0usize;
    let mut unverified = 0usize;
    let mut disputed = 0usize;
    for r in succeeded {
        for caps in CLAIM_MARKER.captures_iter(&r.text) {
            match &caps[1] {
                "VERIFIED" => verified += 1,
                "UNVERIFIED" => unverified += 1,
                _ => disputed += 1,
            }
        }
    }

    if verified + unverified + disputed > 0 {
        result.notes.push(format!(
            "claims: {} verified, {} unverified, {} disputed",
            verified, unverified, disputed
        ));
    }

    // A hyper synthesis that labels its claims and leaves none disputed is
    // already final.
    if stage == Stage::Hyper {
        result.ready_for_final = disputed == 0 && verified + unverified > 0;
    }
}

/// How well `text` follows the pattern's instructions, in [0, 1].
pub(super) fn marker_coverage(pattern: PatternStrategy, text: &str) -> f64 {
    fn distinct(re: &Regex, text: &str) -> usize {
        re.captures_iter(text)
            .map(|caps| caps[1].to_lowercase().replace('-', " "))
            .collect::<BTreeSet<_>>()
            .len()
    }

    let coverage = match pattern {
        PatternStrategy::Gut => 1.0 - (HEDGES.find_iter(text).count() as f64 / 5.0).min(1.0),
        PatternStrategy::Confidence => distinct(&CONFIDENCE_LABELS, text) as f64 / 3.0,
        PatternStrategy::Critique => {
            let found = [STRENGTHS.is_match(text), WEAKNESSES.is_match(text)];
            found.iter().filter(|f| **f).count() as f64 / 2.0
        }
        PatternStrategy::FactCheck => (CLAIM_MARKER.find_iter(text).count() as f64 / 3.0).min(1.0),
        PatternStrategy::Perspective => (distinct(&PERSPECTIVES, text) as f64 / 3.0).min(1.0),
        PatternStrategy::Scenario => (distinct(&SCENARIOS, text) as f64 / 3.0).min(1.0),
    };
    coverage.clamp(0.0, 1.0)
}

fn distinct_matches(pattern: &Regex, succeeded: &[&StageResponse]) -> Vec<String> {
    let found: BTreeSet<String> = succeeded
        .iter()
        .flat_map(|r| pattern.captures_iter(&r.text))
        .map(|caps| caps[1].to_lowercase().replace('-', " "))
        .collect();
    found.into_iter().collect()
}
