//! Response quality evaluation.
//!
//! The default [`HeuristicEvaluator`] is purely local. [`ModelJudgeEvaluator`]
//! asks a configured model for a grade through the same [`ResilientCaller`]
//! every pipeline call uses, falling back to the heuristic when the judge
//! fails or answers with something unparsable.

use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, warn};
use ultra_core::{
    quality, ModelDescriptor, PatternStrategy, QualityBreakdown, QualityWeights, StageResponse,
};

use crate::chain::ResilientCaller;
use crate::config::JudgeAccounting;
use crate::prompts;

lazy_static! {
    static ref SCORE_LINE: Regex =
        Regex::new(r"(?i)\bscore\s*[:=]?\s*(\d+(?:\.\d+)?)").unwrap();

    static ref OUT_OF_TEN: Regex =
        Regex::new(r"(\d+(?:\.\d+)?)\s*(?:/|out of)\s*10\b").unwrap();

    static ref BARE_NUMBER: Regex = Regex::new(r"\d+(?:\.\d+)?").unwrap();
}

/// What an evaluator knows about the run it is scoring for.
#[derive(Debug, Clone, Copy)]
pub struct ScoringContext<'a> {
    /// The user's original prompt
    pub prompt: &'a str,
    pub pattern: PatternStrategy,
    /// Request deadline; model-backed evaluators must not outlive it
    pub deadline: Instant,
}

/// Scores a single response against its peers.
#[async_trait]
pub trait QualityEvaluator: Send + Sync {
    /// Quality in [0, 1]. Failed responses score 0.
    async fn score(
        &self,
        response: &StageResponse,
        peers: &[&StageResponse],
        context: &ScoringContext<'_>,
    ) -> f64;

    fn name(&self) -> &'static str;
}

/// Local scoring from coherence, depth, uniqueness and pattern fit.
#[derive(Debug, Clone, Default)]
pub struct HeuristicEvaluator {
    weights: QualityWeights,
}

impl HeuristicEvaluator {
    pub fn new(weights: QualityWeights) -> Self {
        Self { weights }
    }

    pub fn breakdown(
        &self,
        response: &StageResponse,
        peers: &[&StageResponse],
        pattern: PatternStrategy,
    ) -> QualityBreakdown {
        let peer_texts = peer_texts(response, peers);
        quality::score(&response.text, &peer_texts, pattern, &self.weights)
    }

    /// Blend an external 0-1 grade with uniqueness against peers, giving
    /// uniqueness its configured share of the weight.
    pub fn blend_with_uniqueness(
        &self,
        grade: f64,
        response: &StageResponse,
        peers: &[&StageResponse],
    ) -> f64 {
        let share = self.weights.normalized().uniqueness;
        let uniqueness = quality::uniqueness(&response.text, &peer_texts(response, peers));
        ((1.0 - share) * grade + share * uniqueness).clamp(0.0, 1.0)
    }

    fn score_now(
        &self,
        response: &StageResponse,
        peers: &[&StageResponse],
        pattern: PatternStrategy,
    ) -> f64 {
        if !response.succeeded {
            return 0.0;
        }
        self.breakdown(response, peers, pattern).overall
    }
}

#[async_trait]
impl QualityEvaluator for HeuristicEvaluator {
    async fn score(
        &self,
        response: &StageResponse,
        peers: &[&StageResponse],
        context: &ScoringContext<'_>,
    ) -> f64 {
        self.score_now(response, peers, context.pattern)
    }

    fn name(&self) -> &'static str {
        "heuristic"
    }
}

/// Successful peers other than `response` itself.
fn peer_texts<'a>(response: &StageResponse, peers: &[&'a StageResponse]) -> Vec<&'a str> {
    peers
        .iter()
        .filter(|p| p.succeeded && p.model != response.model)
        .map(|p| p.text.as_str())
        .collect()
}

/// Grades responses with a judge model. The grade covers coherence and depth;
/// overlap with peers is blended in locally.
pub struct ModelJudgeEvaluator {
    caller: Arc<ResilientCaller>,
    judge: ModelDescriptor,
    accounting: JudgeAccounting,
    fallback: HeuristicEvaluator,
}

impl ModelJudgeEvaluator {
    pub fn new(
        caller: Arc<ResilientCaller>,
        judge: ModelDescriptor,
        accounting: JudgeAccounting,
        fallback: HeuristicEvaluator,
    ) -> Self {
        Self {
            caller,
            judge,
            accounting,
            fallback,
        }
    }

    pub fn judge(&self) -> &ModelDescriptor {
        &self.judge
    }
}

#[async_trait]
impl QualityEvaluator for ModelJudgeEvaluator {
    async fn score(
        &self,
        response: &StageResponse,
        peers: &[&StageResponse],
        context: &ScoringContext<'_>,
    ) -> f64 {
        if !response.succeeded {
            return 0.0;
        }

        let prompt = format!(
            "{}\n{}",
            prompts::JUDGE_SYSTEM_PROMPT.trim(),
            prompts::judge_prompt(context.prompt, context.pattern, &response.text)
        );
        let key = self.accounting.budget_key(&self.judge.provider);

        match self
            .caller
            .invoke(&self.judge, &prompt, &key, context.deadline)
            .await
        {
            Ok(graded) => match parse_grade(&graded.text) {
                Some(grade) => {
                    debug!(
                        model = %response.model,
                        judge = %self.judge.name,
                        grade,
                        "Judged response"
                    );
                    self.fallback
                        .blend_with_uniqueness(grade / 10.0, response, peers)
                }
                None => {
                    warn!(
                        judge = %self.judge.name,
                        "Unparsable judge grade, using heuristic score"
                    );
                    self.fallback.score_now(response, peers, context.pattern)
                }
            },
            Err(e) => {
                warn!(
                    judge = %self.judge.name,
                    error = %e,
                    "Judge call failed, using heuristic score"
                );
                self.fallback.score_now(response, peers, context.pattern)
            }
        }
    }

    fn name(&self) -> &'static str {
        "model_judge"
    }
}

/// Extract a 0-10 grade. Prefers an explicit `SCORE:` line, then an `N/10`
/// form. A lone bare number is accepted; several are ambiguous.
fn parse_grade(text: &str) -> Option<f64> {
    let raw = match SCORE_LINE
        .captures(text)
        .or_else(|| OUT_OF_TEN.captures(text))
    {
        Some(captured) => captured.get(1)?.as_str(),
        None => {
            let mut numbers = BARE_NUMBER.find_iter(text);
            let only = numbers.next()?;
            if numbers.next().is_some() {
                return None;
            }
            only.as_str()
        }
    };
    let grade: f64 = raw.parse().ok()?;
    (0.0..=10.0).contains(&grade).then_some(grade)
}
