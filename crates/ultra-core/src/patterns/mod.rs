//! Analysis patterns.
//!
//! A pattern decides two things only: the prompt each model receives at each
//! stage, and how a set of stage responses is combined. The orchestrator
//! never branches on the pattern itself.

mod combine;
mod templates;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::types::{AnalysisRequest, Stage, StageResponse};
use crate::CoreError;

pub use combine::{AgreementMatrix, CombinedResult};

/// A named strategy controlling stage prompts and combination rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternStrategy {
    /// Refine on instinct, adopting only clear improvements from peers
    Gut,
    /// Label claims by how many models support them
    Confidence,
    /// Name strengths and weaknesses of every peer answer
    Critique,
    /// Mark factual claims verified, unverified or disputed
    FactCheck,
    /// Surface distinct viewpoints
    Perspective,
    /// Explore best, worst and most likely outcomes
    Scenario,
}

impl PatternStrategy {
    pub const ALL: [PatternStrategy; 6] = [
        PatternStrategy::Gut,
        PatternStrategy::Confidence,
        PatternStrategy::Critique,
        PatternStrategy::FactCheck,
        PatternStrategy::Perspective,
        PatternStrategy::Scenario,
    ];

    /// Canonical name (the `analysis_type` value).
    pub fn name(&self) -> &'static str {
        match self {
            PatternStrategy::Gut => "gut",
            PatternStrategy::Confidence => "confidence",
            PatternStrategy::Critique => "critique",
            PatternStrategy::FactCheck => "fact_check",
            PatternStrategy::Perspective => "perspective",
            PatternStrategy::Scenario => "scenario",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            PatternStrategy::Gut => "Models refine their own answer on instinct after seeing peers",
            PatternStrategy::Confidence => {
                "Claims are labelled by cross-model agreement and scored with an agreement matrix"
            }
            PatternStrategy::Critique => {
                "Each model names strengths and weaknesses of its peers before revising"
            }
            PatternStrategy::FactCheck => {
                "Factual claims are marked verified, unverified or disputed"
            }
            PatternStrategy::Perspective => "Distinct viewpoints are surfaced and reconciled",
            PatternStrategy::Scenario => "Best, worst and most likely scenarios are explored",
        }
    }

    /// Resolve a pattern by name. Case, `-` and `_` are interchangeable.
    pub fn from_name(name: &str) -> Result<Self, CoreError> {
        let key: String = name
            .trim()
            .to_ascii_lowercase()
            .chars()
            .filter(|c| *c != '-' && *c != '_' && !c.is_whitespace())
            .collect();

        match key.as_str() {
            "gut" => Ok(PatternStrategy::Gut),
            "confidence" => Ok(PatternStrategy::Confidence),
            "critique" => Ok(PatternStrategy::Critique),
            "factcheck" => Ok(PatternStrategy::FactCheck),
            "perspective" => Ok(PatternStrategy::Perspective),
            "scenario" => Ok(PatternStrategy::Scenario),
            _ => Err(CoreError::UnknownPattern(name.to_string())),
        }
    }

    /// Build the prompt sent to one model at `stage`.
    ///
    /// Stage 1 always receives the raw user prompt.
    pub fn stage_prompt(
        &self,
        stage: Stage,
        request: &AnalysisRequest,
        context: &StageContext<'_>,
    ) -> String {
        match stage {
            Stage::Initial => request.prompt.clone(),
            Stage::Meta => templates::meta_prompt(*self, &request.prompt, context),
            Stage::Hyper => templates::hyper_prompt(*self, &request.prompt, context),
            Stage::Ultra => templates::ultra_prompt(*self, &request.prompt, context),
        }
    }

    /// Aggregate the responses of one stage.
    pub fn combine(&self, stage: Stage, responses: &[StageResponse]) -> CombinedResult {
        combine::combine(*self, stage, responses)
    }

    /// How closely `text` follows this pattern's instructions, in [0, 1].
    pub fn marker_coverage(&self, text: &str) -> f64 {
        combine::marker_coverage(*self, text)
    }
}

impl fmt::Display for PatternStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PatternStrategy {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s)
    }
}

/// Another model's text, labelled by model name.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeerText<'a> {
    pub model: &'a str,
    pub text: &'a str,
}

/// What a model gets to see when its stage prompt is built.
#[derive(Debug, Clone, Default)]
pub struct StageContext<'a> {
    /// The model's own previous output (Stage 2) or the text to finalize (Stage 4)
    pub own: Option<&'a str>,

    /// Peer outputs (Stage 2) or every refined analysis (Stage 3)
    pub peers: Vec<PeerText<'a>>,

    /// Combination of the previous stage, when the pattern produced one
    pub summary: Option<&'a CombinedResult>,
}

impl<'a> StageContext<'a> {
    /// Stage 1 context: nothing but the prompt.
    pub fn initial() -> Self {
        Self::default()
    }

    /// Stage 2 context: own answer plus every peer answer.
    pub fn meta(own: &'a str, peers: Vec<PeerText<'a>>) -> Self {
        Self {
            own: Some(own),
            peers,
            summary: None,
        }
    }

    /// Stage 3 context: every refined analysis plus the Stage 2 combination.
    pub fn hyper(analyses: Vec<PeerText<'a>>, summary: Option<&'a CombinedResult>) -> Self {
        Self {
            own: None,
            peers: analyses,
            summary,
        }
    }

    /// Stage 4 context: the Stage 3 synthesis.
    pub fn ultra(synthesis: &'a str, summary: Option<&'a CombinedResult>) -> Self {
        Self {
            own: Some(synthesis),
            peers: Vec::new(),
            summary,
        }
    }

    /// Peer context from successful responses, excluding `exclude_model`.
    pub fn peers_from(responses: &'a [StageResponse], exclude_model: Option<&str>) -> Vec<PeerText<'a>> {
        responses
            .iter()
            .filter(|r| r.succeeded)
            .filter(|r| Some(r.model.as_str()) != exclude_model)
            .map(|r| PeerText {
                model: &r.model,
                text: &r.text,
            })
            .collect()
    }
}
