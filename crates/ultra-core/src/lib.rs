//! # ultra-core
//!
//! Deterministic domain model for the Ultra multi-model synthesis pipeline.
//!
//! This crate knows what a request, a stage response and a final analysis look
//! like, how each analysis pattern prompts models and combines their answers,
//! how answers are scored, and which model should synthesize. It never performs
//! I/O and never calls a model; `ultra-runtime` does that.
//!
//! ## Key Guarantees
//!
//! 1. **Deterministic**: Same inputs always produce the same prompts, scores and fingerprints
//! 2. **No model calls**: Quality scoring here is heuristic only
//! 3. **Pattern-agnostic pipeline**: Patterns differ only in `stage_prompt` and `combine`
//!
//! ## Example
//!
//! ```rust,ignore
//! use ultra_core::{AnalysisRequest, ModelDescriptor, PatternStrategy, Stage, StageContext};
//!
//! let request = AnalysisRequest::new(
//!     "Explain photosynthesis",
//!     vec![ModelDescriptor::new("claude", "anthropic")],
//!     PatternStrategy::from_name("gut")?,
//! );
//! let prompt = request.pattern.stage_prompt(Stage::Initial, &request, &StageContext::initial());
//! ```

pub mod fingerprint;
pub mod patterns;
pub mod quality;
pub mod request;
pub mod response;
pub mod schema;
pub mod similarity;
pub mod synthesizer;
pub mod types;

// Re-export main types at crate root
pub use fingerprint::Fingerprint;
pub use patterns::{AgreementMatrix, CombinedResult, PatternStrategy, PeerText, StageContext};
pub use quality::{QualityBreakdown, QualityWeights};
pub use request::{RequestOptions, RequestPayload};
pub use response::{
    AnalysisResponse, Attribution, DroppedModel, HyperSynthesisView, InitialResponseView,
    MetaAnalysisView, PartialFailureReport, ResponseStatus, StageMetrics,
};
pub use synthesizer::SynthesizerPolicy;
pub use types::{
    AnalysisRequest, ErrorKind, ModelDescriptor, Stage, StageResponse, DEFAULT_REQUEST_TIMEOUT,
    MAX_REQUEST_TIMEOUT,
};

use thiserror::Error;

/// Errors raised by the deterministic core.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Unknown analysis pattern: {0}")]
    UnknownPattern(String),

    #[error("Request failed schema validation: {}", .0.join("; "))]
    Schema(Vec<String>),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("No synthesizer available among [{}]", .candidates.join(", "))]
    NoSynthesizerAvailable { candidates: Vec<String> },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoreError {
    /// The caller-visible error kind, when one applies.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            CoreError::NoSynthesizerAvailable { .. } => Some(ErrorKind::NoSynthesizerAvailable),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_end_to_end_prompting_and_scoring() {
        let payload = RequestPayload::from_json(
            r#"{"prompt": "Explain photosynthesis", "models": ["a", "b"], "analysis_type": "critique"}"#,
        )
        .unwrap();
        let pattern = PatternStrategy::from_name(&payload.analysis_type).unwrap();
        let request = AnalysisRequest::new(
            payload.prompt.clone(),
            payload.models.iter().map(|m| ModelDescriptor::new(m.as_str(), "test")),
            pattern,
        );

        let a = ModelDescriptor::new("a", "test");
        let b = ModelDescriptor::new("b", "test");
        let initial = vec![
            StageResponse::success(&a, Stage::Initial, "Light becomes sugar.", Duration::ZERO),
            StageResponse::success(&b, Stage::Initial, "Chlorophyll absorbs light.", Duration::ZERO),
        ];

        let peers = StageContext::peers_from(&initial, Some("a"));
        let ctx = StageContext::meta(&initial[0].text, peers);
        let prompt = pattern.stage_prompt(Stage::Meta, &request, &ctx);
        assert!(prompt.contains("Strengths"));
        assert!(prompt.contains("Chlorophyll absorbs light."));

        let breakdown = quality::score(
            &initial[0].text,
            &[initial[1].text.as_str()],
            pattern,
            &QualityWeights::default(),
        );
        assert!((0.0..=1.0).contains(&breakdown.overall));
    }

    #[test]
    fn test_error_messages() {
        let err = CoreError::Schema(vec!["a".into(), "b".into()]);
        assert_eq!(err.to_string(), "Request failed schema validation: a; b");

        let err = CoreError::NoSynthesizerAvailable {
            candidates: vec!["x".into()],
        };
        assert_eq!(err.kind(), Some(ErrorKind::NoSynthesizerAvailable));
        assert!(err.to_string().contains("[x]"));
    }
}
