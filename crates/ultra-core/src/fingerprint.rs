//! Deterministic request fingerprints.
//!
//! A fingerprint hashes `(normalized prompt, sorted model names, pattern name,
//! relevant options)` with SHA-256. It also carries a readable label of the
//! form `<pattern>:<scope>:<models>` that cache clears match against.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::patterns::PatternStrategy;
use crate::similarity::collapse_whitespace;
use crate::types::{AnalysisRequest, Stage};

/// Separator between hashed fields; cannot occur in normalized text.
const FIELD_SEPARATOR: u8 = 0x1f;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint {
    digest: String,
    label: String,
}

impl Fingerprint {
    /// Fingerprint of a whole pipeline request.
    ///
    /// Model order and prompt whitespace/case do not matter; the lead model
    /// does, since it changes which model writes the final answer.
    pub fn for_request(request: &AnalysisRequest) -> Self {
        let mut names: Vec<&str> = request.model_names();
        names.sort_unstable();
        names.dedup();
        let models = names.join(",");
        let lead = request
            .lead_model
            .as_ref()
            .map(|m| m.name.as_str())
            .unwrap_or("");

        let digest = hash_fields(&[
            "request",
            &normalize_prompt(&request.prompt),
            &models,
            request.pattern.name(),
            lead,
        ]);

        Self {
            digest,
            label: format!("{}:request:{}", request.pattern.name(), models),
        }
    }

    /// Fingerprint of a single model call at one stage.
    pub fn for_call(model: &str, stage: Stage, pattern: PatternStrategy, prompt: &str) -> Self {
        let digest = hash_fields(&[
            "call",
            &normalize_prompt(prompt),
            model,
            pattern.name(),
            stage.as_str(),
        ]);

        Self {
            digest,
            label: format!("{}:{}:{}", pattern.name(), stage, model),
        }
    }

    /// Hex SHA-256 digest.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Readable label used for pattern-based clears.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// First 12 hex characters, for logs.
    pub fn short(&self) -> &str {
        &self.digest[..12.min(self.digest.len())]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.label, self.short())
    }
}

/// Normalize a prompt for hashing: trim, collapse whitespace, lowercase.
pub fn normalize_prompt(prompt: &str) -> String {
    collapse_whitespace(prompt).to_lowercase()
}

fn hash_fields(fields: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for field in fields {
        hasher.update(field.as_bytes());
        hasher.update([FIELD_SEPARATOR]);
    }
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ModelDescriptor;
    use proptest::prelude::*;

    fn request(prompt: &str, models: &[&str], pattern: PatternStrategy) -> AnalysisRequest {
        AnalysisRequest::new(
            prompt,
            models.iter().map(|m| ModelDescriptor::new(*m, "p")),
            pattern,
        )
    }

    #[test]
    fn test_normalization_ignores_case_and_spacing() {
        let a = request("Explain  photosynthesis\n", &["a", "b"], PatternStrategy::Gut);
        let b = request("explain photosynthesis", &["a", "b"], PatternStrategy::Gut);
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_pattern_changes_fingerprint() {
        let a = request("x", &["a"], PatternStrategy::Gut);
        let b = request("x", &["a"], PatternStrategy::Critique);
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_lead_model_changes_fingerprint() {
        let a = request("x", &["a", "b"], PatternStrategy::Gut);
        let b = a.clone().with_lead_model(ModelDescriptor::new("b", "p"));
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_labels() {
        let r = request("x", &["b", "a"], PatternStrategy::FactCheck);
        assert_eq!(r.fingerprint().label(), "fact_check:request:a,b");

        let call = Fingerprint::for_call("a", Stage::Meta, PatternStrategy::Gut, "x");
        assert_eq!(call.label(), "gut:meta:a");
        assert_eq!(call.digest().len(), 64);
        assert_eq!(call.short().len(), 12);
    }

    #[test]
    fn test_call_stage_is_part_of_key() {
        let a = Fingerprint::for_call("a", Stage::Hyper, PatternStrategy::Gut, "x");
        let b = Fingerprint::for_call("a", Stage::Ultra, PatternStrategy::Gut, "x");
        assert_ne!(a, b);
    }

    proptest! {
        #[test]
        fn prop_model_order_does_not_matter(
            names in proptest::collection::btree_set("[a-z]{1,6}", 1..6),
            prompt in "[a-zA-Z ]{1,40}",
        ) {
            let forward: Vec<&str> = names.iter().map(String::as_str).collect();
            let mut backward = forward.clone();
            backward.reverse();

            let a = request(&prompt, &forward, PatternStrategy::Confidence);
            let b = request(&prompt, &backward, PatternStrategy::Confidence);
            prop_assert_eq!(a.fingerprint(), b.fingerprint());
        }
    }
}
