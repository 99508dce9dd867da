//! Synthesizer selection policy.
//!
//! Stage 3 and Stage 4 each need one model to write the combined answer.
//! Selection walks an ordered priority list, first match wins:
//!
//! 1. An explicit lead model goes first when it is among the candidates
//! 2. Each list entry names a model, a provider, or `*` for any model
//! 3. Several models matching one entry are ordered by synthesis priority,
//!    then latest quality score, then name
//!
//! Candidates no entry matches are never chosen. An empty result is an error,
//! never a silent default.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

use crate::types::ModelDescriptor;
use crate::CoreError;

/// Matches every model.
pub const WILDCARD: &str = "*";

/// Ordered synthesizer preferences.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SynthesizerPolicy {
    priority: Vec<String>,
}

impl Default for SynthesizerPolicy {
    fn default() -> Self {
        Self {
            priority: vec![WILDCARD.to_string()],
        }
    }
}

impl SynthesizerPolicy {
    pub fn new<I, S>(priority: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            priority: priority.into_iter().map(Into::into).collect(),
        }
    }

    pub fn priority(&self) -> &[String] {
        &self.priority
    }

    /// Candidates in selection order, excluding the ones no entry matches.
    pub fn rank(
        &self,
        candidates: &[ModelDescriptor],
        scores: &HashMap<String, f64>,
    ) -> Vec<ModelDescriptor> {
        let mut ranked: Vec<ModelDescriptor> = Vec::new();

        for entry in &self.priority {
            let mut matched: Vec<&ModelDescriptor> = candidates
                .iter()
                .filter(|m| entry_matches(entry, m))
                .filter(|m| !ranked.iter().any(|r| r.name == m.name))
                .collect();

            matched.sort_by(|a, b| {
                let score_a = scores.get(&a.name).copied().unwrap_or(0.0);
                let score_b = scores.get(&b.name).copied().unwrap_or(0.0);
                b.synthesis_priority
                    .cmp(&a.synthesis_priority)
                    .then_with(|| score_b.total_cmp(&score_a))
                    .then_with(|| a.name.cmp(&b.name))
            });

            ranked.extend(matched.into_iter().cloned());
        }

        ranked
    }

    /// Candidates in the order they should be tried.
    ///
    /// Fails with [`CoreError::NoSynthesizerAvailable`] when nothing is
    /// eligible.
    pub fn select(
        &self,
        candidates: &[ModelDescriptor],
        scores: &HashMap<String, f64>,
        lead: Option<&str>,
    ) -> Result<Vec<ModelDescriptor>, CoreError> {
        let mut order = self.rank(candidates, scores);

        if let Some(lead) = lead {
            match candidates.iter().find(|m| m.name == lead) {
                Some(model) => {
                    order.retain(|m| m.name != lead);
                    order.insert(0, model.clone());
                }
                None => {
                    warn!(
                        lead_model = %lead,
                        "Lead model is not an eligible synthesizer; falling back to priority list"
                    );
                }
            }
        }

        if order.is_empty() {
            return Err(CoreError::NoSynthesizerAvailable {
                candidates: candidates.iter().map(|m| m.name.clone()).collect(),
            });
        }
        Ok(order)
    }

    /// The single best synthesizer among `available`.
    pub fn select_first(
        &self,
        available: &[ModelDescriptor],
        scores: &HashMap<String, f64>,
    ) -> Result<ModelDescriptor, CoreError> {
        self.select(available, scores, None)
            .map(|order| order.into_iter().next())?
            .ok_or_else(|| CoreError::NoSynthesizerAvailable {
                candidates: available.iter().map(|m| m.name.clone()).collect(),
            })
    }
}

fn entry_matches(entry: &str, model: &ModelDescriptor) -> bool {
    entry == WILDCARD || entry == model.name || entry == model.provider
}
