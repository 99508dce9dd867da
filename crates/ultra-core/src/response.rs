//! Response payload returned to the outer HTTP/CLI layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ErrorKind, Stage, StageResponse};

/// Stage 1 entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitialResponseView {
    pub model: String,
    pub provider: String,
    pub response: String,
    /// Seconds
    pub response_time: f64,
    pub quality_score: f64,
}

impl From<&StageResponse> for InitialResponseView {
    fn from(r: &StageResponse) -> Self {
        Self {
            model: r.model.clone(),
            provider: r.provider.clone(),
            response: r.text.clone(),
            response_time: r.latency.as_secs_f64(),
            quality_score: r.quality_score,
        }
    }
}

/// Stage 2 entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaAnalysisView {
    pub model: String,
    pub response: String,
    pub quality_score: f64,
}

impl From<&StageResponse> for MetaAnalysisView {
    fn from(r: &StageResponse) -> Self {
        Self {
            model: r.model.clone(),
            response: r.text.clone(),
            quality_score: r.quality_score,
        }
    }
}

/// Stage 3 output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HyperSynthesisView {
    pub model: String,
    pub response: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Success,
    PartialFailure,
}

/// A model removed from the pipeline, and where.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DroppedModel {
    pub model: String,
    pub stage: Stage,
    pub error: ErrorKind,
    pub message: String,
}

impl DroppedModel {
    /// Build from a failed stage response. Returns `None` for successes.
    pub fn from_response(r: &StageResponse) -> Option<Self> {
        if r.succeeded {
            return None;
        }
        Some(Self {
            model: r.model.clone(),
            stage: r.stage,
            error: r.error.unwrap_or(ErrorKind::ProviderUnavailable),
            message: r.error_message.clone().unwrap_or_default(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialFailureReport {
    pub dropped: Vec<DroppedModel>,
}

/// Per-stage counters, handed to observability collaborators as plain data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageMetrics {
    pub stage: Stage,
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cache_hits: usize,
    pub elapsed_ms: u64,
}

impl StageMetrics {
    pub fn from_responses(stage: Stage, responses: &[StageResponse], elapsed_ms: u64) -> Self {
        let succeeded = responses.iter().filter(|r| r.succeeded).count();
        Self {
            stage,
            attempted: responses.len(),
            succeeded,
            failed: responses.len() - succeeded,
            cache_hits: responses.iter().filter(|r| r.cached).count(),
            elapsed_ms,
        }
    }
}

/// Share of the final answer traceable to one Stage 2 contributor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribution {
    pub model: String,
    pub share: f64,
}

/// The complete pipeline result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResponse {
    pub initial_responses: Vec<InitialResponseView>,
    pub meta_analyses: Vec<MetaAnalysisView>,
    pub hyper_synthesis: HyperSynthesisView,
    pub ultra_response: String,
    /// Seconds
    pub processing_time: f64,
    /// Model that produced the final answer
    pub lead_model: String,

    pub status: ResponseStatus,
    pub partial_failure: Option<PartialFailureReport>,
    pub analysis_type: String,
    pub stage_metrics: Vec<StageMetrics>,
    pub attribution: Vec<Attribution>,
    pub completed_at: DateTime<Utc>,
}

impl AnalysisResponse {
    pub fn is_partial(&self) -> bool {
        self.status == ResponseStatus::PartialFailure
    }

    /// Names of every model dropped at any stage.
    pub fn dropped_models(&self) -> Vec<&str> {
        self.partial_failure
            .as_ref()
            .map(|p| p.dropped.iter().map(|d| d.model.as_str()).collect())
            .unwrap_or_default()
    }

    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}
