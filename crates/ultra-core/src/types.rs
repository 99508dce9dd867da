//! Core data model shared by every pipeline component.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use crate::fingerprint::Fingerprint;
use crate::patterns::PatternStrategy;

/// Default overall deadline for a request that does not set one.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Longest overall deadline a request may ask for. Larger values are capped.
pub const MAX_REQUEST_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// One of the four sequential pipeline phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Every model answers the raw prompt
    Initial,
    /// Every survivor refines its answer against its peers
    Meta,
    /// One synthesizer combines all refined answers
    Hyper,
    /// Final synthesis over the hyper output
    Ultra,
}

impl Stage {
    /// All stages in execution order.
    pub const ALL: [Stage; 4] = [Stage::Initial, Stage::Meta, Stage::Hyper, Stage::Ultra];

    /// Stable lowercase name, used in fingerprint labels and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Initial => "initial",
            Stage::Meta => "meta",
            Stage::Hyper => "hyper",
            Stage::Ultra => "ultra",
        }
    }

    /// 1-based position in the pipeline.
    pub fn number(&self) -> u8 {
        match self {
            Stage::Initial => 1,
            Stage::Meta => 2,
            Stage::Hyper => 3,
            Stage::Ultra => 4,
        }
    }

    /// The stage that follows this one, if any.
    pub fn next(&self) -> Option<Stage> {
        match self {
            Stage::Initial => Some(Stage::Meta),
            Stage::Meta => Some(Stage::Hyper),
            Stage::Hyper => Some(Stage::Ultra),
            Stage::Ultra => None,
        }
    }

    /// Whether the stage fans out to every surviving model.
    pub fn is_fan_out(&self) -> bool {
        matches!(self, Stage::Initial | Stage::Meta)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error taxonomy visible to callers.
///
/// Per-call kinds (`ProviderTimeout`, `ProviderUnavailable`, `CircuitOpen`,
/// `RateLimited`) are absorbed into failed stage responses. Fatal kinds end the
/// pipeline. `PartialFailure` is informational only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ProviderTimeout,
    ProviderUnavailable,
    CircuitOpen,
    RateLimited,
    InvalidModelSelection,
    NoSynthesizerAvailable,
    DeadlineExceeded,
    AllModelsFailed,
    PartialFailure,
}

impl ErrorKind {
    /// Whether this kind terminates the pipeline.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ErrorKind::InvalidModelSelection
                | ErrorKind::NoSynthesizerAvailable
                | ErrorKind::DeadlineExceeded
                | ErrorKind::AllModelsFailed
        )
    }

    /// Whether this kind describes a single failed model call.
    pub fn is_per_call(&self) -> bool {
        matches!(
            self,
            ErrorKind::ProviderTimeout
                | ErrorKind::ProviderUnavailable
                | ErrorKind::CircuitOpen
                | ErrorKind::RateLimited
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ProviderTimeout => "provider_timeout",
            ErrorKind::ProviderUnavailable => "provider_unavailable",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::InvalidModelSelection => "invalid_model_selection",
            ErrorKind::NoSynthesizerAvailable => "no_synthesizer_available",
            ErrorKind::DeadlineExceeded => "deadline_exceeded",
            ErrorKind::AllModelsFailed => "all_models_failed",
            ErrorKind::PartialFailure => "partial_failure",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata for one registered provider/model pair.
///
/// Ordering and equality follow the field order, so descriptors sort by name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ModelDescriptor {
    /// Unique model name (e.g., "claude-sonnet-4-5")
    pub name: String,

    /// Provider that hosts the model (e.g., "anthropic")
    pub provider: String,

    /// Free-form capability tags (e.g., "reasoning", "long-context")
    #[serde(default)]
    pub capabilities: BTreeSet<String>,

    /// Tie-breaker when several models match one synthesizer priority entry.
    /// Higher wins.
    #[serde(default)]
    pub synthesis_priority: i32,
}

impl ModelDescriptor {
    pub fn new(name: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            provider: provider.into(),
            capabilities: BTreeSet::new(),
            synthesis_priority: 0,
        }
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }

    pub fn with_synthesis_priority(mut self, priority: i32) -> Self {
        self.synthesis_priority = priority;
        self
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }
}

/// The result of one model call at one stage.
///
/// Built once by the orchestrator and only ever collected afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResponse {
    pub model: String,
    pub provider: String,
    pub stage: Stage,

    /// Model output; empty for failed calls
    pub text: String,

    /// Quality in [0, 1]; 0 for failed calls
    pub quality_score: f64,

    #[serde(with = "duration_millis")]
    pub latency: Duration,

    pub succeeded: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorKind>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    /// Served from the response cache without a provider call
    #[serde(default)]
    pub cached: bool,
}

impl StageResponse {
    /// A successful response, not yet scored.
    pub fn success(
        model: &ModelDescriptor,
        stage: Stage,
        text: impl Into<String>,
        latency: Duration,
    ) -> Self {
        Self {
            model: model.name.clone(),
            provider: model.provider.clone(),
            stage,
            text: text.into(),
            quality_score: 0.0,
            latency,
            succeeded: true,
            error: None,
            error_message: None,
            cached: false,
        }
    }

    /// A failed response carrying the error that dropped the model.
    pub fn failure(
        model: &ModelDescriptor,
        stage: Stage,
        kind: ErrorKind,
        message: impl Into<String>,
        latency: Duration,
    ) -> Self {
        Self {
            model: model.name.clone(),
            provider: model.provider.clone(),
            stage,
            text: String::new(),
            quality_score: 0.0,
            latency,
            succeeded: false,
            error: Some(kind),
            error_message: Some(message.into()),
            cached: false,
        }
    }

    /// Attach a quality score, clamped to [0, 1].
    pub fn with_quality(mut self, score: f64) -> Self {
        self.quality_score = if score.is_finite() {
            score.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self
    }

    /// Mark the response as served from cache.
    pub fn from_cache(mut self) -> Self {
        self.cached = true;
        self.latency = Duration::ZERO;
        self
    }

    /// Re-label a cached response for the stage it is being reused at.
    pub fn for_stage(mut self, stage: Stage) -> Self {
        self.stage = stage;
        self
    }
}

/// A fully resolved request, scoped to one pipeline run.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisRequest {
    pub prompt: String,

    /// Participating models, sorted by name without duplicates
    pub models: Vec<ModelDescriptor>,

    /// Overrides synthesizer selection when it is among the candidates
    pub lead_model: Option<ModelDescriptor>,

    pub pattern: PatternStrategy,

    /// Overall deadline for the run
    pub timeout: Duration,

    pub show_progress: bool,
}

impl AnalysisRequest {
    pub fn new(
        prompt: impl Into<String>,
        models: impl IntoIterator<Item = ModelDescriptor>,
        pattern: PatternStrategy,
    ) -> Self {
        let mut models: Vec<ModelDescriptor> = models.into_iter().collect();
        models.sort_by(|a, b| a.name.cmp(&b.name));
        models.dedup_by(|a, b| a.name == b.name);

        Self {
            prompt: prompt.into(),
            models,
            lead_model: None,
            pattern,
            timeout: DEFAULT_REQUEST_TIMEOUT,
            show_progress: false,
        }
    }

    pub fn with_lead_model(mut self, lead: ModelDescriptor) -> Self {
        self.lead_model = Some(lead);
        self
    }

    /// Set the overall deadline, capped at [`MAX_REQUEST_TIMEOUT`].
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout.min(MAX_REQUEST_TIMEOUT);
        self
    }

    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    /// Model names in sorted order.
    pub fn model_names(&self) -> Vec<&str> {
        self.models.iter().map(|m| m.name.as_str()).collect()
    }

    /// Fingerprint identifying this request for the response cache.
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::for_request(self)
    }
}

/// Serialize `Duration` as integer milliseconds.
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
