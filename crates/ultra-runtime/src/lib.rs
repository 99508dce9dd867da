//! # ultra-runtime
//!
//! Resilient multi-model orchestration for Ultra.
//!
//! This crate runs the four-stage pipeline defined in `ultra-core` against
//! real model adapters. Every model call goes through the same chain:
//!
//! ```text
//! ResponseCache -> Retry -> RateLimiter -> CircuitBreaker -> ModelAdapter
//! ```
//!
//! Per-call failures are absorbed into failed stage responses. Only the
//! errors in [`PipelineError`] end a run.
//!
//! ## Example
//!
//! ```rust,ignore
//! use ultra_runtime::{AdapterFactoryRegistry, Orchestrator, RuntimeConfig};
//! use ultra_core::RequestPayload;
//!
//! let config = RuntimeConfig::from_file("ultra.yaml")?;
//! let orchestrator = Orchestrator::from_config(config, &AdapterFactoryRegistry::with_defaults())?;
//!
//! let payload = RequestPayload::new("Explain photosynthesis", ["claude", "gpt"], "gut");
//! let response = orchestrator.analyze_payload(&payload).await?;
//! println!("{}", response.ultra_response);
//! ```

pub mod cache;
pub mod chain;
pub mod config;
pub mod evaluator;
pub mod orchestrator;
pub mod progress;
pub mod prompts;
pub mod providers;
pub mod registry;
pub mod resilience;
pub mod usage;

pub use cache::{CacheConfig, CacheStats, CachedValue, ResponseCache};
pub use chain::ResilientCaller;
pub use config::{
    ConfigError, JudgeAccounting, JudgeConfig, ModelConfig, QualityConfig, RuntimeConfig,
};
pub use evaluator::{HeuristicEvaluator, ModelJudgeEvaluator, QualityEvaluator, ScoringContext};
pub use orchestrator::{Orchestrator, OrchestratorBuilder};
pub use progress::{NoProgress, ProgressNotifier, TracingProgress};
pub use providers::{
    AdapterFactory, AdapterFactoryRegistry, AdapterResponse, CallOptions, ModelAdapter,
    ProviderError, TokenUsage,
};
pub use registry::ModelRegistry;
pub use resilience::{
    CircuitBreaker, CircuitBreakerConfig, CircuitState, RateLimit, RateLimitConfig, RateLimiter,
    RetryConfig,
};
pub use usage::{UsageSnapshot, UsageTracker};

use std::time::Duration;
use thiserror::Error;
use ultra_core::{CoreError, DroppedModel, ErrorKind, Stage};

/// Failure of a single model call through the resilient chain.
///
/// These never end a pipeline run; the orchestrator turns them into failed
/// stage responses.
#[derive(Error, Debug)]
pub enum CallError {
    #[error("Circuit open for {provider}")]
    CircuitOpen { provider: String },

    #[error("Rate limit reached for {provider}, window resets in {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Duration,
    },

    #[error("{model} timed out after {after:?}")]
    Timeout { model: String, after: Duration },

    #[error("{model} failed: {source}")]
    Provider {
        model: String,
        #[source]
        source: ProviderError,
    },

    #[error("Model not registered: {0}")]
    UnknownModel(String),
}

impl CallError {
    /// Map an adapter error, folding provider-reported timeouts into `Timeout`.
    pub fn from_provider(model: &str, source: ProviderError) -> Self {
        match source {
            ProviderError::Timeout(after) => CallError::Timeout {
                model: model.to_string(),
                after,
            },
            source => CallError::Provider {
                model: model.to_string(),
                source,
            },
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            CallError::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            CallError::RateLimited { .. } => ErrorKind::RateLimited,
            CallError::Timeout { .. } => ErrorKind::ProviderTimeout,
            CallError::Provider { source, .. } => source.kind(),
            CallError::UnknownModel(_) => ErrorKind::ProviderUnavailable,
        }
    }

    /// Whether the retry policy may try again.
    ///
    /// Circuit and rate-limit rejections are never retried in place.
    pub fn is_retryable(&self) -> bool {
        match self {
            CallError::Timeout { .. } => true,
            CallError::Provider { source, .. } => source.is_transient(),
            _ => false,
        }
    }
}

/// Fatal pipeline errors. A run that returns one of these has no synthesis.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("All models failed in the initial stage")]
    AllModelsFailed { dropped: Vec<DroppedModel> },

    #[error("No synthesizer available at {stage} stage among [{}]", .candidates.join(", "))]
    NoSynthesizerAvailable {
        stage: Stage,
        candidates: Vec<String>,
    },

    #[error("Request deadline of {timeout:?} exceeded during {stage} stage")]
    DeadlineExceeded { stage: Stage, timeout: Duration },

    #[error("Invalid model selection: {0}")]
    InvalidModelSelection(String),

    #[error("Unknown analysis pattern: {0}")]
    UnknownPattern(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl PipelineError {
    /// Caller-visible error kind. Request validation errors have none.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            PipelineError::AllModelsFailed { .. } => Some(ErrorKind::AllModelsFailed),
            PipelineError::NoSynthesizerAvailable { .. } => {
                Some(ErrorKind::NoSynthesizerAvailable)
            }
            PipelineError::DeadlineExceeded { .. } => Some(ErrorKind::DeadlineExceeded),
            PipelineError::InvalidModelSelection(_) => Some(ErrorKind::InvalidModelSelection),
            PipelineError::UnknownPattern(_) | PipelineError::InvalidRequest(_) => None,
        }
    }
}

impl From<CoreError> for PipelineError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::UnknownPattern(name) => PipelineError::UnknownPattern(name),
            CoreError::NoSynthesizerAvailable { candidates } => {
                PipelineError::NoSynthesizerAvailable {
                    stage: Stage::Hyper,
                    candidates,
                }
            }
            CoreError::Schema(errors) => PipelineError::InvalidRequest(errors.join("; ")),
            CoreError::InvalidRequest(msg) => PipelineError::InvalidRequest(msg),
            CoreError::Json(e) => PipelineError::InvalidRequest(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_error_classification() {
        let timeout = CallError::from_provider("a", ProviderError::Timeout(Duration::from_secs(1)));
        assert!(matches!(timeout, CallError::Timeout { .. }));
        assert!(timeout.is_retryable());
        assert_eq!(timeout.kind(), ErrorKind::ProviderTimeout);

        let open = CallError::CircuitOpen {
            provider: "p".into(),
        };
        assert!(!open.is_retryable());
        assert_eq!(open.kind(), ErrorKind::CircuitOpen);

        let limited = CallError::RateLimited {
            provider: "p".into(),
            retry_after: Duration::from_secs(3),
        };
        assert!(!limited.is_retryable());

        let auth = CallError::from_provider("a", ProviderError::AuthError);
        assert!(!auth.is_retryable());
        assert_eq!(auth.kind(), ErrorKind::ProviderUnavailable);
    }

    #[test]
    fn test_pipeline_error_kinds() {
        let err = PipelineError::from(CoreError::UnknownPattern("vibes".into()));
        assert!(matches!(err, PipelineError::UnknownPattern(_)));
        assert_eq!(err.kind(), None);

        let err = PipelineError::from(CoreError::NoSynthesizerAvailable {
            candidates: vec!["a".into()],
        });
        assert_eq!(err.kind(), Some(ErrorKind::NoSynthesizerAvailable));
        assert!(err.to_string().contains("hyper"));

        let err = PipelineError::DeadlineExceeded {
            stage: Stage::Meta,
            timeout: Duration::from_secs(5),
        };
        assert_eq!(err.kind(), Some(ErrorKind::DeadlineExceeded));
    }
}
