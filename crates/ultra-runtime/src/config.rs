//! Runtime configuration.
//!
//! Loaded from YAML or JSON, chosen by file extension. Every section has
//! defaults, so an empty file is a valid (if model-less) configuration.
//!
//! ```yaml
//! call_timeout: 30s
//! default_request_timeout: 2m
//! circuit_breaker:
//!   failure_threshold: 5
//!   reset_timeout: 60s
//! rate_limits:
//!   default: { limit: 60, period: 60s }
//!   providers:
//!     anthropic: { limit: 50, period: 60s }
//! synthesizer_priority: [claude-sonnet-4-5, anthropic, "*"]
//! models:
//!   - name: claude-sonnet-4-5
//!     provider: anthropic
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use ultra_core::{ModelDescriptor, QualityWeights, SynthesizerPolicy, DEFAULT_REQUEST_TIMEOUT};

use crate::cache::CacheConfig;
use crate::providers::{CallOptions, ProviderError};
use crate::resilience::{CircuitBreakerConfig, RateLimitConfig, RetryConfig};

/// Errors loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unsupported config format '{0}' (expected .yaml, .yml or .json)")]
    UnsupportedFormat(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Model '{model}' could not be configured: {source}")]
    Provider {
        model: String,
        #[source]
        source: ProviderError,
    },
}

/// Top-level runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub circuit_breaker: CircuitBreakerConfig,
    pub rate_limits: RateLimitConfig,
    pub cache: CacheConfig,
    pub retry: RetryConfig,

    /// Upper bound for one adapter attempt
    #[serde(with = "humantime_duration")]
    pub call_timeout: Duration,

    /// Deadline for requests that do not set one
    #[serde(with = "humantime_duration")]
    pub default_request_timeout: Duration,

    /// Generation settings passed to every adapter call
    pub generation: CallOptions,

    pub synthesizer_priority: SynthesizerPolicy,
    pub quality: QualityConfig,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub judge: Option<JudgeConfig>,

    pub models: Vec<ModelConfig>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            circuit_breaker: CircuitBreakerConfig::default(),
            rate_limits: RateLimitConfig::default(),
            cache: CacheConfig::default(),
            retry: RetryConfig::default(),
            call_timeout: Duration::from_secs(30),
            default_request_timeout: DEFAULT_REQUEST_TIMEOUT,
            generation: CallOptions::default(),
            synthesizer_priority: SynthesizerPolicy::default(),
            quality: QualityConfig::default(),
            judge: None,
            models: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    pub weights: QualityWeights,
}

/// Model-backed quality grading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeConfig {
    /// Registered model that grades responses
    pub model: String,

    #[serde(default)]
    pub accounting: JudgeAccounting,
}

/// Which resilience budget judge calls consume.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JudgeAccounting {
    /// Judge calls share the judge provider's rate limit and circuit
    #[default]
    Shared,
    /// Judge calls use a separate `judge:<provider>` key
    Dedicated,
}

impl JudgeAccounting {
    /// Resilience key for a judge call to `provider`.
    pub fn budget_key(&self, provider: &str) -> String {
        match self {
            JudgeAccounting::Shared => provider.to_string(),
            JudgeAccounting::Dedicated => format!("judge:{}", provider),
        }
    }
}

/// One model to register at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub name: String,
    pub provider: String,

    /// Adapter type; defaults to the provider name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adapter: Option<String>,

    #[serde(default)]
    pub capabilities: BTreeSet<String>,

    #[serde(default)]
    pub synthesis_priority: i32,

    /// Adapter-specific settings (api_key, base_url, provider-side model id)
    #[serde(default = "empty_object")]
    pub config: JsonValue,
}

fn empty_object() -> JsonValue {
    JsonValue::Object(Default::default())
}

impl ModelConfig {
    pub fn adapter_type(&self) -> &str {
        self.adapter.as_deref().unwrap_or(&self.provider)
    }

    pub fn descriptor(&self) -> ModelDescriptor {
        ModelDescriptor {
            name: self.name.clone(),
            provider: self.provider.clone(),
            capabilities: self.capabilities.clone(),
            synthesis_priority: self.synthesis_priority,
        }
    }
}

impl RuntimeConfig {
    /// Load from a `.yaml`, `.yml` or `.json` file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();

        match extension.as_str() {
            "yaml" | "yml" => Self::from_yaml_str(&content),
            "json" => Self::from_json_str(&content),
            other => Err(ConfigError::UnsupportedFormat(other.to_string())),
        }
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make the pipeline unusable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.circuit_breaker.failure_threshold == 0 {
            return invalid("circuit_breaker.failure_threshold must be at least 1".into());
        }
        if self.circuit_breaker.half_open_probe_limit == 0 {
            return invalid("circuit_breaker.half_open_probe_limit must be at least 1".into());
        }

        let limits = std::iter::once(("default", &self.rate_limits.default)).chain(
            self.rate_limits
                .providers
                .iter()
                .map(|(name, limit)| (name.as_str(), limit)),
        );
        for (name, limit) in limits {
            if limit.limit == 0 || limit.period.is_zero() {
                return invalid(format!(
                    "rate_limits.{}: limit and period must be non-zero",
                    name
                ));
            }
        }

        if self.cache.enabled && self.cache.max_entries == 0 {
            return invalid("cache.max_entries must be non-zero when the cache is enabled".into());
        }
        if self.call_timeout.is_zero() || self.default_request_timeout.is_zero() {
            return invalid("timeouts must be non-zero".into());
        }
        if self.synthesizer_priority.priority().is_empty() {
            return invalid("synthesizer_priority must name at least one entry".into());
        }

        let mut seen = HashSet::new();
        for model in &self.models {
            if model.name.trim().is_empty() || model.provider.trim().is_empty() {
                return invalid("every model needs a name and a provider".into());
            }
            if !seen.insert(model.name.as_str()) {
                return invalid(format!("duplicate model name '{}'", model.name));
            }
        }

        if let Some(judge) = &self.judge {
            if !seen.contains(judge.model.as_str()) {
                return invalid(format!(
                    "judge.model '{}' is not a configured model",
                    judge.model
                ));
            }
        }

        Ok(())
    }

    /// Generation settings with the configured call timeout applied.
    pub fn call_options(&self) -> CallOptions {
        self.generation.clone().with_timeout(self.call_timeout)
    }
}

/// Serialize `Duration` as a human-readable string ("30s", "2m").
///
/// Plain integers are accepted on input and read as seconds.
pub(crate) mod humantime_duration {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Seconds(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(text) => humantime::parse_duration(text.trim()).map_err(D::Error::custom),
        }
    }
}
