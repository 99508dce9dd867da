//! Request payload parsing.
//!
//! The payload is the unresolved wire form: model names and a pattern name.
//! Resolution against the registry happens in the runtime.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::schema::validate_request_schema;
use crate::types::MAX_REQUEST_TIMEOUT;
use crate::CoreError;

/// Per-request options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestOptions {
    /// Overall deadline in seconds; runtime default when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<f64>,

    /// Report per-stage progress while running
    #[serde(default)]
    pub show_progress: bool,
}

impl RequestOptions {
    /// Deadline as a `Duration`, if one was given and is usable. Capped at
    /// [`MAX_REQUEST_TIMEOUT`].
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_seconds
            .filter(|s| *s > 0.0)
            .map(|s| {
                Duration::try_from_secs_f64(s)
                    .map_or(MAX_REQUEST_TIMEOUT, |d| d.min(MAX_REQUEST_TIMEOUT))
            })
    }
}

/// Analysis request as received from the outer HTTP/CLI layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestPayload {
    pub prompt: String,

    pub models: Vec<String>,

    #[serde(default)]
    pub lead_model: Option<String>,

    /// Pattern name (e.g., "gut", "confidence")
    pub analysis_type: String,

    #[serde(default)]
    pub options: RequestOptions,
}

impl RequestPayload {
    pub fn new(
        prompt: impl Into<String>,
        models: impl IntoIterator<Item = impl Into<String>>,
        analysis_type: impl Into<String>,
    ) -> Self {
        Self {
            prompt: prompt.into(),
            models: models.into_iter().map(Into::into).collect(),
            lead_model: None,
            analysis_type: analysis_type.into(),
            options: RequestOptions::default(),
        }
    }

    /// Parse and schema-validate a JSON payload.
    pub fn from_json(json: &str) -> Result<Self, CoreError> {
        let value: serde_json::Value = serde_json::from_str(json)?;
        Self::from_value(value)
    }

    /// Schema-validate an already parsed JSON value.
    pub fn from_value(value: serde_json::Value) -> Result<Self, CoreError> {
        validate_request_schema(&value).map_err(CoreError::Schema)?;
        let payload: Self = serde_json::from_value(value)?;

        if payload.prompt.trim().is_empty() {
            return Err(CoreError::InvalidRequest("prompt is blank".to_string()));
        }

        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_payload_with_defaults() {
        let payload = RequestPayload::from_json(
            r#"{"prompt": "Explain photosynthesis", "models": ["a", "b"], "analysis_type": "gut"}"#,
        )
        .unwrap();

        assert_eq!(payload.models, vec!["a", "b"]);
        assert_eq!(payload.lead_model, None);
        assert!(!payload.options.show_progress);
        assert_eq!(payload.options.timeout(), None);
    }

    #[test]
    fn test_parse_payload_options() {
        let payload = RequestPayload::from_json(
            r#"{
                "prompt": "p",
                "models": ["a"],
                "lead_model": "a",
                "analysis_type": "critique",
                "options": {"timeout_seconds": 2.5, "show_progress": true}
            }"#,
        )
        .unwrap();

        assert_eq!(payload.lead_model.as_deref(), Some("a"));
        assert_eq!(payload.options.timeout(), Some(Duration::from_millis(2500)));
        assert!(payload.options.show_progress);
    }

    #[test]
    fn test_huge_timeout_is_capped() {
        for seconds in [1e19, 1e20, f64::INFINITY] {
            let options = RequestOptions {
                timeout_seconds: Some(seconds),
                show_progress: false,
            };
            assert_eq!(options.timeout(), Some(MAX_REQUEST_TIMEOUT));
        }
    }

    #[test]
    fn test_timeout_above_maximum_fails_schema() {
        let err = RequestPayload::from_json(
            r#"{"prompt": "p", "models": ["a"], "analysis_type": "gut",
                "options": {"timeout_seconds": 1e20}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::Schema(_)));
    }

    #[test]
    fn test_schema_violation_is_reported() {
        let err = RequestPayload::from_json(r#"{"prompt": "p", "models": "a"}"#).unwrap_err();
        assert!(matches!(err, CoreError::Schema(_)));
    }

    #[test]
    fn test_blank_prompt_rejected() {
        let err = RequestPayload::from_json(
            r#"{"prompt": "   ", "models": ["a"], "analysis_type": "gut"}"#,
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::InvalidRequest(_)));
    }

    #[test]
    fn test_malformed_json() {
        let err = RequestPayload::from_json("{not json").unwrap_err();
        assert!(matches!(err, CoreError::Json(_)));
    }
}
