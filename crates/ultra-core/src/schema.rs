//! JSON Schema validation for incoming request payloads.
//!
//! Payloads are validated against `schema/request.schema.json` before any
//! model name or pattern is resolved.

use std::sync::OnceLock;

use crate::CoreError;

/// Embedded request schema (loaded at compile time).
const REQUEST_SCHEMA_JSON: &str = include_str!("../schema/request.schema.json");

/// Compiled validator (initialized once, reused).
static COMPILED_SCHEMA: OnceLock<Result<jsonschema::Validator, String>> = OnceLock::new();

fn get_validator() -> Result<&'static jsonschema::Validator, CoreError> {
    let result = COMPILED_SCHEMA.get_or_init(|| {
        let schema_value: serde_json::Value = serde_json::from_str(REQUEST_SCHEMA_JSON)
            .map_err(|e| format!("Invalid schema JSON: {}", e))?;

        jsonschema::options()
            .build(&schema_value)
            .map_err(|e| format!("Failed to compile schema: {}", e))
    });

    result
        .as_ref()
        .map_err(|e| CoreError::Schema(vec![e.clone()]))
}

/// Validate a request payload against the schema.
///
/// Returns every violation, each suffixed with the offending instance path.
pub fn validate_request_schema(payload: &serde_json::Value) -> Result<(), Vec<String>> {
    let validator = get_validator().map_err(|e| vec![e.to_string()])?;

    let errors: Vec<String> = validator
        .iter_errors(payload)
        .map(|e| format!("{} at {}", e, e.instance_path))
        .collect();

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_request_passes() {
        let value = serde_json::json!({
            "prompt": "Explain photosynthesis",
            "models": ["a", "b"],
            "analysis_type": "gut"
        });
        assert!(validate_request_schema(&value).is_ok());
    }

    #[test]
    fn test_full_request_passes() {
        let value = serde_json::json!({
            "prompt": "Explain photosynthesis",
            "models": ["a"],
            "lead_model": null,
            "analysis_type": "confidence",
            "options": { "timeout_seconds": 30, "show_progress": true }
        });
        assert!(validate_request_schema(&value).is_ok());
    }

    #[test]
    fn test_missing_models_fails() {
        let value = serde_json::json!({
            "prompt": "Explain photosynthesis",
            "analysis_type": "gut"
        });
        let errors = validate_request_schema(&value).unwrap_err();
        assert!(!errors.is_empty());
    }

    #[test]
    fn test_empty_model_list_fails() {
        let value = serde_json::json!({
            "prompt": "x",
            "models": [],
            "analysis_type": "gut"
        });
        assert!(validate_request_schema(&value).is_err());
    }

    #[test]
    fn test_non_positive_timeout_fails() {
        let value = serde_json::json!({
            "prompt": "x",
            "models": ["a"],
            "analysis_type": "gut",
            "options": { "timeout_seconds": 0 }
        });
        assert!(validate_request_schema(&value).is_err());
    }
}
