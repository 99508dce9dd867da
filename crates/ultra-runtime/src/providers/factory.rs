//! Adapter factories for configuration-driven model registration.
//!
//! Adding a provider is a configuration entry, not a code change: each
//! adapter type registers a factory that builds adapters from the model's
//! JSON `config` block.
//!
//! ## Usage
//!
//! ```ignore
//! let mut factories = AdapterFactoryRegistry::new();
//! factories.register(Arc::new(AnthropicAdapterFactory));
//!
//! let adapter = factories.create("anthropic", &json!({"model": "claude-sonnet-4-5"}))?;
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value as JsonValue;

use super::{ModelAdapter, ProviderError};

/// Builds model adapters of one type from configuration.
pub trait AdapterFactory: Send + Sync {
    /// Unique identifier for this adapter type.
    ///
    /// Examples: "anthropic", "openai"
    fn adapter_type(&self) -> &'static str;

    /// Create an adapter from its JSON configuration.
    ///
    /// The registry always sets `config["model"]` before calling this.
    fn create(&self, config: &JsonValue) -> Result<Arc<dyn ModelAdapter>, ProviderError>;

    /// Validate configuration without creating an adapter.
    fn validate_config(&self, config: &JsonValue) -> Result<(), ProviderError>;

    /// Defaults for optional fields.
    fn default_config(&self) -> JsonValue {
        serde_json::json!({})
    }

    /// Human-readable description of this adapter type.
    fn description(&self) -> &'static str {
        "Model adapter"
    }
}

/// Registry of available adapter factories, keyed by adapter type.
#[derive(Default)]
pub struct AdapterFactoryRegistry {
    factories: BTreeMap<String, Arc<dyn AdapterFactory>>,
}

impl AdapterFactoryRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory, replacing any factory of the same type.
    pub fn register(&mut self, factory: Arc<dyn AdapterFactory>) {
        self.factories
            .insert(factory.adapter_type().to_string(), factory);
    }

    /// Create an adapter for `model` from type name and configuration.
    ///
    /// Factory defaults are applied under the given config, and `model` is
    /// filled in when the config does not name the provider-side model id.
    pub fn create(
        &self,
        adapter_type: &str,
        model: &str,
        config: &JsonValue,
    ) -> Result<Arc<dyn ModelAdapter>, ProviderError> {
        let factory = self.factory(adapter_type)?;
        factory.create(&merged_config(factory.as_ref(), model, config))
    }

    /// Validate configuration for an adapter type.
    pub fn validate(
        &self,
        adapter_type: &str,
        model: &str,
        config: &JsonValue,
    ) -> Result<(), ProviderError> {
        let factory = self.factory(adapter_type)?;
        factory.validate_config(&merged_config(factory.as_ref(), model, config))
    }

    /// List available adapter types.
    pub fn available_types(&self) -> Vec<&str> {
        self.factories.keys().map(|s| s.as_str()).collect()
    }

    /// Check if an adapter type is registered.
    pub fn has_type(&self, adapter_type: &str) -> bool {
        self.factories.contains_key(adapter_type)
    }

    /// Create a registry with every adapter compiled into this build.
    pub fn with_defaults() -> Self {
        #[allow(unused_mut)]
        let mut registry = Self::new();

        #[cfg(feature = "anthropic")]
        registry.register(Arc::new(super::AnthropicAdapterFactory));

        #[cfg(feature = "openai")]
        registry.register(Arc::new(super::OpenAiAdapterFactory));

        registry
    }

    fn factory(&self, adapter_type: &str) -> Result<&Arc<dyn AdapterFactory>, ProviderError> {
        self.factories.get(adapter_type).ok_or_else(|| {
            ProviderError::NotConfigured(format!(
                "Unknown adapter type: '{}'. Available: {:?}",
                adapter_type,
                self.available_types()
            ))
        })
    }
}

impl std::fmt::Debug for AdapterFactoryRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterFactoryRegistry")
            .field("adapters", &self.available_types())
            .finish()
    }
}

fn merged_config(factory: &dyn AdapterFactory, model: &str, config: &JsonValue) -> JsonValue {
    let mut merged = match factory.default_config() {
        defaults @ JsonValue::Object(_) => defaults,
        _ => JsonValue::Object(Default::default()),
    };
    if let (Some(base), Some(overrides)) = (merged.as_object_mut(), config.as_object()) {
        for (key, value) in overrides {
            base.insert(key.clone(), value.clone());
        }
    }
    if merged["model"].as_str().is_none() {
        merged["model"] = JsonValue::String(model.to_string());
    }
    merged
}
