//! Model registry: the runtime map of model name to descriptor and adapter.
//!
//! Populated from configuration through adapter factories, or directly with
//! [`ModelRegistry::register`]. Also owns the synthesizer priority policy.

use futures::future::join_all;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use ultra_core::{
    AnalysisRequest, CoreError, ModelDescriptor, PatternStrategy, RequestPayload,
    SynthesizerPolicy,
};

use crate::config::{ConfigError, RuntimeConfig};
use crate::providers::{AdapterFactoryRegistry, ModelAdapter};
use crate::PipelineError;

struct RegisteredModel {
    descriptor: ModelDescriptor,
    adapter: Arc<dyn ModelAdapter>,
    available: bool,
}

/// Registered models and their health flags.
pub struct ModelRegistry {
    models: RwLock<BTreeMap<String, RegisteredModel>>,
    policy: SynthesizerPolicy,
}

impl ModelRegistry {
    pub fn new(policy: SynthesizerPolicy) -> Self {
        Self {
            models: RwLock::new(BTreeMap::new()),
            policy,
        }
    }

    /// Build adapters for every configured model.
    pub fn from_config(
        config: &RuntimeConfig,
        factories: &AdapterFactoryRegistry,
    ) -> Result<Self, ConfigError> {
        let registry = Self::new(config.synthesizer_priority.clone());

        for model in &config.models {
            let adapter = factories
                .create(model.adapter_type(), &model.name, &model.config)
                .map_err(|source| ConfigError::Provider {
                    model: model.name.clone(),
                    source,
                })?;
            registry.register(model.descriptor(), adapter);
        }

        Ok(registry)
    }

    /// Register a model, replacing any model of the same name.
    pub fn register(&self, descriptor: ModelDescriptor, adapter: Arc<dyn ModelAdapter>) {
        let name = descriptor.name.clone();
        let previous = self.models.write().insert(
            name.clone(),
            RegisteredModel {
                descriptor,
                adapter,
                available: true,
            },
        );
        if previous.is_some() {
            warn!(model = %name, "Replaced registered model");
        } else {
            info!(model = %name, "Registered model");
        }
    }

    /// Remove a model. Returns false if it was not registered.
    pub fn unregister(&self, name: &str) -> bool {
        self.models.write().remove(name).is_some()
    }

    /// Descriptors of every available model, sorted by name.
    pub fn list_available(&self) -> Vec<ModelDescriptor> {
        self.models
            .read()
            .values()
            .filter(|m| m.available)
            .map(|m| m.descriptor.clone())
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.models.read().keys().cloned().collect()
    }

    pub fn descriptor(&self, name: &str) -> Option<ModelDescriptor> {
        self.models.read().get(name).map(|m| m.descriptor.clone())
    }

    pub fn adapter(&self, name: &str) -> Option<Arc<dyn ModelAdapter>> {
        self.models.read().get(name).map(|m| Arc::clone(&m.adapter))
    }

    pub fn is_available(&self, name: &str) -> bool {
        self.models.read().get(name).is_some_and(|m| m.available)
    }

    /// Toggle a model's health flag. Returns false for unknown models.
    pub fn set_available(&self, name: &str, available: bool) -> bool {
        match self.models.write().get_mut(name) {
            Some(model) => {
                if model.available != available {
                    info!(model = %name, available, "Model availability changed");
                }
                model.available = available;
                true
            }
            None => false,
        }
    }

    pub fn policy(&self) -> &SynthesizerPolicy {
        &self.policy
    }

    /// First model in `available` the priority list matches.
    pub fn select_synthesizer(
        &self,
        available: &[ModelDescriptor],
    ) -> Result<ModelDescriptor, CoreError> {
        self.policy.select_first(available, &HashMap::new())
    }

    /// Every eligible synthesizer among `candidates`, in the order to try them.
    pub fn synthesis_order(
        &self,
        candidates: &[ModelDescriptor],
        scores: &HashMap<String, f64>,
        lead: Option<&str>,
    ) -> Result<Vec<ModelDescriptor>, CoreError> {
        self.policy.select(candidates, scores, lead)
    }

    /// Resolve a wire request against the registered models.
    pub fn resolve(
        &self,
        payload: &RequestPayload,
        default_timeout: Duration,
    ) -> Result<AnalysisRequest, PipelineError> {
        if payload.prompt.trim().is_empty() {
            return Err(PipelineError::InvalidRequest(
                "prompt must not be empty".to_string(),
            ));
        }

        let pattern = PatternStrategy::from_name(&payload.analysis_type)?;

        let names: BTreeSet<&str> = payload.models.iter().map(|m| m.trim()).collect();
        if names.is_empty() {
            return Err(PipelineError::InvalidModelSelection(
                "no models selected".to_string(),
            ));
        }

        let models = self.models.read();
        let mut selected = Vec::with_capacity(names.len());
        for name in names {
            match models.get(name) {
                Some(m) if m.available => selected.push(m.descriptor.clone()),
                Some(_) => {
                    return Err(PipelineError::InvalidModelSelection(format!(
                        "model '{}' is unavailable",
                        name
                    )))
                }
                None => {
                    return Err(PipelineError::InvalidModelSelection(format!(
                        "unknown model '{}'",
                        name
                    )))
                }
            }
        }

        let lead = match payload.lead_model.as_deref().map(str::trim) {
            Some(name) => Some(
                models
                    .get(name)
                    .map(|m| m.descriptor.clone())
                    .ok_or_else(|| {
                        PipelineError::InvalidModelSelection(format!(
                            "unknown lead model '{}'",
                            name
                        ))
                    })?,
            ),
            None => None,
        };
        drop(models);

        let mut request = AnalysisRequest::new(payload.prompt.clone(), selected, pattern)
            .with_timeout(payload.options.timeout().unwrap_or(default_timeout))
            .with_progress(payload.options.show_progress);
        if let Some(lead) = lead {
            request = request.with_lead_model(lead);
        }
        Ok(request)
    }

    /// Probe every adapter concurrently and update availability flags.
    pub async fn health_check(&self) -> BTreeMap<String, bool> {
        let adapters: Vec<(String, Arc<dyn ModelAdapter>)> = self
            .models
            .read()
            .iter()
            .map(|(name, m)| (name.clone(), Arc::clone(&m.adapter)))
            .collect();

        let results = join_all(adapters.into_iter().map(|(name, adapter)| async move {
            let healthy = adapter.health_check().await;
            (name, healthy)
        }))
        .await;

        for (name, healthy) in &results {
            if !healthy {
                warn!(model = %name, "Health check failed");
            }
            self.set_available(name, *healthy);
        }

        results.into_iter().collect()
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new(SynthesizerPolicy::default())
    }
}

impl std::fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRegistry")
            .field("models", &self.names())
            .field("policy", &self.policy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{AdapterResponse, CallOptions, ProviderError};
    use async_trait::async_trait;
    use ultra_core::{ErrorKind, MAX_REQUEST_TIMEOUT};

    struct StubAdapter {
        healthy: bool,
    }

    #[async_trait]
    impl ModelAdapter for StubAdapter {
        async fn call(
            &self,
            _prompt: &str,
            _options: &CallOptions,
        ) -> Result<AdapterResponse, ProviderError> {
            Ok(AdapterResponse::text("ok"))
        }

        async fn health_check(&self) -> bool {
            self.healthy
        }

        fn provider(&self) -> &str {
            "stub"
        }
    }

    fn registry(names: &[(&str, &str)]) -> ModelRegistry {
        let registry = ModelRegistry::new(SynthesizerPolicy::new(["b", "anthropic", "*"]));
        for (name, provider) in names {
            registry.register(
                ModelDescriptor::new(*name, *provider),
                Arc::new(StubAdapter { healthy: true }),
            );
        }
        registry
    }

    #[test]
    fn test_register_and_list() {
        let registry = registry(&[("b", "openai"), ("a", "anthropic")]);
        let names: Vec<String> = registry.list_available().into_iter().map(|m| m.name).collect();
        assert_eq!(names, vec!["a", "b"]);

        assert!(registry.set_available("a", false));
        assert_eq!(registry.list_available().len(), 1);
        assert!(!registry.set_available("ghost", false));

        assert!(registry.unregister("b"));
        assert!(registry.list_available().is_empty());
    }

    #[test]
    fn test_select_synthesizer_first_match_wins() {
        let registry = registry(&[("a", "anthropic"), ("b", "openai"), ("c", "local")]);
        let all = registry.list_available();
        assert_eq!(registry.select_synthesizer(&all).unwrap().name, "b");

        let without_b: Vec<_> = all.iter().filter(|m| m.name != "b").cloned().collect();
        assert_eq!(registry.select_synthesizer(&without_b).unwrap().name, "a");

        let err = registry.select_synthesizer(&[]).unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::NoSynthesizerAvailable));
    }

    #[test]
    fn test_resolve_validates_models() {
        let registry = registry(&[("a", "anthropic"), ("b", "openai")]);
        let timeout = Duration::from_secs(120);

        let payload = RequestPayload::new("Explain photosynthesis", ["b", "a", "b"], "gut");
        let request = registry.resolve(&payload, timeout).unwrap();
        assert_eq!(request.model_names(), vec!["a", "b"]);
        assert_eq!(request.timeout, timeout);

        let payload = RequestPayload::new("x", ["a", "ghost"], "gut");
        assert!(matches!(
            registry.resolve(&payload, timeout),
            Err(PipelineError::InvalidModelSelection(_))
        ));

        let payload = RequestPayload::new("x", Vec::<String>::new(), "gut");
        assert!(matches!(
            registry.resolve(&payload, timeout),
            Err(PipelineError::InvalidModelSelection(_))
        ));

        registry.set_available("b", false);
        let payload = RequestPayload::new("x", ["a", "b"], "gut");
        assert!(matches!(
            registry.resolve(&payload, timeout),
            Err(PipelineError::InvalidModelSelection(_))
        ));

        let payload = RequestPayload::new("x", ["a"], "vibes");
        assert!(matches!(
            registry.resolve(&payload, timeout),
            Err(PipelineError::UnknownPattern(_))
        ));
    }

    #[test]
    fn test_resolve_applies_options() {
        let registry = registry(&[("a", "anthropic"), ("b", "openai")]);
        let mut payload = RequestPayload::new("x", ["a"], "fact-check");
        payload.lead_model = Some("b".into());
        payload.options.timeout_seconds = Some(5.0);
        payload.options.show_progress = true;

        let request = registry.resolve(&payload, Duration::from_secs(120)).unwrap();
        assert_eq!(request.pattern, PatternStrategy::FactCheck);
        assert_eq!(request.timeout, Duration::from_secs(5));
        assert!(request.show_progress);
        assert_eq!(request.lead_model.map(|m| m.name), Some("b".to_string()));

        payload.lead_model = Some("ghost".into());
        assert!(registry.resolve(&payload, Duration::from_secs(1)).is_err());
    }

    #[test]
    fn test_resolve_caps_huge_timeout() {
        let registry = registry(&[("a", "anthropic")]);
        let mut payload = RequestPayload::new("x", ["a"], "gut");
        for seconds in [1e19, 1e20] {
            payload.options.timeout_seconds = Some(seconds);
            let request = registry.resolve(&payload, Duration::from_secs(120)).unwrap();
            assert_eq!(request.timeout, MAX_REQUEST_TIMEOUT);
        }
    }

    #[tokio::test]
    async fn test_health_check_updates_flags() {
        let registry = registry(&[("a", "anthropic")]);
        registry.register(
            ModelDescriptor::new("sick", "local"),
            Arc::new(StubAdapter { healthy: false }),
        );

        let results = registry.health_check().await;
        assert_eq!(results.get("a"), Some(&true));
        assert_eq!(results.get("sick"), Some(&false));
        assert!(!registry.is_available("sick"));
        assert!(registry.is_available("a"));
    }
}
