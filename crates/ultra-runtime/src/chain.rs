//! The resilient call chain.
//!
//! ```text
//! ResponseCache -> Retry -> RateLimiter -> CircuitBreaker -> timeout -> ModelAdapter
//! ```
//!
//! Every attempt, including each retry, is admitted by the rate limiter and
//! the circuit breaker, so a provider never sees more calls than its window
//! allows. No lock is held across the outbound call.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use ultra_core::{Fingerprint, ModelDescriptor, PatternStrategy, Stage, StageResponse};

use crate::cache::{CachedValue, ResponseCache};
use crate::providers::{AdapterResponse, CallOptions, ModelAdapter, ProviderError};
use crate::registry::ModelRegistry;
use crate::resilience::{CircuitBreaker, RateLimiter, RetryConfig};
use crate::usage::UsageTracker;
use crate::CallError;

/// The only path by which models are called.
pub struct ResilientCaller {
    registry: Arc<ModelRegistry>,
    breaker: Arc<CircuitBreaker>,
    limiter: Arc<RateLimiter>,
    cache: Arc<ResponseCache>,
    usage: Arc<UsageTracker>,
    retry: RetryConfig,
    options: CallOptions,
}

impl ResilientCaller {
    /// `options.timeout` is the per-attempt upper bound.
    pub fn new(
        registry: Arc<ModelRegistry>,
        breaker: Arc<CircuitBreaker>,
        limiter: Arc<RateLimiter>,
        cache: Arc<ResponseCache>,
        usage: Arc<UsageTracker>,
        retry: RetryConfig,
        options: CallOptions,
    ) -> Self {
        Self {
            registry,
            breaker,
            limiter,
            cache,
            usage,
            retry,
            options,
        }
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    pub fn usage(&self) -> &Arc<UsageTracker> {
        &self.usage
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Call `model` through retry, rate limiting and circuit breaking.
    ///
    /// `budget_key` names the rate-limit window and circuit to use; pipeline
    /// calls use the model's provider. Nothing is cached here.
    pub async fn invoke(
        &self,
        model: &ModelDescriptor,
        prompt: &str,
        budget_key: &str,
        deadline: Instant,
    ) -> Result<AdapterResponse, CallError> {
        let adapter = self
            .registry
            .adapter(&model.name)
            .ok_or_else(|| CallError::UnknownModel(model.name.clone()))?;
        let adapter: &dyn ModelAdapter = adapter.as_ref();

        self.retry
            .run(&model.name, deadline, move || {
                self.attempt(adapter, model, prompt, budget_key, deadline)
            })
            .await
    }

    async fn attempt(
        &self,
        adapter: &dyn ModelAdapter,
        model: &ModelDescriptor,
        prompt: &str,
        budget_key: &str,
        deadline: Instant,
    ) -> Result<AdapterResponse, CallError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(CallError::Timeout {
                model: model.name.clone(),
                after: Duration::ZERO,
            });
        }

        self.limiter.check(budget_key)?;
        let permit = self.breaker.acquire(budget_key)?;

        let budget = self.options.timeout.min(remaining);
        let options = self.options.clone().with_timeout(budget);

        match tokio::time::timeout(budget, adapter.call(prompt, &options)).await {
            Ok(Ok(response)) if !response.text.trim().is_empty() => {
                permit.success();
                self.usage
                    .record_call(budget_key, &model.name, &response.usage);
                Ok(response)
            }
            Ok(Ok(_)) => {
                permit.failure();
                self.usage.record_failure(budget_key);
                Err(CallError::from_provider(
                    &model.name,
                    ProviderError::EmptyResponse,
                ))
            }
            Ok(Err(e)) => {
                permit.failure();
                self.usage.record_failure(budget_key);
                Err(CallError::from_provider(&model.name, e))
            }
            Err(_) => {
                permit.failure();
                self.usage.record_failure(budget_key);
                Err(CallError::Timeout {
                    model: model.name.clone(),
                    after: budget,
                })
            }
        }
    }

    /// One pipeline call for `model` at `stage`, read-through cached.
    ///
    /// Never fails: errors become a failed [`StageResponse`]. Only successes
    /// are written to the cache.
    pub async fn call_stage(
        &self,
        model: &ModelDescriptor,
        stage: Stage,
        pattern: PatternStrategy,
        prompt: &str,
        deadline: Instant,
    ) -> StageResponse {
        let key = Fingerprint::for_call(&model.name, stage, pattern, prompt);

        if let Some(CachedValue::Call(hit)) = self.cache.get(&key).await {
            debug!(model = %model.name, stage = %stage, key = %key, "Serving call from cache");
            self.usage.record_cache_hit();
            return hit.for_stage(stage).from_cache();
        }

        let started = Instant::now();
        match self.invoke(model, prompt, &model.provider, deadline).await {
            Ok(response) => {
                let result = StageResponse::success(model, stage, response.text, started.elapsed());
                self.cache
                    .put(key, CachedValue::Call(result.clone()), None)
                    .await;
                result
            }
            Err(e) => {
                warn!(model = %model.name, stage = %stage, error = %e, "Model call failed");
                StageResponse::failure(model, stage, e.kind(), e.to_string(), started.elapsed())
            }
        }
    }
}

impl std::fmt::Debug for ResilientCaller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientCaller")
            .field("registry", &self.registry)
            .field("retry", &self.retry)
            .field("options", &self.options)
            .finish()
    }
}
