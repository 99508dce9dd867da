//! The four-stage pipeline.
//!
//! ```text
//! Initial (fan-out) -> Meta (fan-out) -> Hyper (one synthesizer) -> Ultra (one finalizer)
//! ```
//!
//! Every model call goes through the shared [`ResilientCaller`]. A model that
//! fails at any stage is dropped from the stages after it and reported in the
//! response's `partial_failure`. Only the errors in [`PipelineError`] end a
//! run without a synthesis.

use chrono::Utc;
use futures::future::join_all;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use ultra_core::{
    quality, AnalysisRequest, AnalysisResponse, Attribution, DroppedModel, ErrorKind,
    HyperSynthesisView, InitialResponseView, MetaAnalysisView, ModelDescriptor,
    PartialFailureReport, QualityWeights, RequestPayload, ResponseStatus, Stage, StageContext,
    StageMetrics, StageResponse, MAX_REQUEST_TIMEOUT,
};

use crate::cache::{CachedValue, ResponseCache};
use crate::chain::ResilientCaller;
use crate::config::{ConfigError, JudgeConfig, RuntimeConfig};
use crate::evaluator::{HeuristicEvaluator, ModelJudgeEvaluator, QualityEvaluator, ScoringContext};
use crate::progress::{NoProgress, ProgressNotifier, TracingProgress};
use crate::prompts;
use crate::providers::{AdapterFactoryRegistry, CallOptions};
use crate::registry::ModelRegistry;
use crate::resilience::{CircuitBreaker, RateLimiter, RetryConfig};
use crate::usage::UsageTracker;
use crate::PipelineError;

/// Responses collected for one fan-out stage.
struct FanOut {
    responses: Vec<StageResponse>,
    deadline_hit: bool,
    elapsed: Duration,
}

/// Outcome of trying synthesizer candidates in order.
struct Synthesis {
    winner: Option<StageResponse>,
    attempts: Vec<StageResponse>,
    elapsed: Duration,
}

/// Coordinates the pipeline across the registry, the resilient chain and the
/// evaluator. Cheap to share behind an `Arc`; all state is in the components.
pub struct Orchestrator {
    caller: Arc<ResilientCaller>,
    evaluator: Arc<dyn QualityEvaluator>,
    progress: Arc<dyn ProgressNotifier>,
    default_timeout: Duration,
}

impl Orchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }

    /// Build every component from configuration.
    pub fn from_config(
        config: RuntimeConfig,
        factories: &AdapterFactoryRegistry,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let registry = ModelRegistry::from_config(&config, factories)?;

        let mut options = config.call_options();
        if options.system.is_none() {
            options = options.with_system(prompts::ANALYST_SYSTEM_PROMPT.trim());
        }

        let mut builder = OrchestratorBuilder::new()
            .registry(Arc::new(registry))
            .circuit_breaker(Arc::new(CircuitBreaker::new(config.circuit_breaker.clone())))
            .rate_limiter(Arc::new(RateLimiter::new(config.rate_limits.clone())))
            .cache(Arc::new(ResponseCache::new(&config.cache)))
            .retry(config.retry.clone())
            .call_options(options)
            .quality_weights(config.quality.weights)
            .default_timeout(config.default_request_timeout);
        if let Some(judge) = config.judge {
            builder = builder.judge(judge);
        }

        Ok(builder.build())
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        self.caller.registry()
    }

    pub fn caller(&self) -> &Arc<ResilientCaller> {
        &self.caller
    }

    pub fn usage(&self) -> &Arc<UsageTracker> {
        self.caller.usage()
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        self.caller.cache()
    }

    pub fn evaluator(&self) -> &dyn QualityEvaluator {
        self.evaluator.as_ref()
    }

    /// Resolve a wire request against the registry, then run it.
    pub async fn analyze_payload(
        &self,
        payload: &RequestPayload,
    ) -> Result<AnalysisResponse, PipelineError> {
        let request = self.registry().resolve(payload, self.default_timeout)?;
        self.analyze(&request).await
    }

    /// Run the pipeline, serving identical requests from the cache.
    ///
    /// Only runs that dropped no model are cached at request level.
    pub async fn analyze(
        &self,
        request: &AnalysisRequest,
    ) -> Result<AnalysisResponse, PipelineError> {
        if request.models.is_empty() {
            return Err(PipelineError::InvalidModelSelection(
                "no models selected".to_string(),
            ));
        }

        let key = request.fingerprint();
        if let Some(CachedValue::Pipeline(hit)) = self.cache().get(&key).await {
            info!(key = %key, "Serving analysis from cache");
            self.usage().record_cache_hit();
            return Ok(*hit);
        }

        let response = self.run(request).await?;
        if !response.is_partial() {
            self.cache()
                .put(key, CachedValue::Pipeline(Box::new(response.clone())), None)
                .await;
        }
        Ok(response)
    }

    async fn run(&self, request: &AnalysisRequest) -> Result<AnalysisResponse, PipelineError> {
        let started = Instant::now();
        let deadline = started + request.timeout.min(MAX_REQUEST_TIMEOUT);
        let progress = self.notifier(request);
        let pattern = request.pattern;

        info!(
            pattern = %pattern,
            models = %request.model_names().join(", "),
            timeout = ?request.timeout,
            "Starting analysis"
        );

        let mut dropped: Vec<DroppedModel> = Vec::new();
        let mut metrics: Vec<StageMetrics> = Vec::with_capacity(4);

        // Stage 1: the raw prompt to every model.
        let prompt = pattern.stage_prompt(Stage::Initial, request, &StageContext::initial());
        let calls = request
            .models
            .iter()
            .map(|m| (m.clone(), prompt.clone()))
            .collect();
        let stage = self
            .fan_out(Stage::Initial, request, calls, deadline, progress)
            .await;
        let initial = self.score(stage.responses, request, deadline).await;
        metrics.push(stage_metrics(Stage::Initial, &initial, stage.elapsed));
        dropped.extend(initial.iter().filter_map(DroppedModel::from_response));

        if !initial.iter().any(|r| r.succeeded) {
            if stage.deadline_hit {
                return Err(PipelineError::DeadlineExceeded {
                    stage: Stage::Initial,
                    timeout: request.timeout,
                });
            }
            return Err(PipelineError::AllModelsFailed { dropped });
        }

        // Stage 2: each survivor refines its answer against its peers.
        let calls = request
            .models
            .iter()
            .filter_map(|model| {
                let own = initial
                    .iter()
                    .find(|r| r.succeeded && r.model == model.name)?;
                let context = StageContext::meta(
                    &own.text,
                    StageContext::peers_from(&initial, Some(&model.name)),
                );
                Some((
                    model.clone(),
                    pattern.stage_prompt(Stage::Meta, request, &context),
                ))
            })
            .collect();
        let stage = self
            .fan_out(Stage::Meta, request, calls, deadline, progress)
            .await;
        let meta = self.score(stage.responses, request, deadline).await;
        metrics.push(stage_metrics(Stage::Meta, &meta, stage.elapsed));
        dropped.extend(meta.iter().filter_map(DroppedModel::from_response));

        let candidates: Vec<ModelDescriptor> = request
            .models
            .iter()
            .filter(|m| meta.iter().any(|r| r.succeeded && r.model == m.name))
            .cloned()
            .collect();
        if candidates.is_empty() {
            if stage.deadline_hit {
                return Err(PipelineError::DeadlineExceeded {
                    stage: Stage::Meta,
                    timeout: request.timeout,
                });
            }
            return Err(PipelineError::NoSynthesizerAvailable {
                stage: Stage::Hyper,
                candidates: Vec::new(),
            });
        }

        // Stage 3: one synthesizer combines every refined analysis.
        let scores: HashMap<String, f64> = meta
            .iter()
            .filter(|r| r.succeeded)
            .map(|r| (r.model.clone(), r.quality_score))
            .collect();
        let lead = request.lead_model.as_ref().map(|m| m.name.as_str());
        let order = self
            .registry()
            .synthesis_order(&candidates, &scores, lead)?;

        let meta_summary = pattern.combine(Stage::Meta, &meta);
        let context =
            StageContext::hyper(StageContext::peers_from(&meta, None), Some(&meta_summary));
        let prompt = pattern.stage_prompt(Stage::Hyper, request, &context);

        let synthesis = self
            .synthesize(Stage::Hyper, request, &order, &prompt, deadline, progress)
            .await;
        metrics.push(stage_metrics(Stage::Hyper, &synthesis.attempts, synthesis.elapsed));
        dropped.extend(synthesis.attempts.iter().filter_map(DroppedModel::from_response));

        let hyper = match synthesis.winner {
            Some(winner) => winner,
            None if Instant::now() >= deadline => {
                return Err(PipelineError::DeadlineExceeded {
                    stage: Stage::Hyper,
                    timeout: request.timeout,
                })
            }
            None => {
                return Err(PipelineError::NoSynthesizerAvailable {
                    stage: Stage::Hyper,
                    candidates: order.iter().map(|m| m.name.clone()).collect(),
                })
            }
        };

        // Stage 4: finalize, unless the pattern says the synthesis is done.
        let hyper_summary = pattern.combine(Stage::Hyper, std::slice::from_ref(&hyper));
        let (ultra_response, lead_model) = if hyper_summary.ready_for_final {
            debug!(model = %hyper.model, "Synthesis is final, skipping ultra stage");
            metrics.push(stage_metrics(Stage::Ultra, &[], Duration::ZERO));
            (hyper.text.clone(), hyper.model.clone())
        } else {
            let finalizers: Vec<ModelDescriptor> = order
                .iter()
                .filter(|m| {
                    !synthesis
                        .attempts
                        .iter()
                        .any(|r| !r.succeeded && r.model == m.name)
                })
                .cloned()
                .collect();
            let context = StageContext::ultra(&hyper.text, Some(&hyper_summary));
            let prompt = pattern.stage_prompt(Stage::Ultra, request, &context);

            let finalized = self
                .synthesize(Stage::Ultra, request, &finalizers, &prompt, deadline, progress)
                .await;
            metrics.push(stage_metrics(Stage::Ultra, &finalized.attempts, finalized.elapsed));
            dropped.extend(finalized.attempts.iter().filter_map(DroppedModel::from_response));

            match finalized.winner {
                Some(winner) => (winner.text, winner.model),
                None => {
                    warn!(
                        model = %hyper.model,
                        "Every finalizer failed, passing the synthesis through"
                    );
                    (hyper.text.clone(), hyper.model.clone())
                }
            }
        };

        let contributors: Vec<(&str, &str)> = meta
            .iter()
            .filter(|r| r.succeeded)
            .map(|r| (r.model.as_str(), r.text.as_str()))
            .collect();
        let attribution: Vec<Attribution> = quality::attribution(&ultra_response, &contributors);

        let (status, partial_failure) = if dropped.is_empty() {
            (ResponseStatus::Success, None)
        } else {
            (
                ResponseStatus::PartialFailure,
                Some(PartialFailureReport { dropped }),
            )
        };

        let response = AnalysisResponse {
            initial_responses: initial
                .iter()
                .filter(|r| r.succeeded)
                .map(InitialResponseView::from)
                .collect(),
            meta_analyses: meta
                .iter()
                .filter(|r| r.succeeded)
                .map(MetaAnalysisView::from)
                .collect(),
            hyper_synthesis: HyperSynthesisView {
                model: hyper.model.clone(),
                response: hyper.text.clone(),
            },
            ultra_response,
            processing_time: started.elapsed().as_secs_f64(),
            lead_model,
            status,
            partial_failure,
            analysis_type: pattern.name().to_string(),
            stage_metrics: metrics,
            attribution,
            completed_at: Utc::now(),
        };

        info!(
            lead_model = %response.lead_model,
            status = ?response.status,
            dropped = response.dropped_models().len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Analysis complete"
        );
        Ok(response)
    }

    /// Call every model concurrently until all answer or the deadline passes.
    ///
    /// Models still in flight at the deadline are abandoned and recorded as
    /// timed out. Responses come back sorted by model name.
    async fn fan_out(
        &self,
        stage: Stage,
        request: &AnalysisRequest,
        calls: Vec<(ModelDescriptor, String)>,
        deadline: Instant,
        progress: &dyn ProgressNotifier,
    ) -> FanOut {
        let started = Instant::now();
        let names: Vec<String> = calls.iter().map(|(m, _)| m.name.clone()).collect();
        progress.on_stage_start(stage, &names);

        let mut pending: FuturesUnordered<_> = calls
            .iter()
            .map(|(model, prompt)| {
                self.caller
                    .call_stage(model, stage, request.pattern, prompt, deadline)
            })
            .collect();

        let mut responses: Vec<StageResponse> = Vec::with_capacity(calls.len());
        let mut deadline_hit = false;
        let expiry = tokio::time::sleep_until(deadline);
        tokio::pin!(expiry);

        loop {
            tokio::select! {
                biased;
                next = pending.next() => match next {
                    Some(response) => {
                        progress.on_model_complete(stage, &response);
                        responses.push(response);
                    }
                    None => break,
                },
                _ = &mut expiry => {
                    deadline_hit = true;
                    break;
                }
            }
        }
        drop(pending);
        deadline_hit |= Instant::now() >= deadline;

        if deadline_hit {
            for (model, _) in &calls {
                if responses.iter().any(|r| r.model == model.name) {
                    continue;
                }
                warn!(model = %model.name, stage = %stage, "Abandoned at request deadline");
                let abandoned = StageResponse::failure(
                    model,
                    stage,
                    ErrorKind::ProviderTimeout,
                    "abandoned at request deadline",
                    started.elapsed(),
                );
                progress.on_model_complete(stage, &abandoned);
                responses.push(abandoned);
            }
        }

        responses.sort_by(|a, b| a.model.cmp(&b.model));
        let elapsed = started.elapsed();
        let succeeded = responses.iter().filter(|r| r.succeeded).count();
        progress.on_stage_complete(stage, succeeded, responses.len(), elapsed);

        FanOut {
            responses,
            deadline_hit,
            elapsed,
        }
    }

    /// Try `candidates` in order until one succeeds.
    async fn synthesize(
        &self,
        stage: Stage,
        request: &AnalysisRequest,
        candidates: &[ModelDescriptor],
        prompt: &str,
        deadline: Instant,
        progress: &dyn ProgressNotifier,
    ) -> Synthesis {
        let started = Instant::now();
        let names: Vec<String> = candidates.iter().map(|m| m.name.clone()).collect();
        progress.on_stage_start(stage, &names);

        let mut attempts = Vec::new();
        let mut winner = None;
        for model in candidates {
            let response = if Instant::now() >= deadline {
                StageResponse::failure(
                    model,
                    stage,
                    ErrorKind::DeadlineExceeded,
                    "request deadline reached before call",
                    Duration::ZERO,
                )
            } else {
                self.caller
                    .call_stage(model, stage, request.pattern, prompt, deadline)
                    .await
            };
            progress.on_model_complete(stage, &response);

            if response.succeeded {
                winner = Some(response.clone());
                attempts.push(response);
                break;
            }
            if response.error == Some(ErrorKind::DeadlineExceeded) {
                attempts.push(response);
                break;
            }
            info!(model = %model.name, stage = %stage, "Synthesizer failed, trying next candidate");
            attempts.push(response);
        }

        let elapsed = started.elapsed();
        let succeeded = usize::from(winner.is_some());
        progress.on_stage_complete(stage, succeeded, attempts.len(), elapsed);

        Synthesis {
            winner,
            attempts,
            elapsed,
        }
    }

    /// Score every response against the successful responses of its stage.
    async fn score(
        &self,
        responses: Vec<StageResponse>,
        request: &AnalysisRequest,
        deadline: Instant,
    ) -> Vec<StageResponse> {
        let context = ScoringContext {
            prompt: &request.prompt,
            pattern: request.pattern,
            deadline,
        };
        let peers: Vec<&StageResponse> = responses.iter().filter(|r| r.succeeded).collect();
        let scores = join_all(
            responses
                .iter()
                .map(|r| self.evaluator.score(r, &peers, &context)),
        )
        .await;

        responses
            .into_iter()
            .zip(scores)
            .map(|(r, score)| r.with_quality(score))
            .collect()
    }

    fn notifier(&self, request: &AnalysisRequest) -> &dyn ProgressNotifier {
        if request.show_progress {
            self.progress.as_ref()
        } else {
            &NoProgress
        }
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("caller", &self.caller)
            .field("evaluator", &self.evaluator.name())
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}

fn stage_metrics(stage: Stage, responses: &[StageResponse], elapsed: Duration) -> StageMetrics {
    StageMetrics::from_responses(stage, responses, elapsed.as_millis() as u64)
}

/// Assembles an [`Orchestrator`] from shared components.
///
/// Anything not supplied gets a fresh default, so tests can inject only the
/// pieces they observe.
#[derive(Default)]
pub struct OrchestratorBuilder {
    registry: Option<Arc<ModelRegistry>>,
    breaker: Option<Arc<CircuitBreaker>>,
    limiter: Option<Arc<RateLimiter>>,
    cache: Option<Arc<ResponseCache>>,
    usage: Option<Arc<UsageTracker>>,
    retry: RetryConfig,
    call_options: CallOptions,
    weights: QualityWeights,
    judge: Option<JudgeConfig>,
    evaluator: Option<Arc<dyn QualityEvaluator>>,
    progress: Option<Arc<dyn ProgressNotifier>>,
    default_timeout: Option<Duration>,
}

impl OrchestratorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registry(mut self, registry: Arc<ModelRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn circuit_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    pub fn rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn cache(mut self, cache: Arc<ResponseCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn usage(mut self, usage: Arc<UsageTracker>) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Generation settings; `timeout` bounds each attempt.
    pub fn call_options(mut self, options: CallOptions) -> Self {
        self.call_options = options;
        self
    }

    pub fn quality_weights(mut self, weights: QualityWeights) -> Self {
        self.weights = weights;
        self
    }

    /// Grade responses with a judge model instead of the heuristic.
    pub fn judge(mut self, judge: JudgeConfig) -> Self {
        self.judge = Some(judge);
        self
    }

    /// Use a custom evaluator. Takes precedence over [`Self::judge`].
    pub fn evaluator(mut self, evaluator: Arc<dyn QualityEvaluator>) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    /// Notifier for requests that set `show_progress`. Defaults to tracing.
    pub fn progress(mut self, progress: Arc<dyn ProgressNotifier>) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Timeout for wire requests that do not set one.
    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> Orchestrator {
        let registry = self.registry.unwrap_or_default();
        let caller = Arc::new(ResilientCaller::new(
            Arc::clone(&registry),
            self.breaker.unwrap_or_default(),
            self.limiter.unwrap_or_default(),
            self.cache.unwrap_or_default(),
            self.usage.unwrap_or_default(),
            self.retry,
            self.call_options,
        ));

        let heuristic = HeuristicEvaluator::new(self.weights);
        let evaluator: Arc<dyn QualityEvaluator> = match (self.evaluator, self.judge) {
            (Some(evaluator), _) => evaluator,
            (None, Some(judge)) => match registry.descriptor(&judge.model) {
                Some(descriptor) => {
                    info!(
                        judge = %descriptor.name,
                        accounting = ?judge.accounting,
                        "Using model judge"
                    );
                    Arc::new(ModelJudgeEvaluator::new(
                        Arc::clone(&caller),
                        descriptor,
                        judge.accounting,
                        heuristic,
                    ))
                }
                None => {
                    warn!(
                        judge = %judge.model,
                        "Judge model not registered, using heuristic scoring"
                    );
                    Arc::new(heuristic)
                }
            },
            (None, None) => Arc::new(heuristic),
        };

        Orchestrator {
            caller,
            evaluator,
            progress: self.progress.unwrap_or_else(|| Arc::new(TracingProgress)),
            default_timeout: self
                .default_timeout
                .unwrap_or(ultra_core::DEFAULT_REQUEST_TIMEOUT),
        }
    }
}
