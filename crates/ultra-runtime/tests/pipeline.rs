//! End-to-end pipeline behaviour with scripted in-memory adapters.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use ultra_core::{
    quality, AnalysisRequest, ErrorKind, ModelDescriptor, PatternStrategy, RequestPayload,
    ResponseStatus, Stage,
};
use ultra_runtime::{
    AdapterResponse, CacheConfig, CallOptions, CircuitBreaker, CircuitBreakerConfig, CircuitState,
    JudgeAccounting, JudgeConfig, ModelAdapter, ModelRegistry, Orchestrator, OrchestratorBuilder,
    PipelineError, ProviderError, RateLimit, RateLimitConfig, RateLimiter, ResponseCache,
    RetryConfig,
};

#[derive(Clone, Copy)]
enum Script {
    /// Always answers
    Answer,
    /// Answers the first `n` calls, then fails
    AnswerThenFail(usize),
    /// Never answers within any sane timeout
    Hang,
    /// Always fails with a transient error
    Unavailable,
    /// Always answers with a fixed text
    Fixed(&'static str),
}

struct ScriptedAdapter {
    name: String,
    provider: String,
    script: Script,
    calls: AtomicUsize,
}

impl ScriptedAdapter {
    fn new(descriptor: &ModelDescriptor, script: Script) -> Arc<Self> {
        Arc::new(Self {
            name: descriptor.name.clone(),
            provider: descriptor.provider.clone(),
            script,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn answer(&self, call: usize) -> AdapterResponse {
        AdapterResponse::text(format!(
            "{} answer {}: photosynthesis converts light energy into chemical energy, \
             because chlorophyll absorbs red and blue wavelengths in the chloroplast.",
            self.name, call
        ))
    }
}

#[async_trait]
impl ModelAdapter for ScriptedAdapter {
    async fn call(
        &self,
        _prompt: &str,
        _options: &CallOptions,
    ) -> Result<AdapterResponse, ProviderError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        match self.script {
            Script::Answer => Ok(self.answer(call)),
            Script::AnswerThenFail(n) if call <= n => Ok(self.answer(call)),
            Script::AnswerThenFail(_) => Err(ProviderError::ApiError {
                status: 500,
                message: "scripted failure".into(),
            }),
            Script::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(self.answer(call))
            }
            Script::Unavailable => Err(ProviderError::Unavailable("scripted outage".into())),
            Script::Fixed(text) => Ok(AdapterResponse::text(text)),
        }
    }

    fn provider(&self) -> &str {
        &self.provider
    }
}

struct Harness {
    registry: Arc<ModelRegistry>,
    adapters: HashMap<String, Arc<ScriptedAdapter>>,
    builder: OrchestratorBuilder,
}

impl Harness {
    fn new() -> Self {
        let registry = Arc::new(ModelRegistry::default());
        let builder = Orchestrator::builder()
            .registry(Arc::clone(&registry))
            .retry(RetryConfig::disabled())
            .call_options(CallOptions::default().with_timeout(Duration::from_secs(5)));
        Self {
            registry,
            adapters: HashMap::new(),
            builder,
        }
    }

    fn model(self, name: &str, provider: &str, script: Script) -> Self {
        self.descriptor(ModelDescriptor::new(name, provider), script)
    }

    fn descriptor(mut self, descriptor: ModelDescriptor, script: Script) -> Self {
        let adapter = ScriptedAdapter::new(&descriptor, script);
        self.adapters.insert(descriptor.name.clone(), adapter.clone());
        self.registry.register(descriptor, adapter);
        self
    }

    fn with(mut self, f: impl FnOnce(OrchestratorBuilder) -> OrchestratorBuilder) -> Self {
        self.builder = f(self.builder);
        self
    }

    fn build(self) -> (Orchestrator, HashMap<String, Arc<ScriptedAdapter>>) {
        (self.builder.build(), self.adapters)
    }
}

fn request(
    orchestrator: &Orchestrator,
    models: &[&str],
    pattern: PatternStrategy,
) -> AnalysisRequest {
    let models = models
        .iter()
        .filter_map(|name| orchestrator.registry().descriptor(name));
    AnalysisRequest::new("Explain photosynthesis", models, pattern)
}

#[tokio::test(start_paused = true)]
async fn test_all_models_succeed() {
    let (orchestrator, adapters) = Harness::new()
        .model("a", "alpha", Script::Answer)
        .model("b", "beta", Script::Answer)
        .model("c", "gamma", Script::Answer)
        .build();

    let response = orchestrator
        .analyze(&request(&orchestrator, &["a", "b", "c"], PatternStrategy::Gut))
        .await
        .unwrap();

    assert_eq!(response.initial_responses.len(), 3);
    let models: Vec<&str> = response
        .initial_responses
        .iter()
        .map(|r| r.model.as_str())
        .collect();
    assert_eq!(models, vec!["a", "b", "c"]);
    for initial in &response.initial_responses {
        assert!((0.0..=1.0).contains(&initial.quality_score));
    }
    assert_eq!(response.meta_analyses.len(), 3);
    assert!(!response.ultra_response.is_empty());
    assert_eq!(response.status, ResponseStatus::Success);
    assert!(response.partial_failure.is_none());

    let shares: f64 = response.attribution.iter().map(|a| a.share).sum();
    assert!((shares - 1.0).abs() < 1e-9);

    // Two fan-out calls each, plus one synthesis and one finalization.
    let total: usize = adapters.values().map(|a| a.calls()).sum();
    assert_eq!(total, 3 + 3 + 1 + 1);
    assert_eq!(orchestrator.usage().snapshot().total_calls(), 8);
}

#[tokio::test(start_paused = true)]
async fn test_timed_out_model_is_dropped() {
    let (orchestrator, adapters) = Harness::new()
        .model("a", "alpha", Script::Answer)
        .model("b", "beta", Script::Answer)
        .model("c", "gamma", Script::Hang)
        .build();

    let payload = RequestPayload::new("Explain photosynthesis", ["a", "b", "c"], "gut");
    let response = orchestrator.analyze_payload(&payload).await.unwrap();

    assert_eq!(response.initial_responses.len(), 2);
    assert!(response.initial_responses.iter().all(|r| r.model != "c"));
    assert_eq!(response.meta_analyses.len(), 2);
    assert!(["a", "b"].contains(&response.hyper_synthesis.model.as_str()));
    assert!(["a", "b"].contains(&response.lead_model.as_str()));
    assert!(!response.ultra_response.is_empty());

    assert_eq!(response.status, ResponseStatus::PartialFailure);
    let dropped = &response.partial_failure.as_ref().unwrap().dropped;
    assert_eq!(dropped.len(), 1);
    assert_eq!(dropped[0].model, "c");
    assert_eq!(dropped[0].stage, Stage::Initial);
    assert_eq!(dropped[0].error, ErrorKind::ProviderTimeout);

    // Dropped models are not called again in later stages.
    assert_eq!(adapters["c"].calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_all_models_failing_is_fatal() {
    let (orchestrator, _) = Harness::new()
        .model("a", "alpha", Script::Unavailable)
        .model("b", "beta", Script::AnswerThenFail(0))
        .build();

    let err = orchestrator
        .analyze(&request(&orchestrator, &["a", "b"], PatternStrategy::Critique))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), Some(ErrorKind::AllModelsFailed));
    match err {
        PipelineError::AllModelsFailed { dropped } => {
            let names: Vec<&str> = dropped.iter().map(|d| d.model.as_str()).collect();
            assert_eq!(names, vec!["a", "b"]);
            assert_eq!(dropped[0].error, ErrorKind::ProviderUnavailable);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_identical_request_is_served_from_cache() {
    let (orchestrator, adapters) = Harness::new()
        .model("a", "alpha", Script::Answer)
        .model("b", "beta", Script::Answer)
        .with(|b| {
            b.cache(Arc::new(ResponseCache::new(&CacheConfig {
                ttl: Duration::from_secs(60),
                ..CacheConfig::default()
            })))
        })
        .build();
    let req = request(&orchestrator, &["a", "b"], PatternStrategy::Gut);

    let first = orchestrator.analyze(&req).await.unwrap();
    let calls = orchestrator.usage().snapshot().total_calls();
    let adapter_calls = adapters["a"].calls() + adapters["b"].calls();

    let second = orchestrator.analyze(&req).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(
        serde_json::to_string(&first).unwrap(),
        serde_json::to_string(&second).unwrap()
    );
    assert_eq!(orchestrator.usage().snapshot().total_calls(), calls);
    assert_eq!(adapters["a"].calls() + adapters["b"].calls(), adapter_calls);
    assert_eq!(orchestrator.usage().snapshot().cache_hits, 1);

    tokio::time::advance(Duration::from_secs(61)).await;
    orchestrator.analyze(&req).await.unwrap();
    assert!(orchestrator.usage().snapshot().total_calls() > calls);
    assert!(adapters["a"].calls() + adapters["b"].calls() > adapter_calls);
}

#[tokio::test(start_paused = true)]
async fn test_open_circuit_fails_fast() {
    let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig {
        failure_threshold: 2,
        reset_timeout: Duration::from_secs(30),
        half_open_probe_limit: 1,
    }));
    let (orchestrator, adapters) = Harness::new()
        .model("flaky", "down-co", Script::Unavailable)
        .model("steady", "up-co", Script::Answer)
        .with(|b| b.circuit_breaker(Arc::clone(&breaker)))
        .build();
    let req = request(&orchestrator, &["flaky", "steady"], PatternStrategy::Gut);

    for _ in 0..2 {
        let response = orchestrator.analyze(&req).await.unwrap();
        assert_eq!(response.dropped_models(), vec!["flaky"]);
    }
    assert_eq!(adapters["flaky"].calls(), 2);
    assert_eq!(breaker.state("down-co"), CircuitState::Open);

    let response = orchestrator.analyze(&req).await.unwrap();
    let dropped = &response.partial_failure.as_ref().unwrap().dropped;
    assert_eq!(dropped[0].error, ErrorKind::CircuitOpen);
    assert_eq!(adapters["flaky"].calls(), 2);

    // One probe after the reset timeout.
    tokio::time::advance(Duration::from_secs(31)).await;
    orchestrator.analyze(&req).await.unwrap();
    assert_eq!(adapters["flaky"].calls(), 3);
    assert_eq!(breaker.state("down-co"), CircuitState::Open);
}

#[tokio::test(start_paused = true)]
async fn test_rate_limited_model_is_dropped() {
    let mut providers = HashMap::new();
    providers.insert(
        "busy-co".to_string(),
        RateLimit {
            limit: 1,
            period: Duration::from_secs(60),
        },
    );
    let limiter = Arc::new(RateLimiter::new(RateLimitConfig {
        default: RateLimit::default(),
        providers,
    }));
    let (orchestrator, adapters) = Harness::new()
        .model("busy", "busy-co", Script::Answer)
        .model("free", "free-co", Script::Answer)
        .with(|b| b.rate_limiter(Arc::clone(&limiter)))
        .build();

    let response = orchestrator
        .analyze(&request(&orchestrator, &["busy", "free"], PatternStrategy::Gut))
        .await
        .unwrap();

    assert_eq!(adapters["busy"].calls(), 1);
    assert_eq!(response.initial_responses.len(), 2);
    assert_eq!(response.meta_analyses.len(), 1);
    let dropped = &response.partial_failure.as_ref().unwrap().dropped;
    assert_eq!(dropped[0].model, "busy");
    assert_eq!(dropped[0].stage, Stage::Meta);
    assert_eq!(dropped[0].error, ErrorKind::RateLimited);
    assert_eq!(response.lead_model, "free");
}

#[tokio::test(start_paused = true)]
async fn test_deadline_exceeded_when_nothing_arrives() {
    let (orchestrator, _) = Harness::new()
        .model("a", "alpha", Script::Hang)
        .model("b", "beta", Script::Hang)
        .build();
    let req = request(&orchestrator, &["a", "b"], PatternStrategy::Gut)
        .with_timeout(Duration::from_secs(2));

    let started = tokio::time::Instant::now();
    let err = orchestrator.analyze(&req).await.unwrap_err();
    assert!(matches!(
        err,
        PipelineError::DeadlineExceeded {
            stage: Stage::Initial,
            ..
        }
    ));
    assert_eq!(err.kind(), Some(ErrorKind::DeadlineExceeded));
    assert!(started.elapsed() <= Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn test_deadline_mid_stage_keeps_arrived_responses() {
    let (orchestrator, adapters) = Harness::new()
        .model("fast", "alpha", Script::Answer)
        .model("slow", "beta", Script::Hang)
        .build();
    let req = request(&orchestrator, &["fast", "slow"], PatternStrategy::Gut)
        .with_timeout(Duration::from_secs(2));

    let started = tokio::time::Instant::now();
    let err = orchestrator.analyze(&req).await.unwrap_err();

    // The fast answer carries the initial stage past its quorum; the meta
    // stage then has no time left for its only survivor.
    assert!(matches!(
        err,
        PipelineError::DeadlineExceeded {
            stage: Stage::Meta,
            ..
        }
    ));
    assert_eq!(adapters["fast"].calls(), 1);
    assert_eq!(adapters["slow"].calls(), 1);
    assert!(started.elapsed() <= Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn test_huge_timeouts_run_normally() {
    let (orchestrator, _) = Harness::new()
        .model("a", "alpha", Script::Answer)
        .model("b", "beta", Script::Answer)
        .build();

    let mut payload = RequestPayload::new("Explain photosynthesis", ["a", "b"], "gut");
    payload.options.timeout_seconds = Some(1e19);
    let response = orchestrator.analyze_payload(&payload).await.unwrap();
    assert_eq!(response.status, ResponseStatus::Success);

    let mut req = request(&orchestrator, &["a", "b"], PatternStrategy::Critique);
    req.timeout = Duration::MAX;
    let response = orchestrator.analyze(&req).await.unwrap();
    assert_eq!(response.status, ResponseStatus::Success);
}

const CHECKED_A: &str = "VERIFIED: chlorophyll absorbs red and blue light.\n\
                         VERIFIED: photosynthesis releases oxygen as a by-product.";

const CHECKED_B: &str = "VERIFIED: glucose is built from carbon dioxide and water.\n\
                         UNVERIFIED: every plant photosynthesizes at the same rate.";

#[tokio::test(start_paused = true)]
async fn test_settled_fact_check_skips_finalization() {
    let (orchestrator, adapters) = Harness::new()
        .model("a", "alpha", Script::Fixed(CHECKED_A))
        .model("b", "beta", Script::Fixed(CHECKED_B))
        .build();

    let response = orchestrator
        .analyze(&request(&orchestrator, &["a", "b"], PatternStrategy::FactCheck))
        .await
        .unwrap();

    assert_eq!(response.ultra_response, response.hyper_synthesis.response);
    assert_eq!(response.lead_model, response.hyper_synthesis.model);
    assert_eq!(response.status, ResponseStatus::Success);
    assert_eq!(response.stage_metrics[3].stage, Stage::Ultra);
    assert_eq!(response.stage_metrics[3].attempted, 0);

    // Two fan-out calls each and one synthesis; no finalization.
    let total: usize = adapters.values().map(|a| a.calls()).sum();
    assert_eq!(total, 2 + 2 + 1);
}

#[tokio::test(start_paused = true)]
async fn test_unlabeled_fact_check_is_finalized() {
    let (orchestrator, adapters) = Harness::new()
        .model("a", "alpha", Script::Answer)
        .model("b", "beta", Script::Answer)
        .build();

    let response = orchestrator
        .analyze(&request(&orchestrator, &["a", "b"], PatternStrategy::FactCheck))
        .await
        .unwrap();

    assert_eq!(response.stage_metrics[3].attempted, 1);
    let total: usize = adapters.values().map(|a| a.calls()).sum();
    assert_eq!(total, 2 + 2 + 1 + 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_synthesizer_falls_back_to_next_candidate() {
    let (orchestrator, adapters) = Harness::new()
        .descriptor(
            ModelDescriptor::new("preferred", "alpha").with_synthesis_priority(10),
            Script::AnswerThenFail(2),
        )
        .model("backup", "beta", Script::Answer)
        .build();

    let response = orchestrator
        .analyze(&request(&orchestrator, &["backup", "preferred"], PatternStrategy::Gut))
        .await
        .unwrap();

    assert_eq!(response.hyper_synthesis.model, "backup");
    assert_eq!(response.lead_model, "backup");
    assert_eq!(adapters["preferred"].calls(), 3);

    let dropped = &response.partial_failure.as_ref().unwrap().dropped;
    assert_eq!(dropped.len(), 1);
    assert_eq!(dropped[0].model, "preferred");
    assert_eq!(dropped[0].stage, Stage::Hyper);
}

#[tokio::test(start_paused = true)]
async fn test_lead_model_synthesizes() {
    let (orchestrator, _) = Harness::new()
        .descriptor(
            ModelDescriptor::new("a", "alpha").with_synthesis_priority(10),
            Script::Answer,
        )
        .model("b", "beta", Script::Answer)
        .build();

    let mut payload = RequestPayload::new("Explain photosynthesis", ["a", "b"], "perspective");
    payload.lead_model = Some("b".into());
    let response = orchestrator.analyze_payload(&payload).await.unwrap();

    assert_eq!(response.hyper_synthesis.model, "b");
    assert_eq!(response.analysis_type, "perspective");
}

#[tokio::test(start_paused = true)]
async fn test_finalizer_failure_passes_synthesis_through() {
    let (orchestrator, _) = Harness::new()
        .model("solo", "alpha", Script::AnswerThenFail(3))
        .build();

    let response = orchestrator
        .analyze(&request(&orchestrator, &["solo"], PatternStrategy::Gut))
        .await
        .unwrap();

    assert_eq!(response.ultra_response, response.hyper_synthesis.response);
    assert_eq!(response.lead_model, "solo");
    assert!(response.is_partial());
    let dropped = &response.partial_failure.as_ref().unwrap().dropped;
    assert_eq!(dropped[0].stage, Stage::Ultra);

    // Partial results are never cached at request level.
    let again = orchestrator
        .analyze(&request(&orchestrator, &["solo"], PatternStrategy::Gut))
        .await;
    assert!(again.is_ok());
    assert_eq!(orchestrator.usage().snapshot().cache_hits, 3);
}

#[tokio::test(start_paused = true)]
async fn test_judge_scores_with_dedicated_budget() {
    let (orchestrator, adapters) = Harness::new()
        .model("a", "alpha", Script::Answer)
        .model("b", "beta", Script::Answer)
        .model("judge", "alpha", Script::Fixed("SCORE: 7"))
        .with(|b| {
            b.judge(JudgeConfig {
                model: "judge".into(),
                accounting: JudgeAccounting::Dedicated,
            })
        })
        .build();

    let response = orchestrator
        .analyze(&request(&orchestrator, &["a", "b"], PatternStrategy::Gut))
        .await
        .unwrap();

    // The judge grade carries 0.8 of the score; uniqueness against the peer
    // carries the rest under default weights.
    let texts: Vec<&str> = response
        .initial_responses
        .iter()
        .map(|r| r.response.as_str())
        .collect();
    for (i, initial) in response.initial_responses.iter().enumerate() {
        let peer = texts[1 - i];
        let expected = 0.8 * 0.7 + 0.2 * quality::uniqueness(texts[i], &[peer]);
        assert!((initial.quality_score - expected).abs() < 1e-9);
    }
    // Two scored responses in each of the two fan-out stages.
    assert_eq!(adapters["judge"].calls(), 4);
    let usage = orchestrator.usage().snapshot();
    assert_eq!(usage.providers["judge:alpha"].calls, 4);
    assert_eq!(usage.providers["alpha"].calls, 4);
}

#[tokio::test]
async fn test_invalid_payloads_are_rejected() {
    let (orchestrator, _) = Harness::new().model("a", "alpha", Script::Answer).build();

    let unknown = RequestPayload::new("Explain photosynthesis", ["a", "ghost"], "gut");
    assert!(matches!(
        orchestrator.analyze_payload(&unknown).await,
        Err(PipelineError::InvalidModelSelection(_))
    ));

    let pattern = RequestPayload::new("Explain photosynthesis", ["a"], "vibes");
    assert!(matches!(
        orchestrator.analyze_payload(&pattern).await,
        Err(PipelineError::UnknownPattern(_))
    ));

    let empty = RequestPayload::new("   ", ["a"], "gut");
    assert!(matches!(
        orchestrator.analyze_payload(&empty).await,
        Err(PipelineError::InvalidRequest(_))
    ));
}
