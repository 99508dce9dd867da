//! Progress notification for pipeline runs.
//!
//! The orchestrator reports stage and model completion through a
//! [`ProgressNotifier`] when a request sets `show_progress`.

use std::time::Duration;
use tracing::info;
use ultra_core::{Stage, StageResponse};

/// Callback interface for progress updates.
pub trait ProgressNotifier: Send + Sync {
    /// A stage is starting with `models` participating.
    fn on_stage_start(&self, stage: Stage, models: &[String]);

    /// One model finished its call for `stage`.
    fn on_model_complete(&self, stage: Stage, response: &StageResponse);

    /// Every call of `stage` has been collected.
    fn on_stage_complete(&self, stage: Stage, succeeded: usize, total: usize, elapsed: Duration);
}

/// No-op progress notifier.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressNotifier for NoProgress {
    fn on_stage_start(&self, _stage: Stage, _models: &[String]) {}
    fn on_model_complete(&self, _stage: Stage, _response: &StageResponse) {}
    fn on_stage_complete(
        &self,
        _stage: Stage,
        _succeeded: usize,
        _total: usize,
        _elapsed: Duration,
    ) {
    }
}

/// Reports progress as `tracing` events.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingProgress;

impl ProgressNotifier for TracingProgress {
    fn on_stage_start(&self, stage: Stage, models: &[String]) {
        info!(
            stage = %stage,
            step = stage.number(),
            models = %models.join(", "),
            "Stage started"
        );
    }

    fn on_model_complete(&self, stage: Stage, response: &StageResponse) {
        info!(
            stage = %stage,
            model = %response.model,
            succeeded = response.succeeded,
            cached = response.cached,
            latency_ms = response.latency.as_millis() as u64,
            "Model finished"
        );
    }

    fn on_stage_complete(&self, stage: Stage, succeeded: usize, total: usize, elapsed: Duration) {
        info!(
            stage = %stage,
            succeeded,
            total,
            elapsed_ms = elapsed.as_millis() as u64,
            "Stage complete"
        );
    }
}
