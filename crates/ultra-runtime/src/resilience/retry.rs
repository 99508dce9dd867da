//! Bounded exponential backoff for transient call failures.

use backon::{ExponentialBuilder, Retryable};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

use crate::CallError;

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: usize,

    #[serde(with = "crate::config::humantime_duration")]
    pub initial_backoff: Duration,

    #[serde(with = "crate::config::humantime_duration")]
    pub max_backoff: Duration,

    /// Randomize delays to spread out retries from concurrent runs
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(5),
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// No retries at all.
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    fn backoff(&self) -> ExponentialBuilder {
        let builder = ExponentialBuilder::default()
            .with_min_delay(self.initial_backoff)
            .with_max_delay(self.max_backoff)
            .with_factor(2.0)
            .with_max_times(self.max_retries);
        if self.jitter {
            builder.with_jitter()
        } else {
            builder
        }
    }

    /// Run `attempt` until it succeeds, fails with a non-retryable error,
    /// runs out of retries, or `deadline` passes.
    pub async fn run<T, F, Fut>(
        &self,
        label: &str,
        deadline: Instant,
        attempt: F,
    ) -> Result<T, CallError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        attempt
            .retry(self.backoff())
            .sleep(tokio::time::sleep)
            .when(|e: &CallError| e.is_retryable() && Instant::now() < deadline)
            .notify(|e: &CallError, delay: Duration| {
                warn!(call = %label, error = %e, ?delay, "Retrying transient failure");
            })
            .await
    }
}
