//! Fixed-window rate limiting per provider.
//!
//! A rejected call fails immediately with [`CallError::RateLimited`]; nothing
//! is queued.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::CallError;

/// Calls allowed per window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub limit: u32,

    #[serde(with = "crate::config::humantime_duration")]
    pub period: Duration,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            limit: 60,
            period: Duration::from_secs(60),
        }
    }
}

/// Default limit plus per-provider overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub default: RateLimit,
    pub providers: HashMap<String, RateLimit>,
}

impl RateLimitConfig {
    /// Limit for a budget key.
    ///
    /// Keys of the form `judge:<provider>` fall back to the provider's own
    /// limit before the default.
    pub fn limit_for(&self, key: &str) -> RateLimit {
        if let Some(limit) = self.providers.get(key) {
            return *limit;
        }
        key.split_once(':')
            .and_then(|(_, provider)| self.providers.get(provider))
            .copied()
            .unwrap_or(self.default)
    }
}

/// Counter for one provider's current window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitWindow {
    pub window_start: Instant,
    pub count: u32,
    pub limit: u32,
    pub period: Duration,
}

impl RateLimitWindow {
    fn new(limit: RateLimit, now: Instant) -> Self {
        Self {
            window_start: now,
            count: 0,
            limit: limit.limit,
            period: limit.period,
        }
    }

    /// Time until the window resets.
    pub fn remaining(&self, now: Instant) -> Duration {
        self.period
            .saturating_sub(now.saturating_duration_since(self.window_start))
    }
}

/// Per-provider request-rate governor, shared across pipeline runs.
#[derive(Debug, Default)]
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: Mutex<HashMap<String, RateLimitWindow>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Count one attempted call against `key`'s window.
    pub fn check(&self, key: &str) -> Result<(), CallError> {
        let now = Instant::now();
        let mut windows = self.windows.lock();
        let window = windows
            .entry(key.to_string())
            .or_insert_with(|| RateLimitWindow::new(self.config.limit_for(key), now));

        if now.saturating_duration_since(window.window_start) >= window.period {
            window.window_start = now;
            window.count = 0;
        }

        if window.count < window.limit {
            window.count += 1;
            return Ok(());
        }

        let retry_after = window.remaining(now);
        debug!(provider = %key, limit = window.limit, ?retry_after, "Rate limit reached");
        Err(CallError::RateLimited {
            provider: key.to_string(),
            retry_after,
        })
    }

    /// Like [`check`](Self::check), as a bool.
    pub fn allow(&self, key: &str) -> bool {
        self.check(key).is_ok()
    }

    /// Snapshot of `key`'s window, if it has seen a call.
    pub fn window(&self, key: &str) -> Option<RateLimitWindow> {
        self.windows.lock().get(key).copied()
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Forget every window.
    pub fn reset(&self) {
        self.windows.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn limiter(limit: u32, secs: u64) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            default: RateLimit {
                limit,
                period: Duration::from_secs(secs),
            },
            providers: HashMap::new(),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejects_over_limit() {
        let rl = limiter(3, 60);
        assert!(rl.allow("p"));
        assert!(rl.allow("p"));
        assert!(rl.allow("p"));

        match rl.check("p") {
            Err(CallError::RateLimited { retry_after, .. }) => {
                assert_eq!(retry_after, Duration::from_secs(60));
            }
            other => panic!("expected RateLimited, got {:?}", other),
        }
        assert_eq!(rl.window("p").map(|w| w.count), Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_resets_after_period() {
        let rl = limiter(1, 10);
        assert!(rl.allow("p"));

        tokio::time::advance(Duration::from_secs(4)).await;
        match rl.check("p") {
            Err(CallError::RateLimited { retry_after, .. }) => {
                assert_eq!(retry_after, Duration::from_secs(6));
            }
            other => panic!("expected RateLimited, got {:?}", other),
        }

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(rl.allow("p"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_provider_overrides() {
        let mut providers = HashMap::new();
        providers.insert(
            "anthropic".to_string(),
            RateLimit {
                limit: 1,
                period: Duration::from_secs(60),
            },
        );
        let rl = RateLimiter::new(RateLimitConfig {
            default: RateLimit::default(),
            providers,
        });

        assert!(rl.allow("anthropic"));
        assert!(!rl.allow("anthropic"));
        assert!(rl.allow("openai"));

        // Dedicated judge key: own window, provider's limit
        assert!(rl.allow("judge:anthropic"));
        assert!(!rl.allow("judge:anthropic"));
        assert_eq!(rl.config().limit_for("judge:openai"), RateLimit::default());
    }

    proptest! {
        #[test]
        fn accepted_calls_never_exceed_limit(limit in 1u32..20, attempts in 0usize..60) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .start_paused(true)
                .build()
                .unwrap();
            rt.block_on(async {
                let rl = limiter(limit, 60);
                let accepted = (0..attempts).filter(|_| rl.allow("p")).count();
                prop_assert_eq!(accepted, attempts.min(limit as usize));
                Ok(())
            })?;
        }
    }
}
