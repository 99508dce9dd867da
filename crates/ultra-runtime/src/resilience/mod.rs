//! Resilience patterns for ultra-runtime.
//!
//! This module provides:
//! - Circuit breaker to isolate failing providers
//! - Fixed-window rate limiting per provider
//! - Retry with backoff for transient failures

mod circuit_breaker;
mod rate_limiter;
mod retry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitPermit, CircuitSnapshot, CircuitState,
};
pub use rate_limiter::{RateLimit, RateLimitConfig, RateLimitWindow, RateLimiter};
pub use retry::RetryConfig;
