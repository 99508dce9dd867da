//! Model adapter abstractions for ultra-runtime.
//!
//! This module defines the uniform call interface to one provider/model pair
//! and includes implementations for Anthropic and OpenAI-compatible APIs.
//!
//! ## Security
//!
//! All adapters use the [`secrets`] module for credential handling.
//! See [`ApiCredential`] for the recommended patterns.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use ultra_core::ErrorKind;

mod factory;
pub mod secrets;

#[cfg(feature = "anthropic")]
mod anthropic;

#[cfg(feature = "openai")]
mod openai;

pub use factory::{AdapterFactory, AdapterFactoryRegistry};
pub use secrets::{ApiCredential, CredentialSource};

#[cfg(feature = "anthropic")]
pub use anthropic::{AnthropicAdapter, AnthropicAdapterFactory};

#[cfg(feature = "openai")]
pub use openai::{OpenAiAdapter, OpenAiAdapterFactory};

/// Errors from model adapters.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("HTTP request failed: {0}")]
    HttpError(String),

    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    #[error("Rate limit exceeded, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("API error: {status} - {message}")]
    ApiError { status: u16, message: String },

    #[error("JSON parse error: {0}")]
    ParseError(String),

    #[error("Provider returned an empty response")]
    EmptyResponse,

    #[error("Authentication failed")]
    AuthError,

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),
}

impl ProviderError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::HttpError(_)
            | ProviderError::Unavailable(_)
            | ProviderError::Timeout(_) => true,
            ProviderError::ApiError { status, .. } => *status >= 500,
            _ => false,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ProviderError::Timeout(_) => ErrorKind::ProviderTimeout,
            ProviderError::RateLimited { .. } => ErrorKind::RateLimited,
            _ => ErrorKind::ProviderUnavailable,
        }
    }
}

/// Map a transport-level failure; the HTTP status has not been seen yet.
#[cfg(any(feature = "anthropic", feature = "openai"))]
pub(crate) fn map_transport_error(e: reqwest::Error, timeout: Duration) -> ProviderError {
    if e.is_timeout() {
        ProviderError::Timeout(timeout)
    } else if e.is_connect() {
        ProviderError::Unavailable(e.to_string())
    } else {
        ProviderError::HttpError(e.to_string())
    }
}

/// Per-call generation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallOptions {
    /// Maximum tokens to generate
    pub max_tokens: u32,

    /// Sampling temperature
    pub temperature: f32,

    /// Optional system prompt
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,

    /// Transport timeout for this attempt
    #[serde(with = "crate::config::humantime_duration")]
    pub timeout: Duration,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            max_tokens: 2048,
            temperature: 0.7,
            system: None,
            timeout: Duration::from_secs(30),
        }
    }
}

impl CallOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }
}

/// A chat message sent to a chat-style API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Role: "system", "user", or "assistant"
    pub role: String,

    /// Message content
    pub content: String,
}

impl ChatMessage {
    /// Create a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    /// Create a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Response from one adapter call.
#[derive(Debug, Clone)]
pub struct AdapterResponse {
    /// Generated text
    pub text: String,

    /// Token usage
    pub usage: TokenUsage,

    /// Model identifier reported by the provider
    pub model: String,

    /// Stop reason
    pub stop_reason: Option<String>,
}

impl AdapterResponse {
    /// A response with no usage data, as returned by in-memory adapters.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            usage: TokenUsage::default(),
            model: String::new(),
            stop_reason: None,
        }
    }
}

/// Token usage from a call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Tokens in the prompt
    pub prompt_tokens: u32,

    /// Tokens in the completion
    pub completion_tokens: u32,
}

impl TokenUsage {
    /// Total tokens used.
    pub fn total(&self) -> u32 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// Uniform call interface to one provider/model pair.
///
/// Adapters are only ever invoked through [`crate::ResilientCaller`], which
/// applies rate limiting, circuit breaking, retry and timeouts around them.
#[async_trait]
pub trait ModelAdapter: Send + Sync {
    /// Send a prompt and return the generated text.
    async fn call(&self, prompt: &str, options: &CallOptions)
        -> Result<AdapterResponse, ProviderError>;

    /// Check if the adapter is usable.
    async fn health_check(&self) -> bool {
        true
    }

    /// Provider name, used as the resilience key.
    fn provider(&self) -> &str;

    /// Estimate tokens for a prompt.
    fn estimate_tokens(&self, text: &str) -> u32 {
        // ~4 chars per token
        (text.len() / 4) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_message_creation() {
        let system = ChatMessage::system("You are a careful analyst.");
        assert_eq!(system.role, "system");

        let user = ChatMessage::user("Hello!");
        assert_eq!(user.role, "user");
    }

    #[test]
    fn test_token_usage_total() {
        let usage = TokenUsage {
            prompt_tokens: 100,
            completion_tokens: 50,
        };
        assert_eq!(usage.total(), 150);
    }

    #[test]
    fn test_transient_classification() {
        assert!(ProviderError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(ProviderError::HttpError("reset".into()).is_transient());
        assert!(ProviderError::ApiError {
            status: 503,
            message: "overloaded".into()
        }
        .is_transient());
        assert!(!ProviderError::ApiError {
            status: 400,
            message: "bad request".into()
        }
        .is_transient());
        assert!(!ProviderError::AuthError.is_transient());
        assert!(!ProviderError::RateLimited { retry_after: None }.is_transient());
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            ProviderError::Timeout(Duration::from_secs(1)).kind(),
            ErrorKind::ProviderTimeout
        );
        assert_eq!(
            ProviderError::RateLimited { retry_after: None }.kind(),
            ErrorKind::RateLimited
        );
        assert_eq!(ProviderError::EmptyResponse.kind(), ErrorKind::ProviderUnavailable);
    }
}
