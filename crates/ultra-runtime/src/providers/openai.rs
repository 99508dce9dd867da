//! OpenAI-compatible chat-completions adapter.
//!
//! Also serves local servers that speak the same API (vLLM, llama.cpp,
//! Ollama's `/v1` endpoint). Those usually need no key, so the credential is
//! optional unless `require_api_key` is set.

use super::{
    factory::AdapterFactory,
    map_transport_error,
    secrets::{ApiCredential, CredentialSource},
    AdapterResponse, CallOptions, ChatMessage, ModelAdapter, ProviderError, TokenUsage,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;

/// Environment variable name for OpenAI API key.
pub const OPENAI_API_KEY_ENV: &str = "OPENAI_API_KEY";

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Adapter for one OpenAI-compatible model.
pub struct OpenAiAdapter {
    credential: Option<ApiCredential>,
    base_url: String,
    model: String,
    provider: String,
    client: reqwest::Client,
}

impl std::fmt::Debug for OpenAiAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiAdapter")
            .field("credential", &self.credential)
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("provider", &self.provider)
            .finish()
    }
}

impl OpenAiAdapter {
    pub fn new(
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Result<Self, ProviderError> {
        Ok(Self {
            credential: Some(ApiCredential::new(
                api_key,
                CredentialSource::Programmatic,
                "OpenAI API key",
            )),
            base_url: DEFAULT_BASE_URL.to_string(),
            model: model.into(),
            provider: "openai".to_string(),
            client: build_client()?,
        })
    }

    /// Create from JSON configuration.
    ///
    /// `provider` overrides the resilience key, so two local servers can be
    /// rate-limited independently.
    pub fn from_config(config: &JsonValue) -> Result<Self, ProviderError> {
        let credential = if config["require_api_key"].as_bool().unwrap_or(true) {
            Some(ApiCredential::from_config_or_env(
                config,
                "api_key",
                OPENAI_API_KEY_ENV,
                "OpenAI API key",
            )?)
        } else {
            ApiCredential::optional(config, "api_key", OPENAI_API_KEY_ENV, "OpenAI API key")
        };

        let model = config["model"].as_str().ok_or_else(|| {
            ProviderError::NotConfigured("OpenAI-compatible adapter needs a 'model'".to_string())
        })?;

        Ok(Self {
            credential,
            base_url: config["base_url"]
                .as_str()
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            model: model.to_string(),
            provider: config["provider"].as_str().unwrap_or("openai").to_string(),
            client: build_client()?,
        })
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

fn build_client() -> Result<reqwest::Client, ProviderError> {
    reqwest::Client::builder()
        .build()
        .map_err(|e| ProviderError::NotConfigured(format!("Failed to build HTTP client: {}", e)))
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    model: String,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

#[async_trait]
impl ModelAdapter for OpenAiAdapter {
    async fn call(
        &self,
        prompt: &str,
        options: &CallOptions,
    ) -> Result<AdapterResponse, ProviderError> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &options.system {
            messages.push(ChatMessage::system(system.as_str()));
        }
        messages.push(ChatMessage::user(prompt));

        let request = ChatRequest {
            model: &self.model,
            messages,
            max_tokens: options.max_tokens,
            temperature: options.temperature,
        };

        let mut builder = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .timeout(options.timeout)
            .json(&request);
        if let Some(credential) = &self.credential {
            builder = builder.bearer_auth(credential.expose());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| map_transport_error(e, options.timeout))?;

        let status = response.status();

        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(ProviderError::RateLimited { retry_after });
        }

        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(ProviderError::AuthError);
        }

        if !status.is_success() {
            let message = response
                .json::<ApiErrorBody>()
                .await
                .map(|body| body.error.message)
                .unwrap_or_else(|e| e.to_string());

            return Err(ProviderError::ApiError {
                status: status.as_u16(),
                message,
            });
        }

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::ParseError(e.to_string()))?;

        let usage = body
            .usage
            .map(|u| TokenUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
            })
            .unwrap_or_default();

        let choice = body
            .choices
            .into_iter()
            .next()
            .ok_or(ProviderError::EmptyResponse)?;
        let text = choice.message.content.unwrap_or_default();

        if text.trim().is_empty() {
            return Err(ProviderError::EmptyResponse);
        }

        Ok(AdapterResponse {
            text,
            usage,
            model: if body.model.is_empty() {
                self.model.clone()
            } else {
                body.model
            },
            stop_reason: choice.finish_reason,
        })
    }

    fn provider(&self) -> &str {
        &self.provider
    }
}

/// Factory for OpenAI-compatible adapters.
///
/// ## Configuration Format
/// ```json
/// {
///   "api_key": "sk-...",                    // Optional, falls back to OPENAI_API_KEY env
///   "base_url": "http://localhost:8000/v1", // Optional
///   "provider": "local-vllm",               // Optional, resilience key
///   "require_api_key": false                // Optional, default true
/// }
/// ```
pub struct OpenAiAdapterFactory;

impl AdapterFactory for OpenAiAdapterFactory {
    fn adapter_type(&self) -> &'static str {
        "openai"
    }

    fn create(&self, config: &JsonValue) -> Result<Arc<dyn ModelAdapter>, ProviderError> {
        Ok(Arc::new(OpenAiAdapter::from_config(config)?))
    }

    fn validate_config(&self, config: &JsonValue) -> Result<(), ProviderError> {
        let require_key = config["require_api_key"].as_bool().unwrap_or(true);
        if require_key && !ApiCredential::is_available(config, "api_key", OPENAI_API_KEY_ENV) {
            return Err(ProviderError::NotConfigured(format!(
                "OpenAI API key required: set 'api_key' in config or {} env, \
                 or set require_api_key: false for local servers",
                OPENAI_API_KEY_ENV
            )));
        }

        if let Some(url) = config["base_url"].as_str() {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(ProviderError::NotConfigured(
                    "base_url must start with http:// or https://".to_string(),
                ));
            }
        }

        Ok(())
    }

    fn default_config(&self) -> JsonValue {
        serde_json::json!({ "base_url": DEFAULT_BASE_URL })
    }

    fn description(&self) -> &'static str {
        "OpenAI-compatible chat completions (hosted or local)"
    }
}
