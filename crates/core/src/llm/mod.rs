//! Generative-text providers.
//!
//! Nodes depend only on [`TextGenerator`]; the concrete backend is chosen once
//! from [`LlmConfig`] and shared through the node registry.

mod gemini;
mod openai;

pub use gemini::GeminiProvider;
pub use openai::OpenAiProvider;

use crate::config::{secs, LlmConfig, LlmProviderKind};
use crate::error::LlmError;
use std::sync::Arc;
use std::time::Duration;

/// One text-generation call
#[derive(Debug, Clone, PartialEq)]
pub struct GenerateRequest {
    pub prompt: String,
    /// Overrides the provider's default model
    pub model: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub system_message: Option<String>,
}

impl GenerateRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            model: None,
            temperature: 0.7,
            max_tokens: 1000,
            system_message: None,
        }
    }
}

#[async_trait::async_trait]
pub trait TextGenerator: Send + Sync {
    /// Model used when a request does not name one
    fn default_model(&self) -> &str;

    /// Time limit the provider applies to one request, if any
    fn request_timeout(&self) -> Option<Duration> {
        None
    }

    async fn generate(&self, request: GenerateRequest) -> Result<String, LlmError>;
}

/// Stand-in used when no provider is configured; every call fails
pub struct DisabledGenerator;

#[async_trait::async_trait]
impl TextGenerator for DisabledGenerator {
    fn default_model(&self) -> &str {
        "none"
    }

    async fn generate(&self, _request: GenerateRequest) -> Result<String, LlmError> {
        Err(LlmError::NotConfigured)
    }
}

/// Build the provider selected by `config`
pub fn provider_from_config(config: &LlmConfig, http: reqwest::Client) -> Arc<dyn TextGenerator> {
    let timeout = secs(config.request_timeout);
    let model = config.default_model();

    match config.provider {
        LlmProviderKind::OpenAi => {
            let mut provider = OpenAiProvider::new(http, config.api_key.clone(), model, timeout);
            if let Some(base_url) = &config.base_url {
                provider = provider.with_base_url(base_url);
            }
            Arc::new(provider)
        }
        LlmProviderKind::Gemini => {
            let mut provider = GeminiProvider::new(http, config.api_key.clone(), model, timeout);
            if let Some(base_url) = &config.base_url {
                provider = provider.with_base_url(base_url);
            }
            Arc::new(provider)
        }
        LlmProviderKind::None => Arc::new(DisabledGenerator),
    }
}

/// Turn a non-success response into `LlmError::Api`, keeping the body text
pub(crate) async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, LlmError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(LlmError::Api {
        status: status.as_u16(),
        message,
    })
}
