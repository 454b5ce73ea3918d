//! LLM provider abstraction
//!
//! The pipeline only needs chat-style completion with JSON-mode output and a
//! temperature knob. Providers are behind the `LlmClient` trait so that
//! swapping one for another is purely a configuration change; orchestrator
//! tests substitute scripted mocks.

use crate::config::LlmConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod openai_compat;

pub use openai_compat::OpenAiCompatClient;

/// Error types for LLM operations
#[derive(Error, Debug)]
pub enum LlmError {
    #[error("Authentication failed: {message}")]
    Authentication { message: String },

    #[error("Rate limit exceeded: {retry_after:?}")]
    RateLimit { retry_after: Option<u64> },

    #[error("Request failed: {status}: {message}")]
    RequestFailed { status: u16, message: String },

    #[error("Invalid response format: {message}")]
    InvalidResponse { message: String },

    #[error("Request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LlmError {
    /// Whether a retry could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimit { .. } | Self::Network(_) | Self::Timeout { .. } => true,
            Self::RequestFailed { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Role of a message in the conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// Represents a message in a conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Configuration for one completion call
#[derive(Debug, Clone)]
pub struct CompletionOptions {
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    /// Ask the provider for a strict JSON object response.
    pub json_mode: bool,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            temperature: 0.1,
            max_tokens: Some(2048),
            json_mode: true,
        }
    }
}

/// Response from a completion call
#[derive(Debug, Clone)]
pub struct Completion {
    pub content: String,
    pub finish_reason: String,
}

/// The provider trait all LLM backends implement.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Provider name for logging (e.g. "openai", "openrouter")
    fn provider_name(&self) -> &str;

    /// Run one chat completion.
    async fn complete(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<Completion, LlmError>;
}

/// Create a provider from configuration.
///
/// Every supported provider speaks the OpenAI-compatible chat-completions
/// protocol; the provider name only selects defaults and logging labels.
pub fn client_from_config(
    config: &LlmConfig,
    timeout: std::time::Duration,
) -> Result<Box<dyn LlmClient>, LlmError> {
    let api_key = config
        .api_key
        .clone()
        .ok_or_else(|| LlmError::Authentication {
            message: format!("no API key configured for provider {}", config.provider),
        })?;
    Ok(Box::new(
        OpenAiCompatClient::new(
            config.provider.clone(),
            config.base_url.clone(),
            api_key,
            config.model.clone(),
        )
        .with_timeout(timeout),
    ))
}
