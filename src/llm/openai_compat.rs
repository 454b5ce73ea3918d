//! OpenAI-compatible chat-completions provider
//!
//! Works against any endpoint speaking the `/chat/completions` protocol
//! (OpenAI, OpenRouter, DeepSeek, local gateways). JSON mode is requested via
//! `response_format` when supported.

use super::{ChatMessage, Completion, CompletionOptions, LlmClient, LlmError};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

/// Provider client with bounded retries.
pub struct OpenAiCompatClient {
    client: Client,
    provider: String,
    base_url: String,
    api_key: String,
    model: String,
    retry_attempts: usize,
    retry_delay: Duration,
}

impl OpenAiCompatClient {
    /// Create a new client with default retry policy.
    pub fn new(provider: String, base_url: String, api_key: String, model: String) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(60))
                .build()
                .unwrap_or_else(|_| Client::new()),
            provider,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model,
            retry_attempts: 2,
            retry_delay: Duration::from_millis(1000),
        }
    }

    /// Override the request timeout (mirrors the configured LLM timeout).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        self
    }

    /// Execute a request with retry logic for transient failures.
    async fn execute_with_retry<F, Fut>(&self, operation: F) -> Result<Completion, LlmError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<Completion, LlmError>> + Send,
    {
        let mut last_error = None;
        for attempt in 0..=self.retry_attempts {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    let retryable = e.is_retryable();
                    let delay = match &e {
                        LlmError::RateLimit {
                            retry_after: Some(secs),
                        } => Duration::from_secs(*secs),
                        _ => self.retry_delay * (attempt as u32 + 1),
                    };
                    last_error = Some(e);
                    if !retryable || attempt == self.retry_attempts {
                        break;
                    }
                    debug!(provider = %self.provider, attempt, "retrying LLM call");
                    tokio::time::sleep(delay).await;
                }
            }
        }
        Err(last_error.unwrap_or(LlmError::InvalidResponse {
            message: "retry loop produced no error".to_string(),
        }))
    }

    /// Parse error response and return appropriate LlmError
    fn parse_error_response(status: u16, body: &str) -> LlmError {
        match status {
            429 => {
                let retry_after = serde_json::from_str::<serde_json::Value>(body)
                    .ok()
                    .and_then(|json| {
                        json.get("retry_after")
                            .and_then(|v| v.as_u64())
                            .or_else(|| {
                                json.get("error")
                                    .and_then(|e| e.get("retry_after"))
                                    .and_then(|v| v.as_u64())
                            })
                    });
                LlmError::RateLimit { retry_after }
            }
            401 | 403 => LlmError::Authentication {
                message: "Invalid API key or insufficient permissions".to_string(),
            },
            _ => LlmError::RequestFailed {
                status,
                message: body.chars().take(500).collect(),
            },
        }
    }
}

#[async_trait]
impl LlmClient for OpenAiCompatClient {
    fn provider_name(&self) -> &str {
        &self.provider
    }

    async fn complete(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<Completion, LlmError> {
        let operation = || async {
            let url = format!("{}/chat/completions", self.base_url);

            let mut request_body = serde_json::json!({
                "model": self.model,
                "messages": messages,
                "temperature": options.temperature,
            });
            if let Some(max_tokens) = options.max_tokens {
                request_body["max_tokens"] = max_tokens.into();
            }
            if options.json_mode {
                request_body["response_format"] = serde_json::json!({ "type": "json_object" });
            }

            let response = self
                .client
                .post(&url)
                .bearer_auth(&self.api_key)
                .json(&request_body)
                .send()
                .await?;

            if !response.status().is_success() {
                let status = response.status().as_u16();
                let body = response.text().await.unwrap_or_default();
                return Err(Self::parse_error_response(status, &body));
            }

            let body: serde_json::Value =
                response
                    .json()
                    .await
                    .map_err(|e| LlmError::InvalidResponse {
                        message: format!("Failed to parse completion response: {e}"),
                    })?;

            if let Some(error) = body.get("error") {
                return Err(LlmError::RequestFailed {
                    status: 400,
                    message: error.to_string(),
                });
            }

            let choice = body["choices"][0]
                .as_object()
                .ok_or_else(|| LlmError::InvalidResponse {
                    message: "No choices in response".to_string(),
                })?;
            let content = choice["message"]["content"]
                .as_str()
                .ok_or_else(|| LlmError::InvalidResponse {
                    message: "No content in response".to_string(),
                })?
                .to_string();
            let finish_reason = choice["finish_reason"]
                .as_str()
                .unwrap_or("unknown")
                .to_string();

            Ok(Completion {
                content,
                finish_reason,
            })
        };

        self.execute_with_retry(operation).await
    }
}
