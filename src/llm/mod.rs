//! LLM integration.
//!
//! A single `LlmProvider` trait with a reqwest-backed Anthropic
//! implementation. Agents depend only on the trait so tests swap in mocks.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::error::LlmError;

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// A chat message in a completion request.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatRole {
    System,
    User,
    Assistant,
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

/// A completion request.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl CompletionRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            temperature: 0.7,
            max_tokens: 1024,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// Why the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    MaxTokens,
    Other,
}

/// A completion response.
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub content: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub finish_reason: FinishReason,
}

impl CompletionResponse {
    /// Cost of this completion given per-token input/output prices.
    pub fn cost(&self, per_input: Decimal, per_output: Decimal) -> Decimal {
        Decimal::from(self.input_tokens) * per_input
            + Decimal::from(self.output_tokens) * per_output
    }
}

/// LLM provider abstraction.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Model identifier for logging and audit entries.
    fn model_name(&self) -> &str;

    /// (input, output) cost per token.
    fn cost_per_token(&self) -> (Decimal, Decimal);

    async fn complete(&self, request: CompletionRequest)
    -> Result<CompletionResponse, LlmError>;
}

/// Configuration for creating an LLM provider.
#[derive(Clone)]
pub struct LlmConfig {
    pub api_key: SecretString,
    pub model: String,
}

/// Create the default (Anthropic) provider from configuration.
pub fn create_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    let provider = AnthropicProvider::new(config.api_key.clone(), config.model.clone())?;
    tracing::info!(model = %config.model, "Using Anthropic provider");
    Ok(Arc::new(provider))
}

/// Direct Anthropic Messages API provider.
pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: SecretString,
    model: String,
}

impl AnthropicProvider {
    pub fn new(api_key: SecretString, model: String) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| LlmError::RequestFailed {
                provider: "anthropic".into(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            client,
            api_key,
            model,
        })
    }
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContent>,
    stop_reason: Option<String>,
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
struct AnthropicContent {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: u64,
    output_tokens: u64,
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn cost_per_token(&self) -> (Decimal, Decimal) {
        // $3 / $15 per million tokens.
        (Decimal::new(3, 6), Decimal::new(15, 6))
    }

    async fn complete(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, LlmError> {
        let system: String = request
            .messages
            .iter()
            .filter(|m| m.role == ChatRole::System)
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");

        let messages: Vec<serde_json::Value> = request
            .messages
            .iter()
            .filter(|m| m.role != ChatRole::System)
            .map(|m| {
                serde_json::json!({
                    "role": match m.role {
                        ChatRole::Assistant => "assistant",
                        _ => "user",
                    },
                    "content": m.content,
                })
            })
            .collect();

        let body = serde_json::json!({
            "model": self.model,
            "system": system,
            "messages": messages,
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
        });

        let response = self
            .client
            .post(ANTHROPIC_API_URL)
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::RequestFailed {
                provider: "anthropic".into(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(LlmError::AuthFailed {
                provider: "anthropic".into(),
            });
        }
        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(LlmError::RateLimited {
                provider: "anthropic".into(),
                retry_after,
            });
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(LlmError::RequestFailed {
                provider: "anthropic".into(),
                reason: format!("HTTP {status}: {text}"),
            });
        }

        let parsed: AnthropicResponse =
            response.json().await.map_err(|e| LlmError::InvalidResponse {
                provider: "anthropic".into(),
                reason: e.to_string(),
            })?;

        let content = parsed
            .content
            .iter()
            .map(|c| c.text.as_str())
            .collect::<Vec<_>>()
            .join("");

        let finish_reason = match parsed.stop_reason.as_deref() {
            Some("end_turn") | Some("stop_sequence") => FinishReason::Stop,
            Some("max_tokens") => FinishReason::MaxTokens,
            _ => FinishReason::Other,
        };

        Ok(CompletionResponse {
            content,
            input_tokens: parsed.usage.input_tokens,
            output_tokens: parsed.usage.output_tokens,
            finish_reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_request_builder() {
        let req = CompletionRequest::new(vec![ChatMessage::user("hi")])
            .with_temperature(0.2)
            .with_max_tokens(256);
        assert!((req.temperature - 0.2).abs() < f32::EPSILON);
        assert_eq!(req.max_tokens, 256);
    }

    #[test]
    fn response_cost_uses_both_rates() {
        let resp = CompletionResponse {
            content: String::new(),
            input_tokens: 1_000_000,
            output_tokens: 1_000_000,
            finish_reason: FinishReason::Stop,
        };
        let cost = resp.cost(Decimal::new(3, 6), Decimal::new(15, 6));
        assert_eq!(cost, Decimal::new(18, 0));
    }

    #[test]
    fn provider_constructs_with_any_key() {
        // Auth failures surface at request time, not construction.
        let provider = AnthropicProvider::new(
            SecretString::from("test-key"),
            "claude-sonnet-4-20250514".into(),
        )
        .unwrap();
        assert_eq!(provider.model_name(), "claude-sonnet-4-20250514");
    }
}
