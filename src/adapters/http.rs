//! HTTP provider gateway.
//!
//! Speaks two wire formats: OpenAI-style chat completions (used for `openai`
//! and any provider configured with a compatible base URL) and the Anthropic
//! messages API.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, instrument};

use super::{
    Credentials, Generation, GenerationParams, Message, ProviderError, ProviderGateway, Role,
    TokenUsage,
};

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const ANTHROPIC_DEFAULT_MAX_TOKENS: u64 = 1024;

/// Provider gateway over HTTPS
pub struct HttpProviderGateway {
    client: reqwest::Client,

    /// Provider name -> base URL override
    base_urls: HashMap<String, String>,
}

impl Default for HttpProviderGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpProviderGateway {
    /// Create a gateway with the built-in endpoints
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            base_urls: HashMap::new(),
        }
    }

    /// Override the base URL for a provider
    pub fn with_base_url(mut self, provider: impl Into<String>, base_url: impl Into<String>) -> Self {
        self.base_urls.insert(provider.into(), base_url.into());
        self
    }

    fn base_url(&self, provider: &str, credentials: &Credentials) -> Result<String, ProviderError> {
        let url = credentials
            .base_url
            .clone()
            .or_else(|| self.base_urls.get(provider).cloned())
            .or_else(|| match provider {
                "openai" => Some(OPENAI_BASE_URL.to_string()),
                "anthropic" => Some(ANTHROPIC_BASE_URL.to_string()),
                _ => None,
            })
            .ok_or_else(|| ProviderError::Provider {
                message: format!("No base URL configured for provider '{}'", provider),
            })?;

        Ok(url.trim_end_matches('/').to_string())
    }

    async fn openai_chat(
        &self,
        base_url: &str,
        credentials: &Credentials,
        messages: &[Message],
        params: &GenerationParams,
    ) -> Result<Generation, ProviderError> {
        let mut body = json!({
            "model": params.model,
            "messages": messages,
        });
        if let Some(temperature) = params.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(max_tokens) = params.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }

        let mut request = self
            .client
            .post(format!("{}/chat/completions", base_url))
            .bearer_auth(credentials.api_key())
            .json(&body);
        if let Some(ref organization) = credentials.organization {
            request = request.header("OpenAI-Organization", organization);
        }

        let response = request.send().await.map_err(transport_error)?;
        let parsed: OpenAiResponse = parse_response(response).await?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ProviderError::Provider {
                message: "Response contained no choices".to_string(),
            })?;

        let usage = parsed.usage.unwrap_or_default();
        Ok(Generation {
            content,
            usage: TokenUsage {
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
            },
        })
    }

    async fn anthropic_messages(
        &self,
        base_url: &str,
        credentials: &Credentials,
        messages: &[Message],
        params: &GenerationParams,
    ) -> Result<Generation, ProviderError> {
        let system: Vec<&str> = messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect();
        let turns: Vec<&Message> = messages.iter().filter(|m| m.role != Role::System).collect();

        let mut body = json!({
            "model": params.model,
            "messages": turns,
            "max_tokens": params.max_tokens.unwrap_or(ANTHROPIC_DEFAULT_MAX_TOKENS),
        });
        if !system.is_empty() {
            body["system"] = json!(system.join("\n\n"));
        }
        if let Some(temperature) = params.temperature {
            body["temperature"] = json!(temperature);
        }

        let response = self
            .client
            .post(format!("{}/messages", base_url))
            .header("x-api-key", credentials.api_key())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;
        let parsed: AnthropicResponse = parse_response(response).await?;

        let content = parsed
            .content
            .into_iter()
            .filter_map(|block| block.text)
            .collect::<Vec<_>>()
            .join("");

        Ok(Generation {
            content,
            usage: TokenUsage {
                prompt_tokens: parsed.usage.input_tokens,
                completion_tokens: parsed.usage.output_tokens,
            },
        })
    }
}

#[async_trait]
impl ProviderGateway for HttpProviderGateway {
    #[instrument(skip(self, credentials, messages, params), fields(model = %params.model))]
    async fn generate(
        &self,
        provider: &str,
        credentials: &Credentials,
        messages: &[Message],
        params: &GenerationParams,
    ) -> Result<Generation, ProviderError> {
        let base_url = self.base_url(provider, credentials)?;
        debug!(%base_url, messages = messages.len(), "Calling provider");

        match provider {
            "anthropic" => {
                self.anthropic_messages(&base_url, credentials, messages, params)
                    .await
            }
            _ => self.openai_chat(&base_url, credentials, messages, params).await,
        }
    }
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    #[serde(default)]
    choices: Vec<OpenAiChoice>,
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAiMessage {
    content: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct OpenAiUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    #[serde(default)]
    content: Vec<AnthropicBlock>,
    #[serde(default)]
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
struct AnthropicBlock {
    text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

fn transport_error(err: reqwest::Error) -> ProviderError {
    ProviderError::Provider {
        message: format!("Request failed: {}", err),
    }
}

/// Decode a success body, or classify the failure
async fn parse_response<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, ProviderError> {
    let status = response.status();

    if !status.is_success() {
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.text().await.unwrap_or_default();
        return Err(classify_status(status, retry_after.as_deref(), &body));
    }

    response.json().await.map_err(|e| ProviderError::Provider {
        message: format!("Failed to parse provider response: {}", e),
    })
}

/// Map an HTTP failure onto the provider error taxonomy
pub(crate) fn classify_status(status: StatusCode, retry_after: Option<&str>, body: &str) -> ProviderError {
    let message = error_message(body).unwrap_or_else(|| format!("HTTP {}", status.as_u16()));

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ProviderError::Authentication { message },
        StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimit {
            retry_after: retry_after
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs),
        },
        _ => ProviderError::Provider {
            message: format!("HTTP {}: {}", status.as_u16(), message),
        },
    }
}

/// Pull `error.message` out of a JSON error body
fn error_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value
        .pointer("/error/message")
        .and_then(|m| m.as_str())
        .map(str::to_string)
}
