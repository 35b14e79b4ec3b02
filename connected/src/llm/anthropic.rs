use anyhow::{Context, Result};
use common::ProviderConfig;
use serde::Deserialize;
use std::time::Duration;

use super::{extract_json_object, Attempt, CompletionProvider, CompletionRequest};

const DEFAULT_API_URL: &str = "https://api.anthropic.com/v1/messages";
const DEFAULT_MODEL: &str = "claude-3-5-haiku-latest";
const API_VERSION: &str = "2023-06-01";

/// Error categories the Anthropic API reports that are worth advancing the
/// ladder for; everything else is treated as fatal.
const RETRYABLE_ERROR_TYPES: &[&str] = &["rate_limit_error", "overloaded_error", "api_error"];

/// Anthropic messages provider.
///
/// Retryable failures: rate-limit, timeout, connection, and server-side
/// error categories. Auth/request errors and non-JSON output are fatal.
pub struct AnthropicProvider {
    api_url: String,
    api_key: String,
    model: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn from_config(cfg: &ProviderConfig) -> Result<Self> {
        let api_key_env = cfg
            .api_key_env
            .as_deref()
            .context("anthropic provider config missing api_key_env")?;
        let api_key = std::env::var(api_key_env)
            .with_context(|| format!("API key env var '{}' not set", api_key_env))?;

        Ok(Self {
            api_url: cfg
                .api_url
                .clone()
                .unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            api_key,
            model: cfg.model.clone().unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            timeout: Duration::from_secs(cfg.timeout_seconds.unwrap_or(30)),
            client: reqwest::Client::new(),
        })
    }
}

#[async_trait::async_trait]
impl CompletionProvider for AnthropicProvider {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &CompletionRequest) -> Attempt {
        let body = serde_json::json!({
            "model": self.model,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "system": request.system,
            "messages": [
                {"role": "user", "content": request.user.to_string()},
            ],
        });

        let sent = tokio::time::timeout(
            self.timeout,
            self.client
                .post(&self.api_url)
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", API_VERSION)
                .header("Content-Type", "application/json")
                .json(&body)
                .send(),
        )
        .await;

        let response = match sent {
            Err(_) => {
                return Attempt::Retryable {
                    reason: "request timed out".to_string(),
                }
            }
            Ok(Err(e)) if e.is_timeout() || e.is_connect() => {
                return Attempt::Retryable {
                    reason: format!("transport error: {}", e),
                }
            }
            Ok(Err(e)) => {
                return Attempt::Fatal {
                    reason: format!("transport error: {}", e),
                }
            }
            Ok(Ok(r)) => r,
        };

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            let error_type = serde_json::from_str::<ErrorEnvelope>(&detail)
                .ok()
                .map(|e| e.error.error_type)
                .unwrap_or_default();
            let reason = format!("HTTP {} ({})", status, error_type);

            let retryable = status.as_u16() == 429
                || status.is_server_error()
                || RETRYABLE_ERROR_TYPES.contains(&error_type.as_str());
            return if retryable {
                Attempt::Retryable { reason }
            } else {
                Attempt::Fatal { reason }
            };
        }

        let parsed: MessagesResponse = match response.json().await {
            Ok(p) => p,
            Err(e) => {
                return Attempt::Fatal {
                    reason: format!("malformed messages response: {}", e),
                }
            }
        };

        let Some(text) = parsed
            .content
            .iter()
            .find(|b| b.block_type == "text")
            .map(|b| b.text.as_str())
        else {
            return Attempt::Fatal {
                reason: "messages response has no text block".to_string(),
            };
        };

        match extract_json_object(text) {
            Some(value) => Attempt::Success {
                value,
                model: parsed.model.unwrap_or_else(|| self.model.clone()),
            },
            None => Attempt::Fatal {
                reason: "completion output is not a JSON object".to_string(),
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    model: Option<String>,
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(rename = "type", default)]
    error_type: String,
}
