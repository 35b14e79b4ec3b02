use anyhow::{Context, Result};
use common::ProviderConfig;
use serde::Deserialize;
use std::time::Duration;

use super::{extract_json_object, Attempt, CompletionProvider, CompletionRequest};

const DEFAULT_API_URL: &str = "https://api.openai.com/v1/chat/completions";
const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// OpenAI chat-completions provider.
///
/// Retryable failures: HTTP 429, 5xx, and transport timeouts. Everything
/// else (4xx, connection errors, unparsable or non-JSON output) is fatal and
/// stops the provider ladder.
pub struct OpenAiProvider {
    api_url: String,
    api_key: String,
    model: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl OpenAiProvider {
    pub fn from_config(cfg: &ProviderConfig) -> Result<Self> {
        let api_key_env = cfg
            .api_key_env
            .as_deref()
            .context("openai provider config missing api_key_env")?;
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
impl CompletionProvider for OpenAiProvider {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &CompletionRequest) -> Attempt {
        let body = serde_json::json!({
            "model": self.model,
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
            "messages": [
                {"role": "system", "content": request.system},
                {"role": "user", "content": request.user.to_string()},
            ],
        });

        let sent = tokio::time::timeout(
            self.timeout,
            self.client
                .post(&self.api_url)
                .header("Authorization", format!("Bearer {}", self.api_key))
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
            Ok(Err(e)) if e.is_timeout() => {
                return Attempt::Retryable {
                    reason: format!("transport timeout: {}", e),
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
        if status.as_u16() == 429 || status.is_server_error() {
            let detail = response.text().await.unwrap_or_default();
            return Attempt::Retryable {
                reason: format!("HTTP {}: {}", status, truncate(&detail, 200)),
            };
        }
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Attempt::Fatal {
                reason: format!("HTTP {}: {}", status, truncate(&detail, 200)),
            };
        }

        let parsed: ChatResponse = match response.json().await {
            Ok(p) => p,
            Err(e) => {
                return Attempt::Fatal {
                    reason: format!("malformed completion response: {}", e),
                }
            }
        };

        let Some(content) = parsed.choices.first().map(|c| c.message.content.as_str()) else {
            return Attempt::Fatal {
                reason: "completion response has no choices".to_string(),
            };
        };

        match extract_json_object(content) {
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

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    model: Option<String>,
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: String,
}
