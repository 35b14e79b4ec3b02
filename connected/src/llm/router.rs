use anyhow::Result;
use common::LlmConfig;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use super::anthropic::AnthropicProvider;
use super::openai::OpenAiProvider;
use super::{Attempt, CompletionProvider, CompletionRequest};

/// One provider attempt recorded in the router metadata.
#[derive(Debug, Clone, Serialize)]
pub struct TriedProvider {
    pub provider: String,
    pub model: String,
    pub outcome: String,
    pub error: String,
}

/// Metadata describing how a routed completion was (or was not) produced.
#[derive(Debug, Clone, Serialize)]
pub struct RouterMeta {
    pub ok: bool,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub purpose: String,
    pub tried: Vec<TriedProvider>,
    pub error: Option<String>,
}

/// Ordered ladder of completion providers.
///
/// A retryable failure advances to the next provider; a fatal failure stops
/// immediately. A `None` result is never an error to propagate: callers fall
/// back to their deterministic output instead.
pub struct Router {
    providers: Vec<Box<dyn CompletionProvider>>,
}

impl Router {
    /// Build the ladder from configuration. Returns `Ok(None)` when no usable
    /// provider is configured (missing section or absent API key env var),
    /// which puts the whole pipeline into deterministic-fallback mode.
    pub fn from_config(cfg: Option<&LlmConfig>) -> Result<Option<Self>> {
        let Some(cfg) = cfg else {
            return Ok(None);
        };

        let mut providers: Vec<Box<dyn CompletionProvider>> = Vec::new();
        for name in cfg.ladder() {
            let Some(provider_cfg) = cfg.provider(name) else {
                warn!(provider = name, "provider named in ladder has no config section, skipping");
                continue;
            };
            let built: Result<Box<dyn CompletionProvider>> = match name {
                "openai" => OpenAiProvider::from_config(provider_cfg)
                    .map(|p| Box::new(p) as Box<dyn CompletionProvider>),
                "anthropic" => AnthropicProvider::from_config(provider_cfg)
                    .map(|p| Box::new(p) as Box<dyn CompletionProvider>),
                other => {
                    anyhow::bail!("unknown completion provider '{}'", other);
                }
            };
            match built {
                Ok(p) => providers.push(p),
                Err(e) => {
                    warn!(provider = name, error = %e, "provider unavailable, skipping");
                }
            }
        }

        if providers.is_empty() {
            Ok(None)
        } else {
            Ok(Some(Self { providers }))
        }
    }

    /// Test/bench constructor taking pre-built providers.
    pub fn with_providers(providers: Vec<Box<dyn CompletionProvider>>) -> Self {
        Self { providers }
    }

    /// Fold over the provider ladder until one succeeds or a fatal failure
    /// halts the sequence. All attempts made are reported in the metadata.
    pub async fn complete_json(&self, request: &CompletionRequest) -> (Option<Value>, RouterMeta) {
        let mut tried: Vec<TriedProvider> = Vec::new();

        for provider in &self.providers {
            match provider.complete(request).await {
                Attempt::Success { value, model } => {
                    info!(
                        provider = provider.name(),
                        model = %model,
                        purpose = %request.purpose,
                        "completion_ok"
                    );
                    return (
                        Some(value),
                        RouterMeta {
                            ok: true,
                            provider: Some(provider.name().to_string()),
                            model: Some(model),
                            purpose: request.purpose.clone(),
                            tried,
                            error: None,
                        },
                    );
                }
                Attempt::Retryable { reason } => {
                    warn!(
                        provider = provider.name(),
                        purpose = %request.purpose,
                        reason = %reason,
                        "completion_retryable_failure"
                    );
                    tried.push(TriedProvider {
                        provider: provider.name().to_string(),
                        model: provider.model().to_string(),
                        outcome: "retryable".to_string(),
                        error: reason,
                    });
                }
                Attempt::Fatal { reason } => {
                    warn!(
                        provider = provider.name(),
                        purpose = %request.purpose,
                        reason = %reason,
                        "completion_fatal_failure"
                    );
                    tried.push(TriedProvider {
                        provider: provider.name().to_string(),
                        model: provider.model().to_string(),
                        outcome: "fatal".to_string(),
                        error: reason,
                    });
                    break;
                }
            }
        }

        let error = tried
            .last()
            .map(|t| t.error.clone())
            .or_else(|| Some("no providers configured".to_string()));
        (
            None,
            RouterMeta {
                ok: false,
                provider: None,
                model: None,
                purpose: request.purpose.clone(),
                tried,
                error,
            },
        )
    }
}
