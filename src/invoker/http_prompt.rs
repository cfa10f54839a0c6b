//! ai-prompt handler for OpenAI-compatible chat completion APIs

use super::registry::{Invocation, StepHandler};
use crate::config::ProviderConfig;
use crate::error::StepError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// One configured provider endpoint
#[derive(Debug, Clone)]
struct Provider {
    base_url: String,
    api_key: Option<String>,
    model: Option<String>,
    timeout: Duration,
}

/// Sends `prompt` params to a chat completion endpoint
///
/// The node's `action` names the provider; with a single provider configured
/// it may be omitted. Params: `prompt` (required), `system`, `model`,
/// `temperature`, `maxTokens`.
#[derive(Debug, Clone)]
pub struct HttpPromptHandler {
    providers: HashMap<String, Provider>,
    client: reqwest::Client,
}

/// OpenAI-compatible chat completion request
#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
}

#[derive(Debug, Serialize)]
struct Message {
    role: &'static str,
    content: String,
}

/// OpenAI-compatible chat completion response
#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
    usage: Option<Value>,
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

impl HttpPromptHandler {
    /// Build a handler for every configured provider
    pub fn from_providers(providers: &HashMap<String, ProviderConfig>) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().build()?;
        let providers = providers
            .iter()
            .map(|(name, config)| {
                (
                    name.clone(),
                    Provider {
                        base_url: config.base_url.clone(),
                        api_key: config.resolved_api_key(),
                        model: config.model.clone(),
                        timeout: Duration::from_secs(config.timeout),
                    },
                )
            })
            .collect();
        Ok(Self { providers, client })
    }

    /// Use a preconfigured HTTP client
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    fn provider(&self, action: Option<&str>) -> Result<(&str, &Provider), StepError> {
        match action {
            Some(name) => self
                .providers
                .get_key_value(name)
                .map(|(k, v)| (k.as_str(), v))
                .ok_or_else(|| StepError::validation(format!("unknown provider '{}'", name))),
            None if self.providers.len() == 1 => self
                .providers
                .iter()
                .next()
                .map(|(k, v)| (k.as_str(), v))
                .ok_or_else(|| StepError::validation("no providers configured")),
            None => Err(StepError::validation(
                "ai-prompt node must name a provider in 'action'",
            )),
        }
    }

    fn build_request(provider: &Provider, params: &Value) -> Result<ChatCompletionRequest, StepError> {
        let prompt = params
            .get("prompt")
            .and_then(Value::as_str)
            .ok_or_else(|| StepError::validation("ai-prompt requires a string 'prompt' param"))?;

        let model = params
            .get("model")
            .and_then(Value::as_str)
            .map(String::from)
            .or_else(|| provider.model.clone())
            .ok_or_else(|| StepError::validation("no model set on the node or its provider"))?;

        let mut messages = Vec::new();
        if let Some(system) = params.get("system").and_then(Value::as_str) {
            messages.push(Message {
                role: "system",
                content: system.to_string(),
            });
        }
        messages.push(Message {
            role: "user",
            content: prompt.to_string(),
        });

        Ok(ChatCompletionRequest {
            model,
            messages,
            max_tokens: params.get("maxTokens").and_then(Value::as_u64),
            temperature: params.get("temperature").and_then(Value::as_f64),
        })
    }

    /// Map HTTP status to a step error
    fn map_http_error(status: reqwest::StatusCode, body: &str, elapsed: Duration) -> StepError {
        match status.as_u16() {
            401 | 403 => StepError::authorization(format!("HTTP {}: {}", status, body)),
            408 | 504 => StepError::timeout(elapsed),
            429 | 500..=599 => StepError::execution(format!("HTTP {}: {}", status, body)),
            400..=499 => StepError::validation(format!("HTTP {}: {}", status, body)),
            _ => StepError::execution(format!("unexpected HTTP {}: {}", status, body)),
        }
    }
}

fn chat_completion_url(base_url: &str) -> String {
    format!("{}/chat/completions", base_url.trim_end_matches('/'))
}

#[async_trait]
impl StepHandler for HttpPromptHandler {
    async fn handle(&self, invocation: &Invocation<'_>) -> Result<Value, StepError> {
        let (name, provider) = self.provider(invocation.action)?;
        let body = Self::build_request(provider, &invocation.params)?;
        let start = Instant::now();

        let mut request = self
            .client
            .post(chat_completion_url(&provider.base_url))
            .timeout(provider.timeout)
            .json(&body);
        if let Some(ref key) = provider.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                StepError::timeout(start.elapsed())
            } else {
                StepError::from_error(&e)
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::map_http_error(status, &body, start.elapsed()));
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| StepError::execution(format!("failed to parse response: {}", e)))?;

        let choice = completion.choices.into_iter().next();
        let finish_reason = choice.as_ref().and_then(|c| c.finish_reason.clone());
        let text = choice.and_then(|c| c.message.content).unwrap_or_default();
        let parsed = serde_json::from_str::<Value>(text.trim()).ok();

        tracing::debug!(
            provider = name,
            model = completion.model.as_deref().unwrap_or(&body.model),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Prompt completed"
        );

        Ok(json!({
            "text": text,
            "json": parsed,
            "model": completion.model.unwrap_or(body.model),
            "provider": name,
            "finishReason": finish_reason,
            "usage": completion.usage,
            "messages": [{"role": "assistant", "content": text}],
        }))
    }

    fn name(&self) -> &str {
        "http-prompt"
    }
}
