//! Language-model capability and provider implementations.
//!
//! The engine only depends on [`LanguageModel`]: messages in, a raw
//! provider response out. Turning that response into text is the job of
//! the normalization chain in `summary_tree_core::normalize`, and retries,
//! timeouts and fallbacks belong to [`crate::invoke::ResilientInvoker`].
//!
//! Providers:
//! - **[`DisabledModel`]**: always fails; every node becomes a fallback.
//! - **[`MockModel`]**: offline stand-in echoing `"Summary: "` plus the
//!   first sentence of the input.
//! - **[`HttpModel`]**: OpenAI chat completions, Ollama `/api/chat`,
//!   Anthropic messages and Gemini `generateContent` over `reqwest`.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use summary_tree_core::sentence::first_sentence;

use crate::config::ModelConfig;
use crate::error::InvokeError;

/// One chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Sampling options forwarded to the provider.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InvokeOptions {
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for InvokeOptions {
    fn default() -> Self {
        Self {
            temperature: 0.3,
            max_tokens: 512,
        }
    }
}

impl From<&ModelConfig> for InvokeOptions {
    fn from(config: &ModelConfig) -> Self {
        Self {
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        }
    }
}

/// An external language-model service.
///
/// Implementations return the provider's response body untouched; a body
/// that is not JSON should be returned as a JSON string.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Identifier used in logs, e.g. `"openai:gpt-4o-mini"`.
    fn name(&self) -> &str;

    async fn invoke(
        &self,
        messages: &[ChatMessage],
        options: &InvokeOptions,
    ) -> Result<Value, InvokeError>;
}

/// Build the model selected by `model.provider`.
pub fn create_model(config: &ModelConfig) -> Result<Arc<dyn LanguageModel>> {
    if !config.is_enabled() {
        tracing::warn!("model provider disabled; every summary will be an extractive fallback");
        return Ok(Arc::new(DisabledModel));
    }
    match config.provider.as_str() {
        "mock" => Ok(Arc::new(MockModel)),
        "openai" | "ollama" | "anthropic" | "gemini" => Ok(Arc::new(HttpModel::new(config)?)),
        other => bail!("Unknown model provider: {}", other),
    }
}

// ============ Disabled ============

pub struct DisabledModel;

#[async_trait]
impl LanguageModel for DisabledModel {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn invoke(
        &self,
        _messages: &[ChatMessage],
        _options: &InvokeOptions,
    ) -> Result<Value, InvokeError> {
        Err(InvokeError::Disabled)
    }
}

// ============ Mock ============

/// Deterministic offline model.
///
/// Replies in the OpenAI chat shape with `"Summary: "` followed by the first
/// sentence of the last user message.
pub struct MockModel;

#[async_trait]
impl LanguageModel for MockModel {
    fn name(&self) -> &str {
        "mock"
    }

    async fn invoke(
        &self,
        messages: &[ChatMessage],
        _options: &InvokeOptions,
    ) -> Result<Value, InvokeError> {
        let input = messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.as_str())
            .unwrap_or_default();
        Ok(json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": format!("Summary: {}", first_sentence(input))
                }
            }]
        }))
    }
}

// ============ HTTP providers ============

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Provider {
    OpenAi,
    Ollama,
    Anthropic,
    Gemini,
}

impl Provider {
    fn parse(name: &str) -> Result<Self> {
        Ok(match name {
            "openai" => Provider::OpenAi,
            "ollama" => Provider::Ollama,
            "anthropic" => Provider::Anthropic,
            "gemini" => Provider::Gemini,
            other => bail!("Unknown model provider: {}", other),
        })
    }

    fn default_url(&self) -> &'static str {
        match self {
            Provider::OpenAi => "https://api.openai.com",
            Provider::Ollama => "http://localhost:11434",
            Provider::Anthropic => "https://api.anthropic.com",
            Provider::Gemini => "https://generativelanguage.googleapis.com",
        }
    }

    fn default_key_env(&self) -> Option<&'static str> {
        match self {
            Provider::OpenAi => Some("OPENAI_API_KEY"),
            Provider::Ollama => None,
            Provider::Anthropic => Some("ANTHROPIC_API_KEY"),
            Provider::Gemini => Some("GEMINI_API_KEY"),
        }
    }
}

/// A hosted or local model reached over HTTP.
pub struct HttpModel {
    provider: Provider,
    name: String,
    model: String,
    url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpModel {
    pub fn new(config: &ModelConfig) -> Result<Self> {
        let provider = Provider::parse(&config.provider)?;
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("model.model required for provider {}", config.provider))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| provider.default_url().to_string())
            .trim_end_matches('/')
            .to_string();

        let key_env = config
            .api_key_env
            .clone()
            .or_else(|| provider.default_key_env().map(str::to_string));
        let api_key = match key_env {
            Some(var) => match std::env::var(&var) {
                Ok(key) => Some(key),
                // Ollama and self-hosted gateways may run without a key.
                Err(_) if provider == Provider::Ollama || config.url.is_some() => None,
                Err(_) => bail!("{} not set", var),
            },
            None => None,
        };

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            provider,
            name: format!("{}:{}", config.provider, model),
            model,
            url,
            api_key,
            client,
        })
    }

    fn request(&self, messages: &[ChatMessage], options: &InvokeOptions) -> reqwest::RequestBuilder {
        match self.provider {
            Provider::OpenAi => {
                let req = self
                    .client
                    .post(format!("{}/v1/chat/completions", self.url))
                    .json(&json!({
                        "model": self.model,
                        "messages": messages,
                        "temperature": options.temperature,
                        "max_tokens": options.max_tokens,
                    }));
                match &self.api_key {
                    Some(key) => req.bearer_auth(key),
                    None => req,
                }
            }
            Provider::Ollama => self.client.post(format!("{}/api/chat", self.url)).json(&json!({
                "model": self.model,
                "messages": messages,
                "stream": false,
                "options": {
                    "temperature": options.temperature,
                    "num_predict": options.max_tokens,
                },
            })),
            Provider::Anthropic => {
                let system: Vec<&str> = messages
                    .iter()
                    .filter(|m| m.role == "system")
                    .map(|m| m.content.as_str())
                    .collect();
                let turns: Vec<&ChatMessage> =
                    messages.iter().filter(|m| m.role != "system").collect();
                let req = self
                    .client
                    .post(format!("{}/v1/messages", self.url))
                    .header("anthropic-version", "2023-06-01")
                    .json(&json!({
                        "model": self.model,
                        "system": system.join("\n\n"),
                        "messages": turns,
                        "temperature": options.temperature,
                        "max_tokens": options.max_tokens,
                    }));
                match &self.api_key {
                    Some(key) => req.header("x-api-key", key),
                    None => req,
                }
            }
            Provider::Gemini => {
                let system: Vec<&str> = messages
                    .iter()
                    .filter(|m| m.role == "system")
                    .map(|m| m.content.as_str())
                    .collect();
                let contents: Vec<Value> = messages
                    .iter()
                    .filter(|m| m.role != "system")
                    .map(|m| {
                        let role = if m.role == "assistant" { "model" } else { "user" };
                        json!({ "role": role, "parts": [{ "text": m.content }] })
                    })
                    .collect();
                let req = self
                    .client
                    .post(format!(
                        "{}/v1beta/models/{}:generateContent",
                        self.url, self.model
                    ))
                    .json(&json!({
                        "systemInstruction": { "parts": [{ "text": system.join("\n\n") }] },
                        "contents": contents,
                        "generationConfig": {
                            "temperature": options.temperature,
                            "maxOutputTokens": options.max_tokens,
                        },
                    }));
                match &self.api_key {
                    Some(key) => req.query(&[("key", key)]),
                    None => req,
                }
            }
        }
    }
}

#[async_trait]
impl LanguageModel for HttpModel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(
        &self,
        messages: &[ChatMessage],
        options: &InvokeOptions,
    ) -> Result<Value, InvokeError> {
        let response = self
            .request(messages, options)
            .send()
            .await
            .map_err(|e| InvokeError::Transport(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| InvokeError::Transport(e.to_string()))?;

        if !status.is_success() {
            return Err(InvokeError::Http {
                status: status.as_u16(),
                body: truncate_body(&body),
            });
        }

        Ok(parse_body(body))
    }
}

/// Parse a response body as JSON, passing anything else through as a string.
pub fn parse_body(body: String) -> Value {
    serde_json::from_str(&body).unwrap_or(Value::String(body))
}

fn truncate_body(body: &str) -> String {
    const MAX: usize = 500;
    let cut = summary_tree_core::tokens::take_chars(body, MAX);
    if cut.len() < body.len() {
        format!("{}...", cut)
    } else {
        body.to_string()
    }
}
