//! Resilient model invocation: retry with backoff, per-attempt timeout,
//! response normalization and fallback synthesis.
//!
//! One call to [`ResilientInvoker::invoke`] is one logical summarization
//! request. It never fails: when every attempt is exhausted (or the error
//! is not worth retrying) it returns a deterministic fallback summary that
//! is flagged in the [`InvokeOutcome`], so the hierarchy always has
//! something to merge upward.
//!
//! # Retry Strategy
//!
//! - Timeout, transport error, HTTP 429 / 5xx, malformed response → retry
//! - Other HTTP 4xx, disabled provider → fall back immediately
//! - Backoff before retry `n`: `backoff_base * 2^(n-1)`, capped at `backoff_max`

use std::sync::Arc;
use std::time::Duration;

use summary_tree_core::normalize::extract_text;
use summary_tree_core::tokens::{normalize_whitespace, take_chars};

use crate::error::InvokeError;
use crate::llm::{ChatMessage, InvokeOptions, LanguageModel};

/// Prefix marking synthesized summaries.
pub const FALLBACK_PREFIX: &str = "[fallback summary]";

/// Attempt bound, per-attempt timeout and backoff schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Zero is treated as one.
    pub max_attempts: u32,
    pub attempt_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            attempt_timeout: Duration::from_secs(60),
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(16),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry.saturating_sub(1)).unwrap_or(u32::MAX);
        self.backoff_base
            .checked_mul(factor)
            .unwrap_or(self.backoff_max)
            .min(self.backoff_max)
    }
}

/// Result of one logical invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvokeOutcome {
    pub text: String,
    /// True when `text` was synthesized instead of produced by the model.
    pub fallback: bool,
    pub attempts: u32,
    pub retries: u32,
    /// Response shape the text was extracted from.
    pub shape: Option<&'static str>,
    /// Error of the last failed attempt, if any attempt failed.
    pub last_error: Option<String>,
}

impl InvokeOutcome {
    pub fn source(&self) -> &'static str {
        if self.fallback {
            "fallback"
        } else {
            "model"
        }
    }
}

/// Wraps a [`LanguageModel`] with the resilience policy.
pub struct ResilientInvoker {
    model: Arc<dyn LanguageModel>,
    policy: RetryPolicy,
    options: InvokeOptions,
    fallback_chars: usize,
}

impl ResilientInvoker {
    pub fn new(model: Arc<dyn LanguageModel>, policy: RetryPolicy) -> Self {
        Self {
            model,
            policy,
            options: InvokeOptions::default(),
            fallback_chars: 500,
        }
    }

    pub fn with_options(mut self, options: InvokeOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_fallback_chars(mut self, chars: usize) -> Self {
        self.fallback_chars = chars.max(1);
        self
    }

    pub fn model_name(&self) -> &str {
        self.model.name()
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Summarize `content` under `prompt` with the default options.
    pub async fn invoke(&self, prompt: &str, content: &str) -> InvokeOutcome {
        self.invoke_with(prompt, content, &self.options).await
    }

    /// Summarize `content` under `prompt`.
    pub async fn invoke_with(
        &self,
        prompt: &str,
        content: &str,
        options: &InvokeOptions,
    ) -> InvokeOutcome {
        let messages = [ChatMessage::system(prompt), ChatMessage::user(content)];
        let max_attempts = self.policy.max_attempts.max(1);
        let mut last_error: Option<InvokeError> = None;
        let mut attempts = 0u32;

        while attempts < max_attempts {
            if attempts > 0 {
                tokio::time::sleep(self.policy.delay_for(attempts)).await;
            }
            attempts += 1;

            let result = match tokio::time::timeout(
                self.policy.attempt_timeout,
                self.model.invoke(&messages, options),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(InvokeError::Timeout(self.policy.attempt_timeout)),
            };

            let extracted = result.and_then(|value| {
                extract_text(&value).ok_or_else(|| {
                    InvokeError::Malformed(format!("no text field in {}", describe(&value)))
                })
            });

            match extracted {
                Ok(found) => {
                    if attempts > 1 {
                        tracing::info!(
                            model = self.model.name(),
                            attempt = attempts,
                            "model call succeeded after retry"
                        );
                    }
                    return InvokeOutcome {
                        text: found.text,
                        fallback: false,
                        attempts,
                        retries: attempts - 1,
                        shape: Some(found.shape),
                        last_error: last_error.map(|e| e.to_string()),
                    };
                }
                Err(err) => {
                    let retryable = err.is_retryable();
                    tracing::warn!(
                        model = self.model.name(),
                        attempt = attempts,
                        max_attempts,
                        retryable,
                        error = %err,
                        "model call failed"
                    );
                    last_error = Some(err);
                    if !retryable {
                        break;
                    }
                }
            }
        }

        tracing::warn!(
            model = self.model.name(),
            attempts,
            "falling back to excerpt summary"
        );
        InvokeOutcome {
            text: fallback_summary(content, self.fallback_chars),
            fallback: true,
            attempts,
            retries: attempts.saturating_sub(1),
            shape: None,
            last_error: last_error.map(|e| e.to_string()),
        }
    }
}

/// Deterministic substitute summary: a labeled, word-bounded excerpt of
/// the input.
pub fn fallback_summary(content: &str, max_chars: usize) -> String {
    let normalized = normalize_whitespace(content);
    let prefix = take_chars(&normalized, max_chars);
    let excerpt = if prefix.len() == normalized.len() {
        prefix.to_string()
    } else {
        let cut = match prefix.rfind(' ') {
            Some(pos) if pos > 0 && !normalized[prefix.len()..].starts_with(' ') => &prefix[..pos],
            _ => prefix,
        };
        format!("{}...", cut)
    };
    format!("{} {}", FALLBACK_PREFIX, excerpt)
}

fn describe(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let keys: Vec<&str> = map.keys().map(String::as_str).collect();
            format!("object with keys [{}]", keys.join(", "))
        }
        serde_json::Value::Array(items) => format!("array of {}", items.len()),
        serde_json::Value::String(_) => "empty string".to_string(),
        serde_json::Value::Null => "null".to_string(),
        other => format!("{}", other),
    }
}
