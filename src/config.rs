use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use summary_tree_core::chunk::ChunkerSettings;

use crate::hierarchy::BuildSettings;
use crate::invoke::RetryPolicy;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub prompts: PromptConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub input: InputConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    #[serde(default = "default_chars_per_token")]
    pub chars_per_token: usize,
    #[serde(default = "default_safety_margin")]
    pub safety_margin: usize,
    #[serde(default = "default_min_content_tokens")]
    pub min_content_tokens: usize,
    #[serde(default = "default_group_size")]
    pub group_size: usize,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_separator")]
    pub separator: String,
    #[serde(default = "default_fallback_chars")]
    pub fallback_chars: usize,
    #[serde(default)]
    pub keep_merge_input: bool,
    #[serde(default)]
    pub batch_timeout_secs: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chars_per_token: default_chars_per_token(),
            safety_margin: default_safety_margin(),
            min_content_tokens: default_min_content_tokens(),
            group_size: default_group_size(),
            max_concurrency: default_max_concurrency(),
            separator: default_separator(),
            fallback_chars: default_fallback_chars(),
            keep_merge_input: false,
            batch_timeout_secs: None,
        }
    }
}

fn default_chars_per_token() -> usize {
    4
}
fn default_safety_margin() -> usize {
    50
}
fn default_min_content_tokens() -> usize {
    50
}
fn default_group_size() -> usize {
    2
}
fn default_max_concurrency() -> usize {
    3
}
fn default_separator() -> String {
    "\n\n---\n\n".to_string()
}
fn default_fallback_chars() -> usize {
    500
}

impl EngineConfig {
    pub fn chunker_settings(&self) -> ChunkerSettings {
        ChunkerSettings {
            chars_per_token: self.chars_per_token,
            safety_margin: self.safety_margin,
            min_content_tokens: self.min_content_tokens,
        }
    }

    pub fn build_settings(&self) -> BuildSettings {
        BuildSettings {
            group_size: self.group_size,
            max_concurrency: self.max_concurrency,
            separator: self.separator.clone(),
            keep_merge_input: self.keep_merge_input,
            chars_per_token: self.chars_per_token,
        }
    }

    pub fn batch_timeout(&self) -> Option<Duration> {
        self.batch_timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModelConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    /// Environment variable holding the API key. Defaults per provider.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            url: None,
            api_key_env: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            max_attempts: default_max_attempts(),
            timeout_secs: default_timeout_secs(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_temperature() -> f32 {
    0.3
}
fn default_max_tokens() -> u32 {
    512
}
fn default_max_attempts() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    60
}
fn default_backoff_base_ms() -> u64 {
    1000
}
fn default_backoff_max_ms() -> u64 {
    16_000
}

impl ModelConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            attempt_timeout: Duration::from_secs(self.timeout_secs),
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            backoff_max: Duration::from_millis(self.backoff_max_ms),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PromptConfig {
    #[serde(default = "default_summary_prompt")]
    pub summary_prompt: String,
    #[serde(default = "default_context_prompt")]
    pub context_prompt: String,
    #[serde(default = "default_token_budget")]
    pub token_budget: usize,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            summary_prompt: default_summary_prompt(),
            context_prompt: default_context_prompt(),
            token_budget: default_token_budget(),
        }
    }
}

fn default_summary_prompt() -> String {
    "Summarize the following text concisely. Keep names, dates, figures and conclusions."
        .to_string()
}
fn default_context_prompt() -> String {
    "The input consists of summaries of consecutive sections of the same material.".to_string()
}
fn default_token_budget() -> usize {
    2048
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7341".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct InputConfig {
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
            follow_symlinks: false,
        }
    }
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*.md".to_string(), "**/*.txt".to_string()]
}

impl Config {
    /// Configuration used when no file is available: a local database and
    /// every other section at its defaults.
    pub fn minimal() -> Self {
        Self {
            db: DbConfig {
                path: PathBuf::from("./data/sumtree.sqlite"),
            },
            engine: EngineConfig::default(),
            model: ModelConfig::default(),
            prompts: PromptConfig::default(),
            server: ServerConfig::default(),
            input: InputConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    let engine = &config.engine;
    if engine.chars_per_token == 0 {
        anyhow::bail!("engine.chars_per_token must be > 0");
    }
    if engine.min_content_tokens == 0 {
        anyhow::bail!("engine.min_content_tokens must be > 0");
    }
    if engine.group_size < 2 {
        anyhow::bail!("engine.group_size must be >= 2");
    }
    if !(1..=16).contains(&engine.max_concurrency) {
        anyhow::bail!("engine.max_concurrency must be in [1, 16]");
    }
    if engine.batch_timeout_secs == Some(0) {
        anyhow::bail!("engine.batch_timeout_secs must be > 0 when set");
    }

    let model = &config.model;
    if model.max_attempts == 0 {
        anyhow::bail!("model.max_attempts must be >= 1");
    }
    if model.timeout_secs == 0 {
        anyhow::bail!("model.timeout_secs must be > 0");
    }
    if !(0.0..=2.0).contains(&model.temperature) {
        anyhow::bail!("model.temperature must be in [0.0, 2.0]");
    }

    match model.provider.as_str() {
        "disabled" | "mock" => {}
        "openai" | "ollama" | "anthropic" | "gemini" => {
            if model.model.is_none() {
                anyhow::bail!(
                    "model.model must be specified when provider is '{}'",
                    model.provider
                );
            }
        }
        other => anyhow::bail!(
            "Unknown model provider: '{}'. Must be disabled, mock, openai, ollama, anthropic, or gemini.",
            other
        ),
    }

    if config.prompts.token_budget == 0 {
        anyhow::bail!("prompts.token_budget must be > 0");
    }

    Ok(())
}
