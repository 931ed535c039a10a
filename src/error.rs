//! Error taxonomy for the engine and the model invoker.
//!
//! [`InvokeError`] describes one failed attempt to reach the language
//! model; the invoker retries or falls back on it and never lets it escape
//! a batch. [`EngineError`] is what callers of the engine see: structural
//! failures that stop a batch, each carrying enough context (batch id,
//! level, cause) to diagnose or resume.

use std::time::Duration;
use thiserror::Error;

use summary_tree_core::error::ChunkError;

/// A single failed model call.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InvokeError {
    #[error("model call timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("model service returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("malformed model response: {0}")]
    Malformed(String),

    #[error("model provider is disabled")]
    Disabled,
}

impl InvokeError {
    /// Timeouts, transport errors, 429, 5xx and malformed responses are
    /// worth another attempt; other client errors are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            InvokeError::Timeout(_) | InvokeError::Transport(_) | InvokeError::Malformed(_) => {
                true
            }
            InvokeError::Http { status, .. } => *status == 429 || *status >= 500,
            InvokeError::Disabled => false,
        }
    }
}

/// Failures surfaced by the engine and the query surface.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Prompt overhead leaves no room for content.
    #[error("batch {batch_id}: {source}")]
    BudgetTooSmall {
        batch_id: String,
        #[source]
        source: ChunkError,
    },

    /// Nothing to summarize. Raised before any model call.
    #[error("input contains no extractable text")]
    EmptyInput,

    #[error("persistence failure for batch {batch_id} at level {level}: {cause}")]
    Persistence {
        batch_id: String,
        level: u32,
        cause: String,
    },

    #[error("batch {batch_id} cancelled at level {level}: {reason}")]
    Cancelled {
        batch_id: String,
        level: u32,
        reason: String,
    },

    #[error("batch already exists: {0}")]
    BatchExists(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("worker task failed for batch {batch_id} at level {level}: {cause}")]
    Worker {
        batch_id: String,
        level: u32,
        cause: String,
    },
}

impl EngineError {
    /// Wrap a storage error with the batch and level it happened at.
    pub fn persistence(batch_id: &str, level: u32, err: anyhow::Error) -> Self {
        EngineError::Persistence {
            batch_id: batch_id.to_string(),
            level,
            cause: format!("{:#}", err),
        }
    }

    /// Short machine-readable code, shared by the HTTP surface and logs.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::BudgetTooSmall { .. } => "budget_too_small",
            EngineError::EmptyInput => "empty_input",
            EngineError::Persistence { .. } => "persistence",
            EngineError::Cancelled { .. } => "cancelled",
            EngineError::BatchExists(_) => "conflict",
            EngineError::InvalidRequest(_) => "bad_request",
            EngineError::NotFound(_) => "not_found",
            EngineError::Worker { .. } => "internal",
        }
    }
}
