//! Typed errors raised by the pure algorithms in this crate.

use thiserror::Error;

/// Errors raised while chunking input text.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChunkError {
    /// The prompt overhead and safety margin leave too little room for content.
    #[error(
        "token budget too small: budget {budget} - prompt overhead {overhead} - safety margin {safety_margin} leaves {available} tokens, need at least {minimum}"
    )]
    BudgetTooSmall {
        budget: usize,
        overhead: usize,
        safety_margin: usize,
        available: i64,
        minimum: usize,
    },

    /// The content contains no extractable text.
    #[error("input contains no extractable text")]
    EmptyInput,
}

/// Store failures callers need to tell apart from I/O errors.
///
/// Stores return these inside `anyhow::Error`; callers recover them with
/// `downcast_ref::<StoreError>()`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("batch already exists: {0}")]
    BatchExists(String),
}
