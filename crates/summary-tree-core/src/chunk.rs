//! Sentence-boundary text chunker with a token budget.
//!
//! Splits content into [`TextChunk`]s that each fit a content budget
//! derived from the caller's total token budget:
//!
//! ```text
//! content_budget = token_budget - estimate(prompt_overhead) - safety_margin
//! ```
//!
//! Sentences are packed greedily in source order. A sentence that alone
//! exceeds the budget is wrapped on word boundaries (and a single oversized
//! word is cut on character boundaries), so nothing is dropped and every
//! chunk stays within budget.
//!
//! Each chunk carries a SHA-256 hash of its text for provenance.

use sha2::{Digest, Sha256};

use crate::error::ChunkError;
use crate::sentence::split_sentences;
use crate::tokens::{take_chars, TokenEstimator, DEFAULT_CHARS_PER_TOKEN};

/// Default tokens reserved on top of the prompt overhead.
pub const DEFAULT_SAFETY_MARGIN: usize = 50;

/// Default minimum content budget below which chunking is refused.
pub const DEFAULT_MIN_CONTENT_TOKENS: usize = 50;

/// Tuning knobs for [`Chunker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkerSettings {
    pub chars_per_token: usize,
    pub safety_margin: usize,
    pub min_content_tokens: usize,
}

impl Default for ChunkerSettings {
    fn default() -> Self {
        Self {
            chars_per_token: DEFAULT_CHARS_PER_TOKEN,
            safety_margin: DEFAULT_SAFETY_MARGIN,
            min_content_tokens: DEFAULT_MIN_CONTENT_TOKENS,
        }
    }
}

/// A token-bounded slice of a document, aligned to sentence boundaries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    /// Position of the chunk within its document, starting at 0.
    pub index: usize,
    pub content: String,
    pub token_count: usize,
    /// Hex SHA-256 of `content`.
    pub hash: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Chunker {
    settings: ChunkerSettings,
}

impl Chunker {
    pub fn new(settings: ChunkerSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &ChunkerSettings {
        &self.settings
    }

    pub fn estimator(&self) -> TokenEstimator {
        TokenEstimator::new(self.settings.chars_per_token)
    }

    /// Tokens left for content after the prompt overhead and safety margin.
    ///
    /// Fails with [`ChunkError::BudgetTooSmall`] when the result is below
    /// the configured minimum.
    pub fn content_budget(
        &self,
        prompt_overhead: &str,
        token_budget: usize,
    ) -> Result<usize, ChunkError> {
        let overhead = self.estimator().estimate(prompt_overhead);
        let available =
            token_budget as i64 - overhead as i64 - self.settings.safety_margin as i64;
        let minimum = self.settings.min_content_tokens.max(1);
        if available < minimum as i64 {
            return Err(ChunkError::BudgetTooSmall {
                budget: token_budget,
                overhead,
                safety_margin: self.settings.safety_margin,
                available,
                minimum,
            });
        }
        Ok(available as usize)
    }

    /// Split `content` into chunks that fit the content budget.
    ///
    /// Chunk indices are contiguous from 0 and follow source order.
    pub fn chunk(
        &self,
        content: &str,
        prompt_overhead: &str,
        token_budget: usize,
    ) -> Result<Vec<TextChunk>, ChunkError> {
        let budget = self.content_budget(prompt_overhead, token_budget)?;
        let sentences = split_sentences(content);
        if sentences.is_empty() {
            return Err(ChunkError::EmptyInput);
        }

        let estimator = self.estimator();
        let cpt = estimator.chars_per_token();
        let mut pieces: Vec<String> = Vec::new();
        let mut current = String::new();
        let mut current_chars = 0usize;

        for sentence in sentences {
            let sentence_chars = sentence.chars().count();
            if sentence_chars.div_ceil(cpt) > budget {
                if !current.is_empty() {
                    pieces.push(std::mem::take(&mut current));
                    current_chars = 0;
                }
                pieces.extend(wrap_oversized(&sentence, budget, &estimator));
                continue;
            }

            if current.is_empty() {
                current = sentence;
                current_chars = sentence_chars;
                continue;
            }

            // Sentences are whitespace-normalized, so the joined estimate
            // is exact: existing chars + one space + the new sentence.
            let joined_chars = current_chars + 1 + sentence_chars;
            if joined_chars.div_ceil(cpt) > budget {
                pieces.push(std::mem::replace(&mut current, sentence));
                current_chars = sentence_chars;
            } else {
                current.push(' ');
                current.push_str(&sentence);
                current_chars = joined_chars;
            }
        }

        if !current.is_empty() {
            pieces.push(current);
        }

        Ok(pieces
            .into_iter()
            .enumerate()
            .map(|(index, text)| make_chunk(index, text, &estimator))
            .collect())
    }
}

/// Break one oversized sentence into word-wrapped pieces within `budget`.
fn wrap_oversized(sentence: &str, budget: usize, estimator: &TokenEstimator) -> Vec<String> {
    let max_chars = budget * estimator.chars_per_token();
    let mut pieces = Vec::new();
    let mut current = String::new();

    for word in sentence.split(' ') {
        let mut word = word;
        while word.chars().count() > max_chars {
            if !current.is_empty() {
                pieces.push(std::mem::take(&mut current));
            }
            let head = take_chars(word, max_chars);
            pieces.push(head.to_string());
            word = &word[head.len()..];
        }
        if word.is_empty() {
            continue;
        }
        let would_be = if current.is_empty() {
            word.chars().count()
        } else {
            current.chars().count() + 1 + word.chars().count()
        };
        if would_be > max_chars {
            pieces.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }

    if !current.is_empty() {
        pieces.push(current);
    }
    pieces
}

fn make_chunk(index: usize, content: String, estimator: &TokenEstimator) -> TextChunk {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    let hash = format!("{:x}", hasher.finalize());
    TextChunk {
        index,
        token_count: estimator.estimate(&content),
        content,
        hash,
    }
}
