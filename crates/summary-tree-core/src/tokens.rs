//! Length-based token estimation.
//!
//! Models tokenize differently, so the engine never tries to count tokens
//! exactly. [`TokenEstimator`] collapses whitespace and divides the
//! character count by a fixed characters-per-token ratio, rounding up.
//! Treat the result as a budget heuristic.

/// Default characters-per-token ratio.
pub const DEFAULT_CHARS_PER_TOKEN: usize = 4;

/// Deterministic token estimator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenEstimator {
    chars_per_token: usize,
}

impl TokenEstimator {
    /// Create an estimator. A ratio of zero is treated as one.
    pub fn new(chars_per_token: usize) -> Self {
        Self {
            chars_per_token: chars_per_token.max(1),
        }
    }

    pub fn chars_per_token(&self) -> usize {
        self.chars_per_token
    }

    /// Estimate the token count of `text`.
    pub fn estimate(&self, text: &str) -> usize {
        let chars = normalized_char_count(text);
        chars.div_ceil(self.chars_per_token)
    }

    /// Truncate `text` so its estimate fits within `max_tokens`.
    ///
    /// Cuts on a word boundary when one exists in the allowed prefix.
    /// Returns the normalized text unchanged when it already fits.
    pub fn truncate_to(&self, text: &str, max_tokens: usize) -> String {
        let normalized = normalize_whitespace(text);
        let max_chars = max_tokens.saturating_mul(self.chars_per_token);
        if normalized.chars().count() <= max_chars {
            return normalized;
        }
        let prefix = take_chars(&normalized, max_chars);
        if normalized[prefix.len()..].starts_with(' ') {
            return prefix.to_string();
        }
        match prefix.rfind(' ') {
            Some(pos) if pos > 0 => prefix[..pos].to_string(),
            _ => prefix.to_string(),
        }
    }
}

impl Default for TokenEstimator {
    fn default() -> Self {
        Self::new(DEFAULT_CHARS_PER_TOKEN)
    }
}

/// Estimate tokens with the default ratio.
pub fn estimate_tokens(text: &str) -> usize {
    TokenEstimator::default().estimate(text)
}

/// Collapse every whitespace run to a single space and trim both ends.
pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Byte-safe prefix of at most `n` characters.
pub fn take_chars(text: &str, n: usize) -> &str {
    match text.char_indices().nth(n) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

fn normalized_char_count(text: &str) -> usize {
    let mut count = 0usize;
    let mut words = 0usize;
    for word in text.split_whitespace() {
        count += word.chars().count();
        words += 1;
    }
    count + words.saturating_sub(1)
}
