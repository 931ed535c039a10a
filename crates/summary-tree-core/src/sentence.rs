//! Punctuation-aware sentence splitting.
//!
//! Splits on `.`, `!` or `?` (optionally followed by closing quotes or
//! brackets) when the next word starts with a capital letter. Substrings
//! that contain periods but do not end a sentence are masked with
//! placeholders first and restored afterwards:
//!
//! - URLs (`https://…`, `www.…`)
//! - email addresses
//! - decimal and dotted numbers (`3.14`, `1.2.3`)
//! - dotted acronyms (`p.m.`, `e.g.`, `U.S.`)
//! - titles and common abbreviations (`Dr.`, `Mr.`, `Inc.`)
//! - single-letter initials (`J.`)
//!
//! A lone capital followed by a period always reads as an initial, so
//! "He got an A. Then he left." stays one sentence. Literal placeholder
//! characters already present in the input are escaped before masking
//! and come back unchanged.
//!
//! Whitespace is collapsed before splitting, so joining the returned
//! sentences with single spaces reproduces the normalized input exactly.

use regex::Regex;
use std::sync::OnceLock;

use crate::tokens::normalize_whitespace;

const MASK_OPEN: char = '\u{E000}';
const MASK_CLOSE: char = '\u{E001}';

fn protected_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r#"(?:https?://|www\.)[^\s]*[^\s.,;:!?)\]"']"#,
            r"[A-Za-z0-9._%+-]+@[A-Za-z0-9-]+(?:\.[A-Za-z0-9-]+)+",
            r"\d+(?:\.\d+)+",
            r"\b(?:[A-Za-z]\.){2,}",
            r"\b(?:Mr|Mrs|Ms|Mx|Dr|Prof|Sr|Jr|St|Mt|Rev|Hon|Gen|Col|Capt|Lt|Sgt|Gov|Sen|Rep|Inc|Ltd|Co|Corp|Bros|vs|approx|dept|est|Fig|fig|Vol|vol|pp|Jan|Feb|Mar|Apr|Jun|Jul|Aug|Sep|Sept|Oct|Nov|Dec)\.",
            r"\b[A-Z]\.",
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    })
}

/// Split `text` into sentences, preserving order.
///
/// Returns an empty vector for blank input and the whole (normalized)
/// input as one sentence when no boundary is found.
pub fn split_sentences(text: &str) -> Vec<String> {
    let normalized = normalize_whitespace(text);
    if normalized.is_empty() {
        return Vec::new();
    }

    let (masked, vault) = mask(&normalized);
    let chars: Vec<(usize, char)> = masked.char_indices().collect();

    let mut sentences = Vec::new();
    let mut start = 0usize;
    let mut i = 0usize;

    while i < chars.len() {
        if !is_terminator(chars[i].1) {
            i += 1;
            continue;
        }

        let mut j = i + 1;
        while j < chars.len() && is_terminator(chars[j].1) {
            j += 1;
        }
        while j < chars.len() && is_closing(chars[j].1) {
            j += 1;
        }

        let boundary = j + 1 < chars.len()
            && chars[j].1 == ' '
            && starts_with_capital(&masked[chars[j + 1].0..], &vault);

        if boundary {
            sentences.push(unmask(&masked[start..chars[j].0], &vault));
            start = chars[j + 1].0;
            i = j + 1;
        } else {
            i = j;
        }
    }

    if start < masked.len() {
        sentences.push(unmask(&masked[start..], &vault));
    }

    sentences
}

/// The first sentence of `text`, or an empty string for blank input.
pub fn first_sentence(text: &str) -> String {
    split_sentences(text).into_iter().next().unwrap_or_default()
}

fn is_terminator(c: char) -> bool {
    matches!(c, '.' | '!' | '?')
}

fn is_closing(c: char) -> bool {
    matches!(c, '"' | '\'' | ')' | ']' | '”' | '’')
}

fn is_opening(c: char) -> bool {
    matches!(c, '"' | '\'' | '(' | '[' | '“' | '‘')
}

fn starts_with_capital(rest: &str, vault: &[String]) -> bool {
    let rest = rest.trim_start_matches(is_opening);
    let mut iter = rest.chars();
    match iter.next() {
        Some(MASK_OPEN) => {
            let digits: String = iter.take_while(|c| *c != MASK_CLOSE).collect();
            digits
                .parse::<usize>()
                .ok()
                .and_then(|idx| vault.get(idx))
                .and_then(|original| original.chars().next())
                .is_some_and(char::is_uppercase)
        }
        Some(c) => c.is_uppercase(),
        None => false,
    }
}

fn mask(text: &str) -> (String, Vec<String>) {
    let mut vault: Vec<String> = Vec::new();
    let mut masked = String::with_capacity(text.len());
    for c in text.chars() {
        if c == MASK_OPEN || c == MASK_CLOSE {
            vault.push(c.to_string());
            masked.push(MASK_OPEN);
            masked.push_str(&(vault.len() - 1).to_string());
            masked.push(MASK_CLOSE);
        } else {
            masked.push(c);
        }
    }
    for pattern in protected_patterns() {
        masked = pattern
            .replace_all(&masked, |caps: &regex::Captures| {
                vault.push(caps[0].to_string());
                format!("{}{}{}", MASK_OPEN, vault.len() - 1, MASK_CLOSE)
            })
            .into_owned();
    }
    (masked, vault)
}

fn unmask(text: &str, vault: &[String]) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != MASK_OPEN {
            out.push(c);
            continue;
        }
        let digits: String = chars.by_ref().take_while(|c| *c != MASK_CLOSE).collect();
        // Entries may hold placeholders of earlier entries only.
        match digits.parse::<usize>().ok().filter(|idx| *idx < vault.len()) {
            Some(idx) => out.push_str(&unmask(&vault[idx], &vault[..idx])),
            None => {
                out.push(MASK_OPEN);
                out.push_str(&digits);
                out.push(MASK_CLOSE);
            }
        }
    }
    out
}
