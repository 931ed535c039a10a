//! Language-model response normalization.
//!
//! Providers return text in different shapes. Rather than parsing each
//! provider inline, extraction is an ordered chain of small extractor
//! functions; the first one that yields non-empty text wins.
//!
//! | Order | Shape | Typical source |
//! |-------|-------|----------------|
//! | 1 | `"…"` (bare string) | plain-text endpoints |
//! | 2 | `choices[0].message.content` | OpenAI-compatible chat |
//! | 3 | `content` (string or `[{text}]`) | Anthropic messages |
//! | 4 | `text` | simple completion wrappers |
//! | 5 | `candidates[*].content.parts[*].text` | Gemini |
//! | 6 | `response` | Ollama generate |
//! | 7 | `choices[0].text` | OpenAI-compatible completions |
//! | 8 | `message.content` | Ollama chat |
//!
//! Extend the chain by adding an entry to [`EXTRACTORS`]; call sites only
//! use [`extract_text`].

use serde_json::Value;

/// An extractor returns the text it finds in a response, if any.
pub type Extractor = fn(&Value) -> Option<String>;

/// Extractors in priority order, each tagged with the shape it recognizes.
pub const EXTRACTORS: &[(&str, Extractor)] = &[
    ("string", direct_string),
    ("choices.message.content", choices_message_content),
    ("content", content_field),
    ("text", text_field),
    ("candidates.content.parts", candidates_parts),
    ("response", response_field),
    ("choices.text", choices_text),
    ("message.content", message_content),
];

/// Text pulled out of a model response and the shape it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extracted {
    pub shape: &'static str,
    pub text: String,
}

/// Run the extractor chain over `response`.
///
/// Returns `None` when no extractor yields non-empty text; callers treat
/// that as a malformed response.
pub fn extract_text(response: &Value) -> Option<Extracted> {
    EXTRACTORS.iter().find_map(|&(shape, extractor)| {
        extractor(response)
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .map(|text| Extracted { shape, text })
    })
}

fn non_empty(s: &str) -> Option<String> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Join the `text` fields of an array of content parts.
fn join_parts(parts: &[Value]) -> Option<String> {
    let texts: Vec<&str> = parts
        .iter()
        .filter_map(|p| p.get("text").and_then(Value::as_str))
        .filter(|t| !t.trim().is_empty())
        .collect();
    if texts.is_empty() {
        None
    } else {
        Some(texts.join("\n"))
    }
}

fn string_or_parts(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => non_empty(s),
        Value::Array(parts) => join_parts(parts),
        _ => None,
    }
}

fn direct_string(v: &Value) -> Option<String> {
    v.as_str().and_then(non_empty)
}

fn choices_message_content(v: &Value) -> Option<String> {
    let first = v.get("choices")?.as_array()?.first()?;
    string_or_parts(first.get("message")?.get("content")?)
}

fn content_field(v: &Value) -> Option<String> {
    string_or_parts(v.get("content")?)
}

fn text_field(v: &Value) -> Option<String> {
    v.get("text")?.as_str().and_then(non_empty)
}

fn candidates_parts(v: &Value) -> Option<String> {
    v.get("candidates")?.as_array()?.iter().find_map(|candidate| {
        let parts = candidate.get("content")?.get("parts")?.as_array()?;
        join_parts(parts)
    })
}

fn response_field(v: &Value) -> Option<String> {
    v.get("response")?.as_str().and_then(non_empty)
}

fn choices_text(v: &Value) -> Option<String> {
    let first = v.get("choices")?.as_array()?.first()?;
    first.get("text")?.as_str().and_then(non_empty)
}

fn message_content(v: &Value) -> Option<String> {
    string_or_parts(v.get("message")?.get("content")?)
}
