//! Structured-record extraction from free-form model output.
//!
//! Models are asked for a bare JSON object but regularly wrap it in prose,
//! code fences or both. Extraction runs a fixed cascade of independent
//! strategies and returns the first candidate that deserializes:
//!
//! 1. `DirectParse`: the whole trimmed text.
//! 2. `BraceScan`: brace-delimited substrings (one-level nesting pattern, then
//!    the alternation pattern), left to right.
//! 3. `FencedBlock`: a ```` ```json ```` fence, then any fence, then the span
//!    from the first `{` to the last `}`.
//!
//! First match wins, even when the record it yields is semantically empty.

use std::sync::LazyLock;

use regex::Regex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

/// Maximum characters of the source text kept in an `ExtractionFailure`.
pub const FAILURE_PREVIEW_CHARS: usize = 200;

static BRACE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"\{[^{}]*(?:\{[^{}]*\}[^{}]*)*\}").expect("valid regex"),
        Regex::new(r"\{(?:[^{}]|\{[^{}]*\})*\}").expect("valid regex"),
    ]
});

static JSON_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```json\s*(.*?)\s*```").expect("valid regex"));

static ANY_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```\s*(.*?)\s*```").expect("valid regex"));

/// No candidate in the text deserialized into a record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Could not extract valid JSON from: {preview}...")]
pub struct ExtractionFailure {
    /// Leading characters of the original text, for diagnostics.
    pub preview: String,
}

impl ExtractionFailure {
    pub fn for_text(text: &str) -> Self {
        Self {
            preview: text.chars().take(FAILURE_PREVIEW_CHARS).collect(),
        }
    }
}

/// One step of the extraction cascade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStrategy {
    DirectParse,
    BraceScan,
    FencedBlock,
}

/// Strategies in the order they are tried.
pub const CASCADE: [ParseStrategy; 3] = [
    ParseStrategy::DirectParse,
    ParseStrategy::BraceScan,
    ParseStrategy::FencedBlock,
];

impl ParseStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            Self::DirectParse => "direct_parse",
            Self::BraceScan => "brace_scan",
            Self::FencedBlock => "fenced_block",
        }
    }

    /// Candidate substrings this strategy proposes, in priority order.
    pub fn candidates<'a>(&self, text: &'a str) -> Vec<&'a str> {
        match self {
            Self::DirectParse => vec![text.trim()],
            Self::BraceScan => BRACE_PATTERNS
                .iter()
                .flat_map(|pattern| pattern.find_iter(text).map(|m| m.as_str().trim()))
                .collect(),
            Self::FencedBlock => {
                let mut found = Vec::with_capacity(3);
                for fence in [&*JSON_FENCE, &*ANY_FENCE] {
                    if let Some(body) = fence.captures(text).and_then(|c| c.get(1)) {
                        found.push(body.as_str().trim());
                    }
                }
                if let Some(span) = outer_brace_span(text) {
                    found.push(span);
                }
                found
            }
        }
    }

    /// First candidate that deserializes into `T`, if any.
    pub fn try_parse<T: DeserializeOwned>(&self, text: &str) -> Option<T> {
        self.candidates(text)
            .into_iter()
            .filter(|candidate| !candidate.is_empty())
            .find_map(parse_object)
    }
}

/// Parse one candidate as a JSON object, then map it onto `T`.
///
/// Going through `Value` means a repeated key keeps its last value instead of
/// failing the whole candidate.
fn parse_object<T: DeserializeOwned>(candidate: &str) -> Option<T> {
    match serde_json::from_str::<Value>(candidate).ok()? {
        object @ Value::Object(_) => serde_json::from_value(object).ok(),
        _ => None,
    }
}

/// Span from the first `{` to the last `}`.
fn outer_brace_span(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (start < end).then(|| &text[start..=end])
}

/// Extract a record from model output.
pub fn extract<T: DeserializeOwned>(text: &str) -> Result<T, ExtractionFailure> {
    extract_with_strategy(text).map(|(record, _)| record)
}

/// Extract a record and report which strategy produced it.
pub fn extract_with_strategy<T: DeserializeOwned>(
    text: &str,
) -> Result<(T, ParseStrategy), ExtractionFailure> {
    for strategy in CASCADE {
        if let Some(record) = strategy.try_parse::<T>(text) {
            return Ok((record, strategy));
        }
    }
    Err(ExtractionFailure::for_text(text))
}
