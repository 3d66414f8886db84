// Turns free-form model output into book records
//
// JSON strategies run in order and the first one that parses wins. When none
// does, a title/author regex salvages one low-confidence record; otherwise
// the output is reported as unparseable.

use crate::core::errors::{truncate_chars, ResolutionError, RAW_EXCERPT_CHARS};
use crate::core::types::BookRecord;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use tracing::{debug, trace};

const UNKNOWN: &str = "Unknown";
const NO_ISBN: &str = "N/A";
const FALLBACK_DESCRIPTION: &str = "Parsed from unstructured model output";

static FENCE_RE: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"(?i)```json\s*|```\s*").ok());
static BRACKETED_RE: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"(?s)(\[.*\]|\{.*\})").ok());
static SINGLE_QUOTED_KEY_RE: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"'([^']*)'\s*:").ok());
static SINGLE_QUOTED_VALUE_RE: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r":\s*'([^']*)'").ok());
static TITLE_RE: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r#"(?i)\b(?:title|book)\b[\s:]+["']?([^"'\n]+)["']?"#).ok());
static AUTHOR_RE: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r#"(?i)\b(?:author|by)\b[\s:]+["']?([^"'\n]+)["']?"#).ok());

type Strategy = fn(&str) -> Option<Value>;

/// JSON extraction strategies, tried in order
const STRATEGIES: [(&str, Strategy); 4] = [
    ("direct", parse_direct),
    ("strip_fences", parse_without_fences),
    ("balanced_scan", parse_balanced),
    ("bracket_regex", parse_bracketed),
];

/// Parse model output into books, or explain why it can't be done
pub fn parse_books(text: &str) -> Result<Vec<BookRecord>, ResolutionError> {
    if let Some(value) = extract_json(text) {
        return Ok(normalize_books(value));
    }
    if let Some(record) = fallback_record(text) {
        debug!("No JSON in model output, salvaged one record by regex");
        return Ok(vec![record]);
    }
    Err(ResolutionError::UnparseableResponse {
        raw_text: truncate_chars(text, RAW_EXCERPT_CHARS),
    })
}

/// First JSON value any strategy can recover from the text
pub fn extract_json(text: &str) -> Option<Value> {
    if text.trim().is_empty() {
        return None;
    }
    STRATEGIES.iter().find_map(|(name, strategy)| {
        let value = strategy(text)?;
        trace!("Model output parsed by '{}' strategy", name);
        Some(value)
    })
}

fn parse_direct(text: &str) -> Option<Value> {
    serde_json::from_str(text.trim()).ok()
}

fn strip_fences(text: &str) -> String {
    match FENCE_RE.as_ref() {
        Some(re) => re.replace_all(text, "").trim().to_string(),
        None => text.trim().to_string(),
    }
}

fn parse_without_fences(text: &str) -> Option<Value> {
    serde_json::from_str(&strip_fences(text)).ok()
}

/// Parse the balanced substring starting at the first `[` or `{`
///
/// Brackets inside double-quoted strings don't count.
fn parse_balanced(text: &str) -> Option<Value> {
    let cleaned = strip_fences(text);
    let start = cleaned.find(['[', '{'])?;
    let open = cleaned[start..].chars().next()?;
    let close = if open == '[' { ']' } else { '}' };

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in cleaned[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            c if c == open => depth += 1,
            c if c == close => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    let end = start + offset + ch.len_utf8();
                    return serde_json::from_str(&cleaned[start..end]).ok();
                }
            }
            _ => {}
        }
    }
    None
}

/// Greedy bracket match, retried with single quotes normalized to double
fn parse_bracketed(text: &str) -> Option<Value> {
    let cleaned = strip_fences(text);
    let candidate = BRACKETED_RE.as_ref()?.captures(&cleaned)?.get(1)?.as_str();
    if let Ok(value) = serde_json::from_str(candidate) {
        return Some(value);
    }

    let fixed = SINGLE_QUOTED_KEY_RE
        .as_ref()?
        .replace_all(candidate, "\"$1\":");
    let fixed = SINGLE_QUOTED_VALUE_RE
        .as_ref()?
        .replace_all(&fixed, ": \"$1\"");
    serde_json::from_str(&fixed).ok()
}

/// One low-confidence record from title/author phrases in prose
pub fn fallback_record(text: &str) -> Option<BookRecord> {
    let capture = |re: &Lazy<Option<Regex>>| {
        re.as_ref()?
            .captures(text)?
            .get(1)
            .map(|m| m.as_str().trim().to_string())
            .filter(|s| !s.is_empty())
    };
    let title = capture(&TITLE_RE);
    let author = capture(&AUTHOR_RE);
    if title.is_none() && author.is_none() {
        return None;
    }

    Some(BookRecord {
        title: title.unwrap_or_else(|| UNKNOWN.to_string()),
        author: author.unwrap_or_else(|| UNKNOWN.to_string()),
        isbn: NO_ISBN.to_string(),
        description: FALLBACK_DESCRIPTION.to_string(),
        low_confidence: true,
    })
}

/// Object -> one record, array -> its object items, anything else -> none
pub fn normalize_books(value: Value) -> Vec<BookRecord> {
    match value {
        Value::Object(obj) => vec![record_from_object(&obj)],
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_object)
            .map(record_from_object)
            .collect(),
        _ => Vec::new(),
    }
}

fn record_from_object(obj: &Map<String, Value>) -> BookRecord {
    BookRecord {
        title: field(obj, &["title"]).unwrap_or_else(|| UNKNOWN.to_string()),
        author: field(obj, &["author", "authors"]).unwrap_or_else(|| UNKNOWN.to_string()),
        isbn: field(obj, &["isbn"]).unwrap_or_else(|| NO_ISBN.to_string()),
        description: field(obj, &["description"]).unwrap_or_default(),
        low_confidence: false,
    }
}

/// Case-insensitive lookup, trying `names` in order
fn field(obj: &Map<String, Value>, names: &[&str]) -> Option<String> {
    names.iter().find_map(|name| {
        obj.iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .and_then(|(_, value)| value_text(value))
    })
}

fn value_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Array(items) => items
            .iter()
            .filter_map(value_text)
            .collect::<Vec<_>>()
            .join(", "),
        Value::Null | Value::Object(_) => return None,
    };
    (!text.is_empty()).then_some(text)
}
