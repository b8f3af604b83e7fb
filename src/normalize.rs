//! Normalization of webhook responses into a single [`Answer`] shape.
//!
//! The workflow behind the webhook is edited by hand and its response shape
//! drifts. Observed variants include:
//!
//! - a plain text body
//! - a JSON document encoded as a string (sometimes twice)
//! - JSON wrapped in a markdown fence (```` ```json ... ``` ````), possibly
//!   surrounded by prose
//! - objects nested under `output`, `data`, `json` or `response`, or n8n item
//!   lists such as `[{"output": "..."}]`
//!
//! Normalization walks the value recursively. Answer text is taken from the
//! first answer-like field that yields content. References and web sources are
//! collected at every level and merged.
//!
//! ```rust
//! use docchat::normalize::normalize_response;
//!
//! let body = r#"[{"output": "```json\n{\"answer\": \"See section 2.\", \"sources\": [{\"fileId\": \"abc\", \"title\": \"Handbook\", \"lines\": \"10-14\"}]}\n```"}]"#;
//! let answer = normalize_response(body).unwrap();
//! assert_eq!(answer.text, "See section 2.");
//! assert_eq!(answer.references[0].name, "Handbook");
//! ```

use serde_json::{Map, Value};
use std::collections::HashSet;
use thiserror::Error;

use crate::documents::file_id_from_link;
use crate::models::{Answer, DocumentReference, LineRange, WebSource};

/// Maximum nesting depth followed before giving up.
pub const MAX_DEPTH: usize = 8;

const ANSWER_KEYS: &[&str] = &[
    "answer", "text", "response", "output", "content", "message", "reply", "result",
];
const WRAPPER_KEYS: &[&str] = &["json", "data", "body"];
const REFERENCE_KEYS: &[&str] = &["references", "sources", "documents", "citations", "docs"];
const WEB_KEYS: &[&str] = &["web_sources", "webSources", "web_results", "search_results"];

const ID_KEYS: &[&str] = &["file_id", "fileId", "id", "document_id", "documentId"];
const NAME_KEYS: &[&str] = &["name", "title", "file_name", "fileName"];
const LINK_KEYS: &[&str] = &["link", "url", "webViewLink", "source_url"];
const LINES_KEYS: &[&str] = &["lines", "line_range", "lineRange"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("webhook returned an empty response")]
    Empty,
    #[error("webhook response is nested deeper than {0} levels")]
    TooDeep(usize),
}

/// Normalizes a raw response body.
pub fn normalize_response(body: &str) -> Result<Answer, NormalizeError> {
    finish(normalize_text(body, 0)?)
}

/// Normalizes an already-decoded JSON value.
pub fn normalize_value(value: &Value) -> Result<Answer, NormalizeError> {
    finish(normalize_node(value, 0)?)
}

fn finish(answer: Option<Answer>) -> Result<Answer, NormalizeError> {
    let mut answer = answer.ok_or(NormalizeError::Empty)?;
    answer.text = answer.text.trim().to_string();
    answer.references = dedup_references(std::mem::take(&mut answer.references));
    answer.web_sources = dedup_web_sources(std::mem::take(&mut answer.web_sources));
    if answer.is_empty() {
        return Err(NormalizeError::Empty);
    }
    Ok(answer)
}

fn normalize_node(value: &Value, depth: usize) -> Result<Option<Answer>, NormalizeError> {
    if depth > MAX_DEPTH {
        return Err(NormalizeError::TooDeep(MAX_DEPTH));
    }
    match value {
        Value::Null => Ok(None),
        Value::Bool(b) => Ok(Some(text_answer(b.to_string()))),
        Value::Number(n) => Ok(Some(text_answer(n.to_string()))),
        Value::String(s) => normalize_text(s, depth),
        Value::Array(items) => {
            for item in items {
                if let Some(answer) = normalize_node(item, depth + 1)? {
                    if !answer.is_empty() {
                        return Ok(Some(answer));
                    }
                }
            }
            Ok(None)
        }
        Value::Object(map) => normalize_object(map, depth),
    }
}

fn normalize_text(raw: &str, depth: usize) -> Result<Option<Answer>, NormalizeError> {
    if depth > MAX_DEPTH {
        return Err(NormalizeError::TooDeep(MAX_DEPTH));
    }
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }

    if let Some(fence) = find_json_fence(trimmed) {
        if let Ok(value) = serde_json::from_str::<Value>(fence.inner) {
            if let Some(mut answer) = normalize_node(&value, depth + 1)? {
                if answer.text.trim().is_empty() {
                    answer.text = fence.surrounding.trim().to_string();
                }
                if !answer.is_empty() {
                    return Ok(Some(answer));
                }
            }
        }
    }

    if looks_like_json(trimmed) {
        if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
            return normalize_node(&value, depth + 1);
        }
    }

    Ok(Some(text_answer(trimmed.to_string())))
}

fn normalize_object(map: &Map<String, Value>, depth: usize) -> Result<Option<Answer>, NormalizeError> {
    let mut found = first_answer(map, ANSWER_KEYS, depth)?;
    if found.is_none() {
        found = first_answer(map, WRAPPER_KEYS, depth)?;
    }

    let references = collect_references(map);
    let web_sources = collect_web_sources(map);
    if found.is_none() && references.is_empty() && web_sources.is_empty() {
        return Ok(None);
    }

    let mut answer = found.unwrap_or_default();
    // Outer-level references come first; they are usually the curated list.
    let inner = std::mem::replace(&mut answer.references, references);
    answer.references.extend(inner);
    let inner = std::mem::replace(&mut answer.web_sources, web_sources);
    answer.web_sources.extend(inner);
    Ok(Some(answer))
}

fn first_answer(
    map: &Map<String, Value>,
    keys: &[&str],
    depth: usize,
) -> Result<Option<Answer>, NormalizeError> {
    for key in keys {
        if let Some(value) = map.get(*key) {
            if let Some(answer) = normalize_node(value, depth + 1)? {
                if !answer.is_empty() {
                    return Ok(Some(answer));
                }
            }
        }
    }
    Ok(None)
}

fn text_answer(text: String) -> Answer {
    Answer {
        text,
        ..Answer::default()
    }
}

fn looks_like_json(s: &str) -> bool {
    matches!(s.as_bytes().first(), Some(b'{' | b'[' | b'"'))
}

struct Fence<'a> {
    inner: &'a str,
    surrounding: String,
}

/// Finds the first markdown fence tagged `json` or left untagged.
fn find_json_fence(text: &str) -> Option<Fence<'_>> {
    let mut search_from = 0;
    while let Some(rel) = text[search_from..].find("```") {
        let open = search_from + rel;
        let content_start = open + 3;
        let close = content_start + text[content_start..].find("```")?;
        let content = &text[content_start..close];

        let (tag, body) = match content.find('\n') {
            Some(i) => (content[..i].trim(), &content[i + 1..]),
            // Single-line fence: ```json{"answer": "..."}```
            None => match content.get(..4) {
                Some(p) if p.eq_ignore_ascii_case("json") => ("json", &content[4..]),
                _ => ("", content),
            },
        };

        if tag.is_empty() || tag.eq_ignore_ascii_case("json") {
            let surrounding = format!("{}{}", &text[..open], &text[close + 3..]);
            return Some(Fence {
                inner: body.trim(),
                surrounding,
            });
        }
        search_from = close + 3;
    }
    None
}

// ============ References ============

fn collect_references(map: &Map<String, Value>) -> Vec<DocumentReference> {
    let mut out = Vec::new();
    for key in REFERENCE_KEYS {
        if let Some(items) = map.get(*key).and_then(as_list) {
            out.extend(items.iter().filter_map(parse_reference));
        }
    }
    out
}

/// Accepts an array, or a string holding a JSON array.
fn as_list(value: &Value) -> Option<Vec<Value>> {
    match value {
        Value::Array(items) => Some(items.clone()),
        Value::String(s) if s.trim_start().starts_with('[') => {
            serde_json::from_str::<Vec<Value>>(s.trim()).ok()
        }
        _ => None,
    }
}

/// Parses a single reference entry. Entries with neither an id nor a link are
/// dropped.
pub fn parse_reference(value: &Value) -> Option<DocumentReference> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            if s.is_empty() {
                return None;
            }
            if s.starts_with("http://") || s.starts_with("https://") {
                let file_id = file_id_from_link(s).unwrap_or_else(|| s.to_string());
                return Some(DocumentReference {
                    name: file_id.clone(),
                    file_id,
                    link: Some(s.to_string()),
                    lines: None,
                });
            }
            Some(DocumentReference {
                file_id: s.to_string(),
                name: s.to_string(),
                link: None,
                lines: None,
            })
        }
        Value::Object(map) => {
            let link = first_string(map, LINK_KEYS);
            let file_id = first_string(map, ID_KEYS).or_else(|| {
                link.as_deref()
                    .map(|l| file_id_from_link(l).unwrap_or_else(|| l.to_string()))
            })?;
            let name = first_string(map, NAME_KEYS).unwrap_or_else(|| file_id.clone());
            Some(DocumentReference {
                file_id,
                name,
                link,
                lines: parse_lines(map),
            })
        }
        _ => None,
    }
}

pub(crate) fn first_string(map: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| match map.get(*k) {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

fn parse_lines(map: &Map<String, Value>) -> Option<LineRange> {
    for key in LINES_KEYS {
        if let Some(range) = map.get(*key).and_then(line_range_from_value) {
            return Some(range);
        }
    }
    let start = ["start_line", "startLine", "line_start"]
        .iter()
        .find_map(|k| map.get(*k).and_then(as_u32))?;
    let end = ["end_line", "endLine", "line_end"]
        .iter()
        .find_map(|k| map.get(*k).and_then(as_u32))
        .unwrap_or(start);
    Some(LineRange::new(start, end))
}

fn line_range_from_value(value: &Value) -> Option<LineRange> {
    match value {
        Value::String(s) => parse_line_spec(s),
        Value::Number(_) => as_u32(value).map(|n| LineRange::new(n, n)),
        Value::Array(items) => {
            let start = items.first().and_then(as_u32)?;
            let end = items.get(1).and_then(as_u32).unwrap_or(start);
            Some(LineRange::new(start, end))
        }
        Value::Object(map) => {
            let start = ["start", "from"].iter().find_map(|k| map.get(*k).and_then(as_u32))?;
            let end = ["end", "to"]
                .iter()
                .find_map(|k| map.get(*k).and_then(as_u32))
                .unwrap_or(start);
            Some(LineRange::new(start, end))
        }
        _ => None,
    }
}

/// Parses `"12-18"`, `"12–18"`, `"L12-L18"`, `"12:18"` or `"12"`.
pub fn parse_line_spec(spec: &str) -> Option<LineRange> {
    let cleaned: String = spec
        .trim()
        .chars()
        .filter(|c| !matches!(c, 'L' | 'l' | ' '))
        .collect();
    let mut parts = cleaned.splitn(2, |c: char| matches!(c, '-' | '–' | ':'));
    let start: u32 = parts.next()?.parse().ok()?;
    let end = match parts.next() {
        Some(p) if !p.is_empty() => p.parse().ok()?,
        _ => start,
    };
    Some(LineRange::new(start, end))
}

fn as_u32(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn dedup_references(refs: Vec<DocumentReference>) -> Vec<DocumentReference> {
    let mut seen = HashSet::new();
    refs.into_iter()
        .filter(|r| seen.insert((r.file_id.clone(), r.lines)))
        .collect()
}

// ============ Web sources ============

fn collect_web_sources(map: &Map<String, Value>) -> Vec<WebSource> {
    let mut out = Vec::new();
    for key in WEB_KEYS {
        if let Some(items) = map.get(*key).and_then(as_list) {
            for item in &items {
                let Value::Object(entry) = item else { continue };
                let Some(url) = first_string(entry, &["url", "link", "href"]) else {
                    continue;
                };
                out.push(WebSource {
                    title: first_string(entry, &["title", "name"]).unwrap_or_else(|| url.clone()),
                    snippet: first_string(entry, &["snippet", "description", "content"]),
                    url,
                });
            }
        }
    }
    out
}

fn dedup_web_sources(sources: Vec<WebSource>) -> Vec<WebSource> {
    let mut seen = HashSet::new();
    sources
        .into_iter()
        .filter(|s| seen.insert(s.url.clone()))
        .collect()
}
