//! Document list parsing and file-link resolution.
//!
//! The document list comes from the workflow service, so it has the same
//! shape drift as chat answers: a bare array, an object wrapping the array,
//! or n8n items (`[{"json": {...}}]`).

use serde_json::{Map, Value};
use std::collections::HashSet;

use crate::models::DocumentInfo;
use crate::normalize::first_string;

const LIST_KEYS: &[&str] = &["documents", "files", "data", "items"];

/// Parses a document list. Entries without a usable file id are skipped,
/// duplicates are dropped and the result is sorted by name.
pub fn parse_document_list(value: &Value) -> Vec<DocumentInfo> {
    let mut seen = HashSet::new();
    let mut docs: Vec<DocumentInfo> = list_entries(value)
        .iter()
        .filter_map(parse_entry)
        .filter(|d| seen.insert(d.file_id.clone()))
        .collect();
    docs.sort_by_key(|d| d.name.to_lowercase());
    docs
}

fn list_entries(value: &Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items
            .iter()
            .flat_map(|item| match item.get("json") {
                // n8n wraps each item; the wrapped value may itself be a list.
                Some(inner @ Value::Array(_)) => list_entries(inner),
                Some(inner) => vec![inner.clone()],
                None => vec![item.clone()],
            })
            .collect(),
        Value::Object(map) => LIST_KEYS
            .iter()
            .find_map(|k| map.get(*k))
            .map(list_entries)
            .unwrap_or_default(),
        Value::String(s) => serde_json::from_str::<Value>(s)
            .map(|v| list_entries(&v))
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

fn parse_entry(value: &Value) -> Option<DocumentInfo> {
    let map: &Map<String, Value> = value.as_object()?;
    let link = first_string(map, &["link", "url", "webViewLink"]);
    let file_id = first_string(map, &["file_id", "fileId", "id", "document_id"])
        .or_else(|| link.as_deref().and_then(file_id_from_link))?;
    Some(DocumentInfo {
        name: first_string(map, &["name", "title", "file_name", "fileName"])
            .unwrap_or_else(|| file_id.clone()),
        file_id,
        link,
        mime_type: first_string(map, &["mimeType", "mime_type"]),
        modified_at: first_string(map, &["modifiedTime", "modified_at", "updated_at"]),
    })
}

/// Extracts a file id from common share links:
/// `.../file/d/<id>/view`, `.../document/d/<id>/edit` and `...?id=<id>`.
pub fn file_id_from_link(link: &str) -> Option<String> {
    let url = reqwest::Url::parse(link).ok()?;

    let segments: Vec<&str> = url.path_segments()?.collect();
    if let Some(pos) = segments.iter().position(|s| *s == "d") {
        if let Some(id) = segments.get(pos + 1).filter(|s| !s.is_empty()) {
            return Some((*id).to_string());
        }
    }

    url.query_pairs()
        .find(|(k, _)| k == "id")
        .map(|(_, v)| v.into_owned())
        .filter(|v| !v.is_empty())
}

/// Expands a download URL template for a file id.
///
/// The id is percent-encoded so it cannot alter the path or query of the
/// template.
pub fn download_url(template: &str, file_id: &str) -> String {
    template.replace("{id}", &percent_encode(file_id))
}

fn percent_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}
