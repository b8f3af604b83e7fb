//! Core data types shared by the webhook client, session store and HTTP API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// An inclusive, 1-based range of lines within a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LineRange {
    pub start: u32,
    pub end: u32,
}

impl LineRange {
    /// Builds a range, swapping the bounds if needed. Line numbers below 1
    /// are raised to 1.
    pub fn new(start: u32, end: u32) -> Self {
        let (a, b) = if start <= end { (start, end) } else { (end, start) };
        Self {
            start: a.max(1),
            end: b.max(1),
        }
    }
}

/// Pointer from an answer to the document passage it was drawn from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentReference {
    pub file_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lines: Option<LineRange>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebSource {
    pub title: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
}

/// The normalized form of whatever the webhook returned.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    pub text: String,
    #[serde(default)]
    pub references: Vec<DocumentReference>,
    #[serde(default)]
    pub web_sources: Vec<WebSource>,
}

impl Answer {
    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty() && self.references.is_empty() && self.web_sources.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub session_id: String,
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub references: Vec<DocumentReference>,
    #[serde(default)]
    pub web_sources: Vec<WebSource>,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn user(session_id: &str, content: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            role: Role::User,
            content: content.to_string(),
            references: Vec::new(),
            web_sources: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn assistant(session_id: &str, answer: Answer) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            role: Role::Assistant,
            content: answer.text,
            references: answer.references,
            web_sources: answer.web_sources,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub title: String,
    pub message_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An entry of the document list shown in the sidebar.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentInfo {
    pub file_id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<String>,
}
