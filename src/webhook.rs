//! Client for the external workflow webhook.
//!
//! The webhook performs retrieval, ranking, web search and answer
//! generation. This module only delivers chat turns to it and turns whatever
//! comes back into an [`Answer`].
//!
//! # Retry Strategy
//!
//! Every call is attempted at least once and up to `1 + max_retries` times:
//! - network errors and timeouts → retry
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - 2xx with an empty body → retry (the workflow occasionally answers before
//!   its last node has produced output)
//! - other 4xx → fail immediately
//! - backoff before attempt `n`: `backoff_base_ms * 2^(n-1)`, capped at
//!   `backoff_max_ms`

use async_trait::async_trait;
use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

use crate::config::WebhookConfig;
use crate::documents::parse_document_list;
use crate::models::{Answer, DocumentInfo, Role};
use crate::normalize::{normalize_response, NormalizeError};

/// Longest error body kept in [`WebhookError::Status`].
const MAX_ERROR_BODY: usize = 500;

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("request to webhook failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("webhook returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("webhook returned an empty response")]
    Empty,
    #[error("webhook response could not be parsed: {0}")]
    Parse(String),
    #[error("webhook failed after {attempts} attempt(s): {last}")]
    Exhausted {
        attempts: u32,
        last: Box<WebhookError>,
    },
    #[error("{0} is not configured")]
    NotConfigured(&'static str),
}

impl WebhookError {
    pub fn is_retryable(&self) -> bool {
        match self {
            WebhookError::Request(_) | WebhookError::Empty => true,
            WebhookError::Status { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    pub fn is_timeout(&self) -> bool {
        match self {
            WebhookError::Request(e) => e.is_timeout(),
            WebhookError::Exhausted { last, .. } => last.is_timeout(),
            _ => false,
        }
    }
}

impl From<NormalizeError> for WebhookError {
    fn from(err: NormalizeError) -> Self {
        match err {
            NormalizeError::Empty => WebhookError::Empty,
            other => WebhookError::Parse(other.to_string()),
        }
    }
}

/// A prior message forwarded to the workflow for conversational context.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub role: Role,
    pub content: String,
}

/// One user turn as delivered to the workflow.
#[derive(Debug, Clone)]
pub struct ChatTurn {
    pub session_id: String,
    pub message: String,
    pub web_search: bool,
    pub history: Vec<HistoryEntry>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WebhookPayload<'a> {
    session_id: &'a str,
    chat_input: &'a str,
    web_search: bool,
    history: &'a [HistoryEntry],
}

/// Anything that can answer chat turns and list documents.
///
/// The server only talks to this trait, so tests and alternative backends can
/// stand in for the webhook.
#[async_trait]
pub trait AnswerBackend: Send + Sync {
    async fn ask(&self, turn: &ChatTurn) -> Result<Answer, WebhookError>;

    async fn list_documents(&self) -> Result<Vec<DocumentInfo>, WebhookError>;
}

pub struct WebhookClient {
    client: reqwest::Client,
    url: String,
    documents_url: Option<String>,
    token: Option<String>,
    max_retries: u32,
    backoff_base_ms: u64,
    backoff_max_ms: u64,
}

impl WebhookClient {
    pub fn new(config: &WebhookConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        let token = match &config.token_env {
            Some(var) => match std::env::var(var) {
                Ok(token) if !token.is_empty() => Some(token),
                _ => {
                    tracing::warn!(env = %var, "webhook token variable is not set; calling without auth");
                    None
                }
            },
            None => None,
        };

        Ok(Self {
            client,
            url: config.url.clone(),
            documents_url: config.documents_url.clone(),
            token,
            max_retries: config.max_retries,
            backoff_base_ms: config.backoff_base_ms,
            backoff_max_ms: config.backoff_max_ms,
        })
    }

    fn authorized(&self, rb: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => rb.bearer_auth(token),
            None => rb,
        }
    }

    async fn with_retries<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, WebhookError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, WebhookError>>,
    {
        let attempts = self.max_retries + 1;
        let mut last = None;

        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = backoff_delay(attempt, self.backoff_base_ms, self.backoff_max_ms);
                tracing::debug!(attempt = attempt + 1, delay_ms = delay.as_millis() as u64, "retrying {}", what);
                tokio::time::sleep(delay).await;
            }

            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() => {
                    tracing::warn!(attempt = attempt + 1, max = attempts, error = %e, "{} failed", what);
                    last = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(WebhookError::Exhausted {
            attempts,
            last: Box::new(last.unwrap_or(WebhookError::Empty)),
        })
    }

    async fn post_turn(&self, payload: &WebhookPayload<'_>) -> Result<Answer, WebhookError> {
        let response = self
            .authorized(self.client.post(&self.url))
            .json(payload)
            .send()
            .await?;
        let body = checked_body(response).await?;
        Ok(normalize_response(&body)?)
    }

    async fn fetch_documents(&self, url: &str) -> Result<Vec<DocumentInfo>, WebhookError> {
        let response = self.authorized(self.client.get(url)).send().await?;
        let body = checked_body(response).await?;
        if body.trim().is_empty() {
            return Err(WebhookError::Empty);
        }
        let value: serde_json::Value =
            serde_json::from_str(&body).map_err(|e| WebhookError::Parse(e.to_string()))?;
        Ok(parse_document_list(&value))
    }
}

#[async_trait]
impl AnswerBackend for WebhookClient {
    async fn ask(&self, turn: &ChatTurn) -> Result<Answer, WebhookError> {
        let payload = WebhookPayload {
            session_id: &turn.session_id,
            chat_input: &turn.message,
            web_search: turn.web_search,
            history: &turn.history,
        };
        let answer = self.with_retries("chat webhook", || self.post_turn(&payload)).await?;
        tracing::info!(
            session = %turn.session_id,
            references = answer.references.len(),
            web_sources = answer.web_sources.len(),
            "webhook answered"
        );
        Ok(answer)
    }

    async fn list_documents(&self) -> Result<Vec<DocumentInfo>, WebhookError> {
        let url = self
            .documents_url
            .as_deref()
            .ok_or(WebhookError::NotConfigured("webhook.documents_url"))?;
        self.with_retries("documents webhook", || self.fetch_documents(url))
            .await
    }
}

async fn checked_body(response: reqwest::Response) -> Result<String, WebhookError> {
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(WebhookError::Status {
            status: status.as_u16(),
            body: truncate(body, MAX_ERROR_BODY),
        });
    }
    Ok(body)
}

fn truncate(mut s: String, max: usize) -> String {
    if s.len() > max {
        let mut cut = max;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        s.truncate(cut);
    }
    s
}

/// Delay before the given attempt (1-based retry index).
pub fn backoff_delay(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    let exp = attempt.saturating_sub(1).min(20);
    Duration::from_millis(base_ms.saturating_mul(1 << exp).min(max_ms))
}
