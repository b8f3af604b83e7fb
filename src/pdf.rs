//! PDF download proxy.
//!
//! The preview pane cannot load documents from the storage provider directly
//! because of cross-origin restrictions, so the backend fetches them and
//! serves the bytes from its own origin. Downloads are size-limited, checked
//! for the PDF magic bytes and cached briefly so that the preview and the
//! highlight lookup for the same file share one download.
//!
//! Redirects are followed only to allowed hosts. A download that starts on
//! the template host must not be able to hop to an internal address.

use bytes::Bytes;
use moka::future::Cache;
use reqwest::redirect::Policy;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::config::PdfConfig;
use crate::documents::download_url;

const PDF_MAGIC: &[u8] = b"%PDF-";
const MAX_REDIRECTS: usize = 10;

#[derive(Debug, Clone, Error)]
pub enum PdfError {
    #[error("invalid document URL: {0}")]
    InvalidUrl(String),
    #[error("host '{0}' is not in pdf.allowed_hosts")]
    HostNotAllowed(String),
    #[error("document download failed: {0}")]
    Request(String),
    #[error("document download timed out")]
    Timeout,
    #[error("too many redirects")]
    TooManyRedirects,
    #[error("document source returned HTTP {0}")]
    Status(u16),
    #[error("document is larger than {0} bytes")]
    TooLarge(u64),
    #[error("downloaded file is not a PDF")]
    NotPdf,
}

impl From<reqwest::Error> for PdfError {
    fn from(err: reqwest::Error) -> Self {
        // A rejected redirect carries our own error as its source.
        if err.is_redirect() {
            if let Some(rejected) =
                std::error::Error::source(&err).and_then(|s| s.downcast_ref::<PdfError>())
            {
                return rejected.clone();
            }
        }
        if err.is_timeout() {
            PdfError::Timeout
        } else {
            PdfError::Request(err.to_string())
        }
    }
}

#[derive(Clone)]
pub struct PdfFetcher {
    client: reqwest::Client,
    template: String,
    allowed_hosts: Arc<Vec<String>>,
    max_bytes: u64,
    cache: Cache<String, Bytes>,
}

impl PdfFetcher {
    pub fn new(config: &PdfConfig, timeout: Duration) -> anyhow::Result<Self> {
        let mut allowed_hosts: Vec<String> = config
            .allowed_hosts
            .iter()
            .map(|h| h.trim().to_ascii_lowercase())
            .filter(|h| !h.is_empty())
            .collect();
        if let Some(host) = reqwest::Url::parse(&download_url(&config.download_url_template, "x"))
            .ok()
            .and_then(|u| u.host_str().map(str::to_ascii_lowercase))
        {
            allowed_hosts.push(host);
        }
        let allowed_hosts = Arc::new(allowed_hosts);

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(redirect_policy(allowed_hosts.clone()))
            .build()?;

        Ok(Self {
            client,
            template: config.download_url_template.clone(),
            allowed_hosts,
            max_bytes: config.max_bytes,
            cache: Cache::builder()
                .weigher(|_url: &String, bytes: &Bytes| {
                    u32::try_from(bytes.len()).unwrap_or(u32::MAX)
                })
                .max_capacity(config.cache_max_bytes)
                .time_to_live(Duration::from_secs(config.cache_ttl_secs))
                .build(),
        })
    }

    /// Fetches a document by file id through the download URL template.
    pub async fn fetch_file(&self, file_id: &str) -> Result<Bytes, PdfError> {
        let url = download_url(&self.template, file_id);
        self.fetch_cached(url).await
    }

    /// Fetches a document from an arbitrary URL on an allowed host.
    pub async fn fetch_url(&self, raw: &str) -> Result<Bytes, PdfError> {
        let url = reqwest::Url::parse(raw).map_err(|_| PdfError::InvalidUrl(raw.to_string()))?;
        check_target(&self.allowed_hosts, &url)?;
        self.fetch_cached(url.to_string()).await
    }

    /// Concurrent requests for the same URL wait on one download.
    async fn fetch_cached(&self, url: String) -> Result<Bytes, PdfError> {
        self.cache
            .try_get_with(url.clone(), self.download(&url))
            .await
            .map_err(|e: Arc<PdfError>| (*e).clone())
    }

    async fn download(&self, url: &str) -> Result<Bytes, PdfError> {
        let mut response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(PdfError::Status(status.as_u16()));
        }
        if response.content_length().is_some_and(|len| len > self.max_bytes) {
            return Err(PdfError::TooLarge(self.max_bytes));
        }

        let mut buf = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            if (buf.len() + chunk.len()) as u64 > self.max_bytes {
                return Err(PdfError::TooLarge(self.max_bytes));
            }
            buf.extend_from_slice(&chunk);
        }

        if !is_pdf(&buf) {
            return Err(PdfError::NotPdf);
        }
        tracing::info!(%url, bytes = buf.len(), "downloaded pdf");
        Ok(Bytes::from(buf))
    }
}

fn host_allowed(allowed: &[String], host: &str) -> bool {
    allowed
        .iter()
        .any(|a| host == a || host.ends_with(&format!(".{}", a)))
}

/// Requires an http(s) URL whose host is allowed.
fn check_target(allowed: &[String], url: &reqwest::Url) -> Result<(), PdfError> {
    if !matches!(url.scheme(), "http" | "https") {
        return Err(PdfError::InvalidUrl(url.to_string()));
    }
    let host = url
        .host_str()
        .map(str::to_ascii_lowercase)
        .ok_or_else(|| PdfError::InvalidUrl(url.to_string()))?;
    if !host_allowed(allowed, &host) {
        return Err(PdfError::HostNotAllowed(host));
    }
    Ok(())
}

fn redirect_policy(allowed: Arc<Vec<String>>) -> Policy {
    Policy::custom(move |attempt| {
        let rejected = if attempt.previous().len() > MAX_REDIRECTS {
            Some(PdfError::TooManyRedirects)
        } else {
            check_target(&allowed, attempt.url()).err()
        };
        match rejected {
            Some(err) => {
                tracing::warn!(url = %attempt.url(), error = %err, "redirect refused");
                attempt.error(err)
            }
            None => attempt.follow(),
        }
    })
}

/// True if the buffer starts with `%PDF-`, ignoring leading whitespace and a
/// UTF-8 byte-order mark.
pub fn is_pdf(bytes: &[u8]) -> bool {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    bytes[start..].starts_with(PDF_MAGIC)
}
