//! TOML configuration.
//!
//! Every section except `[auth]` has usable defaults apart from the two
//! required values, `server.bind` and `webhook.url`:
//!
//! ```toml
//! [server]
//! bind = "127.0.0.1:8080"
//! static_dir = "./web/dist"
//!
//! [webhook]
//! url = "https://automation.example.com/webhook/docchat"
//! documents_url = "https://automation.example.com/webhook/docchat-documents"
//! max_retries = 3
//!
//! [auth]
//! [[auth.users]]
//! username = "analyst"
//! password_sha256 = "<output of `docchat hash-password`>"
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
    #[serde(default)]
    pub pdf: PdfConfig,
    #[serde(default)]
    pub auth: Option<AuthConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
    #[serde(default)]
    pub static_dir: Option<PathBuf>,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

fn default_max_body_bytes() -> usize {
    1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebhookConfig {
    pub url: String,
    #[serde(default)]
    pub documents_url: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// Number of prior messages forwarded with each chat turn.
    #[serde(default = "default_history_window")]
    pub history_window: usize,
    /// Name of an environment variable holding a bearer token for the webhook.
    #[serde(default)]
    pub token_env: Option<String>,
}

fn default_timeout_secs() -> u64 {
    60
}
fn default_max_retries() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    500
}
fn default_backoff_max_ms() -> u64 {
    8_000
}
fn default_history_window() -> usize {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct SessionsConfig {
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
            max_messages: default_max_messages(),
        }
    }
}

fn default_max_sessions() -> usize {
    500
}
fn default_max_messages() -> usize {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct PdfConfig {
    /// Direct-download URL with an `{id}` placeholder for the file id.
    #[serde(default = "default_download_url_template")]
    pub download_url_template: String,
    /// Hosts that `GET /api/pdf?url=` may fetch from, and that downloads may
    /// be redirected to. Subdomains are included.
    #[serde(default = "default_allowed_hosts")]
    pub allowed_hosts: Vec<String>,
    #[serde(default = "default_pdf_max_bytes")]
    pub max_bytes: u64,
    /// Total size of cached documents, in bytes.
    #[serde(default = "default_cache_max_bytes")]
    pub cache_max_bytes: u64,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    /// Used for highlight placement when a page has no extractable text.
    #[serde(default = "default_lines_per_page")]
    pub lines_per_page: usize,
}

impl Default for PdfConfig {
    fn default() -> Self {
        Self {
            download_url_template: default_download_url_template(),
            allowed_hosts: default_allowed_hosts(),
            max_bytes: default_pdf_max_bytes(),
            cache_max_bytes: default_cache_max_bytes(),
            cache_ttl_secs: default_cache_ttl_secs(),
            lines_per_page: default_lines_per_page(),
        }
    }
}

fn default_download_url_template() -> String {
    "https://drive.google.com/uc?export=download&id={id}".to_string()
}
fn default_pdf_max_bytes() -> u64 {
    50 * 1024 * 1024
}
fn default_allowed_hosts() -> Vec<String> {
    // Drive's download endpoint redirects here.
    vec!["drive.usercontent.google.com".to_string()]
}
fn default_cache_max_bytes() -> u64 {
    200 * 1024 * 1024
}
fn default_cache_ttl_secs() -> u64 {
    600
}
fn default_lines_per_page() -> usize {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    #[serde(default = "default_secret_env")]
    pub secret_env: String,
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: i64,
    #[serde(default)]
    pub users: Vec<UserConfig>,
}

fn default_secret_env() -> String {
    "DOCCHAT_AUTH_SECRET".to_string()
}
fn default_token_ttl_secs() -> i64 {
    12 * 60 * 60
}

#[derive(Debug, Deserialize, Clone)]
pub struct UserConfig {
    pub username: String,
    /// Hex-encoded SHA-256 digest of the password.
    pub password_sha256: String,
}

impl Config {
    /// Parses and validates configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(content).with_context(|| "Failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.server.bind.trim().is_empty() {
            bail!("server.bind must not be empty");
        }

        let url = reqwest::Url::parse(&self.webhook.url)
            .with_context(|| format!("webhook.url is not a valid URL: {}", self.webhook.url))?;
        if !matches!(url.scheme(), "http" | "https") {
            bail!("webhook.url must use http or https, got '{}'", url.scheme());
        }
        if let Some(docs) = &self.webhook.documents_url {
            reqwest::Url::parse(docs)
                .with_context(|| format!("webhook.documents_url is not a valid URL: {}", docs))?;
        }
        if self.webhook.timeout_secs == 0 {
            bail!("webhook.timeout_secs must be > 0");
        }
        if self.webhook.backoff_base_ms == 0 {
            bail!("webhook.backoff_base_ms must be > 0");
        }
        if self.webhook.backoff_max_ms < self.webhook.backoff_base_ms {
            bail!("webhook.backoff_max_ms must be >= webhook.backoff_base_ms");
        }

        if self.sessions.max_sessions == 0 {
            bail!("sessions.max_sessions must be >= 1");
        }
        if self.sessions.max_messages < 2 {
            bail!("sessions.max_messages must be >= 2");
        }

        if !self.pdf.download_url_template.contains("{id}") {
            bail!("pdf.download_url_template must contain an {{id}} placeholder");
        }
        if self.pdf.lines_per_page == 0 {
            bail!("pdf.lines_per_page must be >= 1");
        }
        if self.pdf.max_bytes == 0 {
            bail!("pdf.max_bytes must be > 0");
        }
        if self.pdf.max_bytes > u64::from(u32::MAX) {
            bail!("pdf.max_bytes must be < 4 GiB");
        }

        if let Some(auth) = &self.auth {
            if auth.token_ttl_secs <= 0 {
                bail!("auth.token_ttl_secs must be > 0");
            }
            if auth.users.is_empty() {
                bail!("auth is configured but auth.users is empty");
            }
            let mut seen = HashSet::new();
            for user in &auth.users {
                if user.username.trim().is_empty() || user.username.contains(':') {
                    bail!("auth user names must be non-empty and must not contain ':'");
                }
                if !seen.insert(user.username.as_str()) {
                    bail!("duplicate auth user: {}", user.username);
                }
                let digest = &user.password_sha256;
                if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
                    bail!(
                        "auth user '{}': password_sha256 must be 64 hex characters",
                        user.username
                    );
                }
            }
        }

        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    Config::from_toml(&content)
}
