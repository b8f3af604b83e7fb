//! # docchat
//!
//! Backend for a document chat assistant.
//!
//! The browser UI talks only to this server. Retrieval, ranking, web search
//! and answer generation happen in an external workflow service reached over
//! a webhook; docchat delivers chat turns to it with retries, normalizes the
//! many response shapes the workflow produces into one [`models::Answer`],
//! keeps per-session history, and proxies cited PDFs so the preview pane can
//! render them and highlight the cited lines.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────────┐   ┌──────────────────┐
//! │ Browser  │──▶│   HTTP server    │──▶│ Workflow webhook │
//! │   UI     │◀──│ sessions + auth  │◀──│  (retry+backoff) │
//! └──────────┘   └────────┬─────────┘   └──────────────────┘
//!                         │                      │
//!                         ▼                      ▼
//!                 ┌──────────────┐       ┌──────────────┐
//!                 │  PDF proxy   │       │  normalize   │
//!                 │ + highlight  │       │  → Answer    │
//!                 └──────────────┘       └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! docchat check                       # validate the configuration
//! docchat ask "What does clause 4 say?"
//! docchat serve                       # start the HTTP server
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`models`] | Messages, answers, references |
//! | [`normalize`] | Webhook response normalization |
//! | [`webhook`] | Webhook client with retry and backoff |
//! | [`sessions`] | In-memory session history |
//! | [`documents`] | Document list parsing and download links |
//! | [`pdf`] | PDF download proxy with cache |
//! | [`highlight`] | Line range to page region mapping |
//! | [`auth`] | Login and bearer tokens |
//! | [`server`] | HTTP API |

pub mod auth;
pub mod config;
pub mod documents;
pub mod highlight;
pub mod models;
pub mod normalize;
pub mod pdf;
pub mod server;
pub mod sessions;
pub mod webhook;
