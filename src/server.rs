//! HTTP API for the chat UI.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `POST` | `/api/login` | Exchange credentials for a bearer token |
//! | `POST` | `/api/chat` | Send a message, receive the normalized answer |
//! | `GET`  | `/api/sessions` | List chat sessions, newest first |
//! | `DELETE` | `/api/sessions` | Delete every session of the caller |
//! | `GET`  | `/api/sessions/{id}/messages` | Full history of a session |
//! | `DELETE` | `/api/sessions/{id}` | Delete a session |
//! | `GET`  | `/api/documents` | Document list from the workflow service |
//! | `GET`  | `/api/documents/{file_id}/pdf` | Proxied PDF bytes |
//! | `GET`  | `/api/documents/{file_id}/highlight?start=&end=` | Highlight placement |
//! | `GET`  | `/api/pdf?url=` | Proxied PDF from an allowed host |
//!
//! Anything else is served from `server.static_dir` when it is configured.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "message must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `unauthorized` (401), `forbidden` (403),
//! `not_found` (404), `payload_too_large` (413), `internal` (500),
//! `upstream_error` (502), `upstream_timeout` (504).
//!
//! # Authentication
//!
//! When `[auth]` is configured every `/api/*` route except `/api/login`
//! requires `Authorization: Bearer <token>`, and sessions are scoped to the
//! token's user.

use anyhow::Context;
use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        DefaultBodyLimit, Path, Query, Request, State,
    },
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::auth::Authenticator;
use crate::config::Config;
use crate::highlight::{locate_in_pdf, HighlightRegion};
use crate::models::{ChatMessage, DocumentInfo, LineRange, SessionSummary};
use crate::pdf::{PdfError, PdfFetcher};
use crate::sessions::{is_valid_session_id, SessionStore};
use crate::webhook::{AnswerBackend, ChatTurn, WebhookClient, WebhookError};

/// Longest accepted chat message, in characters.
pub const MAX_MESSAGE_CHARS: usize = 8_000;
const MAX_FILE_ID_LEN: usize = 256;

/// Shared application state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    backend: Arc<dyn AnswerBackend>,
    sessions: SessionStore,
    pdfs: PdfFetcher,
    auth: Option<Arc<Authenticator>>,
}

/// The authenticated user, or `None` when auth is disabled.
#[derive(Clone, Debug)]
struct CurrentUser(Option<String>);

/// Starts the server with the webhook backend described by `config`.
///
/// Runs until the process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let backend = WebhookClient::new(&config.webhook)?;
    run_server_with_backend(config, Arc::new(backend)).await
}

/// Starts the server with a custom [`AnswerBackend`].
///
/// ```rust,no_run
/// use docchat::server::run_server_with_backend;
/// use docchat::webhook::WebhookClient;
/// use std::sync::Arc;
///
/// # async fn example(config: &docchat::config::Config) -> anyhow::Result<()> {
/// let backend = WebhookClient::new(&config.webhook)?;
/// run_server_with_backend(config, Arc::new(backend)).await?;
/// # Ok(())
/// # }
/// ```
pub async fn run_server_with_backend(
    config: &Config,
    backend: Arc<dyn AnswerBackend>,
) -> anyhow::Result<()> {
    let app = build_router(config, backend)?;

    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind))?;
    tracing::info!("docchat listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app).await?;
    Ok(())
}

/// Builds the application router without binding a socket.
pub fn build_router(config: &Config, backend: Arc<dyn AnswerBackend>) -> anyhow::Result<Router> {
    let auth = match &config.auth {
        Some(auth_config) => Some(Arc::new(Authenticator::from_config(auth_config)?)),
        None => None,
    };

    let state = AppState {
        config: Arc::new(config.clone()),
        backend,
        sessions: SessionStore::new(&config.sessions),
        pdfs: PdfFetcher::new(&config.pdf, Duration::from_secs(config.webhook.timeout_secs))?,
        auth,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let protected = Router::new()
        .route("/api/chat", post(handle_chat))
        .route(
            "/api/sessions",
            get(handle_list_sessions).delete(handle_clear_sessions),
        )
        .route("/api/sessions/{id}", axum::routing::delete(handle_delete_session))
        .route("/api/sessions/{id}/messages", get(handle_session_messages))
        .route("/api/documents", get(handle_documents))
        .route("/api/documents/{file_id}/pdf", get(handle_document_pdf))
        .route("/api/documents/{file_id}/highlight", get(handle_highlight))
        .route("/api/pdf", get(handle_pdf_url))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    let public = Router::new()
        .route("/health", get(handle_health))
        .route("/api/login", post(handle_login));

    let mut app = Router::new().merge(public).merge(protected);
    if let Some(dir) = &config.server.static_dir {
        tracing::info!(dir = %dir.display(), "serving UI bundle");
        app = app.fallback_service(ServeDir::new(dir).append_index_html_on_directories(true));
    }

    Ok(app
        .layer(DefaultBodyLimit::max(config.server.max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state))
}

// ============ Error response ============

/// JSON error response body.
#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

/// Inner error detail with a machine-readable code and human-readable message.
#[derive(Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

/// Internal error type that converts into an Axum HTTP response.
#[derive(Debug)]
struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn app_error(status: StatusCode, code: &'static str, message: impl Into<String>) -> AppError {
    AppError {
        status,
        code,
        message: message.into(),
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    app_error(StatusCode::BAD_REQUEST, "bad_request", message)
}

fn unauthorized(message: impl Into<String>) -> AppError {
    app_error(StatusCode::UNAUTHORIZED, "unauthorized", message)
}

fn not_found(message: impl Into<String>) -> AppError {
    app_error(StatusCode::NOT_FOUND, "not_found", message)
}

fn internal(message: impl Into<String>) -> AppError {
    app_error(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
}

impl From<WebhookError> for AppError {
    fn from(err: WebhookError) -> Self {
        match &err {
            WebhookError::NotConfigured(_) => not_found(err.to_string()),
            e if e.is_timeout() => {
                app_error(StatusCode::GATEWAY_TIMEOUT, "upstream_timeout", err.to_string())
            }
            _ => app_error(StatusCode::BAD_GATEWAY, "upstream_error", err.to_string()),
        }
    }
}

impl From<PdfError> for AppError {
    fn from(err: PdfError) -> Self {
        let message = err.to_string();
        match err {
            PdfError::InvalidUrl(_) => bad_request(message),
            PdfError::HostNotAllowed(_) => app_error(StatusCode::FORBIDDEN, "forbidden", message),
            PdfError::TooLarge(_) => {
                app_error(StatusCode::PAYLOAD_TOO_LARGE, "payload_too_large", message)
            }
            PdfError::Status(404) => not_found(message),
            PdfError::Timeout => {
                app_error(StatusCode::GATEWAY_TIMEOUT, "upstream_timeout", message)
            }
            PdfError::Request(_)
            | PdfError::TooManyRedirects
            | PdfError::Status(_)
            | PdfError::NotPdf => app_error(StatusCode::BAD_GATEWAY, "upstream_error", message),
        }
    }
}

/// Extractor rejections: oversized bodies keep 413, everything else is a 400.
fn rejection(status: StatusCode, message: String) -> AppError {
    if status == StatusCode::PAYLOAD_TOO_LARGE {
        app_error(status, "payload_too_large", message)
    } else {
        bad_request(message)
    }
}

impl From<JsonRejection> for AppError {
    fn from(err: JsonRejection) -> Self {
        rejection(err.status(), err.body_text())
    }
}

impl From<QueryRejection> for AppError {
    fn from(err: QueryRejection) -> Self {
        rejection(err.status(), err.body_text())
    }
}

// ============ Auth ============

async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let user = match &state.auth {
        None => None,
        Some(auth) => {
            let token = request
                .headers()
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
                .ok_or_else(|| unauthorized("missing bearer token"))?;
            let username = auth
                .verify(token.trim(), Utc::now())
                .map_err(|e| unauthorized(e.to_string()))?;
            Some(username)
        }
    };
    request.extensions_mut().insert(CurrentUser(user));
    Ok(next.run(request).await)
}

#[derive(Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

#[derive(Serialize)]
struct LoginResponse {
    username: String,
    token: String,
    expires_at: DateTime<Utc>,
}

/// Handler for `POST /api/login`.
async fn handle_login(
    State(state): State<AppState>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<Json<LoginResponse>, AppError> {
    let Json(req) = payload?;
    let auth = state
        .auth
        .as_ref()
        .ok_or_else(|| not_found("authentication is not enabled"))?;
    let issued = auth.login(&req.username, &req.password, Utc::now()).map_err(|e| {
        tracing::info!(user = %req.username, "login rejected");
        unauthorized(e.to_string())
    })?;
    tracing::info!(user = %req.username, "login");
    Ok(Json(LoginResponse {
        username: req.username,
        token: issued.token,
        expires_at: issued.expires_at,
    }))
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /api/chat ============

#[derive(Deserialize)]
struct ChatRequest {
    #[serde(alias = "sessionId")]
    session_id: String,
    #[serde(alias = "chatInput")]
    message: String,
    #[serde(default, alias = "webSearch")]
    web_search: bool,
}

/// Handler for `POST /api/chat`.
///
/// Stores the user message, forwards it to the backend together with the
/// recent history, and stores and returns the assistant's reply. If the
/// backend fails the user message stays in the history.
async fn handle_chat(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Json<ChatMessage>, AppError> {
    let Json(req) = payload?;
    let message = req.message.trim();
    if message.is_empty() {
        return Err(bad_request("message must not be empty"));
    }
    if message.chars().count() > MAX_MESSAGE_CHARS {
        return Err(bad_request(format!(
            "message must be at most {} characters",
            MAX_MESSAGE_CHARS
        )));
    }
    if !is_valid_session_id(&req.session_id) {
        return Err(bad_request(
            "session_id must be 1-128 characters of letters, digits, '-' or '_'",
        ));
    }

    let owner = user.0.as_deref();
    let history = state
        .sessions
        .recent(owner, &req.session_id, state.config.webhook.history_window)
        .await;
    state
        .sessions
        .append(owner, ChatMessage::user(&req.session_id, message))
        .await;

    let turn = ChatTurn {
        session_id: req.session_id.clone(),
        message: message.to_string(),
        web_search: req.web_search,
        history,
    };
    let answer = state.backend.ask(&turn).await.map_err(|e| {
        tracing::error!(session = %req.session_id, error = %e, "chat turn failed");
        AppError::from(e)
    })?;

    let reply = ChatMessage::assistant(&req.session_id, answer);
    state.sessions.append(owner, reply.clone()).await;
    Ok(Json(reply))
}

// ============ Sessions ============

#[derive(Serialize)]
struct SessionListResponse {
    sessions: Vec<SessionSummary>,
}

async fn handle_list_sessions(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
) -> Json<SessionListResponse> {
    Json(SessionListResponse {
        sessions: state.sessions.list(user.0.as_deref()).await,
    })
}

#[derive(Serialize)]
struct ClearResponse {
    deleted: usize,
}

async fn handle_clear_sessions(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
) -> Json<ClearResponse> {
    Json(ClearResponse {
        deleted: state.sessions.clear_owner(user.0.as_deref()).await,
    })
}

#[derive(Serialize)]
struct SessionMessagesResponse {
    session_id: String,
    messages: Vec<ChatMessage>,
}

async fn handle_session_messages(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Path(id): Path<String>,
) -> Result<Json<SessionMessagesResponse>, AppError> {
    let messages = state
        .sessions
        .history(user.0.as_deref(), &id)
        .await
        .ok_or_else(|| not_found(format!("session not found: {}", id)))?;
    Ok(Json(SessionMessagesResponse {
        session_id: id,
        messages,
    }))
}

async fn handle_delete_session(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    if state.sessions.delete(user.0.as_deref(), &id).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_found(format!("session not found: {}", id)))
    }
}

// ============ Documents ============

#[derive(Serialize)]
struct DocumentListResponse {
    documents: Vec<DocumentInfo>,
}

async fn handle_documents(
    State(state): State<AppState>,
) -> Result<Json<DocumentListResponse>, AppError> {
    let documents = state.backend.list_documents().await?;
    Ok(Json(DocumentListResponse { documents }))
}

fn check_file_id(file_id: &str) -> Result<(), AppError> {
    if file_id.trim().is_empty() || file_id.len() > MAX_FILE_ID_LEN {
        return Err(bad_request("invalid file id"));
    }
    Ok(())
}

fn pdf_response(bytes: Bytes) -> Response {
    (
        [
            (header::CONTENT_TYPE, "application/pdf"),
            (header::CONTENT_DISPOSITION, "inline"),
            (header::CACHE_CONTROL, "private, max-age=300"),
        ],
        bytes,
    )
        .into_response()
}

async fn handle_document_pdf(
    State(state): State<AppState>,
    Path(file_id): Path<String>,
) -> Result<Response, AppError> {
    check_file_id(&file_id)?;
    let bytes = state.pdfs.fetch_file(&file_id).await?;
    Ok(pdf_response(bytes))
}

#[derive(Deserialize)]
struct PdfUrlQuery {
    url: String,
}

async fn handle_pdf_url(
    State(state): State<AppState>,
    query: Result<Query<PdfUrlQuery>, QueryRejection>,
) -> Result<Response, AppError> {
    let Query(query) = query?;
    let bytes = state.pdfs.fetch_url(&query.url).await?;
    Ok(pdf_response(bytes))
}

#[derive(Deserialize)]
struct HighlightQuery {
    start: u32,
    #[serde(default)]
    end: Option<u32>,
}

async fn handle_highlight(
    State(state): State<AppState>,
    Path(file_id): Path<String>,
    query: Result<Query<HighlightQuery>, QueryRejection>,
) -> Result<Json<HighlightRegion>, AppError> {
    let Query(query) = query?;
    check_file_id(&file_id)?;
    if query.start == 0 {
        return Err(bad_request("start must be >= 1"));
    }
    let range = LineRange::new(query.start, query.end.unwrap_or(query.start));
    let bytes = state.pdfs.fetch_file(&file_id).await?;
    let fallback = state.config.pdf.lines_per_page;

    let region = tokio::task::spawn_blocking(move || locate_in_pdf(&bytes, range, fallback))
        .await
        .map_err(|e| internal(format!("highlight task failed: {}", e)))?;
    Ok(Json(region))
}
