//! End-to-end tests for the HTTP API.
//!
//! A mock workflow service (chat webhook, document list and file downloads)
//! and the docchat server are started on free ports; requests go through real
//! sockets with reqwest.

use async_trait::async_trait;
use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
    Json, Router,
};
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Document, Object, Stream};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use docchat::auth::hash_password;
use docchat::config::Config;
use docchat::models::{Answer, DocumentInfo};
use docchat::server::run_server_with_backend;
use docchat::webhook::{AnswerBackend, ChatTurn, WebhookClient, WebhookError};

// ─── Helpers ────────────────────────────────────────────────────────

fn find_free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

async fn wait_for_server(port: u16) {
    let client = reqwest::Client::new();
    let url = format!("http://127.0.0.1:{}/health", port);
    for _ in 0..50 {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        if let Ok(resp) = client.get(&url).send().await {
            if resp.status().is_success() {
                return;
            }
        }
    }
    panic!("Server did not become ready within 5 seconds");
}

/// Two pages: three text lines, then two.
fn sample_pdf() -> Vec<u8> {
    let pages: &[&[&str]] = &[
        &["Section 1", "The parties agree", "to the following terms"],
        &["Clause 4: termination", "Either party may terminate"],
    ];

    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Courier",
    });
    let resources_id = doc.add_object(dictionary! {
        "Font" => dictionary! { "F1" => font_id },
    });

    let mut kids: Vec<Object> = Vec::new();
    for lines in pages {
        let mut operations = Vec::new();
        for (i, line) in lines.iter().enumerate() {
            operations.push(Operation::new("BT", vec![]));
            operations.push(Operation::new("Tf", vec!["F1".into(), 12.into()]));
            operations.push(Operation::new(
                "Td",
                vec![72.into(), (760 - 14 * i as i64).into()],
            ));
            operations.push(Operation::new("Tj", vec![Object::string_literal(*line)]));
            operations.push(Operation::new("ET", vec![]));
        }
        let content = Content { operations };
        let content_id = doc.add_object(Stream::new(dictionary! {}, content.encode().unwrap()));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
            "Resources" => resources_id,
        });
        kids.push(page_id.into());
    }

    let count = kids.len() as i64;
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count,
            "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut buf = Vec::new();
    doc.save_to(&mut buf).unwrap();
    buf
}

// ─── Mock workflow service ──────────────────────────────────────────

#[derive(Clone, Default)]
struct Workflow {
    port: u16,
    payloads: Arc<Mutex<Vec<Value>>>,
    failing: Arc<AtomicBool>,
    pdf: Arc<Vec<u8>>,
}

async fn workflow_chat(State(wf): State<Workflow>, Json(payload): Json<Value>) -> Response {
    wf.payloads.lock().unwrap().push(payload.clone());
    if wf.failing.load(Ordering::SeqCst) {
        return (StatusCode::INTERNAL_SERVER_ERROR, "workflow crashed").into_response();
    }

    let question = payload["chatInput"].as_str().unwrap_or_default();
    let inner = json!({
        "answer": format!("You asked: {}", question),
        "references": [
            { "file_id": "doc-1", "name": "Contract.pdf", "lines": "4-5" }
        ]
    });
    let output = format!("Here you go.\n```json\n{}\n```", inner);
    Json(json!([{ "output": output }])).into_response()
}

async fn workflow_documents() -> Json<Value> {
    Json(json!([
        { "json": { "id": "doc-1", "name": "Contract.pdf", "mimeType": "application/pdf" } },
        { "json": { "id": "doc-2", "name": "annex.pdf" } },
        { "json": { "id": "doc-1", "name": "Contract.pdf" } }
    ]))
}

async fn workflow_file(State(wf): State<Workflow>, Path(id): Path<String>) -> Response {
    match id.as_str() {
        "doc-1" => (
            [(header::CONTENT_TYPE, "application/pdf")],
            wf.pdf.as_ref().clone(),
        )
            .into_response(),
        "not-a-pdf" => "<html>login required</html>".into_response(),
        // Same server, but under a host name that is not allowed.
        "hop" => Redirect::temporary(&format!("http://localhost:{}/files/doc-1", wf.port))
            .into_response(),
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn workflow_slow() -> &'static str {
    tokio::time::sleep(std::time::Duration::from_secs(3)).await;
    "too late"
}

async fn start_workflow() -> (u16, Workflow) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let wf = Workflow {
        port,
        pdf: Arc::new(sample_pdf()),
        ..Workflow::default()
    };
    let app = Router::new()
        .route("/webhook", post(workflow_chat))
        .route("/slow", post(workflow_slow))
        .route("/documents", get(workflow_documents))
        .route("/files/{id}", get(workflow_file))
        .with_state(wf.clone());

    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    (port, wf)
}

fn test_config(port: u16, workflow_port: u16, extra: &str) -> Config {
    let toml = format!(
        r#"
[server]
bind = "127.0.0.1:{port}"

[webhook]
url = "http://127.0.0.1:{wp}/webhook"
documents_url = "http://127.0.0.1:{wp}/documents"
timeout_secs = 5
max_retries = 1
backoff_base_ms = 10
backoff_max_ms = 20
history_window = 4

[pdf]
download_url_template = "http://127.0.0.1:{wp}/files/{{id}}"
{extra}
"#,
        port = port,
        wp = workflow_port,
        extra = extra,
    );
    Config::from_toml(&toml).unwrap()
}

async fn start_server(cfg: Config, backend: Arc<dyn AnswerBackend>) -> String {
    let port: u16 = cfg
        .server
        .bind
        .rsplit(':')
        .next()
        .unwrap()
        .parse()
        .unwrap();
    tokio::spawn(async move {
        run_server_with_backend(&cfg, backend).await.ok();
    });
    wait_for_server(port).await;
    format!("http://127.0.0.1:{}", port)
}

async fn start_with_workflow(extra: &str) -> (String, Workflow, u16) {
    let (wp, wf) = start_workflow().await;
    let cfg = test_config(find_free_port(), wp, extra);
    let backend = Arc::new(WebhookClient::new(&cfg.webhook).unwrap());
    let base = start_server(cfg, backend).await;
    (base, wf, wp)
}

async fn error_code(resp: reqwest::Response) -> String {
    let body: Value = resp.json().await.unwrap();
    body["error"]["code"].as_str().unwrap().to_string()
}

// ─── Tests ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_health() {
    let (base, _, _) = start_with_workflow("").await;
    let body: Value = reqwest::get(format!("{}/health", base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn test_chat_flow_and_sessions() {
    let (base, wf, _) = start_with_workflow("").await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/api/chat", base))
        .json(&json!({ "session_id": "s1", "message": "What is clause 4?" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let reply: Value = resp.json().await.unwrap();
    assert_eq!(reply["role"], "assistant");
    assert_eq!(reply["session_id"], "s1");
    assert_eq!(reply["content"], "You asked: What is clause 4?");
    assert_eq!(reply["references"][0]["file_id"], "doc-1");
    assert_eq!(reply["references"][0]["lines"]["start"], 4);
    assert_eq!(reply["references"][0]["lines"]["end"], 5);

    let resp = client
        .post(format!("{}/api/chat", base))
        .json(&json!({ "sessionId": "s1", "chatInput": "And clause 5?", "webSearch": true }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    // The second turn carries the first exchange as history.
    {
        let payloads = wf.payloads.lock().unwrap();
        assert_eq!(payloads.len(), 2);
        assert_eq!(payloads[0]["history"].as_array().unwrap().len(), 0);
        let second = &payloads[1];
        assert_eq!(second["sessionId"], "s1");
        assert_eq!(second["chatInput"], "And clause 5?");
        assert_eq!(second["webSearch"], true);
        let history = second["history"].as_array().unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0]["role"], "user");
        assert_eq!(history[0]["content"], "What is clause 4?");
        assert_eq!(history[1]["role"], "assistant");
    }

    let list: Value = client
        .get(format!("{}/api/sessions", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let sessions = list["sessions"].as_array().unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0]["id"], "s1");
    assert_eq!(sessions[0]["title"], "What is clause 4?");
    assert_eq!(sessions[0]["message_count"], 4);

    let history: Value = client
        .get(format!("{}/api/sessions/s1/messages", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let messages = history["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 4);
    assert_eq!(messages[0]["role"], "user");
    assert_eq!(messages[3]["role"], "assistant");

    let resp = client
        .delete(format!("{}/api/sessions/s1", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);

    let resp = client
        .delete(format!("{}/api/sessions/s1", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    assert_eq!(error_code(resp).await, "not_found");

    let resp = client
        .get(format!("{}/api/sessions/s1/messages", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn test_chat_validation() {
    let (base, wf, _) = start_with_workflow("").await;
    let client = reqwest::Client::new();

    for body in [
        json!({ "session_id": "s1", "message": "   " }),
        json!({ "session_id": "bad id!", "message": "hello" }),
        json!({ "session_id": "s1", "message": "x".repeat(8_001) }),
    ] {
        let resp = client
            .post(format!("{}/api/chat", base))
            .json(&body)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        assert_eq!(error_code(resp).await, "bad_request");
    }
    assert!(wf.payloads.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_webhook_failure_keeps_user_message() {
    let (base, wf, _) = start_with_workflow("").await;
    wf.failing.store(true, Ordering::SeqCst);
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/api/chat", base))
        .json(&json!({ "session_id": "s2", "message": "Is anyone there?" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 502);
    assert_eq!(error_code(resp).await, "upstream_error");

    // One try plus one retry.
    assert_eq!(wf.payloads.lock().unwrap().len(), 2);

    let history: Value = client
        .get(format!("{}/api/sessions/s2/messages", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let messages = history["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["content"], "Is anyone there?");
}

#[tokio::test]
async fn test_documents_list() {
    let (base, _, _) = start_with_workflow("").await;
    let body: Value = reqwest::get(format!("{}/api/documents", base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let docs = body["documents"].as_array().unwrap();
    let names: Vec<&str> = docs.iter().map(|d| d["name"].as_str().unwrap()).collect();
    assert_eq!(names, vec!["annex.pdf", "Contract.pdf"]);
    assert_eq!(docs[1]["mime_type"], "application/pdf");
}

#[tokio::test]
async fn test_pdf_proxy() {
    let (base, _, wp) = start_with_workflow("").await;

    let resp = reqwest::get(format!("{}/api/documents/doc-1/pdf", base))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers()["content-type"], "application/pdf");
    let bytes = resp.bytes().await.unwrap();
    assert!(bytes.starts_with(b"%PDF-"));

    let resp = reqwest::get(format!("{}/api/documents/missing/pdf", base))
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    let resp = reqwest::get(format!("{}/api/documents/not-a-pdf/pdf", base))
        .await
        .unwrap();
    assert_eq!(resp.status(), 502);
    assert_eq!(error_code(resp).await, "upstream_error");

    // The template host is allowed implicitly.
    let client = reqwest::Client::new();
    let resp = client
        .get(format!("{}/api/pdf", base))
        .query(&[("url", format!("http://127.0.0.1:{}/files/doc-1", wp))])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let resp = client
        .get(format!("{}/api/pdf", base))
        .query(&[("url", "http://metadata.internal/latest")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);
    assert_eq!(error_code(resp).await, "forbidden");
}

#[tokio::test]
async fn test_pdf_redirect_to_other_host_is_forbidden() {
    let (base, _, wp) = start_with_workflow("").await;

    let resp = reqwest::get(format!("{}/api/documents/hop/pdf", base))
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);
    assert_eq!(error_code(resp).await, "forbidden");

    let resp = reqwest::Client::new()
        .get(format!("{}/api/pdf", base))
        .query(&[("url", format!("http://127.0.0.1:{}/files/hop", wp))])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);
    assert_eq!(error_code(resp).await, "forbidden");
}

#[tokio::test]
async fn test_pdf_over_size_limit() {
    let (base, _, _) = start_with_workflow("max_bytes = 100").await;

    let resp = reqwest::get(format!("{}/api/documents/doc-1/pdf", base))
        .await
        .unwrap();
    assert_eq!(resp.status(), 413);
    assert_eq!(error_code(resp).await, "payload_too_large");
}

#[tokio::test]
async fn test_webhook_timeout_is_504() {
    let (wp, _) = start_workflow().await;
    let mut cfg = test_config(find_free_port(), wp, "");
    cfg.webhook.url = format!("http://127.0.0.1:{}/slow", wp);
    cfg.webhook.timeout_secs = 1;
    cfg.webhook.max_retries = 0;
    let backend = Arc::new(WebhookClient::new(&cfg.webhook).unwrap());
    let base = start_server(cfg, backend).await;

    let resp = reqwest::Client::new()
        .post(format!("{}/api/chat", base))
        .json(&json!({ "session_id": "slow", "message": "anyone?" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 504);
    assert_eq!(error_code(resp).await, "upstream_timeout");
}

#[tokio::test]
async fn test_rejected_requests_use_error_contract() {
    let (wp, _) = start_workflow().await;
    let mut cfg = test_config(find_free_port(), wp, "");
    cfg.server.max_body_bytes = 1024;
    let backend = Arc::new(WebhookClient::new(&cfg.webhook).unwrap());
    let base = start_server(cfg, backend).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/api/chat", base))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    assert_eq!(error_code(resp).await, "bad_request");

    let resp = client
        .post(format!("{}/api/chat", base))
        .body(r#"{"session_id": "s1", "message": "hi"}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    assert_eq!(error_code(resp).await, "bad_request");

    let resp = client
        .post(format!("{}/api/chat", base))
        .json(&json!({ "session_id": "s1", "message": "x".repeat(4_000) }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 413);
    assert_eq!(error_code(resp).await, "payload_too_large");

    let resp = client
        .get(format!("{}/api/documents/doc-1/highlight", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    assert_eq!(error_code(resp).await, "bad_request");

    let resp = client
        .get(format!("{}/api/pdf", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    assert_eq!(error_code(resp).await, "bad_request");
}

#[tokio::test]
async fn test_highlight() {
    let (base, _, _) = start_with_workflow("").await;

    let region: Value = reqwest::get(format!(
        "{}/api/documents/doc-1/highlight?start=4&end=5",
        base
    ))
    .await
    .unwrap()
    .json()
    .await
    .unwrap();
    assert_eq!(region["page"], 2);
    assert_eq!(region["page_count"], 2);
    assert_eq!(region["lines"]["start"], 4);
    assert_eq!(region["lines"]["end"], 5);
    assert_eq!(region["approximate"], false);

    let single: Value = reqwest::get(format!("{}/api/documents/doc-1/highlight?start=2", base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(single["page"], 1);
    assert_eq!(single["lines"]["end"], 2);

    let resp = reqwest::get(format!("{}/api/documents/doc-1/highlight?start=0", base))
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn test_login_disabled_without_auth() {
    let (base, _, _) = start_with_workflow("").await;
    let resp = reqwest::Client::new()
        .post(format!("{}/api/login", base))
        .json(&json!({ "username": "a", "password": "b" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn test_static_fallback() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("index.html"), "<h1>docchat</h1>").unwrap();

    let (wp, _) = start_workflow().await;
    let mut cfg = test_config(find_free_port(), wp, "");
    cfg.server.static_dir = Some(dir.path().to_path_buf());
    let backend = Arc::new(WebhookClient::new(&cfg.webhook).unwrap());
    let base = start_server(cfg, backend).await;

    let body = reqwest::get(format!("{}/", base))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(body.contains("docchat"));

    // API routes still win over the fallback.
    let resp = reqwest::get(format!("{}/health", base)).await.unwrap();
    assert_eq!(resp.status(), 200);
}

// ─── Auth, with an in-process backend ───────────────────────────────

struct StaticBackend;

#[async_trait]
impl AnswerBackend for StaticBackend {
    async fn ask(&self, turn: &ChatTurn) -> Result<Answer, WebhookError> {
        Ok(Answer {
            text: format!("echo: {}", turn.message),
            ..Answer::default()
        })
    }

    async fn list_documents(&self) -> Result<Vec<DocumentInfo>, WebhookError> {
        Err(WebhookError::NotConfigured("webhook.documents_url"))
    }
}

async fn login(client: &reqwest::Client, base: &str, user: &str, password: &str) -> reqwest::Response {
    client
        .post(format!("{}/api/login", base))
        .json(&json!({ "username": user, "password": password }))
        .send()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_auth_and_session_scoping() {
    std::env::set_var("DOCCHAT_IT_AUTH_SECRET", "integration-secret");
    let extra = format!(
        r#"
[auth]
secret_env = "DOCCHAT_IT_AUTH_SECRET"

[[auth.users]]
username = "ana"
password_sha256 = "{}"

[[auth.users]]
username = "ben"
password_sha256 = "{}"
"#,
        hash_password("ana-pass"),
        hash_password("ben-pass"),
    );
    let cfg = test_config(find_free_port(), find_free_port(), &extra);
    let base = start_server(cfg, Arc::new(StaticBackend)).await;
    let client = reqwest::Client::new();

    // Health stays public.
    let resp = client.get(format!("{}/health", base)).send().await.unwrap();
    assert_eq!(resp.status(), 200);

    let resp = client.get(format!("{}/api/sessions", base)).send().await.unwrap();
    assert_eq!(resp.status(), 401);
    assert_eq!(error_code(resp).await, "unauthorized");

    let resp = client
        .get(format!("{}/api/sessions", base))
        .bearer_auth("not-a-token")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    let resp = login(&client, &base, "ana", "wrong").await;
    assert_eq!(resp.status(), 401);

    let ana: Value = login(&client, &base, "ana", "ana-pass").await.json().await.unwrap();
    let ana_token = ana["token"].as_str().unwrap().to_string();
    assert_eq!(ana["username"], "ana");
    assert!(ana["expires_at"].is_string());

    let ben: Value = login(&client, &base, "ben", "ben-pass").await.json().await.unwrap();
    let ben_token = ben["token"].as_str().unwrap().to_string();

    let reply: Value = client
        .post(format!("{}/api/chat", base))
        .bearer_auth(&ana_token)
        .json(&json!({ "session_id": "shared", "message": "hi" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(reply["content"], "echo: hi");

    let ana_sessions: Value = client
        .get(format!("{}/api/sessions", base))
        .bearer_auth(&ana_token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(ana_sessions["sessions"].as_array().unwrap().len(), 1);

    // Same session id, different user: not visible.
    let ben_sessions: Value = client
        .get(format!("{}/api/sessions", base))
        .bearer_auth(&ben_token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(ben_sessions["sessions"].as_array().unwrap().is_empty());
    let resp = client
        .get(format!("{}/api/sessions/shared/messages", base))
        .bearer_auth(&ben_token)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    // Documents are not configured on this backend.
    let resp = client
        .get(format!("{}/api/documents", base))
        .bearer_auth(&ana_token)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    let cleared: Value = client
        .delete(format!("{}/api/sessions", base))
        .bearer_auth(&ana_token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(cleared["deleted"], 1);
}
