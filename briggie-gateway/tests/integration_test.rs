//! Integration tests for Briggie Gateway.
//!
//! Drives the full HTTP API against a mocked upstream provider with an
//! isolated history file per test.

use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
    Router,
};
use briggie_common::config::{
    BatchContext, Config, ProviderConfig, ProviderKind, StorageConfig,
};
use briggie_gateway::{build_router, build_state};
use serde_json::{json, Value};
use std::path::Path;
use tempfile::TempDir;
use tower::ServiceExt;
use wiremock::matchers::{header as header_matcher, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const COMPLETIONS_PATH: &str = "/v1/chat/completions";

fn test_config(server: &MockServer, history_path: &Path, provider: ProviderConfig) -> Config {
    Config {
        provider: ProviderConfig {
            api_key: Some("test-key".to_string()),
            base_url: Some(format!("{}/v1", server.uri())),
            system_prompt: Some("Be kind.".to_string()),
            ..provider
        },
        storage: StorageConfig {
            history_path: history_path.to_path_buf(),
        },
        ..Default::default()
    }
}

fn mistral() -> ProviderConfig {
    ProviderConfig {
        kind: ProviderKind::Mistral,
        ..Default::default()
    }
}

fn openai(batch_context: BatchContext) -> ProviderConfig {
    ProviderConfig {
        kind: ProviderKind::OpenAI,
        batch_context,
        ..Default::default()
    }
}

async fn create_test_app(config: &Config) -> Router {
    let state = build_state(config).await;
    build_router(state, &config.server)
}

fn sse_body(fragments: &[&str]) -> String {
    let mut body = String::new();
    for fragment in fragments {
        let chunk = json!({"choices": [{"delta": {"content": fragment}}]});
        body.push_str(&format!("data: {}\n\n", chunk));
    }
    body.push_str("data: [DONE]\n\n");
    body
}

async fn mount_sse(server: &MockServer, fragments: &[&str]) {
    Mock::given(method("POST"))
        .and(path(COMPLETIONS_PATH))
        .and(header_matcher("authorization", "Bearer test-key"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(sse_body(fragments), "text/event-stream"),
        )
        .mount(server)
        .await;
}

async fn mount_completion(server: &MockServer, reply: &str) {
    Mock::given(method("POST"))
        .and(path(COMPLETIONS_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "message": {"role": "assistant", "content": reply},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 12, "completion_tokens": 4}
        })))
        .mount(server)
        .await;
}

/// Messages the upstream received in its most recent request.
async fn last_upstream_messages(server: &MockServer) -> Vec<Value> {
    let requests = server.received_requests().await.unwrap();
    let last = requests.last().expect("upstream was never called");
    let body: Value = serde_json::from_slice(&last.body).unwrap();
    body["messages"].as_array().cloned().unwrap_or_default()
}

async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> axum::response::Response {
    let request = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(b) => request
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_string(&b).unwrap()))
            .unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };
    app.clone().oneshot(request).await.unwrap()
}

async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap()
        .to_vec()
}

async fn request_json(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let response = send(app, method, uri, body).await;
    let status = response.status();
    let json = serde_json::from_slice(&body_bytes(response).await).unwrap();
    (status, json)
}

async fn stream_text(app: &Router, user_id: &str, content: &str) -> (StatusCode, String) {
    let response = send(
        app,
        Method::POST,
        &format!("/chat-system/chat-streaming/{}", user_id),
        Some(json!({"content": content})),
    )
    .await;
    let status = response.status();
    let text = String::from_utf8(body_bytes(response).await).unwrap();
    (status, text)
}

fn read_history_file(path: &Path) -> Value {
    serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
}

// ─────────────────────────────────────────────────────────────────────────────
// Health Check Tests
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_health_check() {
    let temp_dir = TempDir::new().unwrap();
    let server = MockServer::start().await;
    let config = test_config(&server, &temp_dir.path().join("history.json"), mistral());
    let app = create_test_app(&config).await;

    let (status, body) = request_json(&app, Method::GET, "/health", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!({"status": "ok", "provider": "mistral:mistral-small-latest", "mode": "online"})
    );
    assert!(server.received_requests().await.unwrap().is_empty());
}

// ─────────────────────────────────────────────────────────────────────────────
// History Tests
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_submit_then_read_history() {
    let temp_dir = TempDir::new().unwrap();
    let history_path = temp_dir.path().join("history.json");
    let server = MockServer::start().await;
    let config = test_config(&server, &history_path, mistral());
    let app = create_test_app(&config).await;

    let (status, body) = request_json(
        &app,
        Method::POST,
        "/chat-system/chat/alice",
        Some(json!({"content": "hello"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"role": "user", "content": "hello"}));

    let (status, body) = request_json(&app, Method::GET, "/chat-system/chat/alice", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([{"role": "user", "content": "hello"}]));

    assert_eq!(
        read_history_file(&history_path),
        json!({"alice": [{"role": "user", "content": "hello"}]})
    );
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unseen_user_has_empty_history() {
    let temp_dir = TempDir::new().unwrap();
    let server = MockServer::start().await;
    let config = test_config(&server, &temp_dir.path().join("history.json"), mistral());
    let app = create_test_app(&config).await;

    let (status, body) = request_json(&app, Method::GET, "/chat-system/chat/nobody", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));
}

#[tokio::test]
async fn test_corrupt_history_file_starts_empty() {
    let temp_dir = TempDir::new().unwrap();
    let history_path = temp_dir.path().join("history.json");
    std::fs::write(&history_path, "{ not json").unwrap();

    let server = MockServer::start().await;
    let config = test_config(&server, &history_path, mistral());
    let app = create_test_app(&config).await;

    let (status, body) = request_json(&app, Method::GET, "/chat-system/chat/alice", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));
}

#[tokio::test]
async fn test_history_survives_restart() {
    let temp_dir = TempDir::new().unwrap();
    let history_path = temp_dir.path().join("nested").join("history.json");
    let server = MockServer::start().await;
    mount_sse(&server, &["Noted."]).await;
    let config = test_config(&server, &history_path, mistral());

    let app = create_test_app(&config).await;
    stream_text(&app, "carol", "remember me").await;
    drop(app);

    let app = create_test_app(&config).await;
    let (_, body) = request_json(&app, Method::GET, "/chat-system/chat/carol", None).await;
    assert_eq!(
        body,
        json!([
            {"role": "user", "content": "remember me"},
            {"role": "assistant", "content": "Noted."}
        ])
    );
}

#[tokio::test]
async fn test_malformed_body_is_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let history_path = temp_dir.path().join("history.json");
    let server = MockServer::start().await;
    let config = test_config(&server, &history_path, mistral());
    let app = create_test_app(&config).await;

    let response = send(
        &app,
        Method::POST,
        "/chat-system/chat/alice",
        Some(json!({"text": "hello"})),
    )
    .await;

    assert!(response.status().is_client_error());
    assert!(!history_path.exists());
}

#[tokio::test]
async fn test_blank_user_id_is_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let server = MockServer::start().await;
    let config = test_config(&server, &temp_dir.path().join("history.json"), mistral());
    let app = create_test_app(&config).await;

    let (status, body) = request_json(&app, Method::GET, "/chat-system/chat/%20%20", None).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["code"], "INVALID_REQUEST");
}

// ─────────────────────────────────────────────────────────────────────────────
// Streaming Relay Tests
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_streaming_relays_fragments_and_commits() {
    let temp_dir = TempDir::new().unwrap();
    let history_path = temp_dir.path().join("history.json");
    let server = MockServer::start().await;
    mount_sse(&server, &["Hel", "lo", " there"]).await;
    let config = test_config(&server, &history_path, mistral());
    let app = create_test_app(&config).await;

    let response = send(
        &app,
        Method::POST,
        "/chat-system/chat-streaming/bob",
        Some(json!({"content": "hi"})),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "text/plain; charset=utf-8"
    );
    let text = String::from_utf8(body_bytes(response).await).unwrap();
    assert_eq!(text, "Hello there");

    let expected = json!([
        {"role": "user", "content": "hi"},
        {"role": "assistant", "content": "Hello there"}
    ]);
    let (_, body) = request_json(&app, Method::GET, "/chat-system/chat/bob", None).await;
    assert_eq!(body, expected);
    assert_eq!(read_history_file(&history_path)["bob"], expected);

    let sent = server.received_requests().await.unwrap();
    let request: Value = serde_json::from_slice(&sent[0].body).unwrap();
    assert_eq!(request["stream"], true);
    assert_eq!(request["model"], "mistral-small-latest");
}

#[tokio::test]
async fn test_streaming_context_includes_prior_history() {
    let temp_dir = TempDir::new().unwrap();
    let history_path = temp_dir.path().join("history.json");
    std::fs::write(
        &history_path,
        json!({"alice": [
            {"role": "user", "content": "I have a headache"},
            {"role": "assistant", "content": "Drink some water."}
        ]})
        .to_string(),
    )
    .unwrap();

    let server = MockServer::start().await;
    mount_sse(&server, &["Rest", " too."]).await;
    let config = test_config(&server, &history_path, mistral());
    let app = create_test_app(&config).await;

    let (status, text) = stream_text(&app, "alice", "Still hurts").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(text, "Rest too.");

    assert_eq!(
        last_upstream_messages(&server).await,
        vec![
            json!({"role": "system", "content": "Be kind."}),
            json!({"role": "user", "content": "I have a headache"}),
            json!({"role": "assistant", "content": "Drink some water."}),
            json!({"role": "user", "content": "Still hurts"}),
        ]
    );
}

#[tokio::test]
async fn test_upstream_failure_returns_bad_gateway() {
    let temp_dir = TempDir::new().unwrap();
    let history_path = temp_dir.path().join("history.json");
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(COMPLETIONS_PATH))
        .respond_with(ResponseTemplate::new(500).set_body_string("upstream exploded"))
        .mount(&server)
        .await;
    let config = test_config(&server, &history_path, mistral());
    let app = create_test_app(&config).await;

    let (status, body) = request_json(
        &app,
        Method::POST,
        "/chat-system/chat-streaming/dave",
        Some(json!({"content": "hello?"})),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["code"], "UPSTREAM_ERROR");
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .contains("API error (500)"));

    // The user turn is kept, no assistant turn recorded
    assert_eq!(
        read_history_file(&history_path)["dave"],
        json!([{"role": "user", "content": "hello?"}])
    );
}

#[tokio::test]
async fn test_n_turns_record_n_users_and_n_replies() {
    let temp_dir = TempDir::new().unwrap();
    let history_path = temp_dir.path().join("history.json");
    let server = MockServer::start().await;
    mount_sse(&server, &["ok"]).await;
    let config = test_config(&server, &history_path, mistral());
    let app = create_test_app(&config).await;

    let turns = ["one", "two", "three", "four"];
    for turn in turns {
        let (status, text) = stream_text(&app, "erin", turn).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(text, "ok");
    }

    let saved = read_history_file(&history_path);
    let messages = saved["erin"].as_array().unwrap();
    assert_eq!(messages.len(), turns.len() * 2);
    for (i, turn) in turns.iter().enumerate() {
        assert_eq!(messages[2 * i], json!({"role": "user", "content": turn}));
        assert_eq!(messages[2 * i + 1], json!({"role": "assistant", "content": "ok"}));
    }
    assert_eq!(last_upstream_messages(&server).await.len(), 1 + 7);
}

#[tokio::test]
async fn test_submit_then_stream_records_each_turn_once() {
    let temp_dir = TempDir::new().unwrap();
    let history_path = temp_dir.path().join("history.json");
    let server = MockServer::start().await;
    mount_sse(&server, &["ok"]).await;
    let config = test_config(&server, &history_path, mistral());
    let app = create_test_app(&config).await;

    // Browser client: record the turn, then stream the reply for it
    for turn in ["hello", "hello"] {
        let (status, _) = request_json(
            &app,
            Method::POST,
            "/chat-system/chat/uma",
            Some(json!({"content": turn})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, text) = stream_text(&app, "uma", turn).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(text, "ok");
    }

    assert_eq!(
        read_history_file(&history_path)["uma"],
        json!([
            {"role": "user", "content": "hello"},
            {"role": "assistant", "content": "ok"},
            {"role": "user", "content": "hello"},
            {"role": "assistant", "content": "ok"}
        ])
    );

    let requests = server.received_requests().await.unwrap();
    let first: Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(
        first["messages"],
        json!([
            {"role": "system", "content": "Be kind."},
            {"role": "user", "content": "hello"}
        ])
    );
    assert_eq!(last_upstream_messages(&server).await.len(), 1 + 3);
}

// ─────────────────────────────────────────────────────────────────────────────
// Batch Provider Tests
// ─────────────────────────────────────────────────────────────────────────────

async fn seeded_batch_app(
    temp_dir: &TempDir,
    server: &MockServer,
    batch_context: BatchContext,
) -> Router {
    let history_path = temp_dir.path().join("history.json");
    std::fs::write(
        &history_path,
        json!({"frank": [
            {"role": "user", "content": "Hi"},
            {"role": "assistant", "content": "Hello Frank."}
        ]})
        .to_string(),
    )
    .unwrap();
    mount_completion(server, "Take it easy.").await;
    let config = test_config(server, &history_path, openai(batch_context));
    create_test_app(&config).await
}

#[tokio::test]
async fn test_batch_reply_is_one_fragment_with_full_context() {
    let temp_dir = TempDir::new().unwrap();
    let server = MockServer::start().await;
    let app = seeded_batch_app(&temp_dir, &server, BatchContext::Full).await;

    let (status, text) = stream_text(&app, "frank", "I feel tired").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(text, "Take it easy.");

    let messages = last_upstream_messages(&server).await;
    assert_eq!(messages.len(), 4);
    assert_eq!(messages[0]["role"], "system");
    assert_eq!(messages[3]["content"], "I feel tired");

    let sent = server.received_requests().await.unwrap();
    let request: Value = serde_json::from_slice(&sent[0].body).unwrap();
    assert_eq!(request["stream"], false);
    assert_eq!(request["model"], "gpt-4o-mini");

    let (_, body) = request_json(&app, Method::GET, "/chat-system/chat/frank", None).await;
    assert_eq!(
        body.as_array().unwrap().last().unwrap(),
        &json!({"role": "assistant", "content": "Take it easy."})
    );
}

#[tokio::test]
async fn test_batch_latest_turn_sends_only_new_turn() {
    let temp_dir = TempDir::new().unwrap();
    let server = MockServer::start().await;
    let app = seeded_batch_app(&temp_dir, &server, BatchContext::LatestTurn).await;

    let (status, _) = stream_text(&app, "frank", "I feel tired").await;
    assert_eq!(status, StatusCode::OK);

    assert_eq!(
        last_upstream_messages(&server).await,
        vec![
            json!({"role": "system", "content": "Be kind."}),
            json!({"role": "user", "content": "I feel tired"}),
        ]
    );

    // History still keeps every turn
    let (_, body) = request_json(&app, Method::GET, "/chat-system/chat/frank", None).await;
    assert_eq!(body.as_array().unwrap().len(), 4);
}
