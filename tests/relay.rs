//! Integration tests for POST /api/chat.
//!
//! Drives the full router with a scripted provider and verifies:
//! - single and continued generations stream as one body
//! - the continuation ceiling is enforced and reported
//! - the credential precondition (400) and error envelope (500)
//! - client keys override server defaults
//! - CORS mode and client disconnects

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use futures::StreamExt;
use http::{header, Request, StatusCode};
use tower::ServiceExt;

use chatrelay::config::Config;
use chatrelay::credentials::{CredentialSet, ProviderKind};
use chatrelay::llm::{Message, ScriptedSource, Segment};
use chatrelay::proxy::{create_router, AppState, CONTINUE_PROMPT, REQUEST_ID_HEADER};

/// Build a test app around a scripted provider.
fn setup_app(
    script: Vec<Segment>,
    configure: impl FnOnce(&mut Config),
) -> (axum::Router, Arc<ScriptedSource>) {
    let mut config = Config::default();
    configure(&mut config);

    let source = Arc::new(ScriptedSource::new(script));
    let state = AppState::new(source.clone(), config);
    (create_router(state), source)
}

fn with_segments(max_response_segments: u32) -> impl FnOnce(&mut Config) {
    move |config| config.relay.max_response_segments = max_response_segments
}

fn chat_request(body: serde_json::Value) -> Request<Body> {
    Request::post("/api/chat")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn hello_with_keys(keys: serde_json::Value) -> Request<Body> {
    chat_request(serde_json::json!({
        "messages": [{"role": "user", "content": "Hi"}],
        "apiKeys": keys,
    }))
}

fn hello() -> Request<Body> {
    hello_with_keys(serde_json::json!({"openaiApiKey": "sk-client"}))
}

async fn body_text(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), 1_048_576)
        .await
        .expect("read body");
    String::from_utf8(bytes.to_vec()).unwrap()
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    serde_json::from_str(&body_text(response).await).unwrap_or_default()
}

// ============================================================================
// Successful relays
// ============================================================================

#[tokio::test]
async fn test_single_segment_streams_text() {
    let (app, source) = setup_app(vec![Segment::stop(&["Hello", " world"])], |_| {});

    let response = app.oneshot(hello()).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers();
    assert_eq!(
        headers.get(header::CONTENT_TYPE).unwrap(),
        "text/plain; charset=utf-8"
    );
    assert!(headers.get(REQUEST_ID_HEADER).is_some());
    assert_eq!(body_text(response).await, "Hello world");
    assert_eq!(source.call_count(), 1);
}

#[tokio::test]
async fn test_truncated_generation_is_continued() {
    let (app, source) = setup_app(
        vec![
            Segment::length(&["A"]),
            Segment::length(&["B"]),
            Segment::stop(&["C"]),
        ],
        with_segments(3),
    );

    let response = app.oneshot(hello()).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "ABC");
    assert_eq!(source.call_count(), 3);

    let last = &source.calls()[2].messages;
    assert_eq!(
        last,
        &vec![
            Message::user("Hi"),
            Message::assistant("A"),
            Message::user(CONTINUE_PROMPT),
            Message::assistant("B"),
            Message::user(CONTINUE_PROMPT),
        ]
    );
}

#[tokio::test]
async fn test_default_ceiling_allows_one_continuation() {
    let (app, source) = setup_app(
        vec![Segment::length(&["first "]), Segment::stop(&["second"])],
        |_| {},
    );

    let response = app.oneshot(hello()).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "first second");
    assert_eq!(source.call_count(), 2);
}

#[tokio::test]
async fn test_max_tokens_reaches_provider() {
    let (app, source) = setup_app(vec![Segment::stop(&["ok"])], |config| {
        config.relay.max_tokens = 256
    });

    let response = app.oneshot(hello()).await.unwrap();
    assert_eq!(body_text(response).await, "ok");
    assert_eq!(source.calls()[0].options.max_tokens, 256);
}

// ============================================================================
// Continuation ceiling
// ============================================================================

#[tokio::test]
async fn test_ceiling_before_any_output_is_500() {
    let (app, source) = setup_app(
        vec![
            Segment::length(&[]),
            Segment::length(&[]),
            Segment::length(&[]),
            Segment::length(&[]),
        ],
        with_segments(3),
    );

    let response = app.oneshot(hello()).await.unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let json = body_json(response).await;
    assert_eq!(json["error"], "Continuation limit exceeded");
    assert!(json["details"]
        .as_str()
        .unwrap()
        .contains("maximum segments reached (3)"));
    assert_eq!(source.call_count(), 3, "no fourth call may be made");
}

#[tokio::test]
async fn test_ceiling_after_output_truncates_body() {
    let (app, source) = setup_app(
        vec![
            Segment::length(&["1"]),
            Segment::length(&["2"]),
            Segment::length(&["3"]),
            Segment::length(&["4"]),
        ],
        with_segments(3),
    );

    let response = app.oneshot(hello()).await.unwrap();

    // Status was committed with the first chunk; the body just ends.
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "123");
    assert_eq!(source.call_count(), 3);
}

// ============================================================================
// Credential precondition
// ============================================================================

#[tokio::test]
async fn test_missing_keys_is_400_without_provider_call() {
    let (app, source) = setup_app(vec![Segment::stop(&["never"])], |_| {});

    let request = chat_request(serde_json::json!({
        "messages": [{"role": "user", "content": "Hi"}]
    }));
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["error"], "Missing API key");
    assert!(json["details"].as_str().unwrap().contains("openaiApiKey"));
    assert_eq!(source.call_count(), 0);
}

#[tokio::test]
async fn test_ollama_url_alone_is_not_a_key() {
    let (app, source) = setup_app(vec![Segment::stop(&["never"])], |_| {});

    let response = app
        .oneshot(hello_with_keys(serde_json::json!({
            "ollamaApiBaseUrl": "http://localhost:11434"
        })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(source.call_count(), 0);
}

#[tokio::test]
async fn test_blank_keys_are_missing() {
    let (app, source) = setup_app(vec![Segment::stop(&["never"])], |_| {});

    let response = app
        .oneshot(hello_with_keys(serde_json::json!({
            "anthropicApiKey": "   ",
            "openaiApiKey": ""
        })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(source.call_count(), 0);
}

#[tokio::test]
async fn test_server_default_key_is_used() {
    let (app, source) = setup_app(vec![Segment::stop(&["hi"])], |config| {
        config.defaults = CredentialSet::new().with(ProviderKind::Anthropic, "ant-server");
    });

    let request = chat_request(serde_json::json!({
        "messages": [{"role": "user", "content": "Hi"}]
    }));
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "hi");
    let credentials = &source.calls()[0].credentials;
    assert_eq!(
        credentials
            .api_key(ProviderKind::Anthropic)
            .unwrap()
            .expose_secret(),
        "ant-server"
    );
}

#[tokio::test]
async fn test_client_key_overrides_server_default() {
    let (app, source) = setup_app(vec![Segment::stop(&["hi"])], |config| {
        config.defaults = CredentialSet::new()
            .with(ProviderKind::OpenAi, "sk-server")
            .with(ProviderKind::Groq, "gsk-server");
    });

    let response = app
        .oneshot(hello_with_keys(serde_json::json!({
            "openaiApiKey": "sk-client",
            "groqApiKey": " "
        })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let credentials = &source.calls()[0].credentials;
    assert_eq!(
        credentials.api_key(ProviderKind::OpenAi).unwrap().expose_secret(),
        "sk-client"
    );
    // Blank client values leave the default in place.
    assert_eq!(
        credentials.api_key(ProviderKind::Groq).unwrap().expose_secret(),
        "gsk-server"
    );
}

// ============================================================================
// Failures
// ============================================================================

#[tokio::test]
async fn test_provider_failure_on_first_call_is_500() {
    let (app, source) = setup_app(vec![Segment::fail("401 Unauthorized")], |_| {});

    let response = app.oneshot(hello()).await.unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(response.headers().get(REQUEST_ID_HEADER).is_some());
    let json = body_json(response).await;
    assert_eq!(json["error"], "Provider call failed");
    assert!(json["details"].as_str().unwrap().contains("401 Unauthorized"));
    assert_eq!(source.call_count(), 1);
}

#[tokio::test]
async fn test_mid_stream_failure_ends_body_early() {
    let (app, source) = setup_app(
        vec![Segment::interrupted(&["partial"], "connection reset")],
        |_| {},
    );

    let response = app.oneshot(hello()).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "partial");
    assert_eq!(source.live_streams(), 0);
}

#[tokio::test]
async fn test_failed_continuation_is_not_retried() {
    let (app, source) = setup_app(
        vec![
            Segment::length(&["start"]),
            Segment::fail("overloaded"),
            Segment::stop(&["never"]),
        ],
        with_segments(3),
    );

    let response = app.oneshot(hello()).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "start");
    assert_eq!(source.call_count(), 2);
}

#[tokio::test]
async fn test_malformed_body_is_500() {
    let (app, source) = setup_app(vec![], |_| {});

    let request = Request::post("/api/chat")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{\"messages\": [oops"))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let json = body_json(response).await;
    assert_eq!(json["error"], "Invalid request");
    assert_eq!(source.call_count(), 0);
}

#[tokio::test]
async fn test_empty_messages_is_500() {
    let (app, source) = setup_app(vec![], |_| {});

    let response = app
        .oneshot(chat_request(serde_json::json!({
            "messages": [],
            "apiKeys": {"openaiApiKey": "sk"}
        })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(source.call_count(), 0);
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test]
async fn test_client_disconnect_releases_provider_stream() {
    let (app, source) = setup_app(vec![Segment::hang(&["tick"])], |_| {});

    let response = app.oneshot(hello()).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let mut body = response.into_body().into_data_stream();
    let first = body.next().await.unwrap().unwrap();
    assert_eq!(first, "tick");
    assert_eq!(source.live_streams(), 1);

    drop(body);

    let released = async {
        while source.live_streams() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(2), released)
        .await
        .expect("provider stream should be released after disconnect");
    assert_eq!(source.call_count(), 1);
}

// ============================================================================
// CORS and auxiliary endpoints
// ============================================================================

/// Assert the full set of CORS headers is present.
fn assert_cors_headers(response: &axum::response::Response) {
    let headers = response.headers();
    assert_eq!(
        headers.get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
        "*",
        "status {}",
        response.status()
    );
    assert_eq!(
        headers.get(header::ACCESS_CONTROL_ALLOW_METHODS).unwrap(),
        "POST, OPTIONS"
    );
    assert_eq!(
        headers.get(header::ACCESS_CONTROL_ALLOW_HEADERS).unwrap(),
        "Content-Type"
    );
}

#[tokio::test]
async fn test_cors_preflight_and_headers() {
    let (app, _source) = setup_app(vec![Segment::stop(&["ok"])], |config| {
        config.server.cors_allow_origin = Some("*".to_string());
    });

    let preflight = Request::options("/api/chat").body(Body::empty()).unwrap();
    let response = app.clone().oneshot(preflight).await.unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_cors_headers(&response);

    let response = app.oneshot(hello()).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_cors_headers(&response);
}

#[tokio::test]
async fn test_cors_headers_on_error_responses() {
    let (app, source) = setup_app(vec![Segment::fail("503 Service Unavailable")], |config| {
        config.server.cors_allow_origin = Some("*".to_string());
    });

    // Missing credentials: 400.
    let request = chat_request(serde_json::json!({
        "messages": [{"role": "user", "content": "Hi"}]
    }));
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_cors_headers(&response);
    assert_eq!(source.call_count(), 0);

    // Provider failure before any output: 500.
    let response = app.oneshot(hello()).await.unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_cors_headers(&response);
    assert_eq!(body_json(response).await["error"], "Provider call failed");
}

#[tokio::test]
async fn test_no_cors_by_default() {
    let (app, _source) = setup_app(vec![Segment::stop(&["ok"])], |_| {});

    let preflight = Request::options("/api/chat").body(Body::empty()).unwrap();
    let response = app.clone().oneshot(preflight).await.unwrap();
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);

    let response = app.oneshot(hello()).await.unwrap();
    assert!(response
        .headers()
        .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
        .is_none());
}

#[tokio::test]
async fn test_concurrency_limit_still_serves() {
    let (app, _source) = setup_app(vec![Segment::stop(&["ok"])], |config| {
        config.server.max_concurrent_requests = Some(1);
    });

    let response = app.oneshot(hello()).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "ok");
}

#[tokio::test]
async fn test_health() {
    let (app, _source) = setup_app(vec![], |_| {});

    let response = app
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
    assert_eq!(json["service"], "chatrelay");
}

#[tokio::test]
async fn test_providers_listing_hides_secrets() {
    let (app, _source) = setup_app(vec![], |config| {
        config.defaults = CredentialSet::new().with(ProviderKind::Groq, "gsk-secret");
        config.relay.provider = Some(ProviderKind::Groq);
    });

    let response = app
        .oneshot(Request::get("/providers").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let text = body_text(response).await;
    assert!(!text.contains("gsk-secret"));

    let json: serde_json::Value = serde_json::from_str(&text).unwrap();
    let providers = json["providers"].as_array().unwrap();
    assert_eq!(providers.len(), 5);

    let groq = providers.iter().find(|p| p["name"] == "groq").unwrap();
    assert_eq!(groq["has_default_credential"], true);
    assert_eq!(groq["preferred"], true);
    let openai = providers.iter().find(|p| p["name"] == "openai").unwrap();
    assert_eq!(openai["has_default_credential"], false);
}
