//! HTTP request handlers.

use axum::{
    body::{Body, Bytes},
    extract::{Extension, State},
    http::{header, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use futures::{stream, StreamExt};
use tokio::sync::oneshot;
use tracing::Instrument;

use super::continuation::{ContinuationController, RelayOutcome};
use super::server::{AppState, RequestId};
use super::stream::{OutwardStream, SwitchableStream, OUTWARD_BUFFER};
use super::types::ChatRequest;
use crate::error::{Error, Result};
use crate::llm::StreamingOptions;

/// Response header: correlation ID (UUID v4).
pub const REQUEST_ID_HEADER: &str = "x-chatrelay-request-id";

/// Content type of a successful relay.
pub const TEXT_CONTENT_TYPE: &str = "text/plain; charset=utf-8";

const NO_BUFFERING_HEADER: &str = "x-accel-buffering";

/// Handle POST /api/chat
///
/// The status is committed when the relay yields its first chunk. If it
/// ends before that, its error (if any) becomes the error envelope.
pub async fn chat(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    body: Bytes,
) -> Response {
    let span = tracing::info_span!("chat", request_id = %request_id.0);

    match relay_chat(&state, &body).instrument(span.clone()).await {
        Ok(response) => response,
        Err(err) => {
            span.in_scope(|| {
                tracing::warn!(
                    status = %err.status_code(),
                    error = %err,
                    "Chat request failed"
                );
            });
            err.into_response()
        }
    }
}

async fn relay_chat(state: &AppState, body: &[u8]) -> Result<Response> {
    let request = ChatRequest::from_slice(body)?;

    let credentials = match &request.api_keys {
        Some(keys) => state.config.defaults.overlay(keys),
        None => state.config.defaults.clone(),
    };
    if !credentials.has_api_key() {
        return Err(Error::MissingCredential);
    }

    tracing::info!(
        messages = request.messages.len(),
        client_keys = request.api_keys.is_some(),
        providers = ?credentials.providers().collect::<Vec<_>>(),
        "Received chat request"
    );

    let relay = &state.config.relay;
    let controller = ContinuationController::new(
        state.source.clone(),
        credentials,
        request.messages,
        StreamingOptions::new(relay.max_tokens),
        relay.max_response_segments,
    );

    let (stream, mut outward) = SwitchableStream::new(OUTWARD_BUFFER);
    let (done_tx, done_rx) = oneshot::channel();
    let task = tokio::spawn(
        async move {
            let result = controller.run(stream).await;
            if let Ok(outcome) = &result {
                tracing::info!(?outcome, "Relay finished");
            }
            // The handler stops listening once the body is committed.
            if let Err(Err(err)) = done_tx.send(result) {
                tracing::error!(error = %err, "Relay failed after streaming started");
            }
        }
        .instrument(tracing::Span::current()),
    );
    outward.attach(task);

    match outward.next_chunk().await {
        Some(first) => Ok(streaming_response(Some(first), outward)),
        None => match done_rx.await {
            Ok(Ok(RelayOutcome::Completed { .. })) => Ok(streaming_response(None, outward)),
            Ok(Ok(RelayOutcome::Cancelled { .. })) => {
                Err(Error::Internal("relay cancelled".to_string()))
            }
            Ok(Err(err)) => Err(err),
            Err(_) => Err(Error::Internal("relay task ended unexpectedly".to_string())),
        },
    }
}

fn streaming_response(first: Option<Bytes>, outward: OutwardStream) -> Response {
    let body = stream::iter(first.map(Ok)).chain(outward);
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, TEXT_CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache, no-transform"),
        ],
        [(HeaderName::from_static(NO_BUFFERING_HEADER), "no")],
        Body::from_stream(body),
    )
        .into_response()
}

/// Handle OPTIONS /api/chat. CORS headers are added by the server layer.
pub async fn preflight() -> StatusCode {
    StatusCode::NO_CONTENT
}

/// Add the configured CORS headers to a response.
pub async fn cors_headers(State(origin): State<HeaderValue>, mut response: Response) -> Response {
    let headers = response.headers_mut();
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("POST, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type"),
    );
    response
}

/// Handle GET /health
pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "chatrelay"
    }))
}

/// Handle GET /providers
pub async fn list_providers(State(state): State<AppState>) -> impl IntoResponse {
    let config = &state.config;
    let providers: Vec<serde_json::Value> = config
        .providers
        .iter()
        .map(|p| {
            serde_json::json!({
                "name": p.kind.as_str(),
                "model": p.model,
                "base_url": p.base_url,
                "has_default_credential": config.defaults.contains(p.kind),
                "key_source": p.key_source.to_string(),
                "preferred": config.relay.provider == Some(p.kind),
            })
        })
        .collect();

    Json(serde_json::json!({
        "providers": providers,
        "max_response_segments": config.relay.max_response_segments,
        "max_tokens": config.relay.max_tokens,
    }))
}
