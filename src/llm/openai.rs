//! OpenAI-compatible streaming chat completions.
//!
//! Used for OpenAI, Groq, OpenRouter and Ollama (through its `/v1` API).

use axum::http::header;
use serde::{Deserialize, Serialize};

use super::sse::{event_stream, EventParser};
use super::{FinishReason, Generation, Message, StreamEvent, StreamingOptions};
use crate::credentials::ProviderKind;
use crate::error::{Error, Result};
use crate::router::SelectedProvider;

/// Streaming chat completion request body.
#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    max_tokens: u32,
    stream: bool,
}

/// Streaming chunk.
#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Option<Delta>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    message: Option<String>,
}

/// Tracks the last reported finish_reason; emitted once the body ends.
pub(crate) struct OpenAiParser {
    provider: ProviderKind,
    finish_reason: Option<FinishReason>,
}

impl OpenAiParser {
    pub(crate) fn new(provider: ProviderKind) -> Self {
        Self {
            provider,
            finish_reason: None,
        }
    }
}

impl EventParser for OpenAiParser {
    fn parse(&mut self, data: &str) -> Result<Vec<StreamEvent>> {
        let data = data.trim();
        if data.is_empty() || data == "[DONE]" {
            return Ok(Vec::new());
        }

        let chunk: ChatCompletionChunk = match serde_json::from_str(data) {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::debug!(provider = %self.provider, error = %e, "Skipping malformed stream chunk");
                return Ok(Vec::new());
            }
        };

        if let Some(error) = chunk.error {
            return Err(Error::provider(
                self.provider,
                error
                    .message
                    .unwrap_or_else(|| "provider reported an error".to_string()),
            ));
        }

        let mut events = Vec::new();
        if let Some(choice) = chunk.choices.into_iter().next() {
            if let Some(content) = choice.delta.and_then(|d| d.content) {
                if !content.is_empty() {
                    events.push(StreamEvent::Delta(content));
                }
            }
            if let Some(reason) = choice.finish_reason {
                self.finish_reason = Some(FinishReason::from_provider(&reason));
            }
        }
        Ok(events)
    }

    fn finish(&mut self) -> Option<StreamEvent> {
        self.finish_reason.take().map(StreamEvent::Finish)
    }
}

/// Open a streaming chat completion.
pub async fn stream_chat(
    http: &reqwest::Client,
    provider: &SelectedProvider,
    messages: &[Message],
    options: &StreamingOptions,
) -> Result<Generation> {
    let url = format!("{}/chat/completions", provider.api_base.trim_end_matches('/'));

    // Tool choice is always none: no tools are declared in the request.
    let body = ChatCompletionRequest {
        model: &provider.model,
        messages,
        max_tokens: options.max_tokens,
        stream: true,
    };

    let mut request = http
        .post(&url)
        .header(header::CONTENT_TYPE, "application/json")
        .json(&body);

    if let Some(api_key) = &provider.api_key {
        request = request.header(
            header::AUTHORIZATION,
            format!("Bearer {}", api_key.expose_secret()),
        );
    }

    let response = request.send().await.map_err(|e| {
        tracing::error!(error = %e, provider = %provider.kind, "Failed to reach provider");
        Error::provider(provider.kind, format!("failed to reach provider: {}", e))
    })?;

    let status = response.status();
    if !status.is_success() {
        let error_body = response.text().await.unwrap_or_default();
        tracing::error!(
            status = %status,
            provider = %provider.kind,
            body = %error_body,
            "Provider returned error"
        );
        return Err(Error::provider(
            provider.kind,
            format!("returned {}: {}", status, error_body),
        ));
    }

    let events = event_stream(
        provider.kind,
        response.bytes_stream(),
        OpenAiParser::new(provider.kind),
    );
    Ok(Generation::new(provider.kind, events))
}
