//! Anthropic Messages API streaming.

use axum::http::header;
use serde::{Deserialize, Serialize};

use super::sse::{event_stream, EventParser};
use super::{FinishReason, Generation, Message, Role, StreamEvent, StreamingOptions};
use crate::credentials::ProviderKind;
use crate::error::{Error, Result};
use crate::router::SelectedProvider;

const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<&'a Message>,
    stream: bool,
}

impl<'a> MessagesRequest<'a> {
    /// System messages travel in the top-level `system` field.
    fn new(model: &'a str, messages: &'a [Message], max_tokens: u32) -> Self {
        let system: Vec<&str> = messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect();

        Self {
            model,
            max_tokens,
            system: (!system.is_empty()).then(|| system.join("\n\n")),
            messages: messages.iter().filter(|m| m.role != Role::System).collect(),
            stream: true,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicEvent {
    ContentBlockDelta { delta: BlockDelta },
    MessageDelta { delta: MessageDeltaBody },
    Error { error: ApiError },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BlockDelta {
    TextDelta { text: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct MessageDeltaBody {
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    message: String,
}

pub(crate) struct AnthropicParser {
    stop_reason: Option<FinishReason>,
}

impl AnthropicParser {
    pub(crate) fn new() -> Self {
        Self { stop_reason: None }
    }
}

impl EventParser for AnthropicParser {
    fn parse(&mut self, data: &str) -> Result<Vec<StreamEvent>> {
        let event: AnthropicEvent = match serde_json::from_str(data) {
            Ok(event) => event,
            Err(e) => {
                tracing::debug!(error = %e, "Skipping malformed Anthropic event");
                return Ok(Vec::new());
            }
        };

        match event {
            AnthropicEvent::ContentBlockDelta {
                delta: BlockDelta::TextDelta { text },
            } if !text.is_empty() => Ok(vec![StreamEvent::Delta(text)]),
            AnthropicEvent::MessageDelta { delta } => {
                if let Some(reason) = delta.stop_reason {
                    self.stop_reason = Some(FinishReason::from_provider(&reason));
                }
                Ok(Vec::new())
            }
            AnthropicEvent::Error { error } => Err(Error::provider(
                ProviderKind::Anthropic,
                match error.kind {
                    Some(kind) => format!("{}: {}", kind, error.message),
                    None => error.message,
                },
            )),
            _ => Ok(Vec::new()),
        }
    }

    fn finish(&mut self) -> Option<StreamEvent> {
        self.stop_reason.take().map(StreamEvent::Finish)
    }
}

/// Open a streaming Messages API call.
pub async fn stream_chat(
    http: &reqwest::Client,
    provider: &SelectedProvider,
    messages: &[Message],
    options: &StreamingOptions,
) -> Result<Generation> {
    let url = format!("{}/messages", provider.api_base.trim_end_matches('/'));
    let body = MessagesRequest::new(&provider.model, messages, options.max_tokens);

    let mut request = http
        .post(&url)
        .header(header::CONTENT_TYPE, "application/json")
        .header("anthropic-version", ANTHROPIC_VERSION)
        .json(&body);

    if let Some(api_key) = &provider.api_key {
        request = request.header("x-api-key", api_key.expose_secret());
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

    let events = event_stream(provider.kind, response.bytes_stream(), AnthropicParser::new());
    Ok(Generation::new(provider.kind, events))
}
