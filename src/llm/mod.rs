//! Provider stream sources.
//!
//! A [`StreamSource`] turns a conversation into a [`Generation`]: a stream of
//! text deltas terminated by exactly one finish event. The relay splits a
//! generation into the bytes it forwards to the client and the
//! [`FinishSignal`] it consults before deciding whether to continue.

pub mod anthropic;
pub mod client;
pub mod mock;
pub mod openai;
pub mod sse;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::oneshot;

use crate::credentials::{CredentialSet, ProviderKind};
use crate::error::{Error, Result};

pub use client::ProviderClient;
pub use mock::{ScriptedSource, Segment};

/// Author of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// A chat message.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// Why a provider call ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    /// Natural completion.
    Stop,
    /// Truncated by the token cap.
    Length,
    Other(String),
}

impl FinishReason {
    /// Normalize the reason strings used by the supported providers.
    pub fn from_provider(reason: &str) -> Self {
        match reason {
            "stop" | "end_turn" | "stop_sequence" => FinishReason::Stop,
            "length" | "max_tokens" => FinishReason::Length,
            other => FinishReason::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::Length => "length",
            FinishReason::Other(reason) => reason,
        }
    }
}

impl fmt::Display for FinishReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Completion record delivered once per provider call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finish {
    /// Everything the call emitted.
    pub text: String,
    pub reason: FinishReason,
}

/// One step of a provider's token stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Delta(String),
    Finish(FinishReason),
}

/// Whether the provider may call tools. The relay never offers any.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ToolChoice {
    #[default]
    None,
}

/// Generation options shared by every call of one relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamingOptions {
    pub tool_choice: ToolChoice,
    pub max_tokens: u32,
}

impl StreamingOptions {
    pub fn new(max_tokens: u32) -> Self {
        Self {
            tool_choice: ToolChoice::None,
            max_tokens,
        }
    }
}

pub type EventStream = BoxStream<'static, Result<StreamEvent>>;

/// Bytes relayed to the client from one provider call.
pub type ByteSource = BoxStream<'static, Result<Bytes>>;

/// An in-flight provider call.
pub struct Generation {
    provider: ProviderKind,
    events: EventStream,
}

struct Tap {
    events: EventStream,
    on_finish: Option<oneshot::Sender<Finish>>,
    text: String,
    done: bool,
}

impl Generation {
    pub fn new(provider: ProviderKind, events: EventStream) -> Self {
        Self { provider, events }
    }

    pub fn provider(&self) -> ProviderKind {
        self.provider
    }

    /// Split into the relayed bytes and the finish signal.
    ///
    /// The signal resolves once the first finish event is read from the
    /// byte source; the source ends right there. Errors end it as well.
    pub fn into_relay(self) -> (ByteSource, FinishSignal) {
        let (tx, rx) = oneshot::channel();
        let tap = Tap {
            events: self.events,
            on_finish: Some(tx),
            text: String::new(),
            done: false,
        };

        let bytes = stream::unfold(tap, |mut tap| async move {
            while !tap.done {
                match tap.events.next().await {
                    Some(Ok(StreamEvent::Delta(text))) => {
                        if text.is_empty() {
                            continue;
                        }
                        tap.text.push_str(&text);
                        return Some((Ok(Bytes::from(text)), tap));
                    }
                    Some(Ok(StreamEvent::Finish(reason))) => {
                        tap.done = true;
                        if let Some(on_finish) = tap.on_finish.take() {
                            let text = std::mem::take(&mut tap.text);
                            let _ = on_finish.send(Finish { text, reason });
                        }
                    }
                    Some(Err(err)) => {
                        tap.done = true;
                        return Some((Err(err), tap));
                    }
                    None => tap.done = true,
                }
            }
            None
        })
        .boxed();

        let signal = FinishSignal {
            provider: self.provider,
            rx,
        };
        (bytes, signal)
    }
}

/// Resolves to the call's [`Finish`] after its byte source is drained.
pub struct FinishSignal {
    provider: ProviderKind,
    rx: oneshot::Receiver<Finish>,
}

impl FinishSignal {
    pub async fn wait(self) -> Result<Finish> {
        self.rx.await.map_err(|_| {
            Error::provider(self.provider, "stream ended without a finish reason")
        })
    }
}

/// Opens token streams against an LLM provider.
pub trait StreamSource: Send + Sync {
    fn call<'a>(
        &'a self,
        messages: &'a [Message],
        credentials: &'a CredentialSet,
        options: &'a StreamingOptions,
    ) -> BoxFuture<'a, Result<Generation>>;
}
