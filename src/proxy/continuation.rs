//! Continuation across token-limited provider calls.
//!
//! A [`ContinuationController`] owns one request's conversation. It opens a
//! provider call, relays it through the [`SwitchableStream`], and when the
//! call was cut off by the token cap it appends what was said plus
//! [`CONTINUE_PROMPT`] and opens the next call on the same outward stream.

use std::fmt;
use std::sync::Arc;

use super::stream::{RelayEnd, SwitchableStream};
use crate::credentials::CredentialSet;
use crate::error::{Error, Result};
use crate::llm::{Finish, FinishReason, FinishSignal, Message, StreamSource, StreamingOptions};

/// Appended as a user message before every continuation call.
pub const CONTINUE_PROMPT: &str = "Continue your prior response. IMPORTANT: Immediately begin \
     from where you left off without any interruptions. Do not repeat any content.";

/// Relay state. Exactly one provider call is active while `Streaming`.
pub enum State {
    Streaming(FinishSignal),
    Deciding(Finish),
    Continuing,
    Done,
    Cancelled,
    Failed(Error),
}

impl State {
    pub fn name(&self) -> &'static str {
        match self {
            State::Streaming(_) => "streaming",
            State::Deciding(_) => "deciding",
            State::Continuing => "continuing",
            State::Done => "done",
            State::Cancelled => "cancelled",
            State::Failed(_) => "failed",
        }
    }
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What to do after a provider call finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Close,
    Continue { segments_left: u32 },
    LimitReached,
}

/// Decide the next step from the finish reason and the calls made so far.
pub fn decide(reason: &FinishReason, switches: u32, max_segments: u32) -> Decision {
    if *reason != FinishReason::Length {
        return Decision::Close;
    }
    if switches >= max_segments {
        return Decision::LimitReached;
    }
    Decision::Continue {
        segments_left: max_segments - switches,
    }
}

/// How a relay ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    Completed { segments: u32 },
    Cancelled { segments: u32 },
}

pub struct ContinuationController {
    source: Arc<dyn StreamSource>,
    credentials: CredentialSet,
    messages: Vec<Message>,
    options: StreamingOptions,
    max_segments: u32,
}

impl ContinuationController {
    pub fn new(
        source: Arc<dyn StreamSource>,
        credentials: CredentialSet,
        messages: Vec<Message>,
        options: StreamingOptions,
        max_segments: u32,
    ) -> Self {
        Self {
            source,
            credentials,
            messages,
            options,
            max_segments,
        }
    }

    /// Drive the relay to completion. The outward stream is closed on every
    /// exit path.
    pub async fn run(mut self, mut stream: SwitchableStream) -> Result<RelayOutcome> {
        let mut state = State::Continuing;
        loop {
            state = match state {
                State::Done => {
                    return Ok(RelayOutcome::Completed {
                        segments: stream.switches(),
                    })
                }
                State::Cancelled => {
                    stream.close();
                    tracing::info!(segments = stream.switches(), "Client disconnected");
                    return Ok(RelayOutcome::Cancelled {
                        segments: stream.switches(),
                    });
                }
                State::Failed(err) => {
                    stream.close();
                    return Err(err);
                }
                active => {
                    let next = self.step(active, &mut stream).await;
                    tracing::trace!(state = next.name(), "Relay transition");
                    next
                }
            };
        }
    }

    async fn step(&mut self, state: State, stream: &mut SwitchableStream) -> State {
        match state {
            State::Continuing => {
                let call = self
                    .source
                    .call(&self.messages, &self.credentials, &self.options)
                    .await;
                match call {
                    Ok(generation) => {
                        let (bytes, signal) = generation.into_relay();
                        match stream.switch_source(bytes) {
                            Ok(()) => State::Streaming(signal),
                            Err(err) => State::Failed(err),
                        }
                    }
                    Err(err) => State::Failed(err),
                }
            }
            State::Streaming(signal) => match stream.relay().await {
                Ok(RelayEnd::Exhausted) => match signal.wait().await {
                    Ok(finish) => State::Deciding(finish),
                    Err(err) => State::Failed(err),
                },
                Ok(RelayEnd::Disconnected) => State::Cancelled,
                Err(err) => State::Failed(err),
            },
            State::Deciding(finish) => {
                match decide(&finish.reason, stream.switches(), self.max_segments) {
                    Decision::Close => {
                        stream.close();
                        State::Done
                    }
                    Decision::LimitReached => State::Failed(Error::ContinuationLimitExceeded {
                        segments: stream.switches(),
                    }),
                    Decision::Continue { segments_left } => {
                        tracing::info!(
                            max_tokens = self.options.max_tokens,
                            segments_left,
                            "Reached max token limit, continuing message"
                        );
                        self.messages.push(Message::assistant(finish.text));
                        self.messages.push(Message::user(CONTINUE_PROMPT));
                        State::Continuing
                    }
                }
            }
            terminal => terminal,
        }
    }
}
