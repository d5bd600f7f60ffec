//! Scripted [`StreamSource`] for tests and local experiments.
//!
//! Each call pops the next [`Segment`] off the script. Calls are recorded
//! so tests can assert on call counts and on the conversation each call saw.
//!
//! This module is public on purpose: integration tests and downstream
//! crates drive the relay through it without a live provider.

use futures::future::{self, BoxFuture};
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::{
    EventStream, FinishReason, Generation, Message, StreamEvent, StreamSource, StreamingOptions,
};
use crate::credentials::{CredentialSet, ProviderKind};
use crate::error::{Error, Result};

/// Scripted outcome of one provider call.
#[derive(Debug, Clone)]
pub enum Segment {
    /// Emit the chunks, then finish with the reason.
    Complete {
        chunks: Vec<String>,
        reason: FinishReason,
    },
    /// The call itself fails before streaming.
    Fail(String),
    /// Emit the chunks, then error mid-stream.
    Interrupted { chunks: Vec<String>, message: String },
    /// Emit the chunks, then never produce anything else.
    Hang { chunks: Vec<String> },
}

fn owned(chunks: &[&str]) -> Vec<String> {
    chunks.iter().map(|c| c.to_string()).collect()
}

impl Segment {
    pub fn stop(chunks: &[&str]) -> Self {
        Segment::Complete {
            chunks: owned(chunks),
            reason: FinishReason::Stop,
        }
    }

    pub fn length(chunks: &[&str]) -> Self {
        Segment::Complete {
            chunks: owned(chunks),
            reason: FinishReason::Length,
        }
    }

    pub fn fail(message: &str) -> Self {
        Segment::Fail(message.to_string())
    }

    pub fn interrupted(chunks: &[&str], message: &str) -> Self {
        Segment::Interrupted {
            chunks: owned(chunks),
            message: message.to_string(),
        }
    }

    pub fn hang(chunks: &[&str]) -> Self {
        Segment::Hang {
            chunks: owned(chunks),
        }
    }
}

/// What one call received.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub messages: Vec<Message>,
    pub credentials: CredentialSet,
    pub options: StreamingOptions,
}

/// Decrements the live-stream counter when the stream holding it is dropped.
struct LiveGuard(Arc<AtomicUsize>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A [`StreamSource`] replaying a fixed script.
#[derive(Debug)]
pub struct ScriptedSource {
    provider: ProviderKind,
    script: Mutex<VecDeque<Segment>>,
    calls: Mutex<Vec<RecordedCall>>,
    live: Arc<AtomicUsize>,
}

impl ScriptedSource {
    pub fn new(script: impl IntoIterator<Item = Segment>) -> Self {
        Self {
            provider: ProviderKind::OpenAi,
            script: Mutex::new(script.into_iter().collect()),
            calls: Mutex::new(Vec::new()),
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or_default()
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Streams handed out and not yet dropped.
    pub fn live_streams(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    fn generation(&self, segment: Segment) -> Result<Generation> {
        let deltas = |chunks: Vec<String>| {
            stream::iter(chunks.into_iter().map(|c| Ok::<_, Error>(StreamEvent::Delta(c))))
        };

        let events: EventStream = match segment {
            Segment::Fail(message) => return Err(Error::provider(self.provider, message)),
            Segment::Complete { chunks, reason } => deltas(chunks)
                .chain(stream::once(future::ready(Ok(StreamEvent::Finish(reason)))))
                .boxed(),
            Segment::Interrupted { chunks, message } => {
                let err = Error::provider(self.provider, message);
                deltas(chunks)
                    .chain(stream::once(future::ready(Err(err))))
                    .boxed()
            }
            Segment::Hang { chunks } => deltas(chunks).chain(stream::pending()).boxed(),
        };

        self.live.fetch_add(1, Ordering::SeqCst);
        let guard = LiveGuard(self.live.clone());
        let events = events
            .map(move |event| {
                let _held = &guard;
                event
            })
            .boxed();

        Ok(Generation::new(self.provider, events))
    }
}

impl StreamSource for ScriptedSource {
    fn call<'a>(
        &'a self,
        messages: &'a [Message],
        credentials: &'a CredentialSet,
        options: &'a StreamingOptions,
    ) -> BoxFuture<'a, Result<Generation>> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(RecordedCall {
                messages: messages.to_vec(),
                credentials: credentials.clone(),
                options: options.clone(),
            });
        }

        let next = self.script.lock().ok().and_then(|mut s| s.pop_front());
        let result = match next {
            Some(segment) => self.generation(segment),
            None => Err(Error::provider(self.provider, "script exhausted")),
        };
        future::ready(result).boxed()
    }
}
