//! Switchable outward stream.
//!
//! [`SwitchableStream`] owns the sending half of the response body and lets
//! the relay re-point it at successive provider sources without ever closing
//! it in between. [`OutwardStream`] is the receiving half handed to axum.
//! The channel is bounded, so a slow client slows down reads from the
//! provider instead of buffering its output.

use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::convert::Infallible;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;

use crate::error::{Error, Result};
use crate::llm::ByteSource;

/// Chunks buffered between the relay and the HTTP body.
pub const OUTWARD_BUFFER: usize = 8;

/// Why [`SwitchableStream::relay`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnd {
    /// The active source has no more bytes.
    Exhausted,
    /// The client went away.
    Disconnected,
}

/// Sending side of the response body.
pub struct SwitchableStream {
    outward: Option<mpsc::Sender<Bytes>>,
    active: Option<ByteSource>,
    switches: u32,
}

impl SwitchableStream {
    pub fn new(buffer: usize) -> (Self, OutwardStream) {
        let (tx, rx) = mpsc::channel(buffer);
        let stream = Self {
            outward: Some(tx),
            active: None,
            switches: 0,
        };
        let outward = OutwardStream {
            rx: ReceiverStream::new(rx),
            task: None,
        };
        (stream, outward)
    }

    /// Number of sources switched in so far. Never decreases.
    pub fn switches(&self) -> u32 {
        self.switches
    }

    pub fn is_closed(&self) -> bool {
        self.outward.is_none()
    }

    /// Start relaying from `source`. Unread bytes of the previous source are
    /// discarded. The outward stream stays open.
    pub fn switch_source(&mut self, source: ByteSource) -> Result<()> {
        if self.outward.is_none() {
            return Err(Error::StreamState("cannot switch source after close"));
        }
        if self.active.replace(source).is_some() {
            tracing::debug!(switches = self.switches, "Replaced previous source");
        }
        self.switches += 1;
        Ok(())
    }

    /// Forward the active source to the client until it is exhausted, it
    /// fails, or the client disconnects.
    pub async fn relay(&mut self) -> Result<RelayEnd> {
        let outward = self
            .outward
            .as_ref()
            .ok_or(Error::StreamState("relay on closed stream"))?;
        let source = self
            .active
            .as_mut()
            .ok_or(Error::StreamState("relay without an active source"))?;

        loop {
            tokio::select! {
                biased;
                _ = outward.closed() => return Ok(RelayEnd::Disconnected),
                chunk = source.next() => match chunk {
                    Some(Ok(bytes)) => {
                        if outward.send(bytes).await.is_err() {
                            return Ok(RelayEnd::Disconnected);
                        }
                    }
                    Some(Err(err)) => return Err(err),
                    None => return Ok(RelayEnd::Exhausted),
                },
            }
        }
    }

    /// End the outward stream. Idempotent.
    pub fn close(&mut self) {
        if self.outward.take().is_some() {
            tracing::debug!(switches = self.switches, "Outward stream closed");
        }
        self.active = None;
    }
}

/// Aborts the relay task when the response body is dropped.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Receiving side of the response body.
pub struct OutwardStream {
    rx: ReceiverStream<Bytes>,
    task: Option<AbortOnDrop>,
}

impl OutwardStream {
    /// Tie the lifetime of the task producing this stream to the stream.
    pub fn attach(&mut self, task: JoinHandle<()>) {
        self.task = Some(AbortOnDrop(task));
    }

    /// Wait for the next chunk; `None` once the stream is closed.
    pub async fn next_chunk(&mut self) -> Option<Bytes> {
        self.rx.next().await
    }
}

impl Stream for OutwardStream {
    type Item = std::result::Result<Bytes, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.rx)
            .poll_next(cx)
            .map(|chunk| chunk.map(Ok))
    }
}
