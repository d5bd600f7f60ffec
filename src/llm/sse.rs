//! Server-Sent-Events decoding for provider streams.
//!
//! [`SseDecoder`] buffers raw bytes across chunk boundaries and yields the
//! payload of every complete `data:` line. [`event_stream`] drives a
//! decoder over an HTTP body and hands each payload to a provider-specific
//! [`EventParser`].

use bytes::Bytes;
use futures::stream::{self, BoxStream, Stream};
use futures::StreamExt;
use std::collections::VecDeque;
use std::fmt::Display;

use super::{EventStream, StreamEvent};
use crate::credentials::ProviderKind;
use crate::error::{Error, Result};

/// Pending bytes without a newline are discarded past this size.
const MAX_LINE_BUFFER: usize = 64 * 1024;

/// Line-buffered extractor of `data:` payloads.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process a chunk of bytes, returning the data payloads it completed.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);

        let mut payloads = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(data) = parse_line(&line) {
                payloads.push(data);
            }
        }

        if self.buffer.len() > MAX_LINE_BUFFER {
            tracing::warn!(
                buffered = self.buffer.len(),
                "SSE line exceeded buffer cap, discarding"
            );
            self.buffer.clear();
        }

        payloads
    }

    /// Flush an unterminated final line.
    pub fn finish(&mut self) -> Option<String> {
        let line = std::mem::take(&mut self.buffer);
        parse_line(&line)
    }
}

/// Extract the payload of a `data:` line. Other fields and comments yield `None`.
fn parse_line(line: &[u8]) -> Option<String> {
    let line = std::str::from_utf8(line).ok()?;
    let line = line.trim_end_matches(['\r', '\n']);
    let data = line.strip_prefix("data:")?;
    Some(data.strip_prefix(' ').unwrap_or(data).to_string())
}

/// Maps SSE data payloads to stream events for one provider protocol.
pub trait EventParser: Send + 'static {
    /// Events carried by one payload. Errors end the stream.
    fn parse(&mut self, data: &str) -> Result<Vec<StreamEvent>>;

    /// Terminal event once the body is exhausted.
    fn finish(&mut self) -> Option<StreamEvent>;
}

struct DecodeState<P> {
    provider: ProviderKind,
    body: BoxStream<'static, std::result::Result<Bytes, String>>,
    decoder: SseDecoder,
    parser: P,
    queue: VecDeque<Result<StreamEvent>>,
    ended: bool,
}

impl<P: EventParser> DecodeState<P> {
    fn push_payloads(&mut self, payloads: impl IntoIterator<Item = String>) {
        for data in payloads {
            if self.ended {
                break;
            }
            match self.parser.parse(&data) {
                Ok(events) => self.queue.extend(events.into_iter().map(Ok)),
                Err(err) => {
                    self.queue.push_back(Err(err));
                    self.ended = true;
                }
            }
        }
    }
}

/// Decode an SSE body into provider events.
pub fn event_stream<S, E, P>(provider: ProviderKind, body: S, parser: P) -> EventStream
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
    E: Display,
    P: EventParser,
{
    let state = DecodeState {
        provider,
        body: body.map(|chunk| chunk.map_err(|e| e.to_string())).boxed(),
        decoder: SseDecoder::new(),
        parser,
        queue: VecDeque::new(),
        ended: false,
    };

    stream::unfold(state, |mut st| async move {
        loop {
            if let Some(item) = st.queue.pop_front() {
                return Some((item, st));
            }
            if st.ended {
                return None;
            }
            match st.body.next().await {
                Some(Ok(bytes)) => {
                    let payloads = st.decoder.feed(&bytes);
                    st.push_payloads(payloads);
                }
                Some(Err(e)) => {
                    tracing::error!(provider = %st.provider, error = %e, "Error streaming from provider");
                    st.queue.push_back(Err(Error::provider(
                        st.provider,
                        format!("stream interrupted: {}", e),
                    )));
                    st.ended = true;
                }
                None => {
                    let rest = st.decoder.finish();
                    st.push_payloads(rest);
                    if !st.ended {
                        if let Some(event) = st.parser.finish() {
                            st.queue.push_back(Ok(event));
                        }
                    }
                    st.ended = true;
                }
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::FinishReason;

    /// Build SSE data from event lines, then split at the given byte positions
    /// to simulate TCP chunk boundaries.
    fn split_sse_at_positions(events: &[&str], split_positions: &[usize]) -> Vec<Vec<u8>> {
        let full: Vec<u8> = events
            .iter()
            .flat_map(|e| format!("{}\n\n", e).into_bytes())
            .collect();

        let mut chunks = Vec::new();
        let mut prev = 0;
        for &pos in split_positions {
            if pos > prev && pos < full.len() {
                chunks.push(full[prev..pos].to_vec());
                prev = pos;
            }
        }
        chunks.push(full[prev..].to_vec());
        chunks
    }

    fn decode_all(chunks: &[Vec<u8>]) -> Vec<String> {
        let mut decoder = SseDecoder::new();
        let mut out: Vec<String> = chunks.iter().flat_map(|c| decoder.feed(c)).collect();
        out.extend(decoder.finish());
        out
    }

    #[test]
    fn test_single_chunk() {
        let chunks = split_sse_at_positions(&[r#"data: {"a":1}"#, "data: [DONE]"], &[]);
        assert_eq!(decode_all(&chunks), vec![r#"{"a":1}"#, "[DONE]"]);
    }

    #[test]
    fn test_payload_split_across_chunks() {
        let events = [
            r#"data: {"choices":[{"delta":{"content":"Hi"},"finish_reason":null}]}"#,
            r#"data: {"choices":[{"delta":{},"finish_reason":"stop"}]}"#,
            "data: [DONE]",
        ];
        let chunks = split_sse_at_positions(&events, &[10, 50, 90, 120]);
        assert!(chunks.len() > 1);

        let payloads = decode_all(&chunks);
        assert_eq!(payloads.len(), 3);
        assert!(payloads[1].contains("\"stop\""));
        assert_eq!(payloads[2], "[DONE]");
    }

    #[test]
    fn test_non_data_fields_skipped() {
        let raw = b"event: message_start\nid: 123\nretry: 5000\n: keep-alive\ndata: {\"x\":1}\n\n";
        let mut decoder = SseDecoder::new();
        assert_eq!(decoder.feed(raw), vec![r#"{"x":1}"#]);
    }

    #[test]
    fn test_crlf_line_endings() {
        let raw = b"data: one\r\n\r\ndata: two\r\n\r\n";
        let mut decoder = SseDecoder::new();
        assert_eq!(decoder.feed(raw), vec!["one", "two"]);
    }

    #[test]
    fn test_data_without_space() {
        let mut decoder = SseDecoder::new();
        assert_eq!(decoder.feed(b"data:{\"x\":1}\n"), vec![r#"{"x":1}"#]);
    }

    #[test]
    fn test_final_line_without_newline() {
        let mut decoder = SseDecoder::new();
        assert_eq!(decoder.feed(b"data: first\n\ndata: [DONE]"), vec!["first"]);
        assert_eq!(decoder.finish().as_deref(), Some("[DONE]"));
    }

    #[test]
    fn test_empty_stream() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.finish().is_none());
    }

    #[test]
    fn test_buffer_cap() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(&vec![b'x'; 65 * 1024]).is_empty());

        // The oversized partial line was dropped; the rest of it is not `data:`.
        let payloads = decoder.feed(b"xxx\ndata: ok\n\n");
        assert_eq!(payloads, vec!["ok"]);
    }

    /// Parser treating every payload as a delta, `[DONE]` as nothing, and
    /// `boom` as an error.
    struct EchoParser {
        saw_any: bool,
    }

    impl EventParser for EchoParser {
        fn parse(&mut self, data: &str) -> Result<Vec<StreamEvent>> {
            match data {
                "[DONE]" => Ok(vec![]),
                "boom" => Err(Error::provider(ProviderKind::Groq, "boom")),
                other => {
                    self.saw_any = true;
                    Ok(vec![StreamEvent::Delta(other.to_string())])
                }
            }
        }

        fn finish(&mut self) -> Option<StreamEvent> {
            self.saw_any.then_some(StreamEvent::Finish(FinishReason::Stop))
        }
    }

    fn body(chunks: &[&'static str]) -> impl Stream<Item = std::result::Result<Bytes, String>> {
        stream::iter(
            chunks
                .iter()
                .map(|c| Ok(Bytes::from_static(c.as_bytes())))
                .collect::<Vec<_>>(),
        )
    }

    #[tokio::test]
    async fn test_event_stream_appends_finish() {
        let events: Vec<_> = event_stream(
            ProviderKind::Groq,
            body(&["data: He", "llo\n\ndata: [DONE]\n\n"]),
            EchoParser { saw_any: false },
        )
        .collect()
        .await;

        let events: Vec<StreamEvent> = events.into_iter().map(|e| e.unwrap()).collect();
        assert_eq!(
            events,
            vec![
                StreamEvent::Delta("Hello".to_string()),
                StreamEvent::Finish(FinishReason::Stop),
            ]
        );
    }

    #[tokio::test]
    async fn test_event_stream_stops_at_parser_error() {
        let events: Vec<_> = event_stream(
            ProviderKind::Groq,
            body(&["data: a\n\ndata: boom\n\ndata: b\n\n"]),
            EchoParser { saw_any: false },
        )
        .collect()
        .await;

        assert_eq!(events.len(), 2);
        assert!(events[0].is_ok());
        assert!(events[1].is_err());
    }

    #[tokio::test]
    async fn test_event_stream_transport_error() {
        let chunks: Vec<std::result::Result<Bytes, String>> = vec![
            Ok(Bytes::from_static(b"data: a\n\n")),
            Err("connection reset".to_string()),
        ];
        let events: Vec<_> = event_stream(
            ProviderKind::OpenAi,
            stream::iter(chunks),
            EchoParser { saw_any: false },
        )
        .collect()
        .await;

        assert_eq!(events.len(), 2);
        let err = events[1].as_ref().unwrap_err().to_string();
        assert!(err.contains("connection reset"));
    }
}
