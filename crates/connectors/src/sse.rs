//! Server-sent events framing
//!
//! Turns the raw byte stream of `text/event-stream` responses into one
//! string per event (the joined `data:` lines). Only `data` matters to the
//! engine; `event`, `id` and `retry` fields are ignored.

use std::collections::VecDeque;

use bytes::Bytes;
use futures::{Stream, StreamExt};

use crate::{ConnectorError, EventStream};

/// Incremental SSE decoder. Chunks may split lines and multi-byte
/// characters anywhere; only complete lines are interpreted.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning every event completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line);

            if line.is_empty() {
                if !self.data.is_empty() {
                    events.push(self.data.join("\n"));
                    self.data.clear();
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line.as_ref(), ""),
            };
            if field == "data" {
                self.data.push(value.to_string());
            }
        }

        events
    }
}

/// Wrap a byte stream into an [`EventStream`]. The end of the underlying
/// stream surfaces as a single `StreamClosed` error.
pub fn decode_stream<S>(inner: S) -> EventStream
where
    S: Stream<Item = Result<Bytes, ConnectorError>> + Send + 'static,
{
    let state = (Box::pin(inner), SseDecoder::new(), VecDeque::new(), false);
    Box::pin(futures::stream::unfold(
        state,
        |(mut inner, mut decoder, mut pending, done)| async move {
            loop {
                if let Some(event) = pending.pop_front() {
                    return Some((Ok(event), (inner, decoder, pending, done)));
                }
                if done {
                    return None;
                }
                match inner.next().await {
                    Some(Ok(chunk)) => pending.extend(decoder.push(&chunk)),
                    Some(Err(err)) => return Some((Err(err), (inner, decoder, pending, true))),
                    None => {
                        return Some((
                            Err(ConnectorError::StreamClosed),
                            (inner, decoder, pending, true),
                        ))
                    }
                }
            }
        },
    ))
}
