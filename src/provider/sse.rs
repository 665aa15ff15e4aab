//! SSE decoding for streaming chat completions.
//!
//! Buffers the raw byte stream line by line, strips the `data: ` prefix,
//! stops at the `data: [DONE]` terminator, and parses each payload as a
//! [`StreamChunk`]. A payload that fails to parse aborts the stream with
//! [`UpstreamError::MalformedStream`].

use crate::error::UpstreamError;
use crate::provider::types::StreamChunk;
use bytes::Bytes;
use futures_util::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Streaming SSE parser over a byte stream.
///
/// Terminated by `data: [DONE]` or by the underlying stream closing; any
/// buffered trailing line is drained on close.
pub struct SseStream<S> {
    inner: S,
    buffer: String,
    done: bool,
    inner_done: bool,
}

impl<S> SseStream<S> {
    /// Wrap a raw byte stream.
    pub fn new(stream: S) -> Self {
        Self {
            inner: stream,
            buffer: String::new(),
            done: false,
            inner_done: false,
        }
    }

    /// Parse one SSE line into a chunk.
    ///
    /// Returns `None` for empty lines, comments, non-data fields, and the
    /// `[DONE]` terminator (which also marks the stream finished).
    fn parse_sse_line(&mut self, line: &str) -> Option<Result<StreamChunk, UpstreamError>> {
        let trimmed = line.trim();

        if trimmed.is_empty() || trimmed.starts_with(':') {
            return None;
        }

        let data = trimmed.strip_prefix("data:")?.trim_start();

        if data == "[DONE]" {
            self.done = true;
            return None;
        }

        match serde_json::from_str::<StreamChunk>(data) {
            Ok(chunk) => Some(Ok(chunk)),
            Err(e) => Some(Err(UpstreamError::MalformedStream(format!(
                "bad SSE payload: {e}"
            )))),
        }
    }
}

impl<S> Stream for SseStream<S>
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Unpin,
{
    type Item = Result<StreamChunk, UpstreamError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if self.done {
                return Poll::Ready(None);
            }

            // Drain complete lines already buffered.
            if let Some(newline_pos) = self.buffer.find('\n') {
                let line = self.buffer[..newline_pos].to_string();
                self.buffer.drain(..=newline_pos);

                if let Some(result) = self.parse_sse_line(&line) {
                    return Poll::Ready(Some(result));
                }
                continue;
            }

            if self.inner_done {
                return Poll::Ready(None);
            }

            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    match std::str::from_utf8(&bytes) {
                        Ok(text) => self.buffer.push_str(text),
                        Err(e) => {
                            return Poll::Ready(Some(Err(UpstreamError::MalformedStream(
                                format!("non-UTF-8 SSE bytes: {e}"),
                            ))))
                        }
                    }
                }
                Poll::Ready(Some(Err(e))) => {
                    return Poll::Ready(Some(Err(UpstreamError::from(e))));
                }
                Poll::Ready(None) => {
                    self.inner_done = true;
                    // terminate any unfinished trailing line so the drain
                    // path above flushes it
                    if !self.buffer.is_empty() {
                        self.buffer.push('\n');
                    }
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
