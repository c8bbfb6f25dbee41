//! Generic SSE (Server-Sent Events) parser.
//!
//! Converts a byte stream (usually a `reqwest::Response` body) into a
//! `Stream<Item = SseEvent>`. Used for completion streams and platform run
//! streams.

use std::pin::Pin;

use bytes::{Bytes, BytesMut};
use futures::Stream;
use tokio_stream::StreamExt;

/// A parsed SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
}

/// Incremental line decoder; feed it chunks, take complete events out.
///
/// Bytes are buffered raw and only complete lines are decoded, so a
/// character split across chunks survives intact.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: BytesMut,
    current_event: Option<String>,
    current_data: Vec<String>,
    current_id: Option<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Next complete event in the buffer, if any.
    pub fn next_event(&mut self) -> Option<SseEvent> {
        while let Some(newline_pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let raw = self.buffer.split_to(newline_pos + 1);
            let line = String::from_utf8_lossy(&raw[..newline_pos]);
            let line = line.trim_end_matches('\r');

            if line.is_empty() {
                // Empty line = dispatch event
                if let Some(event) = self.dispatch() {
                    return Some(event);
                }
                continue;
            }

            if line.starts_with(':') {
                // Comment, skip
                continue;
            }

            if let Some(value) = line.strip_prefix("event:") {
                self.current_event = Some(value.trim_start().to_string());
            } else if let Some(value) = line.strip_prefix("data:") {
                self.current_data.push(value.trim_start().to_string());
            } else if let Some(value) = line.strip_prefix("id:") {
                self.current_id = Some(value.trim_start().to_string());
            }
        }
        None
    }

    /// Flush a trailing event not followed by a blank line.
    pub fn finish(&mut self) -> Option<SseEvent> {
        if !self.buffer.is_empty() {
            self.buffer.extend_from_slice(b"\n");
            if let Some(event) = self.next_event() {
                return Some(event);
            }
        }
        self.dispatch()
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        if self.current_data.is_empty() {
            self.current_event = None;
            return None;
        }
        let event = SseEvent {
            event: self.current_event.take(),
            data: self.current_data.join("\n"),
            id: self.current_id.take(),
        };
        self.current_data.clear();
        Some(event)
    }
}

type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>;

/// Parse a reqwest response body as an SSE stream.
pub fn parse_sse_stream(
    response: reqwest::Response,
) -> impl Stream<Item = anyhow::Result<SseEvent>> + Send {
    parse_sse_bytes(Box::pin(response.bytes_stream()))
}

fn parse_sse_bytes(byte_stream: ByteStream) -> impl Stream<Item = anyhow::Result<SseEvent>> + Send {
    futures::stream::unfold(
        (byte_stream, SseDecoder::new(), false),
        |(mut byte_stream, mut decoder, ended)| async move {
            loop {
                if let Some(event) = decoder.next_event() {
                    return Some((Ok(event), (byte_stream, decoder, ended)));
                }
                if ended {
                    return None;
                }

                match byte_stream.next().await {
                    Some(Ok(chunk)) => decoder.feed(&chunk),
                    Some(Err(e)) => {
                        return Some((
                            Err(anyhow::anyhow!("SSE stream error: {e}")),
                            (byte_stream, decoder, true),
                        ));
                    }
                    None => {
                        // Stream ended. Dispatch any remaining data.
                        return decoder
                            .finish()
                            .map(|event| (Ok(event), (byte_stream, decoder, true)));
                    }
                }
            }
        },
    )
}
