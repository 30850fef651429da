//! Server-sent event decoding for OpenAI-compatible chat completion streams.
//!
//! The upstream emits lines such as:
//!
//! ```text
//! data: {"choices":[{"delta":{"content":"Hi"}}]}
//!
//! data: [DONE]
//! ```
//!
//! Only `data:` lines matter. A malformed payload is skipped without ending
//! the stream; `[DONE]` ends it.

use futures_util::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use std::pin::Pin;

/// Terminal payload of a completion stream.
pub const DONE_SENTINEL: &str = "[DONE]";

/// Classification of one event-stream line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseLine {
    /// Blank, comment, non-data, malformed, or content-free line
    Skip,
    /// End-of-stream sentinel
    Done,
    /// Non-empty text fragment from the first choice's delta
    Fragment(String),
}

#[derive(Debug, Deserialize)]
struct ChunkPayload {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Option<ChunkDelta>,
}

#[derive(Debug, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Classify a single line of the event stream.
pub fn parse_line(line: &str) -> SseLine {
    let line = line.trim_end_matches('\r');
    let Some(data) = line.strip_prefix("data:") else {
        return SseLine::Skip;
    };
    let data = data.strip_prefix(' ').unwrap_or(data);

    if data.trim() == DONE_SENTINEL {
        return SseLine::Done;
    }

    match serde_json::from_str::<ChunkPayload>(data) {
        Ok(payload) => payload
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.delta)
            .and_then(|delta| delta.content)
            .filter(|content| !content.is_empty())
            .map_or(SseLine::Skip, SseLine::Fragment),
        Err(e) => {
            tracing::debug!(error = %e, payload_len = data.len(), "Skipping malformed stream fragment");
            SseLine::Skip
        }
    }
}

/// Splits a chunked byte stream into lines.
///
/// Bytes are buffered until a newline so multi-byte characters and lines
/// split across chunks are reassembled before decoding.
struct LineReader<S> {
    inner: Pin<Box<S>>,
    buffer: Vec<u8>,
    eof: bool,
}

impl<S, B, E> LineReader<S>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
{
    fn new(inner: S) -> Self {
        Self {
            inner: Box::pin(inner),
            buffer: Vec::new(),
            eof: false,
        }
    }

    async fn next_line(&mut self) -> Option<Result<String, E>> {
        loop {
            if let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
                let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&raw[..raw.len() - 1]).into_owned();
                return Some(Ok(line));
            }

            if self.eof {
                if self.buffer.is_empty() {
                    return None;
                }
                // Final line without a trailing newline
                let raw = std::mem::take(&mut self.buffer);
                return Some(Ok(String::from_utf8_lossy(&raw).into_owned()));
            }

            match self.inner.next().await {
                Some(Ok(chunk)) => self.buffer.extend_from_slice(chunk.as_ref()),
                Some(Err(e)) => return Some(Err(e)),
                None => self.eof = true,
            }
        }
    }
}

/// Turn an upstream byte stream into a stream of text fragments.
///
/// The result is finite and consumed once: it ends at `[DONE]`, at the end
/// of the byte stream, or after yielding the first transport error.
pub fn fragment_stream<S, B, E>(bytes: S) -> impl Stream<Item = Result<String, E>> + Send
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Send + 'static,
{
    stream::unfold(Some(LineReader::new(bytes)), |reader| async move {
        let mut reader = reader?;
        loop {
            match reader.next_line().await? {
                Ok(line) => match parse_line(&line) {
                    SseLine::Fragment(text) => return Some((Ok(text), Some(reader))),
                    SseLine::Done => return None,
                    SseLine::Skip => continue,
                },
                Err(e) => return Some((Err(e), None)),
            }
        }
    })
}
