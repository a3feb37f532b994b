//! Common streaming infrastructure for backend responses
//!
//! This module provides shared abstractions for reading streaming responses, supporting both
//! real HTTP responses and replayed byte chunks with identical processing logic, plus the
//! byte-to-line decoding both wire framings build on.

use anyhow::Result;
use async_trait::async_trait;
use reqwest::Response;
use std::collections::VecDeque;
use std::time::Duration;

/// Trait for streaming chunk sources (real HTTP response or replay)
///
/// This abstraction allows the bridge driver to use the same processing logic for live backend
/// responses and canned byte sequences, ensuring identical behavior.
#[async_trait]
pub trait ChunkStream: Send {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>>;
}

/// Real HTTP response chunk stream
pub struct HttpChunkStream {
    pub response: Response,
}

impl HttpChunkStream {
    pub fn new(response: Response) -> Self {
        Self { response }
    }
}

#[async_trait]
impl ChunkStream for HttpChunkStream {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        match self.response.chunk().await {
            Ok(Some(chunk)) => Ok(Some(chunk.to_vec())),
            Ok(None) => Ok(None),
            Err(e) => Err(anyhow::anyhow!("HTTP chunk error: {}", e)),
        }
    }
}

/// Replays a fixed sequence of byte chunks, optionally failing once they are exhausted
pub struct ReplayChunkStream {
    chunks: VecDeque<Vec<u8>>,
    delay: Option<Duration>,
    trailing_error: Option<String>,
}

impl ReplayChunkStream {
    pub fn new<I, B>(chunks: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Vec<u8>>,
    {
        Self {
            chunks: chunks.into_iter().map(Into::into).collect(),
            delay: None,
            trailing_error: None,
        }
    }

    /// Sleep before yielding each chunk to simulate network pacing
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Report a transport error after the last chunk instead of a clean end
    pub fn with_trailing_error(mut self, message: impl Into<String>) -> Self {
        self.trailing_error = Some(message.into());
        self
    }
}

#[async_trait]
impl ChunkStream for ReplayChunkStream {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        match self.chunks.pop_front() {
            Some(chunk) => Ok(Some(chunk)),
            None => match self.trailing_error.take() {
                Some(message) => Err(anyhow::anyhow!(message)),
                None => Ok(None),
            },
        }
    }
}

/// Splits a byte stream into complete text lines.
///
/// Bytes are held until a newline arrives, so multi-byte characters split across network
/// chunks are decoded intact. Trailing `\r` is removed and empty lines are dropped.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    pending: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add raw bytes and return every line completed by them
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);

        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.pending[start..].iter().position(|&b| b == b'\n') {
            let end = start + offset;
            if let Some(line) = Self::decode_line(&self.pending[start..end]) {
                lines.push(line);
            }
            start = end + 1;
        }
        self.pending.drain(..start);
        lines
    }

    /// Flush a final line that was not newline-terminated
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.pending);
        Self::decode_line(&rest)
    }

    /// Whether bytes of an incomplete line are being held
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    fn decode_line(raw: &[u8]) -> Option<String> {
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        if raw.iter().all(u8::is_ascii_whitespace) {
            return None;
        }
        Some(String::from_utf8_lossy(raw).into_owned())
    }
}
