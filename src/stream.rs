//! Streamed completion consumption
//!
//! One generation request opens one network stream and drains it chunk by
//! chunk. The response body is plain text flushed incrementally with no
//! per-chunk framing, so chunk boundaries can land anywhere - including in
//! the middle of a multi-byte character. Decoding therefore carries state
//! across chunks, and the accumulated text only ever grows.
//!
//! Cancellation is cooperative: the token is checked between chunk reads,
//! and whatever text has accumulated at that point is kept, not discarded.

use std::pin::Pin;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::Client;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::error::ApiError;

/// Raw response body chunks.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, ApiError>> + Send>>;

/// Payload for the streaming completion endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompletionRequest {
    pub prompt: String,
    pub include_context: bool,
    pub context_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route: Option<String>,
}

impl CompletionRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            include_context: true,
            context_type: "general".to_string(),
            route: None,
        }
    }

    pub fn with_context_type(mut self, context_type: impl Into<String>) -> Self {
        self.context_type = context_type.into();
        self
    }

    pub fn with_route(mut self, route: impl Into<String>) -> Self {
        self.route = Some(route.into());
        self
    }
}

/// How a drained stream ended.
///
/// `Cancelled` is a successful partial completion: its text is kept and
/// persisted by the caller when non-empty.
#[derive(Debug)]
pub enum StreamOutcome {
    Completed(String),
    Cancelled(String),
    Failed(ApiError),
}

/// Seam for opening a completion stream.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn open(&self, request: &CompletionRequest) -> Result<ByteStream, ApiError>;
}

/// REST client for the assistant `/stream` endpoint.
pub struct HttpCompletionClient {
    client: Client,
    base_url: String,
    api_token: Option<String>,
}

impl HttpCompletionClient {
    pub fn new(config: &EngineConfig) -> Self {
        // No overall request timeout: an open stream has no deadline, the
        // user stops it manually. Only connecting is bounded.
        let client = Client::builder()
            .connect_timeout(config.request_timeout)
            .build()
            .expect("Failed to create HTTP client");
        Self {
            client,
            base_url: config.base_url.clone(),
            api_token: config.api_token.clone(),
        }
    }
}

#[async_trait]
impl CompletionClient for HttpCompletionClient {
    async fn open(&self, request: &CompletionRequest) -> Result<ByteStream, ApiError> {
        let mut builder = self
            .client
            .post(format!("{}/stream", self.base_url))
            .json(request);
        if let Some(token) = &self.api_token {
            builder = builder.bearer_auth(token);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| ApiError::from_reqwest(&e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::from_status(status.as_u16(), &body));
        }

        let body = response.bytes_stream().map(|chunk| {
            chunk
                .map(|bytes| bytes.to_vec())
                .map_err(|e| ApiError::network(format!("Stream read failed: {e}")))
        });
        Ok(Box::pin(body))
    }
}

/// Stateful UTF-8 decoder for byte chunks split at arbitrary boundaries.
///
/// An incomplete multi-byte sequence at the end of a chunk is carried over
/// and completed by the next chunk. Invalid bytes decode to U+FFFD instead
/// of failing the stream.
#[derive(Debug, Default)]
pub struct Utf8Accumulator {
    pending: Vec<u8>,
}

impl Utf8Accumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode the next chunk, returning the newly completed text.
    pub fn push(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut decoded = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(valid) => {
                    decoded.push_str(valid);
                    self.pending.clear();
                    break;
                }
                Err(err) => {
                    let valid_len = err.valid_up_to();
                    decoded.push_str(&String::from_utf8_lossy(&self.pending[..valid_len]));
                    match err.error_len() {
                        // A complete but invalid sequence: replace and move on.
                        Some(bad_len) => {
                            decoded.push('\u{FFFD}');
                            self.pending.drain(..valid_len + bad_len);
                        }
                        // Incomplete trailing character: keep the bytes for
                        // the next chunk.
                        None => {
                            self.pending.drain(..valid_len);
                            break;
                        }
                    }
                }
            }
        }
        decoded
    }

    /// Flush at end of stream. A character truncated by the server decodes
    /// to U+FFFD.
    pub fn finish(&mut self) -> String {
        if self.pending.is_empty() {
            String::new()
        } else {
            self.pending.clear();
            "\u{FFFD}".to_string()
        }
    }
}

/// Drain a completion stream to its terminal outcome.
///
/// `on_delta` observes the full accumulated text after every chunk that
/// completed at least one character; observers only ever see it grow. The
/// cancellation token is checked before each chunk read, so cancellation
/// latency is bounded by one chunk and the text accumulated so far is
/// returned, not dropped.
pub async fn consume<F>(
    mut body: ByteStream,
    cancel: &CancellationToken,
    mut on_delta: F,
) -> StreamOutcome
where
    F: FnMut(&str),
{
    let mut decoder = Utf8Accumulator::new();
    let mut text = String::new();

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                tracing::debug!(chars = text.chars().count(), "generation cancelled mid-stream");
                return StreamOutcome::Cancelled(text);
            }

            chunk = body.next() => match chunk {
                Some(Ok(bytes)) => {
                    let delta = decoder.push(&bytes);
                    if !delta.is_empty() {
                        text.push_str(&delta);
                        on_delta(&text);
                    }
                }
                Some(Err(err)) => {
                    tracing::warn!(error = %err, "completion stream failed mid-read");
                    return StreamOutcome::Failed(err);
                }
                None => {
                    let tail = decoder.finish();
                    if !tail.is_empty() {
                        text.push_str(&tail);
                        on_delta(&text);
                    }
                    return StreamOutcome::Completed(text);
                }
            }
        }
    }
}
