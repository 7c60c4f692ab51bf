//! Upstream agent seam.
//!
//! The web layer only sees an [`Agent`] that turns a chat request into a
//! cancellable stream of tagged [`AgentMessage`]s. [`HttpAgent`] is the
//! production implementation: it posts the request to an upstream service
//! and decodes its newline-delimited JSON response body.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::agent_types::{AgentMessage, ChatRequest};
use crate::error::ChatRelayError;

pub type AgentStream = BoxStream<'static, Result<AgentMessage, ChatRelayError>>;

#[async_trait]
pub trait Agent: Send + Sync {
    /// Starts one turn. Implementations must stop producing messages once
    /// `cancel` fires.
    async fn start(
        &self,
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> Result<AgentStream, ChatRelayError>;
}

/// Lines longer than this are rejected without being parsed.
pub const MAX_LINE_BYTES: usize = 4 * 1024 * 1024;

/// Incremental newline-delimited JSON decoder.
#[derive(Debug, Default)]
pub struct NdjsonDecoder {
    buf: Vec<u8>,
}

impl NdjsonDecoder {
    /// Feeds a chunk and returns every complete line decoded from it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<AgentMessage, ChatRelayError>> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line = self.buf.drain(..=pos).collect::<Vec<u8>>();
            if let Some(item) = decode_line(&line[..line.len() - 1]) {
                out.push(item);
            }
        }
        if self.buf.len() > MAX_LINE_BYTES {
            self.buf.clear();
            out.push(Err(ChatRelayError::Agent(format!(
                "upstream line exceeds {MAX_LINE_BYTES} bytes"
            ))));
        }
        out
    }

    /// Decodes a trailing line that had no newline.
    pub fn finish(&mut self) -> Option<Result<AgentMessage, ChatRelayError>> {
        let rest = std::mem::take(&mut self.buf);
        decode_line(&rest)
    }
}

fn decode_line(line: &[u8]) -> Option<Result<AgentMessage, ChatRelayError>> {
    if line.iter().all(u8::is_ascii_whitespace) {
        return None;
    }
    Some(serde_json::from_slice::<AgentMessage>(line).map_err(ChatRelayError::from))
}

pub struct HttpAgent {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpAgent {
    pub fn new(endpoint: &str, connect_timeout: Duration) -> Result<Self, ChatRelayError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
        })
    }
}

#[async_trait]
impl Agent for HttpAgent {
    async fn start(
        &self,
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> Result<AgentStream, ChatRelayError> {
        let send = self
            .client
            .post(&self.endpoint)
            .header("accept", "application/x-ndjson")
            .json(&request)
            .send();
        let resp = tokio::select! {
            resp = send => resp?,
            _ = cancel.cancelled() => {
                return Err(ChatRelayError::Agent("cancelled before upstream responded".into()));
            }
        };
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let snippet: String = body.chars().take(200).collect();
            return Err(ChatRelayError::Agent(format!(
                "upstream returned {status}: {snippet}"
            )));
        }
        debug!(target: "agent", endpoint = %self.endpoint, "Upstream stream opened");

        let mut bytes = resp.bytes_stream();
        let stream = async_stream::stream! {
            let mut decoder = NdjsonDecoder::default();
            loop {
                let chunk = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    chunk = bytes.next() => chunk,
                };
                match chunk {
                    Some(Ok(chunk)) => {
                        for item in decoder.push(&chunk) {
                            yield item;
                        }
                    }
                    Some(Err(e)) => {
                        yield Err(ChatRelayError::from(e));
                        break;
                    }
                    None => {
                        if let Some(item) = decoder.finish() {
                            yield item;
                        }
                        break;
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }
}
