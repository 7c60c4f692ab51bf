//! Lifecycle of one streamed chat response.
//!
//! A [`StreamSession`] pumps an upstream [`AgentStream`] into a
//! [`StreamSinkAdapter`] until one of four things happens: the agent
//! finishes, the client goes away, the deadline passes, or the agent fails.
//! All four funnel into [`StreamSession::finish`], which closes the sink,
//! stops the upstream and logs exactly once.

use std::time::{Duration, Instant};

use futures_util::StreamExt;
use serde::Serialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::sink::{EventSink, SinkError, StreamSinkAdapter};
use crate::agent::AgentStream;
use crate::agent_types::AgentMessage;

/// Payload of the event that ends a completed stream.
pub const DONE_DATA: &str = "[DONE]";

/// JSON payload for one server-sent event.
pub fn event_data<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|e| {
        json!({"type": "error", "error": format!("unserializable event: {e}")}).to_string()
    })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    Completed,
    ClientAbort,
    Timeout,
    UpstreamError,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::Completed => "completed",
            CloseReason::ClientAbort => "client_abort",
            CloseReason::Timeout => "timeout",
            CloseReason::UpstreamError => "upstream_error",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Streaming,
    Closed(CloseReason),
}

pub struct StreamSession<S> {
    id: String,
    sink: StreamSinkAdapter<S>,
    state: SessionState,
    deadline: Duration,
    client_abort: CancellationToken,
    upstream_cancel: CancellationToken,
    announced_session: bool,
}

impl<S: EventSink> StreamSession<S> {
    /// `client_abort` fires when the inbound connection goes away;
    /// `upstream_cancel` is the token the agent stream was started with.
    pub fn new(
        id: String,
        sink: S,
        deadline: Duration,
        client_abort: CancellationToken,
        upstream_cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            sink: StreamSinkAdapter::new(sink),
            state: SessionState::Idle,
            deadline,
            client_abort,
            upstream_cancel,
            announced_session: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Streams `source` to the sink and returns how the session ended.
    pub async fn run(mut self, mut source: AgentStream) -> CloseReason {
        let started = Instant::now();
        self.state = SessionState::Streaming;
        let reason = self.pump(&mut source).await;
        drop(source);
        self.finish(reason, started);
        reason
    }

    /// Waits on the next upstream message, the deadline and the client
    /// abort at once. The timer and the abort listener live only for the
    /// duration of this call.
    async fn pump(&mut self, source: &mut AgentStream) -> CloseReason {
        let deadline = tokio::time::sleep(self.deadline);
        tokio::pin!(deadline);
        let client_abort = self.client_abort.clone();

        loop {
            tokio::select! {
                biased;
                _ = client_abort.cancelled() => return CloseReason::ClientAbort,
                _ = &mut deadline => return CloseReason::Timeout,
                next = source.next() => match next {
                    Some(Ok(message)) => {
                        let terminal = message.is_terminal();
                        if let Err(e) = self.forward(&message) {
                            return self.fail(&e.to_string());
                        }
                        if terminal {
                            return self.complete();
                        }
                        if self.sink.is_closed() {
                            // A write lost the race with a disconnect.
                            return CloseReason::ClientAbort;
                        }
                    }
                    Some(Err(e)) => return self.fail(&e.to_string()),
                    None => return self.complete(),
                },
            }
        }
    }

    fn forward(&mut self, message: &AgentMessage) -> Result<(), SinkError> {
        if !self.announced_session {
            if let Some(session_id) = message.session_id() {
                self.announced_session = true;
                self.sink.send(&event_data(
                    &json!({"type": "session_init", "session_id": session_id}),
                ))?;
            }
        }
        self.sink.send(&event_data(message))
    }

    fn complete(&mut self) -> CloseReason {
        if let Err(e) = self.sink.send(DONE_DATA) {
            return self.fail(&e.to_string());
        }
        CloseReason::Completed
    }

    /// Best-effort error event; the session closes either way.
    fn fail(&mut self, error: &str) -> CloseReason {
        warn!(target: "web", stream_id = %self.id, error = %error, "Stream failed");
        let _ = self
            .sink
            .send(&event_data(&json!({"type": "error", "error": error})));
        CloseReason::UpstreamError
    }

    fn finish(&mut self, reason: CloseReason, started: Instant) {
        if matches!(self.state, SessionState::Closed(_)) {
            return;
        }
        self.state = SessionState::Closed(reason);
        if reason != CloseReason::Completed {
            self.upstream_cancel.cancel();
        }
        self.sink.close();
        info!(
            target: "web",
            stream_id = %self.id,
            reason = reason.as_str(),
            latency_ms = started.elapsed().as_millis(),
            "Stream closed"
        );
    }
}
