use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use axum::response::sse::Event;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    #[error("sink already closed")]
    Closed,

    #[error("sink write failed: {0}")]
    Write(String),
}

/// Output a streamed response is written to, one event payload per `write`.
///
/// `close` is not required to tolerate a second call, and `write` after
/// close is expected to fail with [`SinkError::Closed`].
pub trait EventSink: Send + Sync {
    fn write(&self, data: &str) -> Result<(), SinkError>;
    fn close(&self);
}

/// Single-flight wrapper over an [`EventSink`].
///
/// Sends after close are dropped silently and the underlying `close` runs at
/// most once no matter how many termination paths ask for it.
pub struct StreamSinkAdapter<S> {
    sink: S,
    closed: AtomicBool,
}

impl<S: EventSink> StreamSinkAdapter<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn send(&self, text: &str) -> Result<(), SinkError> {
        if self.is_closed() {
            return Ok(());
        }
        match self.sink.write(text) {
            Ok(()) => Ok(()),
            Err(SinkError::Closed) => {
                // The consumer went away between our check and the write.
                self.closed.store(true, Ordering::SeqCst);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Returns true for the one call that actually closed the sink.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.sink.close();
        true
    }
}

/// Sink feeding an SSE response through an unbounded channel of events.
///
/// A dropped receiver (client gone) surfaces as [`SinkError::Closed`].
pub struct ChannelSink {
    tx: Mutex<Option<mpsc::UnboundedSender<Event>>>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx: Mutex::new(Some(tx)),
            },
            rx,
        )
    }
}

impl EventSink for ChannelSink {
    fn write(&self, data: &str) -> Result<(), SinkError> {
        let guard = self.tx.lock().map_err(|_| SinkError::Write("sink lock poisoned".into()))?;
        let tx = guard.as_ref().ok_or(SinkError::Closed)?;
        tx.send(Event::default().data(data))
            .map_err(|_| SinkError::Closed)
    }

    fn close(&self) {
        let mut guard = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        let _ = guard.take();
    }
}
