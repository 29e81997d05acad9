//! Events pushed from a session facade to the UI
//!
//! Every facade owns one [`EventSink`]; the UI drains the matching receiver.
//! Closing the sink is what makes `dispose()` final: once
//! [`EventSink::close`] returns, nothing else reaches the receiver.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use super::state::LifecycleState;
use crate::sftp::FileInfo;

/// Correlates a file pane request with the events it produces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// Lifecycle transition; `countdown` is set while a reconnect is pending
    Status {
        state: LifecycleState,
        message: String,
        countdown: Option<u64>,
    },
    /// One complete line of log output
    Line { text: String },
    /// Raw terminal output
    Output { data: Vec<u8> },
    Error { message: String },
    /// The current connection ended; fires once per connection
    Closed { reason: String },
    /// Directory listing produced by a file pane request
    Listing {
        request_id: RequestId,
        path: String,
        entries: Vec<FileInfo>,
    },
    /// A file pane request failed; the connection is unaffected
    OperationFailed {
        request_id: RequestId,
        operation: String,
        message: String,
    },
}

/// Sending half of a facade's event stream
#[derive(Clone)]
pub struct EventSink {
    tx: Arc<Mutex<Option<mpsc::UnboundedSender<SessionEvent>>>>,
}

impl EventSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx: Arc::new(Mutex::new(Some(tx))),
            },
            rx,
        )
    }

    /// Deliver `event`; returns false once the sink is closed
    pub fn emit(&self, event: SessionEvent) -> bool {
        let guard = self.tx.lock();
        match guard.as_ref() {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    pub fn status(&self, state: LifecycleState, message: impl Into<String>) -> bool {
        self.emit(SessionEvent::Status {
            state,
            message: message.into(),
            countdown: None,
        })
    }

    pub fn error(&self, message: impl Into<String>) -> bool {
        self.emit(SessionEvent::Error {
            message: message.into(),
        })
    }

    pub fn close(&self) {
        if self.tx.lock().take().is_some() {
            debug!("Event sink closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.lock().is_none()
    }
}

/// Emits [`SessionEvent::Closed`] at most once per armed connection
#[derive(Debug, Default)]
pub struct CloseGuard {
    armed: AtomicBool,
}

impl CloseGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Call on each successful connect
    pub fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }

    /// Returns true if this call emitted the event
    pub fn fire(&self, sink: &EventSink, reason: &str) -> bool {
        if !self.armed.swap(false, Ordering::SeqCst) {
            debug!("Duplicate close suppressed: {}", reason);
            return false;
        }
        sink.emit(SessionEvent::Closed {
            reason: reason.to_string(),
        })
    }
}
