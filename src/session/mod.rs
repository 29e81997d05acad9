//! Session Management Module
//!
//! Device sessions built on one shared lifecycle:
//! - State machine for the connection lifecycle
//! - Reconnect countdown with user overrides
//! - Event stream for the UI, closed on dispose
//! - Log streaming, interactive shell, and (in [`crate::sftp`]) file browsing

mod decoder;
mod driver;
mod events;
mod log;
mod reconnect;
mod shell;
mod state;

pub use decoder::LineStreamDecoder;
pub use driver::{ActivityContext, ActivityEnd, SessionActivity, SessionDriver};
pub use events::{CloseGuard, EventSink, RequestId, SessionEvent};
pub use log::{closed_marker, LogSession};
pub use reconnect::ReconnectSupervisor;
pub use shell::InteractiveShellSession;
pub use state::LifecycleState;
