//! Session lifecycle state

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle of a session facade
///
/// ```text
/// Connecting -> Connected -> Disconnected -> Reconnecting -> Connecting
///      |                         ^   ^            |
///      +-------------------------+   +------------+ (countdown cancelled)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// A connect attempt is in flight
    Connecting,
    Connected,
    /// Not connected and no countdown running
    Disconnected,
    /// Countdown to an automatic reconnect is running
    Reconnecting,
}

impl LifecycleState {
    pub fn is_connected(&self) -> bool {
        matches!(self, LifecycleState::Connected)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleState::Connecting => write!(f, "connecting"),
            LifecycleState::Connected => write!(f, "connected"),
            LifecycleState::Disconnected => write!(f, "disconnected"),
            LifecycleState::Reconnecting => write!(f, "reconnecting"),
        }
    }
}
