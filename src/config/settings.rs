//! User settings with defaults

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Session behaviour settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Reconnect automatically after a transport loss
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,

    /// Countdown before an automatic reconnect
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,

    /// Connection timeout in seconds
    #[serde(default = "default_timeout")]
    pub connect_timeout_secs: u64,

    /// SSH keepalive interval in seconds (0 disables)
    #[serde(default = "default_keepalive")]
    pub keepalive_interval_secs: u64,

    /// Terminal columns
    #[serde(default = "default_cols")]
    pub terminal_cols: u32,

    /// Terminal rows
    #[serde(default = "default_rows")]
    pub terminal_rows: u32,

    /// Show dotfiles in directory listings
    #[serde(default = "default_true")]
    pub show_hidden_files: bool,
}

fn default_true() -> bool {
    true
}

fn default_reconnect_delay() -> u64 {
    5
}

fn default_timeout() -> u64 {
    30
}

fn default_keepalive() -> u64 {
    30
}

fn default_cols() -> u32 {
    80
}

fn default_rows() -> u32 {
    24
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            reconnect_delay_secs: 5,
            connect_timeout_secs: 30,
            keepalive_interval_secs: 30,
            terminal_cols: 80,
            terminal_rows: 24,
            show_hidden_files: true,
        }
    }
}

impl Settings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    pub fn keepalive_interval(&self) -> Option<Duration> {
        (self.keepalive_interval_secs > 0).then(|| Duration::from_secs(self.keepalive_interval_secs))
    }
}
