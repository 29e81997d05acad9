//! devicelink - SSH plumbing for managing remote devices
//!
//! Connects to devices over SSH (directly or through a bastion), pins their
//! host keys, caches credentials in the system keychain, and drives three
//! kinds of sessions on top of one reconnecting lifecycle: streamed logs, an
//! interactive shell, and an SFTP file browser.

pub mod config;
pub mod prompt;
pub mod session;
pub mod sftp;
pub mod ssh;

#[cfg(test)]
mod testing;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the default tracing subscriber.
///
/// Honors `RUST_LOG`, defaulting to `info`. Does nothing if a subscriber is
/// already installed.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
