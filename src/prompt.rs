//! Interactive prompt collaborator
//!
//! The UI layer implements [`Prompter`]; every prompt may be cancelled, which
//! reads as `None`.

use async_trait::async_trait;

#[async_trait]
pub trait Prompter: Send + Sync {
    /// Masked input
    async fn ask_secret(&self, prompt: &str) -> Option<String>;

    /// Modal choice; returns the index into `options`
    async fn ask_choice(&self, message: &str, options: &[&str]) -> Option<usize>;

    async fn ask_text(&self, prompt: &str, default: &str) -> Option<String>;
}

/// Prompter for unattended use: declines every choice and never supplies input
pub struct NonInteractive;

#[async_trait]
impl Prompter for NonInteractive {
    async fn ask_secret(&self, prompt: &str) -> Option<String> {
        tracing::debug!("Non-interactive: declining secret prompt {:?}", prompt);
        None
    }

    async fn ask_choice(&self, message: &str, _options: &[&str]) -> Option<usize> {
        tracing::debug!("Non-interactive: declining choice {:?}", message);
        None
    }

    async fn ask_text(&self, _prompt: &str, _default: &str) -> Option<String> {
        None
    }
}
