//! Desktop notification sink.
//!
//! [`Notifier`] is fire-and-forget: delivery problems are logged and
//! swallowed, never returned. The production sink shells out to
//! `terminal-notifier`; when that binary is missing every call is a no-op.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::OnceCell;

use crate::detect::PrEvent;

/// One desktop notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Coalescing key: a later notification with the same group replaces the
    /// earlier one.
    pub group: String,
    pub title: String,
    pub subtitle: String,
    pub body: String,
    /// Opened when the notification is clicked.
    pub url: String,
}

impl Notification {
    pub fn from_event(event: &PrEvent) -> Self {
        Self {
            group: event.key(),
            title: event.title(),
            subtitle: event.subtitle(),
            body: event.body(),
            url: event.url().to_string(),
        }
    }
}

/// Sink for desktop notifications.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Human-readable name for logging.
    fn name(&self) -> &str;

    /// Deliver one notification. Never fails.
    async fn notify(&self, notification: &Notification);
}

/// [`Notifier`] backed by the `terminal-notifier` CLI.
pub struct TerminalNotifier {
    bin: String,
    timeout: Duration,
    available: OnceCell<bool>,
}

impl TerminalNotifier {
    pub fn new(bin: impl Into<String>, timeout: Duration) -> Self {
        Self {
            bin: bin.into(),
            timeout,
            available: OnceCell::new(),
        }
    }

    /// Whether the binary can be found, checked once per process.
    pub async fn is_available(&self) -> bool {
        *self
            .available
            .get_or_init(|| async {
                if self.bin.trim().is_empty() {
                    return false;
                }
                let found = tokio::process::Command::new("which")
                    .arg(&self.bin)
                    .output()
                    .await
                    .map(|o| o.status.success())
                    .unwrap_or(false);
                if !found {
                    tracing::info!(target: "notify", "{} not found; notifications disabled", self.bin);
                }
                found
            })
            .await
    }

    fn args(notification: &Notification) -> Vec<String> {
        let mut args = vec![
            "-group".to_string(),
            notification.group.clone(),
            "-title".into(),
            notification.title.clone(),
            "-message".into(),
            // A leading bracket or dash would be parsed as an option.
            format!("\u{200B}{}", notification.body),
        ];
        if !notification.subtitle.is_empty() {
            args.push("-subtitle".into());
            args.push(notification.subtitle.clone());
        }
        if !notification.url.is_empty() {
            args.push("-open".into());
            args.push(notification.url.clone());
        }
        args
    }
}

#[async_trait]
impl Notifier for TerminalNotifier {
    fn name(&self) -> &str {
        &self.bin
    }

    async fn notify(&self, notification: &Notification) {
        if !self.is_available().await {
            return;
        }

        let child = tokio::process::Command::new(&self.bin)
            .args(Self::args(notification))
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(self.timeout, child).await {
            Ok(Ok(output)) if output.status.success() => {
                tracing::debug!(target: "notify", "sent {}", notification.group);
            }
            Ok(Ok(output)) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                tracing::warn!(target: "notify", "{} failed: {}", self.bin, stderr.trim());
            }
            Ok(Err(e)) => tracing::warn!(target: "notify", "failed to run {}: {e}", self.bin),
            Err(_) => tracing::warn!(target: "notify", "{} timed out", self.bin),
        }
    }
}
