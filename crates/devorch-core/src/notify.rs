//! Best-effort operator notifications.
//!
//! Delivery never blocks the caller: [`dispatch`] hands the notification to
//! a spawned task bounded by a timeout, and failures only reach DEBUG logs.

use crate::error::{OrchestratorError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    ApprovalRequired,
    ServiceStarted,
    ServiceStopped,
    ServiceCrashed,
    CommandFailed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
}

impl Notification {
    pub fn new(kind: NotificationKind, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            title: title.into(),
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait NotificationSink: Send + Sync + std::fmt::Debug {
    async fn deliver(&self, notification: &Notification) -> Result<()>;
}

/// Fire-and-forget delivery on the current runtime
pub fn dispatch(sink: &Arc<dyn NotificationSink>, notification: Notification) {
    let runtime = match tokio::runtime::Handle::try_current() {
        Ok(runtime) => runtime,
        Err(_) => {
            tracing::debug!(kind = ?notification.kind, "no runtime, notification dropped");
            return;
        }
    };
    let sink = sink.clone();
    runtime.spawn(async move {
        if let Err(err) = sink.deliver(&notification).await {
            tracing::debug!(%err, kind = ?notification.kind, "notification not delivered");
        }
    });
}

/// Discards everything
#[derive(Debug, Default, Clone)]
pub struct NullNotifier;

#[async_trait]
impl NotificationSink for NullNotifier {
    async fn deliver(&self, _notification: &Notification) -> Result<()> {
        Ok(())
    }
}

/// Native desktop notifications: `osascript` on macOS, `notify-send`
/// everywhere else.
#[derive(Debug, Clone)]
pub struct DesktopNotifier {
    app_name: String,
    timeout: Duration,
}

impl DesktopNotifier {
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            timeout: Duration::from_secs(3),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn command(&self, notification: &Notification) -> tokio::process::Command {
        if cfg!(target_os = "macos") {
            let script = format!(
                "display notification \"{}\" with title \"{}\" subtitle \"{}\"",
                escape_applescript(&notification.message),
                escape_applescript(&self.app_name),
                escape_applescript(&notification.title),
            );
            let mut cmd = tokio::process::Command::new("osascript");
            cmd.arg("-e").arg(script);
            cmd
        } else {
            let mut cmd = tokio::process::Command::new("notify-send");
            cmd.arg("--app-name")
                .arg(&self.app_name)
                .arg(&notification.title)
                .arg(&notification.message);
            cmd
        }
    }
}

fn escape_applescript(text: &str) -> String {
    text.replace('\\', "\\\\").replace('"', "\\\"")
}

#[async_trait]
impl NotificationSink for DesktopNotifier {
    async fn deliver(&self, notification: &Notification) -> Result<()> {
        let mut cmd = self.command(notification);
        cmd.stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true);

        let status = tokio::time::timeout(self.timeout, cmd.status())
            .await
            .map_err(|_| {
                OrchestratorError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "notification helper timed out",
                ))
            })??;

        if !status.success() {
            return Err(OrchestratorError::ExecutionFailure {
                exit_code: crate::process::exit_code(&status),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Debug, Default)]
    struct Recorder {
        seen: Mutex<Vec<Notification>>,
    }

    #[async_trait]
    impl NotificationSink for Recorder {
        async fn deliver(&self, notification: &Notification) -> Result<()> {
            self.seen.lock().push(notification.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_dispatch_delivers_in_background() {
        let recorder = Arc::new(Recorder::default());
        let sink: Arc<dyn NotificationSink> = recorder.clone();

        dispatch(
            &sink,
            Notification::new(NotificationKind::ServiceCrashed, "web crashed", "exit 1"),
        );

        for _ in 0..50 {
            if !recorder.seen.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(recorder.seen.lock()[0].kind, NotificationKind::ServiceCrashed);
    }

    #[test]
    fn test_dispatch_without_runtime_is_noop() {
        let sink: Arc<dyn NotificationSink> = Arc::new(NullNotifier);
        dispatch(
            &sink,
            Notification::new(NotificationKind::CommandFailed, "x", "y"),
        );
    }

    #[test]
    fn test_applescript_escaping() {
        assert_eq!(escape_applescript(r#"say "hi"\"#), r#"say \"hi\"\\"#);
    }
}
