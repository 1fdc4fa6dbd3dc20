//! Command executor
//!
//! Runs an already-classified command record as `sh -c <text>` in its
//! working directory, on its own task. Every transition is written to the
//! state store as it happens: queued → running → completed | failed.
//! Spawn failures become failed records with exit code 127 or 126.

use crate::config::ExecutorConfig;
use crate::error::{OrchestratorError, Result};
use crate::notify::{dispatch, Notification, NotificationKind, NotificationSink};
use crate::process;
use crate::state::StateStore;
use crate::types::{now, CommandId, CommandRecord, CommandStatus, LogLevel};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

const SOURCE: &str = "executor";

/// Read a stream to the end, keeping only the last `limit` bytes
async fn read_tail<R>(mut reader: R, limit: usize) -> String
where
    R: AsyncRead + Unpin,
{
    let mut kept: Vec<u8> = Vec::new();
    let mut buf = [0u8; 8192];
    let mut truncated = false;
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                kept.extend_from_slice(&buf[..n]);
                if kept.len() > limit {
                    let excess = kept.len() - limit;
                    kept.drain(..excess);
                    truncated = true;
                }
            }
            Err(err) => {
                tracing::debug!(%err, "output stream closed with error");
                break;
            }
        }
    }
    let text = String::from_utf8_lossy(&kept).into_owned();
    if truncated {
        format!("[output truncated]\n{}", text)
    } else {
        text
    }
}

pub struct CommandExecutor {
    store: Arc<StateStore>,
    config: ExecutorConfig,
    notifier: Arc<dyn NotificationSink>,
    cancels: Mutex<HashMap<CommandId, oneshot::Sender<()>>>,
    directory_locks: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl std::fmt::Debug for CommandExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandExecutor")
            .field("config", &self.config)
            .field("running", &self.cancels.lock().len())
            .finish()
    }
}

impl CommandExecutor {
    pub fn new(
        store: Arc<StateStore>,
        config: ExecutorConfig,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            store,
            config,
            notifier,
            cancels: Mutex::new(HashMap::new()),
            directory_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Start executing a queued record. With concurrent execution allowed
    /// the record is `running` when this returns; otherwise it stays
    /// `queued` until its directory is free.
    pub fn execute(self: &Arc<Self>, id: &CommandId) -> Result<JoinHandle<()>> {
        let record = self
            .store
            .command(id)
            .ok_or_else(|| OrchestratorError::CommandNotFound(id.clone()))?;
        if record.status != CommandStatus::Queued {
            return Err(OrchestratorError::InvalidState(format!(
                "command {} is {}, expected queued",
                id, record.status
            )));
        }

        let (cancel_tx, cancel_rx) = oneshot::channel();
        self.cancels.lock().insert(id.clone(), cancel_tx);

        let dir_lock = if self.config.allow_concurrent_in_same_directory {
            if let Err(err) = self.mark_running(id) {
                self.cancels.lock().remove(id);
                return Err(err);
            }
            None
        } else {
            Some(self.directory_lock(&record.working_directory))
        };

        let executor = self.clone();
        let id = id.clone();
        Ok(tokio::spawn(async move {
            executor.run(record, dir_lock, cancel_rx).await;
            executor.cancels.lock().remove(&id);
        }))
    }

    /// Ask a queued or running command to stop: SIGTERM, grace period,
    /// then SIGKILL.
    pub fn cancel(&self, id: &CommandId) -> Result<()> {
        let sender = self.cancels.lock().remove(id);
        if let Some(tx) = sender {
            if tx.send(()).is_ok() {
                tracing::info!("Cancellation requested for {}", id);
                return Ok(());
            }
        }
        match self.store.command(id) {
            Some(record) => Err(OrchestratorError::InvalidState(format!(
                "command {} is {} and cannot be cancelled",
                id, record.status
            ))),
            None => Err(OrchestratorError::CommandNotFound(id.clone())),
        }
    }

    pub fn running_count(&self) -> usize {
        self.cancels.lock().len()
    }

    fn directory_lock(&self, dir: &PathBuf) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.directory_locks.lock();
        // Drop locks nobody holds or waits on.
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks.entry(dir.clone()).or_default().clone()
    }

    fn mark_running(&self, id: &CommandId) -> Result<CommandRecord> {
        self.store.update_command(id, |r| {
            r.status = CommandStatus::Running;
            r.started_at = Some(now());
        })
    }

    async fn run(
        &self,
        record: CommandRecord,
        dir_lock: Option<Arc<tokio::sync::Mutex<()>>>,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        let _guard = match &dir_lock {
            Some(lock) => {
                tokio::select! {
                    guard = lock.lock() => Some(guard),
                    _ = &mut cancel_rx => {
                        self.finish_rejected(&record.id, "cancelled before start");
                        return;
                    }
                }
            }
            None => None,
        };
        if dir_lock.is_some() {
            if let Err(err) = self.mark_running(&record.id) {
                tracing::warn!(%err, "command vanished before start");
                self.store.log(
                    LogLevel::Error,
                    format!("Could not start {}: {}", record.text, err),
                    SOURCE,
                );
                return;
            }
        }

        let spawned = Command::new(&self.config.shell)
            .arg("-c")
            .arg(&record.text)
            .current_dir(&record.working_directory)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(source) => {
                let code = process::spawn_failure_code(&source);
                let err = OrchestratorError::SpawnFailure {
                    command: record.text.clone(),
                    source,
                };
                let message = format!("{} (in {})", err, record.working_directory.display());
                if let Err(err) = self.store.update_command(&record.id, |r| {
                    r.status = CommandStatus::Failed;
                    r.exit_code = Some(code);
                    r.error = Some(message.clone());
                }) {
                    self.record_lost(&record, code, &err);
                }
                self.store.log(LogLevel::Error, message, SOURCE);
                self.notify_failure(&record, code);
                return;
            }
        };

        tracing::info!(
            command_id = %record.id,
            pid = child.id(),
            "Running: {}",
            record.text
        );

        let limit = self.config.max_output_bytes;
        let stdout = child.stdout.take().map(|out| tokio::spawn(read_tail(out, limit)));
        let stderr = child.stderr.take().map(|err| tokio::spawn(read_tail(err, limit)));

        let mut cancelled = false;
        let status = tokio::select! {
            status = child.wait() => status,
            _ = &mut cancel_rx => {
                cancelled = true;
                let grace = Duration::from_millis(self.config.cancel_grace_ms);
                process::terminate_child(&mut child, grace).await
            }
        };

        let stdout = match stdout {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };
        let stderr = match stderr {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        let (code, wait_error) = match status {
            Ok(status) => (process::exit_code(&status), None),
            Err(err) => (-1, Some(format!("failed to wait for process: {}", err))),
        };
        let succeeded = code == 0 && !cancelled && wait_error.is_none();
        let error = if cancelled {
            Some("cancelled by operator".to_string())
        } else if !succeeded {
            wait_error.or_else(|| {
                Some(OrchestratorError::ExecutionFailure { exit_code: code }.to_string())
            })
        } else {
            None
        };

        let updated = self.store.update_command(&record.id, |r| {
            r.status = if succeeded {
                CommandStatus::Completed
            } else {
                CommandStatus::Failed
            };
            r.exit_code = Some(code);
            r.stdout = stdout;
            r.stderr = stderr;
            r.error = error;
        });

        match updated {
            Ok(done) if done.status == CommandStatus::Completed => {
                self.store.log(
                    LogLevel::Info,
                    format!("Completed: {} (exit 0)", record.text),
                    SOURCE,
                );
            }
            Ok(done) => {
                let level = if cancelled { LogLevel::Warn } else { LogLevel::Error };
                let what = if cancelled { "Cancelled" } else { "Failed" };
                self.store.log(
                    level,
                    format!("{}: {} (exit {})", what, done.text, code),
                    SOURCE,
                );
                if !cancelled {
                    self.notify_failure(&record, code);
                }
            }
            Err(err) => self.record_lost(&record, code, &err),
        }
    }

    fn record_lost(&self, record: &CommandRecord, code: i32, err: &OrchestratorError) {
        tracing::warn!(command_id = %record.id, %err, "could not record command result");
        self.store.log(
            LogLevel::Error,
            format!(
                "Result of {} (exit {}) could not be recorded: {}",
                record.text, code, err
            ),
            SOURCE,
        );
    }

    fn finish_rejected(&self, id: &CommandId, reason: &str) {
        match self.store.update_command(id, |r| {
            r.status = CommandStatus::Rejected;
            r.reason = Some(reason.to_string());
        }) {
            Ok(record) => self.store.log(
                LogLevel::Warn,
                format!("Cancelled before start: {}", record.text),
                SOURCE,
            ),
            Err(err) => tracing::warn!(%err, "could not record cancellation"),
        }
    }

    fn notify_failure(&self, record: &CommandRecord, code: i32) {
        dispatch(
            &self.notifier,
            Notification::new(
                NotificationKind::CommandFailed,
                "Command failed",
                format!("{} exited with code {}", record.text, code),
            ),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StateLimits;
    use crate::notify::NullNotifier;

    fn setup(config: ExecutorConfig) -> (Arc<StateStore>, Arc<CommandExecutor>) {
        let store = Arc::new(StateStore::new(&StateLimits::default()));
        let executor = Arc::new(CommandExecutor::new(
            store.clone(),
            config,
            Arc::new(NullNotifier),
        ));
        (store, executor)
    }

    fn submit(store: &StateStore, text: &str, dir: &std::path::Path) -> CommandId {
        let record = CommandRecord::new(text, dir);
        let id = record.id.clone();
        store.insert_command(record);
        id
    }

    #[tokio::test]
    async fn test_read_tail_keeps_last_bytes() {
        let data: &[u8] = b"0123456789";
        let tail = read_tail(data, 4).await;
        assert_eq!(tail, "[output truncated]\n6789");
        assert_eq!(read_tail(&b"ok"[..], 4).await, "ok");
    }

    #[tokio::test]
    async fn test_result_survives_small_history() {
        let dir = tempfile::tempdir().unwrap();
        let other = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::new(&StateLimits {
            command_history: 1,
            ..StateLimits::default()
        }));
        let executor = Arc::new(CommandExecutor::new(
            store.clone(),
            ExecutorConfig::default(),
            Arc::new(NullNotifier),
        ));

        let slow = submit(&store, "sleep 0.3; exit 3", dir.path());
        let slow_run = executor.execute(&slow).unwrap();
        let fast = submit(&store, "echo fast", other.path());
        executor.execute(&fast).unwrap().await.unwrap();
        slow_run.await.unwrap();

        let record = store.command(&slow).unwrap();
        assert_eq!(record.status, CommandStatus::Failed);
        assert_eq!(record.exit_code, Some(3));
        assert!(store
            .snapshot()
            .logs
            .iter()
            .any(|l| l.level == LogLevel::Error && l.message.contains("sleep 0.3; exit 3")));
    }

    #[tokio::test]
    async fn test_success_captures_output() {
        let dir = tempfile::tempdir().unwrap();
        let (store, executor) = setup(ExecutorConfig::default());
        let id = submit(&store, "echo hello; echo oops >&2", dir.path());

        let handle = executor.execute(&id).unwrap();
        assert_eq!(store.command(&id).unwrap().status, CommandStatus::Running);
        handle.await.unwrap();

        let record = store.command(&id).unwrap();
        assert_eq!(record.status, CommandStatus::Completed);
        assert_eq!(record.exit_code, Some(0));
        assert_eq!(record.stdout, "hello\n");
        assert_eq!(record.stderr, "oops\n");
        assert!(record.started_at.is_some() && record.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_failed_with_code() {
        let dir = tempfile::tempdir().unwrap();
        let (store, executor) = setup(ExecutorConfig::default());
        let id = submit(&store, "exit 42", dir.path());

        executor.execute(&id).unwrap().await.unwrap();

        let record = store.command(&id).unwrap();
        assert_eq!(record.status, CommandStatus::Failed);
        assert_eq!(record.exit_code, Some(42));
        assert!(store.snapshot().logs.iter().any(|l| l.level == LogLevel::Error));
    }

    #[tokio::test]
    async fn test_missing_directory_is_spawn_failure() {
        let dir = tempfile::tempdir().unwrap();
        let (store, executor) = setup(ExecutorConfig::default());
        let id = submit(&store, "ls", &dir.path().join("does-not-exist"));

        executor.execute(&id).unwrap().await.unwrap();

        let record = store.command(&id).unwrap();
        assert_eq!(record.status, CommandStatus::Failed);
        assert_eq!(record.exit_code, Some(127));
        assert!(record.error.unwrap().contains("does-not-exist"));
    }

    #[tokio::test]
    async fn test_cancel_running_command() {
        let dir = tempfile::tempdir().unwrap();
        let (store, executor) = setup(ExecutorConfig {
            cancel_grace_ms: 500,
            ..ExecutorConfig::default()
        });
        let id = submit(&store, "sleep 30", dir.path());

        let handle = executor.execute(&id).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        executor.cancel(&id).unwrap();
        handle.await.unwrap();

        let record = store.command(&id).unwrap();
        assert_eq!(record.status, CommandStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("cancelled by operator"));
        assert!(record.exit_code.unwrap() >= 128);

        assert_eq!(executor.cancel(&id).unwrap_err().code(), "invalid_state");
        assert_eq!(
            executor.cancel(&CommandId::from("cmd_missing")).unwrap_err().code(),
            "command_not_found"
        );
    }

    #[tokio::test]
    async fn test_same_directory_serialized_when_configured() {
        let dir = tempfile::tempdir().unwrap();
        let (store, executor) = setup(ExecutorConfig {
            allow_concurrent_in_same_directory: false,
            ..ExecutorConfig::default()
        });
        let first = submit(&store, "sleep 0.3", dir.path());
        let second = submit(&store, "true", dir.path());

        let h1 = executor.execute(&first).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let h2 = executor.execute(&second).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(store.command(&first).unwrap().status, CommandStatus::Running);
        assert_eq!(store.command(&second).unwrap().status, CommandStatus::Queued);

        h1.await.unwrap();
        h2.await.unwrap();
        let first = store.command(&first).unwrap();
        let second = store.command(&second).unwrap();
        assert!(second.started_at.unwrap() >= first.finished_at.unwrap());
    }

    #[tokio::test]
    async fn test_execute_rejects_non_queued() {
        let dir = tempfile::tempdir().unwrap();
        let (store, executor) = setup(ExecutorConfig::default());
        let id = submit(&store, "true", dir.path());
        executor.execute(&id).unwrap().await.unwrap();

        let err = executor.execute(&id).unwrap_err();
        assert_eq!(err.code(), "invalid_state");
    }
}
