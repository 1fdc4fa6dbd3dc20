//! Service lifecycle manager
//!
//! Starts long-running background processes (dev servers, watchers),
//! tracks pid, port and status, stops them with the TERM/KILL ladder and
//! notices when one dies on its own.
//!
//! Processes stay in the orchestrator's process group and are spawned with
//! `kill_on_drop`, so they outlive client reconnects but not the core.

use crate::config::ServiceConfig;
use crate::error::{OrchestratorError, Result};
use crate::notify::{dispatch, Notification, NotificationKind, NotificationSink};
use crate::process;
use crate::state::StateStore;
use crate::types::{now, LogLevel, Service, ServiceId, ServiceStatus};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

const SOURCE: &str = "services";

/// How a tracked service is held
#[derive(Debug)]
enum Tracked {
    /// Spawned by this process; reaped through the handle
    Owned(Child),
    /// Re-adopted after a restart; only the pid is known
    Adopted(u32),
}

#[derive(Debug)]
pub struct ServiceManager {
    store: Arc<StateStore>,
    config: ServiceConfig,
    shell: String,
    notifier: Arc<dyn NotificationSink>,
    processes: Mutex<HashMap<ServiceId, Tracked>>,
}

fn forward_lines<R>(store: Arc<StateStore>, reader: R, source: String, level: LogLevel)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => store.log(level, line, source.clone()),
                Ok(None) => break,
                Err(err) => {
                    tracing::debug!(%err, %source, "service output closed");
                    break;
                }
            }
        }
    });
}

impl ServiceManager {
    pub fn new(
        store: Arc<StateStore>,
        config: ServiceConfig,
        shell: impl Into<String>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            store,
            config,
            shell: shell.into(),
            notifier,
            processes: Mutex::new(HashMap::new()),
        }
    }

    /// Spawn a service. The caller has already run the guardrail check.
    pub async fn start_service(
        &self,
        name: &str,
        command: &str,
        working_directory: PathBuf,
        port: Option<u16>,
    ) -> Result<Service> {
        if name.trim().is_empty() || command.trim().is_empty() {
            return Err(OrchestratorError::InvalidRequest(
                "service name and command are required".to_string(),
            ));
        }

        let service = Service {
            id: ServiceId::new(),
            name: name.to_string(),
            command: command.to_string(),
            working_directory,
            port,
            pid: None,
            started_at: now(),
            status: ServiceStatus::Starting,
        };
        if let Err(err) = self.store.reserve_service(service.clone()) {
            self.store.log(
                LogLevel::Error,
                format!("Cannot start service '{}': {}", name, err),
                SOURCE,
            );
            return Err(err);
        }

        let spawned = Command::new(&self.shell)
            .arg("-c")
            .arg(command)
            .current_dir(&service.working_directory)
            .stdin(Stdio::null())
            .stdout(if self.config.capture_output { Stdio::piped() } else { Stdio::null() })
            .stderr(if self.config.capture_output { Stdio::piped() } else { Stdio::null() })
            .kill_on_drop(true)
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(source) => {
                let err = OrchestratorError::SpawnFailure {
                    command: command.to_string(),
                    source,
                };
                self.store.remove_service(
                    &service.id,
                    ServiceStatus::Stopped,
                    Some(process::EXIT_CANNOT_EXECUTE),
                    Some(err.to_string()),
                );
                self.store.log(
                    LogLevel::Error,
                    format!("Failed to start service '{}': {}", name, err),
                    SOURCE,
                );
                return Err(err);
            }
        };

        let pid = child.id().unwrap_or_default();
        let log_source = format!("service:{}", name);
        if let Some(stdout) = child.stdout.take() {
            forward_lines(self.store.clone(), stdout, log_source.clone(), LogLevel::Info);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(self.store.clone(), stderr, log_source, LogLevel::Warn);
        }

        let running = {
            let mut processes = self.processes.lock().await;
            let running = self.store.mark_service_running(&service.id, pid)?;
            processes.insert(service.id.clone(), Tracked::Owned(child));
            running
        };

        let port_note = port.map(|p| format!(", port {}", p)).unwrap_or_default();
        self.store.log(
            LogLevel::Info,
            format!("Started service '{}' (pid {}{})", name, pid, port_note),
            SOURCE,
        );
        dispatch(
            &self.notifier,
            Notification::new(
                NotificationKind::ServiceStarted,
                format!("Service {} started", name),
                command.to_string(),
            ),
        );
        Ok(running)
    }

    /// Stop a service: stopping, SIGTERM, bounded wait, SIGKILL, removed.
    pub async fn stop_service(&self, id: &ServiceId) -> Result<Service> {
        let tracked = self.processes.lock().await.remove(id);
        let tracked = tracked.ok_or_else(|| OrchestratorError::ServiceNotFound(id.clone()))?;

        let stopping = self.store.set_service_status(id, ServiceStatus::Stopping)?;
        let grace = Duration::from_secs(self.config.stop_timeout_secs);

        let exit_code = match tracked {
            Tracked::Owned(mut child) => match process::terminate_child(&mut child, grace).await {
                Ok(status) => Some(process::exit_code(&status)),
                Err(err) => {
                    tracing::warn!(%err, "error while stopping {}", stopping.name);
                    None
                }
            },
            Tracked::Adopted(pid) => {
                if !process::terminate_pid(pid, grace).await {
                    tracing::warn!(pid, "adopted process survived SIGKILL");
                }
                None
            }
        };

        let stopped = self
            .store
            .remove_service(id, ServiceStatus::Stopped, exit_code, None)
            .ok_or_else(|| OrchestratorError::ServiceNotFound(id.clone()))?;
        self.store.log(
            LogLevel::Info,
            format!("Stopped service '{}'", stopped.name),
            SOURCE,
        );
        dispatch(
            &self.notifier,
            Notification::new(
                NotificationKind::ServiceStopped,
                format!("Service {} stopped", stopped.name),
                stopped.command.clone(),
            ),
        );
        Ok(stopped)
    }

    /// Stop everything, used on shutdown
    pub async fn stop_all(&self) {
        let ids: Vec<ServiceId> = self.processes.lock().await.keys().cloned().collect();
        for id in ids {
            if let Err(err) = self.stop_service(&id).await {
                tracing::warn!(%err, "failed to stop {} during shutdown", id);
            }
        }
    }

    /// Detect tracked processes that exited without a stop request and mark
    /// them crashed. Returns the crashed ids.
    pub async fn reconcile(&self) -> Vec<ServiceId> {
        let mut exited: Vec<(ServiceId, Option<i32>)> = Vec::new();
        {
            let mut processes = self.processes.lock().await;
            for (id, tracked) in processes.iter_mut() {
                match tracked {
                    Tracked::Owned(child) => match child.try_wait() {
                        Ok(Some(status)) => exited.push((id.clone(), Some(process::exit_code(&status)))),
                        Ok(None) => {}
                        Err(err) => {
                            tracing::warn!(%err, "cannot poll service {}", id);
                            exited.push((id.clone(), None));
                        }
                    },
                    Tracked::Adopted(pid) => {
                        if !process::is_alive(*pid) {
                            exited.push((id.clone(), None));
                        }
                    }
                }
            }
            for (id, _) in &exited {
                processes.remove(id);
            }
        }

        let mut crashed = Vec::with_capacity(exited.len());
        for (id, exit_code) in exited {
            let code_note = exit_code
                .map(|c| format!("exit code {}", c))
                .unwrap_or_else(|| "exit code unknown".to_string());
            let reason = format!("process exited unexpectedly ({})", code_note);
            let Some(service) =
                self.store
                    .remove_service(&id, ServiceStatus::Crashed, exit_code, Some(reason))
            else {
                continue;
            };
            self.store.log(
                LogLevel::Error,
                format!("Service '{}' crashed ({})", service.name, code_note),
                SOURCE,
            );
            dispatch(
                &self.notifier,
                Notification::new(
                    NotificationKind::ServiceCrashed,
                    format!("Service {} crashed", service.name),
                    code_note,
                ),
            );
            crashed.push(id);
        }
        crashed
    }

    pub fn spawn_reconciler(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = self.clone();
        let period = Duration::from_millis(self.config.reconcile_interval_ms.max(10));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                manager.reconcile().await;
            }
        })
    }

    /// Take back services persisted by a previous run. Live pids are
    /// tracked again as running; dead ones are dropped with a warning.
    pub async fn adopt(&self, services: Vec<Service>) -> Vec<Service> {
        let mut adopted = Vec::new();
        let mut processes = self.processes.lock().await;
        for mut service in services {
            match service.pid.filter(|pid| process::is_alive(*pid)) {
                Some(pid) => {
                    service.status = ServiceStatus::Running;
                    processes.insert(service.id.clone(), Tracked::Adopted(pid));
                    self.store.restore_service(service.clone());
                    self.store.log(
                        LogLevel::Info,
                        format!("Re-adopted service '{}' (pid {})", service.name, pid),
                        SOURCE,
                    );
                    adopted.push(service);
                }
                None => {
                    self.store.log(
                        LogLevel::Warn,
                        format!("Service '{}' did not survive the restart", service.name),
                        SOURCE,
                    );
                }
            }
        }
        adopted
    }

    pub async fn tracked_count(&self) -> usize {
        self.processes.lock().await.len()
    }
}
