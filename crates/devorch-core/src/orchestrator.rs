//! Orchestrator facade
//!
//! Wires the guardrails, approvals, executor, service manager, NLP
//! pre-processor, persistence and state store together and exposes the
//! submission API used by the gateway and tests.
//!
//! ```text
//! text ──► NLP (optional) ──► guardrails ──┬─ Blocked ────────► rejected record + ERROR log
//!                                          ├─ NeedsApproval ──► approval queue ──► executor
//!                                          └─ Allowed ────────► executor
//! ```

use crate::approval::ApprovalCoordinator;
use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};
use crate::executor::CommandExecutor;
use crate::guardrail::{
    expand_home, resolve_directory, GuardrailPolicy, PolicyHandle, PolicyWatcher, Verdict,
};
use crate::nlp::{tools, NlpContext, NlpOutcome, NlpPreprocessor, NlpProvider};
use crate::notify::{DesktopNotifier, NotificationSink, NullNotifier};
use crate::project::{DirectoryDetector, ProjectDetector};
use crate::service::ServiceManager;
use crate::state::{Delta, StateSnapshot, StateStore};
use crate::storage::{OrchestratorStore, PersistHandle, SharedStore};
use crate::types::{
    now, ApprovalId, CommandId, CommandRecord, CommandStatus, LogLevel, ProjectProfile,
    SavedCommand, Service, ServiceId, ServiceRequest,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

const SOURCE: &str = "orchestrator";

/// A command submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub text: String,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub use_nlp: bool,
    /// NLP provider to try first, overriding the configured primary
    #[serde(default)]
    pub provider: Option<String>,
}

impl SubmitRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            cwd: None,
            use_nlp: false,
            provider: None,
        }
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_nlp(mut self) -> Self {
        self.use_nlp = true;
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.use_nlp = true;
        self.provider = Some(provider.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    Executed,
    Rejected,
    PendingApproval,
}

/// Synchronous answer to a submission. Execution results arrive later as
/// `command` events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    pub status: SubmissionStatus,
    /// Command id, or the affected service id for tool calls
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_id: Option<ApprovalId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// The command text that went through the guardrails
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub translated_from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

impl Submission {
    fn for_command(status: SubmissionStatus, id: &CommandId, command: &str) -> Self {
        Self {
            status,
            id: id.to_string(),
            approval_id: None,
            reason: None,
            command: Some(command.to_string()),
            translated_from: None,
            tool: None,
            result: None,
        }
    }

    fn for_tool(name: &str, id: impl Into<String>, result: Option<serde_json::Value>) -> Self {
        Self {
            status: SubmissionStatus::Executed,
            id: id.into(),
            approval_id: None,
            reason: None,
            command: None,
            translated_from: None,
            tool: Some(name.to_string()),
            result,
        }
    }
}

#[derive(Debug)]
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    notifier: Option<Arc<dyn NotificationSink>>,
    detector: Option<Arc<dyn ProjectDetector>>,
    providers: Vec<Arc<dyn NlpProvider>>,
}

impl OrchestratorBuilder {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            config,
            notifier: None,
            detector: None,
            providers: Vec::new(),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_detector(mut self, detector: Arc<dyn ProjectDetector>) -> Self {
        self.detector = Some(detector);
        self
    }

    pub fn with_nlp_provider(mut self, provider: Arc<dyn NlpProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    /// Open storage, restore history and services, start background tasks
    pub async fn start(self) -> Result<Arc<Orchestrator>> {
        let config = self.config;
        config.validate()?;

        let database = match &config.storage.database_path {
            Some(path) => OrchestratorStore::open(path)?,
            None => OrchestratorStore::open_in_memory()?,
        }
        .into_shared();
        let (persist, persist_task) = PersistHandle::spawn(database.clone());

        let store = Arc::new(StateStore::new(&config.state).with_persistence(persist.clone()));
        let history = database.lock().recent_commands(config.state.command_history)?;
        tracing::info!("Restored {} commands from history", history.len());
        store.seed_history(history);
        let saved = database.lock().saved_commands()?;
        store.set_saved_commands(saved);

        let notifier: Arc<dyn NotificationSink> = match self.notifier {
            Some(notifier) => notifier,
            None if config.notifications.enabled => Arc::new(
                DesktopNotifier::new(config.notifications.app_name.clone())
                    .with_timeout(Duration::from_millis(config.notifications.timeout_ms)),
            ),
            None => Arc::new(NullNotifier),
        };
        let detector: Arc<dyn ProjectDetector> = match self.detector {
            Some(detector) => detector,
            None => Arc::new(DirectoryDetector),
        };

        let policy = PolicyHandle::new(GuardrailPolicy::from_config(&config.guardrails)?);
        let watcher = match (&config.guardrails.policy_file, config.guardrails.watch) {
            (Some(path), true) => match policy.watch(path.clone(), config.guardrails.clone()) {
                Ok(watcher) => Some(watcher),
                Err(err) => {
                    tracing::warn!(%err, "policy hot-reload disabled");
                    None
                }
            },
            _ => None,
        };

        let executor = Arc::new(CommandExecutor::new(
            store.clone(),
            config.executor.clone(),
            notifier.clone(),
        ));
        let approvals = Arc::new(ApprovalCoordinator::new(
            store.clone(),
            executor.clone(),
            notifier.clone(),
            config.approvals.clone(),
        ));
        let services = Arc::new(ServiceManager::new(
            store.clone(),
            config.services.clone(),
            config.executor.shell.clone(),
            notifier,
        ));

        let persisted = database.lock().services()?;
        let adopted = services.adopt(persisted.clone()).await;
        for gone in persisted.iter().filter(|s| !adopted.iter().any(|a| a.id == s.id)) {
            if let Err(err) = database.lock().delete_service(&gone.id) {
                tracing::warn!("could not forget service {}: {:#}", gone.id, err);
            }
        }

        let mut nlp = NlpPreprocessor::new(&config.nlp);
        for provider in self.providers {
            nlp = nlp.with_provider(provider);
        }

        let mut tasks = vec![services.spawn_reconciler()];
        tasks.extend(approvals.spawn_expiry_sweep());

        tracing::info!(
            "Orchestrator started: {} guardrail rules, {} allowed directories",
            policy.current().rule_count(),
            policy.current().allowed_directories().len()
        );

        Ok(Arc::new(Orchestrator {
            config,
            store,
            policy,
            executor,
            approvals,
            services,
            nlp,
            detector,
            database,
            persist,
            persist_task: parking_lot::Mutex::new(Some(persist_task)),
            tasks: parking_lot::Mutex::new(tasks),
            watcher: parking_lot::Mutex::new(watcher),
        }))
    }
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    store: Arc<StateStore>,
    policy: PolicyHandle,
    executor: Arc<CommandExecutor>,
    approvals: Arc<ApprovalCoordinator>,
    services: Arc<ServiceManager>,
    nlp: NlpPreprocessor,
    detector: Arc<dyn ProjectDetector>,
    database: SharedStore,
    persist: PersistHandle,
    persist_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    watcher: parking_lot::Mutex<Option<PolicyWatcher>>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("store", &self.store)
            .field("executor", &self.executor)
            .field("nlp", &self.nlp)
            .finish()
    }
}

fn arg_string(args: &HashMap<String, serde_json::Value>, key: &str) -> Option<String> {
    match args.get(key)? {
        serde_json::Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl Orchestrator {
    pub fn builder(config: OrchestratorConfig) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config)
    }

    pub async fn start(config: OrchestratorConfig) -> Result<Arc<Self>> {
        Self::builder(config).start().await
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn nlp(&self) -> &NlpPreprocessor {
        &self.nlp
    }

    pub fn policy(&self) -> &PolicyHandle {
        &self.policy
    }

    /// Classify without submitting
    pub fn check_command(&self, text: &str, cwd: Option<&Path>) -> Result<Verdict> {
        let cwd = self.resolve_cwd(cwd)?;
        Ok(self.policy.current().evaluate(text, &cwd))
    }

    /// Working directory for a request: explicit, else the active project,
    /// else the configured default, else the process cwd. Relative paths are
    /// kept relative so the guardrails refuse them.
    fn resolve_cwd(&self, requested: Option<&Path>) -> Result<PathBuf> {
        let chosen = match requested {
            Some(path) => expand_home(&path.to_string_lossy()),
            None => match self.store.current_project() {
                Some(project) => project.path,
                None => match &self.config.default_working_directory {
                    Some(dir) => expand_home(&dir.to_string_lossy()),
                    None => std::env::current_dir()?,
                },
            },
        };
        if chosen.is_absolute() {
            Ok(resolve_directory(&chosen))
        } else {
            Ok(chosen)
        }
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    pub async fn run_command(&self, request: SubmitRequest) -> Result<Submission> {
        let text = request.text.trim();
        if text.is_empty() {
            return Err(OrchestratorError::InvalidRequest(
                "command text is empty".to_string(),
            ));
        }
        let cwd = self.resolve_cwd(request.cwd.as_deref())?;

        if request.use_nlp && self.config.nlp.enabled {
            let ctx = NlpContext {
                cwd: cwd.clone(),
                project: self.store.current_project(),
            };
            let translation = self
                .nlp
                .translate(text, request.provider.as_deref(), &ctx)
                .await;
            for failure in &translation.failures {
                self.store.log(LogLevel::Warn, failure.to_string(), "nlp");
            }
            match translation.outcome {
                Some(NlpOutcome::Tool { name, args, source, .. }) => {
                    self.store.log(
                        LogLevel::Info,
                        format!("Interpreted '{}' as {} ({})", text, name, source),
                        "nlp",
                    );
                    return self.dispatch_tool(&name, &args, &cwd).await;
                }
                Some(NlpOutcome::Command { command, source, .. }) => {
                    self.store.log(
                        LogLevel::Info,
                        format!("Translated '{}' -> '{}' ({})", text, command, source),
                        "nlp",
                    );
                    let mut submission = self.submit(&command, cwd, &source)?;
                    submission.translated_from = Some(text.to_string());
                    return Ok(submission);
                }
                None => {}
            }
        }

        self.submit(text, cwd, "literal")
    }

    /// Classify and route one concrete command
    fn submit(&self, text: &str, cwd: PathBuf, origin: &str) -> Result<Submission> {
        let mut record = CommandRecord::new(text, &cwd).with_origin(origin);
        let id = record.id.clone();

        match self.policy.current().evaluate(text, &cwd) {
            Verdict::Blocked { reason } => {
                record.status = CommandStatus::Rejected;
                record.reason = Some(reason.clone());
                record.finished_at = Some(now());
                self.store.insert_command(record);
                self.store.log(
                    LogLevel::Error,
                    format!("Blocked: {} in {} ({})", text, cwd.display(), reason),
                    SOURCE,
                );
                let mut submission = Submission::for_command(SubmissionStatus::Rejected, &id, text);
                submission.reason = Some(reason);
                Ok(submission)
            }
            Verdict::NeedsApproval { reason } => {
                self.store.insert_command(record);
                let approval = self.approvals.request(&id, reason.clone())?;
                let mut submission =
                    Submission::for_command(SubmissionStatus::PendingApproval, &id, text);
                submission.approval_id = Some(approval.id);
                submission.reason = Some(reason);
                Ok(submission)
            }
            Verdict::Allowed => {
                self.store.insert_command(record);
                self.executor.execute(&id)?;
                Ok(Submission::for_command(SubmissionStatus::Executed, &id, text))
            }
        }
    }

    async fn dispatch_tool(
        &self,
        name: &str,
        args: &HashMap<String, serde_json::Value>,
        cwd: &Path,
    ) -> Result<Submission> {
        let missing = |key: &str| {
            OrchestratorError::InvalidRequest(format!("{} needs a '{}' argument", name, key))
        };

        match name {
            tools::START_SERVICE => {
                let service_name = arg_string(args, "name").ok_or_else(|| missing("name"))?;
                let command = arg_string(args, "command").ok_or_else(|| missing("command"))?;
                let mut request = ServiceRequest::new(service_name, command);
                request.cwd = Some(
                    arg_string(args, "cwd")
                        .map(PathBuf::from)
                        .unwrap_or_else(|| cwd.to_path_buf()),
                );
                request.port = arg_string(args, "port").and_then(|p| p.parse().ok());
                let service = self.start_service(request).await?;
                Ok(Submission::for_tool(
                    name,
                    service.id.to_string(),
                    serde_json::to_value(&service).ok(),
                ))
            }
            tools::STOP_SERVICE => {
                let key = arg_string(args, "service_id")
                    .or_else(|| arg_string(args, "name"))
                    .ok_or_else(|| missing("service_id"))?;
                let id = self
                    .store
                    .services()
                    .into_iter()
                    .find(|s| s.id.as_str() == key || s.name == key)
                    .map(|s| s.id)
                    .unwrap_or_else(|| ServiceId::from(key));
                let stopped = self.stop_service(&id).await?;
                Ok(Submission::for_tool(
                    name,
                    stopped.id.to_string(),
                    serde_json::to_value(&stopped).ok(),
                ))
            }
            tools::LIST_SERVICES => Ok(Submission::for_tool(
                name,
                String::new(),
                serde_json::to_value(self.list_services()).ok(),
            )),
            tools::GET_STATUS => Ok(Submission::for_tool(
                name,
                String::new(),
                serde_json::to_value(self.get_status()).ok(),
            )),
            tools::SET_PROJECT => {
                let path = arg_string(args, "path").ok_or_else(|| missing("path"))?;
                let path = expand_home(&path);
                let path = if path.is_absolute() { path } else { cwd.join(path) };
                let profile = self.set_project(&path)?;
                Ok(Submission::for_tool(
                    name,
                    profile.name.clone(),
                    serde_json::to_value(&profile).ok(),
                ))
            }
            other => Err(OrchestratorError::InvalidRequest(format!(
                "unknown tool '{}'",
                other
            ))),
        }
    }

    pub fn approve_command(&self, id: &ApprovalId) -> Result<CommandId> {
        self.approvals.approve(id)
    }

    pub fn reject_command(&self, id: &ApprovalId) -> Result<CommandId> {
        self.approvals.reject(id)
    }

    /// Cancel a command. A command still waiting for approval is rejected;
    /// a running one gets the TERM/KILL ladder.
    pub fn cancel_command(&self, id: &CommandId) -> Result<()> {
        let pending = self
            .store
            .pending_approvals()
            .into_iter()
            .find(|a| &a.command_id == id);
        match pending {
            Some(approval) => self.approvals.reject(&approval.id).map(|_| ()),
            None => self.executor.cancel(id),
        }
    }

    pub fn command(&self, id: &CommandId) -> Option<CommandRecord> {
        self.store.command(id)
    }

    // ------------------------------------------------------------------
    // Services
    // ------------------------------------------------------------------

    /// Start a service after the same guardrail check commands get. Services
    /// are never queued for approval: a guarded command is refused with
    /// [`OrchestratorError::ApprovalRequired`].
    pub async fn start_service(&self, request: ServiceRequest) -> Result<Service> {
        let cwd = self.resolve_cwd(request.cwd.as_deref())?;
        match self.policy.current().evaluate(&request.command, &cwd) {
            Verdict::Blocked { reason } => {
                self.store.log(
                    LogLevel::Error,
                    format!("Blocked service '{}': {} ({})", request.name, request.command, reason),
                    SOURCE,
                );
                Err(OrchestratorError::PolicyViolation(reason))
            }
            Verdict::NeedsApproval { reason } => {
                self.store.log(
                    LogLevel::Warn,
                    format!(
                        "Service '{}' needs approval, run it as a command instead: {} ({})",
                        request.name, request.command, reason
                    ),
                    SOURCE,
                );
                Err(OrchestratorError::ApprovalRequired(reason))
            }
            Verdict::Allowed => {
                self.services
                    .start_service(&request.name, &request.command, cwd, request.port)
                    .await
            }
        }
    }

    pub async fn stop_service(&self, id: &ServiceId) -> Result<Service> {
        self.services.stop_service(id).await
    }

    pub fn list_services(&self) -> Vec<Service> {
        self.store.services()
    }

    pub fn get_status(&self) -> StateSnapshot {
        self.store.snapshot()
    }

    pub fn subscribe(&self) -> (StateSnapshot, broadcast::Receiver<Delta>) {
        self.store.subscribe_with_snapshot()
    }

    // ------------------------------------------------------------------
    // Project, logs, saved commands
    // ------------------------------------------------------------------

    pub fn set_project(&self, path: &Path) -> Result<ProjectProfile> {
        let profile = self.detector.detect(path)?;
        let branch = profile
            .git_branch
            .as_deref()
            .map(|b| format!(" on {}", b))
            .unwrap_or_default();
        self.store.set_project(profile.clone());
        self.store.log(
            LogLevel::Info,
            format!("Switched to project {}{}", profile.name, branch),
            SOURCE,
        );
        Ok(profile)
    }

    pub fn clear_logs(&self) {
        self.store.clear_logs();
    }

    fn refresh_saved_commands(&self) -> Result<()> {
        let saved = self.database.lock().saved_commands()?;
        self.store.set_saved_commands(saved);
        Ok(())
    }

    pub fn save_command(&self, saved: SavedCommand) -> Result<SavedCommand> {
        if saved.name.trim().is_empty() || saved.command.trim().is_empty() {
            return Err(OrchestratorError::InvalidRequest(
                "saved command needs a name and a command".to_string(),
            ));
        }
        self.database.lock().insert_saved_command(&saved)?;
        self.refresh_saved_commands()?;
        tracing::info!("Saved command '{}': {}", saved.name, saved.command);
        Ok(saved)
    }

    pub fn delete_saved_command(&self, id: &str) -> Result<()> {
        if !self.database.lock().delete_saved_command(id)? {
            return Err(OrchestratorError::SavedCommandNotFound(id.to_string()));
        }
        self.refresh_saved_commands()
    }

    /// Submit a saved command through the normal guardrail path
    pub fn run_saved_command(&self, id: &str) -> Result<Submission> {
        let saved = self
            .database
            .lock()
            .saved_command(id)?
            .ok_or_else(|| OrchestratorError::SavedCommandNotFound(id.to_string()))?;
        self.database.lock().touch_saved_command(id, &now())?;
        self.refresh_saved_commands()?;

        let cwd = self.resolve_cwd(saved.working_directory.as_deref())?;
        self.submit(&saved.command, cwd, &format!("saved:{}", saved.name))
    }

    /// Stop background tasks and services, flush pending writes
    pub async fn shutdown(&self) {
        tracing::info!("Orchestrator shutting down");
        self.watcher.lock().take();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.services.stop_all().await;
        self.persist.flush().await;
        if let Some(task) = self.persist_task.lock().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nlp::NlpOutcome;
    use async_trait::async_trait;

    struct Fixture {
        orchestrator: Arc<Orchestrator>,
        dir: tempfile::TempDir,
    }

    impl Fixture {
        fn cwd(&self) -> PathBuf {
            self.dir.path().to_path_buf()
        }
    }

    async fn fixture_with(builder: impl FnOnce(OrchestratorBuilder) -> OrchestratorBuilder) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let config = OrchestratorConfig::default()
            .with_allowed_directories(vec![dir.path().to_string_lossy().into_owned()]);
        let orchestrator = builder(Orchestrator::builder(config)).start().await.unwrap();
        Fixture { orchestrator, dir }
    }

    async fn fixture() -> Fixture {
        fixture_with(|b| b).await
    }

    async fn wait_finished(o: &Orchestrator, id: &str) -> CommandRecord {
        let id = CommandId::from(id);
        for _ in 0..200 {
            if let Some(record) = o.command(&id) {
                if record.is_finished() {
                    return record;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("command {} did not finish", id);
    }

    #[tokio::test]
    async fn test_allowed_command_runs() {
        let f = fixture().await;
        let submission = f
            .orchestrator
            .run_command(SubmitRequest::new("echo hello").with_cwd(f.cwd()))
            .await
            .unwrap();
        assert_eq!(submission.status, SubmissionStatus::Executed);

        let record = wait_finished(&f.orchestrator, &submission.id).await;
        assert_eq!(record.status, CommandStatus::Completed);
        assert_eq!(record.exit_code, Some(0));
        assert_eq!(record.stdout.trim(), "hello");
        assert_eq!(record.origin, "literal");
    }

    #[tokio::test]
    async fn test_empty_text_is_invalid() {
        let f = fixture().await;
        let err = f
            .orchestrator
            .run_command(SubmitRequest::new("   "))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_request");
    }

    #[tokio::test]
    async fn test_relative_cwd_is_blocked() {
        let f = fixture().await;
        let submission = f
            .orchestrator
            .run_command(SubmitRequest::new("ls").with_cwd("some/relative/dir"))
            .await
            .unwrap();
        assert_eq!(submission.status, SubmissionStatus::Rejected);
    }

    #[tokio::test]
    async fn test_template_translation_is_recorded() {
        let f = fixture().await;
        let submission = f
            .orchestrator
            .run_command(SubmitRequest::new("show date").with_cwd(f.cwd()).with_nlp())
            .await
            .unwrap();
        assert_eq!(submission.command.as_deref(), Some("date"));
        assert_eq!(submission.translated_from.as_deref(), Some("show date"));
        let record = f.orchestrator.command(&CommandId::from(submission.id.as_str())).unwrap();
        assert_eq!(record.origin, "template");
    }

    #[derive(Debug)]
    struct Down;

    #[async_trait]
    impl NlpProvider for Down {
        fn name(&self) -> &str {
            "down"
        }

        async fn translate(&self, _text: &str, _ctx: &NlpContext) -> Result<Option<NlpOutcome>> {
            Err(OrchestratorError::InvalidRequest("connection refused".to_string()))
        }
    }

    #[tokio::test]
    async fn test_failed_provider_falls_back_to_literal_with_warning() {
        let f = fixture_with(|b| b.with_nlp_provider(Arc::new(Down))).await;
        let submission = f
            .orchestrator
            .run_command(
                SubmitRequest::new("where am i")
                    .with_cwd(f.cwd())
                    .with_provider("down"),
            )
            .await
            .unwrap();
        assert_eq!(submission.command.as_deref(), Some("where am i"));
        assert!(submission.translated_from.is_none());
        let logs = f.orchestrator.get_status().logs;
        assert!(logs
            .iter()
            .any(|l| l.level == LogLevel::Warn && l.message.contains("down")));
    }

    #[tokio::test]
    async fn test_cancel_pending_command_rejects_approval() {
        let f = fixture().await;
        let submission = f
            .orchestrator
            .run_command(SubmitRequest::new("git reset --hard").with_cwd(f.cwd()))
            .await
            .unwrap();
        assert_eq!(submission.status, SubmissionStatus::PendingApproval);

        let id = CommandId::from(submission.id.as_str());
        f.orchestrator.cancel_command(&id).unwrap();
        assert_eq!(f.orchestrator.command(&id).unwrap().status, CommandStatus::Rejected);
        assert!(f.orchestrator.get_status().pending_approvals.is_empty());
    }

    #[tokio::test]
    async fn test_guarded_service_is_refused() {
        let f = fixture().await;
        let err = f
            .orchestrator
            .start_service(ServiceRequest::new("cleanup", "sudo rm -rf /").with_cwd(f.cwd()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "policy_violation");

        let err = f
            .orchestrator
            .start_service(ServiceRequest::new("killer", "killall node").with_cwd(f.cwd()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "approval_required");
        assert!(f.orchestrator.list_services().is_empty());
    }

    #[tokio::test]
    async fn test_tool_outcome_starts_and_stops_service() {
        let f = fixture().await;
        let submission = f
            .orchestrator
            .run_command(
                SubmitRequest::new("start service sleeper with sleep 30")
                    .with_cwd(f.cwd())
                    .with_nlp(),
            )
            .await
            .unwrap();
        assert_eq!(submission.tool.as_deref(), Some(tools::START_SERVICE));
        assert_eq!(f.orchestrator.list_services().len(), 1);

        f.orchestrator
            .run_command(SubmitRequest::new("stop service sleeper").with_nlp())
            .await
            .unwrap();
        assert!(f.orchestrator.list_services().is_empty());
    }

    #[tokio::test]
    async fn test_saved_commands() {
        let f = fixture().await;
        let saved = f
            .orchestrator
            .save_command(SavedCommand::new("greet", "echo hi").with_working_directory(f.cwd()))
            .unwrap();
        assert_eq!(f.orchestrator.get_status().saved_commands.len(), 1);

        let submission = f.orchestrator.run_saved_command(&saved.id).unwrap();
        assert_eq!(submission.status, SubmissionStatus::Executed);
        let record = wait_finished(&f.orchestrator, &submission.id).await;
        assert_eq!(record.origin, "saved:greet");
        assert!(f.orchestrator.get_status().saved_commands[0].last_used.is_some());

        f.orchestrator.delete_saved_command(&saved.id).unwrap();
        assert_eq!(
            f.orchestrator.delete_saved_command(&saved.id).unwrap_err().code(),
            "saved_command_not_found"
        );
    }

    #[tokio::test]
    async fn test_project_becomes_default_cwd() {
        let f = fixture().await;
        let project = f.dir.path().join("api");
        std::fs::create_dir(&project).unwrap();
        let profile = f.orchestrator.set_project(&project).unwrap();
        assert_eq!(profile.name, "api");

        let submission = f
            .orchestrator
            .run_command(SubmitRequest::new("pwd"))
            .await
            .unwrap();
        let record = wait_finished(&f.orchestrator, &submission.id).await;
        assert_eq!(record.working_directory, profile.path);
    }

    #[tokio::test]
    async fn test_shutdown_stops_services() {
        let f = fixture().await;
        f.orchestrator
            .start_service(ServiceRequest::new("idle", "sleep 30").with_cwd(f.cwd()))
            .await
            .unwrap();
        f.orchestrator.shutdown().await;
        assert!(f.orchestrator.list_services().is_empty());
    }
}
