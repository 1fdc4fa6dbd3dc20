//! Error types for devorch core
//!
//! Every fallible operation of the orchestrator returns [`OrchestratorError`].
//! Policy and validation errors are returned synchronously to the caller;
//! execution-time outcomes (non-zero exits, crashes) are recorded in the
//! state store instead and never surface as `Err`.

use crate::types::{ApprovalId, CommandId, ServiceId};
use thiserror::Error;

/// Result type alias for orchestrator operations
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Main error type for orchestrator operations
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// The guardrail policy refused the command outright
    #[error("Blocked by guardrail policy: {0}")]
    PolicyViolation(String),

    /// The command is guarded and needs a human decision first
    #[error("Approval required: {0}")]
    ApprovalRequired(String),

    /// Unknown or already resolved approval
    #[error("Approval conflict for {id}: {reason}")]
    ApprovalConflict { id: ApprovalId, reason: String },

    /// A process ran and exited unsuccessfully
    #[error("Command exited with code {exit_code}")]
    ExecutionFailure { exit_code: i32 },

    /// The process could not be spawned at all
    #[error("Failed to spawn '{command}': {source}")]
    SpawnFailure {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Service not found: {0}")]
    ServiceNotFound(ServiceId),

    #[error("Command not found: {0}")]
    CommandNotFound(CommandId),

    #[error("Saved command not found: {0}")]
    SavedCommandNotFound(String),

    /// Port already owned by a starting or running service
    #[error("Port {port} is already in use by service '{owner}'")]
    PortConflict { port: u16, owner: String },

    /// Operation not valid for the current state of a record
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Malformed request (empty command text, bad arguments)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Observer disconnected: {0}")]
    ObserverDisconnected(String),

    /// An NLP provider failed or timed out; the next one is tried
    #[error("Provider '{provider}' unavailable: {reason}")]
    ProviderUnavailable { provider: String, reason: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic error with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        source: Box<OrchestratorError>,
    },
}

impl OrchestratorError {
    /// Add context to an error
    pub fn context(self, context: impl Into<String>) -> Self {
        Self::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, skipping any context wrappers
    pub fn root(&self) -> &OrchestratorError {
        match self {
            Self::WithContext { source, .. } => source.root(),
            other => other,
        }
    }

    /// Short machine-readable code, used on the wire
    pub fn code(&self) -> &'static str {
        match self.root() {
            Self::PolicyViolation(_) => "policy_violation",
            Self::ApprovalRequired(_) => "approval_required",
            Self::ApprovalConflict { .. } => "approval_conflict",
            Self::ExecutionFailure { .. } => "execution_failure",
            Self::SpawnFailure { .. } => "spawn_failure",
            Self::ServiceNotFound(_) => "service_not_found",
            Self::CommandNotFound(_) => "command_not_found",
            Self::SavedCommandNotFound(_) => "saved_command_not_found",
            Self::PortConflict { .. } => "port_conflict",
            Self::InvalidState(_) => "invalid_state",
            Self::InvalidRequest(_) => "invalid_request",
            Self::ObserverDisconnected(_) => "observer_disconnected",
            Self::ProviderUnavailable { .. } => "provider_unavailable",
            Self::InvalidConfig(_) => "invalid_config",
            Self::Storage(_) => "storage",
            Self::Io(_) => "io",
            Self::Serialization(_) => "serialization",
            Self::WithContext { .. } => "internal",
        }
    }
}

impl From<rusqlite::Error> for OrchestratorError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<anyhow::Error> for OrchestratorError {
    fn from(err: anyhow::Error) -> Self {
        Self::Storage(format!("{:#}", err))
    }
}

impl From<toml::de::Error> for OrchestratorError {
    fn from(err: toml::de::Error) -> Self {
        Self::InvalidConfig(err.to_string())
    }
}

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to a Result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add lazy context to a Result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.context(f()))
    }
}
