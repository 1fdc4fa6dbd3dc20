//! Core types for devorch
//!
//! Records shared by every component: command records, pending approvals,
//! services, log entries, saved commands and the project profile. All of
//! them are plain data; only the state store mutates them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

/// Timestamp type alias
pub type Timestamp = DateTime<Utc>;

/// Create a timestamp for the current moment
pub fn now() -> Timestamp {
    Utc::now()
}

macro_rules! prefixed_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Generate a fresh random id
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::new_v4().simple()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

prefixed_id!(
    /// Identifier of a submitted command
    CommandId,
    "cmd"
);
prefixed_id!(
    /// Identifier of a pending approval
    ApprovalId,
    "apr"
);
prefixed_id!(
    /// Identifier of a managed service
    ServiceId,
    "svc"
);

/// Lifecycle of a submitted command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Rejected,
}

impl CommandStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CommandStatus::Completed | CommandStatus::Failed | CommandStatus::Rejected
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CommandStatus::Queued => "queued",
            CommandStatus::Running => "running",
            CommandStatus::Completed => "completed",
            CommandStatus::Failed => "failed",
            CommandStatus::Rejected => "rejected",
        }
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(CommandStatus::Queued),
            "running" => Ok(CommandStatus::Running),
            "completed" => Ok(CommandStatus::Completed),
            "failed" => Ok(CommandStatus::Failed),
            "rejected" => Ok(CommandStatus::Rejected),
            other => Err(format!("unknown command status: {}", other)),
        }
    }
}

/// One submitted command and everything known about its execution.
///
/// Immutable once `finished_at` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRecord {
    pub id: CommandId,
    pub text: String,
    pub working_directory: PathBuf,
    pub status: CommandStatus,
    #[serde(default)]
    pub exit_code: Option<i32>,
    pub submitted_at: Timestamp,
    #[serde(default)]
    pub started_at: Option<Timestamp>,
    #[serde(default)]
    pub finished_at: Option<Timestamp>,
    /// `literal`, or the name of the NLP provider that produced the text
    pub origin: String,
    /// Policy or rejection reason
    #[serde(default)]
    pub reason: Option<String>,
    /// Spawn or cancellation diagnostics
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
}

impl CommandRecord {
    pub fn new(text: impl Into<String>, working_directory: impl Into<PathBuf>) -> Self {
        Self {
            id: CommandId::new(),
            text: text.into(),
            working_directory: working_directory.into(),
            status: CommandStatus::Queued,
            exit_code: None,
            submitted_at: now(),
            started_at: None,
            finished_at: None,
            origin: "literal".to_string(),
            reason: None,
            error: None,
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = origin.into();
        self
    }

    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }

    /// Wall-clock duration, once both ends are known
    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}

/// A guarded command waiting for a human decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingApproval {
    pub id: ApprovalId,
    pub command_id: CommandId,
    /// Literal, unabridged command text
    pub command_text: String,
    pub working_directory: PathBuf,
    pub reason: String,
    pub requested_at: Timestamp,
    #[serde(default)]
    pub expires_at: Option<Timestamp>,
}

/// How an approval left the pending queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Approved,
    Rejected,
    Expired,
}

/// Service lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
    Crashed,
}

impl ServiceStatus {
    /// Whether the service currently owns a live process (and its port)
    pub fn is_active(self) -> bool {
        matches!(self, ServiceStatus::Starting | ServiceStatus::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ServiceStatus::Starting => "starting",
            ServiceStatus::Running => "running",
            ServiceStatus::Stopping => "stopping",
            ServiceStatus::Stopped => "stopped",
            ServiceStatus::Crashed => "crashed",
        }
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "starting" => Ok(ServiceStatus::Starting),
            "running" => Ok(ServiceStatus::Running),
            "stopping" => Ok(ServiceStatus::Stopping),
            "stopped" => Ok(ServiceStatus::Stopped),
            "crashed" => Ok(ServiceStatus::Crashed),
            other => Err(format!("unknown service status: {}", other)),
        }
    }
}

/// A long-running background process managed by the orchestrator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub id: ServiceId,
    pub name: String,
    pub command: String,
    pub working_directory: PathBuf,
    #[serde(default)]
    pub port: Option<u16>,
    /// Only meaningful while the status is starting or running
    #[serde(default)]
    pub pid: Option<u32>,
    pub started_at: Timestamp,
    pub status: ServiceStatus,
}

/// Request to launch a service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRequest {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub port: Option<u16>,
}

impl ServiceRequest {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            cwd: None,
            port: None,
        }
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }
}

/// Severity of a domain log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Info => f.write_str("INFO"),
            LogLevel::Warn => f.write_str("WARN"),
            LogLevel::Error => f.write_str("ERROR"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
    pub source: String,
    pub timestamp: Timestamp,
}

impl LogEntry {
    pub fn new(level: LogLevel, message: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            source: source.into(),
            timestamp: now(),
        }
    }
}

/// A named command the operator keeps for reuse
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedCommand {
    pub id: String,
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: Timestamp,
    #[serde(default)]
    pub last_used: Option<Timestamp>,
}

impl SavedCommand {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            id: format!("saved_{}", Uuid::new_v4().simple()),
            name: name.into(),
            command: command.into(),
            working_directory: None,
            description: None,
            tags: Vec::new(),
            created_at: now(),
            last_used: None,
        }
    }

    pub fn with_working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }
}

/// The active project, as reported by a project detector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectProfile {
    pub name: String,
    pub path: PathBuf,
    #[serde(default)]
    pub project_type: Vec<String>,
    #[serde(default)]
    pub git_branch: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_prefixed_and_unique() {
        let a = CommandId::new();
        let b = CommandId::new();
        assert!(a.as_str().starts_with("cmd_"));
        assert!(ServiceId::new().as_str().starts_with("svc_"));
        assert!(ApprovalId::new().as_str().starts_with("apr_"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_id_serializes_as_plain_string() {
        let id = ApprovalId::from("apr_1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"apr_1\"");
    }

    #[test]
    fn test_status_strings_round_trip_through_from_str() {
        for status in [
            CommandStatus::Queued,
            CommandStatus::Running,
            CommandStatus::Completed,
            CommandStatus::Failed,
            CommandStatus::Rejected,
        ] {
            assert_eq!(status.as_str().parse::<CommandStatus>().unwrap(), status);
        }
        assert!("paused".parse::<ServiceStatus>().is_err());
    }

    #[test]
    fn test_log_level_wire_format() {
        let entry = LogEntry::new(LogLevel::Warn, "careful", "guardrail");
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["level"], "WARN");
    }

    #[test]
    fn test_only_starting_and_running_are_active() {
        assert!(ServiceStatus::Starting.is_active());
        assert!(ServiceStatus::Running.is_active());
        assert!(!ServiceStatus::Stopping.is_active());
        assert!(!ServiceStatus::Crashed.is_active());
    }

    #[test]
    fn test_new_record_is_queued_literal() {
        let record = CommandRecord::new("ls", "/tmp");
        assert_eq!(record.status, CommandStatus::Queued);
        assert_eq!(record.origin, "literal");
        assert!(!record.is_finished());
        assert_eq!(record.duration_ms(), None);
    }
}
