//! Typed deltas published by the state store.
//!
//! On the wire every delta is one JSON object:
//! `{"type": "...", "data": {...}, "version": N, "timestamp": "..."}`.

use super::StateSnapshot;
use crate::types::{
    ApprovalId, CommandId, CommandRecord, LogEntry, PendingApproval, ProjectProfile, Resolution,
    SavedCommand, Service, ServiceId, ServiceStatus, Timestamp,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum StateEvent {
    /// Full snapshot, sent on connect and on resync
    State(StateSnapshot),
    ProjectChanged(ProjectProfile),
    /// Service registered or moved to a new non-terminal status
    ServiceStatus(Service),
    ServiceStarted(Service),
    ServiceStopped(ServiceStopped),
    ApprovalRequired(PendingApproval),
    ApprovalResolved(ApprovalResolved),
    Command(CommandRecord),
    Log(LogEntry),
    LogsCleared {},
    SavedCommands(Vec<SavedCommand>),
}

impl StateEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            StateEvent::State(_) => "state",
            StateEvent::ProjectChanged(_) => "project_changed",
            StateEvent::ServiceStatus(_) => "service_status",
            StateEvent::ServiceStarted(_) => "service_started",
            StateEvent::ServiceStopped(_) => "service_stopped",
            StateEvent::ApprovalRequired(_) => "approval_required",
            StateEvent::ApprovalResolved(_) => "approval_resolved",
            StateEvent::Command(_) => "command",
            StateEvent::Log(_) => "log",
            StateEvent::LogsCleared {} => "logs_cleared",
            StateEvent::SavedCommands(_) => "saved_commands",
        }
    }
}

/// Final word on a service that left the snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceStopped {
    pub id: ServiceId,
    pub name: String,
    pub status: ServiceStatus,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalResolved {
    pub id: ApprovalId,
    pub command_id: CommandId,
    pub resolution: Resolution,
}

/// One versioned mutation of the state store
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Delta {
    pub version: u64,
    pub timestamp: Timestamp,
    #[serde(flatten)]
    pub event: StateEvent,
}

impl Delta {
    /// Wrap a full snapshot as a `state` frame carrying its own version
    pub fn snapshot(snapshot: StateSnapshot) -> Self {
        Self {
            version: snapshot.version,
            timestamp: crate::types::now(),
            event: StateEvent::State(snapshot),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
