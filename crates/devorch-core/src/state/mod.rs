//! State store
//!
//! The single authoritative snapshot of the orchestrator. Every mutation
//! goes through one `parking_lot::Mutex`: it updates the snapshot, bumps
//! `version` by exactly one and publishes a [`Delta`] on a broadcast
//! channel before the lock is released, so subscribers see deltas in
//! mutation order. Readers only ever get clones.

mod event;

pub use event::{ApprovalResolved, Delta, ServiceStopped, StateEvent};

use crate::config::StateLimits;
use crate::error::{OrchestratorError, Result};
use crate::ring::RingBuffer;
use crate::storage::{PersistHandle, PersistOp};
use crate::types::{
    now, ApprovalId, CommandId, CommandRecord, LogEntry, LogLevel, PendingApproval,
    ProjectProfile, Resolution, SavedCommand, Service, ServiceId, ServiceStatus,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::broadcast;

/// Aggregate view handed to observers
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub version: u64,
    pub current_project: Option<ProjectProfile>,
    pub services: BTreeMap<ServiceId, Service>,
    pub command_history: Vec<CommandRecord>,
    pub pending_approvals: Vec<PendingApproval>,
    pub logs: Vec<LogEntry>,
    pub saved_commands: Vec<SavedCommand>,
}

impl StateSnapshot {
    pub fn command(&self, id: &CommandId) -> Option<&CommandRecord> {
        self.command_history.iter().find(|c| &c.id == id)
    }

    pub fn approval_for(&self, command_id: &CommandId) -> Option<&PendingApproval> {
        self.pending_approvals
            .iter()
            .find(|a| &a.command_id == command_id)
    }
}

struct StoreInner {
    version: u64,
    current_project: Option<ProjectProfile>,
    services: BTreeMap<ServiceId, Service>,
    commands: RingBuffer<CommandRecord>,
    approvals: Vec<PendingApproval>,
    logs: RingBuffer<LogEntry>,
    saved_commands: Vec<SavedCommand>,
}

impl StoreInner {
    fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            version: self.version,
            current_project: self.current_project.clone(),
            services: self.services.clone(),
            command_history: self.commands.to_vec(),
            pending_approvals: self.approvals.clone(),
            logs: self.logs.to_vec(),
            saved_commands: self.saved_commands.clone(),
        }
    }
}

pub struct StateStore {
    inner: Mutex<StoreInner>,
    events: broadcast::Sender<Delta>,
    persist: Option<PersistHandle>,
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("version", &self.version())
            .field("subscribers", &self.events.receiver_count())
            .finish()
    }
}

impl StateStore {
    pub fn new(limits: &StateLimits) -> Self {
        let (events, _) = broadcast::channel(limits.broadcast_capacity.max(16));
        Self {
            inner: Mutex::new(StoreInner {
                version: 0,
                current_project: None,
                services: BTreeMap::new(),
                commands: RingBuffer::new(limits.command_history),
                approvals: Vec::new(),
                logs: RingBuffer::new(limits.logs),
                saved_commands: Vec::new(),
            }),
            events,
            persist: None,
        }
    }

    /// Queue terminal command records and service changes for the database
    pub fn with_persistence(mut self, handle: PersistHandle) -> Self {
        self.persist = Some(handle);
        self
    }

    /// Seed history loaded from storage, oldest first. Not broadcast.
    pub fn seed_history(&self, records: Vec<CommandRecord>) {
        let mut inner = self.inner.lock();
        for record in records {
            inner.commands.push(record);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Delta> {
        self.events.subscribe()
    }

    /// Snapshot and receiver taken under the same lock: the receiver yields
    /// exactly the deltas after the snapshot's version.
    pub fn subscribe_with_snapshot(&self) -> (StateSnapshot, broadcast::Receiver<Delta>) {
        let inner = self.inner.lock();
        (inner.snapshot(), self.events.subscribe())
    }

    pub fn snapshot(&self) -> StateSnapshot {
        self.inner.lock().snapshot()
    }

    pub fn version(&self) -> u64 {
        self.inner.lock().version
    }

    fn commit(&self, inner: &mut StoreInner, event: StateEvent) -> u64 {
        inner.version += 1;
        let delta = Delta {
            version: inner.version,
            timestamp: now(),
            event,
        };
        tracing::trace!(version = delta.version, kind = delta.event.kind(), "state delta");
        // No receivers is fine: nobody is watching yet.
        let _ = self.events.send(delta);
        inner.version
    }

    fn persist(&self, op: PersistOp) {
        if let Some(handle) = &self.persist {
            handle.send(op);
        }
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    pub fn insert_command(&self, record: CommandRecord) {
        let mut inner = self.inner.lock();
        let finished = record.is_finished();
        // Queued and running records stay until they finish: approvals and
        // the executor still point at them.
        inner
            .commands
            .push_unpinned(record.clone(), |c| !c.is_finished());
        if finished {
            self.persist(PersistOp::Command(record.clone()));
        }
        self.commit(&mut inner, StateEvent::Command(record));
    }

    /// Apply `update` to a live command record. Finished records are
    /// immutable.
    pub fn update_command<F>(&self, id: &CommandId, update: F) -> Result<CommandRecord>
    where
        F: FnOnce(&mut CommandRecord),
    {
        let mut inner = self.inner.lock();
        let record = inner
            .commands
            .find_mut(|c| &c.id == id)
            .ok_or_else(|| OrchestratorError::CommandNotFound(id.clone()))?;
        if record.is_finished() {
            return Err(OrchestratorError::InvalidState(format!(
                "command {} already finished as {}",
                id, record.status
            )));
        }
        update(record);
        if record.status.is_terminal() && record.finished_at.is_none() {
            record.finished_at = Some(now());
        }
        let updated = record.clone();
        if updated.is_finished() {
            self.persist(PersistOp::Command(updated.clone()));
        }
        self.commit(&mut inner, StateEvent::Command(updated.clone()));
        Ok(updated)
    }

    pub fn command(&self, id: &CommandId) -> Option<CommandRecord> {
        self.inner
            .lock()
            .commands
            .iter()
            .find(|c| &c.id == id)
            .cloned()
    }

    // ------------------------------------------------------------------
    // Approvals
    // ------------------------------------------------------------------

    pub fn add_approval(&self, approval: PendingApproval) {
        let mut inner = self.inner.lock();
        inner.approvals.push(approval.clone());
        self.commit(&mut inner, StateEvent::ApprovalRequired(approval));
    }

    /// Remove a pending approval. Exactly one caller wins for a given id.
    pub fn take_approval(
        &self,
        id: &ApprovalId,
        resolution: Resolution,
    ) -> Option<PendingApproval> {
        let mut inner = self.inner.lock();
        let index = inner.approvals.iter().position(|a| &a.id == id)?;
        let approval = inner.approvals.remove(index);
        self.commit(
            &mut inner,
            StateEvent::ApprovalResolved(ApprovalResolved {
                id: approval.id.clone(),
                command_id: approval.command_id.clone(),
                resolution,
            }),
        );
        Some(approval)
    }

    pub fn pending_approvals(&self) -> Vec<PendingApproval> {
        self.inner.lock().approvals.clone()
    }

    // ------------------------------------------------------------------
    // Services
    // ------------------------------------------------------------------

    /// Register a service in `starting`, refusing ports owned by an active
    /// service. Check and insert happen under one lock.
    pub fn reserve_service(&self, service: Service) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(port) = service.port {
            if let Some(owner) = inner
                .services
                .values()
                .find(|s| s.port == Some(port) && s.status.is_active())
            {
                return Err(OrchestratorError::PortConflict {
                    port,
                    owner: owner.name.clone(),
                });
            }
        }
        inner.services.insert(service.id.clone(), service.clone());
        self.commit(&mut inner, StateEvent::ServiceStatus(service));
        Ok(())
    }

    pub fn mark_service_running(&self, id: &ServiceId, pid: u32) -> Result<Service> {
        let mut inner = self.inner.lock();
        let service = inner
            .services
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::ServiceNotFound(id.clone()))?;
        service.pid = Some(pid);
        service.status = ServiceStatus::Running;
        let service = service.clone();
        self.persist(PersistOp::Service(service.clone()));
        self.commit(&mut inner, StateEvent::ServiceStarted(service.clone()));
        Ok(service)
    }

    /// Put back a service re-adopted after a restart
    pub fn restore_service(&self, service: Service) {
        let mut inner = self.inner.lock();
        inner.services.insert(service.id.clone(), service.clone());
        self.commit(&mut inner, StateEvent::ServiceStarted(service));
    }

    /// Move a service to a non-terminal status. The pid is dropped once the
    /// status is no longer starting or running.
    pub fn set_service_status(&self, id: &ServiceId, status: ServiceStatus) -> Result<Service> {
        let mut inner = self.inner.lock();
        let service = inner
            .services
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::ServiceNotFound(id.clone()))?;
        service.status = status;
        if !status.is_active() {
            service.pid = None;
        }
        let service = service.clone();
        self.commit(&mut inner, StateEvent::ServiceStatus(service.clone()));
        Ok(service)
    }

    /// Drop a service from the snapshot with its final status
    pub fn remove_service(
        &self,
        id: &ServiceId,
        status: ServiceStatus,
        exit_code: Option<i32>,
        reason: Option<String>,
    ) -> Option<Service> {
        let mut inner = self.inner.lock();
        let mut service = inner.services.remove(id)?;
        service.status = status;
        service.pid = None;
        self.persist(PersistOp::RemoveService(id.clone()));
        self.commit(
            &mut inner,
            StateEvent::ServiceStopped(ServiceStopped {
                id: id.clone(),
                name: service.name.clone(),
                status,
                exit_code,
                reason,
            }),
        );
        Some(service)
    }

    pub fn service(&self, id: &ServiceId) -> Option<Service> {
        self.inner.lock().services.get(id).cloned()
    }

    pub fn services(&self) -> Vec<Service> {
        self.inner.lock().services.values().cloned().collect()
    }

    // ------------------------------------------------------------------
    // Logs, project, saved commands
    // ------------------------------------------------------------------

    /// Append a domain log entry; mirrored to `tracing` at the same level
    pub fn log(&self, level: LogLevel, message: impl Into<String>, source: impl Into<String>) {
        let entry = LogEntry::new(level, message, source);
        match level {
            LogLevel::Info => tracing::info!(source = %entry.source, "{}", entry.message),
            LogLevel::Warn => tracing::warn!(source = %entry.source, "{}", entry.message),
            LogLevel::Error => tracing::error!(source = %entry.source, "{}", entry.message),
        }
        let mut inner = self.inner.lock();
        inner.logs.push(entry.clone());
        self.commit(&mut inner, StateEvent::Log(entry));
    }

    pub fn clear_logs(&self) {
        let mut inner = self.inner.lock();
        inner.logs.clear();
        self.commit(&mut inner, StateEvent::LogsCleared {});
    }

    pub fn set_project(&self, profile: ProjectProfile) {
        let mut inner = self.inner.lock();
        inner.current_project = Some(profile.clone());
        self.commit(&mut inner, StateEvent::ProjectChanged(profile));
    }

    pub fn current_project(&self) -> Option<ProjectProfile> {
        self.inner.lock().current_project.clone()
    }

    pub fn set_saved_commands(&self, saved: Vec<SavedCommand>) {
        let mut inner = self.inner.lock();
        inner.saved_commands = saved.clone();
        self.commit(&mut inner, StateEvent::SavedCommands(saved));
    }
}
